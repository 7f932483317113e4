//! Line obfuscation applied to every line on the wire.
//!
//! Each `char` code point is XOR-ed with [`KEY`]. The transform is its own
//! inverse, so the same function encodes outbound lines and decodes inbound
//! ones. This is a scramble, not encryption: anyone holding the raw bytes and
//! the constant recovers the text.

/// Constant mixed into every code point.
pub const KEY: u32 = 20;

/// Scrambles (or unscrambles) one line of text.
///
/// `KEY` only touches bits 2 and 4, which never carries a scalar value into
/// or out of the surrogate block `D800..=DFFF` and never pushes it past
/// `10FFFF`, so every `char` maps to another valid `char`.
pub fn transform(line: &str) -> String {
    line.chars().map(transform_char).collect()
}

fn transform_char(c: char) -> char {
    char::from_u32(c as u32 ^ KEY).unwrap_or(c)
}
