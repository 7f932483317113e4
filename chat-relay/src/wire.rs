use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Code points that scramble into `\n` and `\r`. They are replaced before
/// encoding so a line always stays one line on the wire.
const UNFRAMEABLE: &[char] = &['\u{1e}', '\u{19}'];

/// Marks every line that originates from the server rather than a user.
pub const SERVER_PREFIX: &str = "[Server] ";

/// Sent exactly once, right after a name has been accepted.
pub const ACCEPTED_TOKEN: &str = "[Server] [Valid]";

/// Sent to a session that an administrator has kicked out.
pub const KICKED_TOKEN: &str = "[Server] [Kicked Out]";

pub const SEPARATOR: &str = "------------------------------------------------------------------";

/// Formats `text` as a server-origin line.
pub fn server_line(text: impl AsRef<str>) -> String {
    format!("{SERVER_PREFIX}{}", text.as_ref())
}

/// What a decoded server line means to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal<'a> {
    Accepted,
    Kicked,
    Text(&'a str),
}

impl<'a> Signal<'a> {
    pub fn classify(line: &'a str) -> Self {
        match line {
            ACCEPTED_TOKEN => Signal::Accepted,
            KICKED_TOKEN => Signal::Kicked,
            text => Signal::Text(text),
        }
    }
}

/// Reads decoded lines from a buffered stream.
///
/// Bytes of a partially received line are kept in `pending`, so dropping a
/// `next_line` future inside `select!` never loses input.
pub struct LineReader<R> {
    inner: R,
    pending: Vec<u8>,
}

impl<R> LineReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            pending: Vec::new(),
        }
    }

    /// Returns the next decoded line, or `None` once the peer has closed the
    /// stream and nothing is left over.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        let bytes = self.inner.read_until(b'\n', &mut self.pending).await?;
        if bytes == 0 && self.pending.is_empty() {
            return Ok(None);
        }

        // Malformed bytes become U+FFFD rather than ending the session.
        let raw = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&raw);
        Ok(Some(codec::transform(text.trim_end_matches(LINE_ENDINGS))))
    }
}

/// Encodes and writes a single line, then flushes so peers see it promptly.
pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_lines(writer, std::iter::once(line)).await
}

/// Encodes and writes several lines with one flush at the end.
pub async fn write_lines<W, I, S>(writer: &mut W, lines: I) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut encoded = Vec::new();
    for line in lines {
        let framed = line.as_ref().replace(UNFRAMEABLE, "\u{fffd}");
        encoded.extend_from_slice(codec::transform(&framed).as_bytes());
        encoded.push(b'\n');
    }
    writer.write_all(&encoded).await?;
    writer.flush().await
}
