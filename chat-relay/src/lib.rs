//! Line-oriented chat server with block lists, private messages and an
//! administrator tier.
//!
//! Each module focuses on a concrete responsibility:
//!
//! - [`codec`] scrambles every line on the wire with a reversible XOR.
//! - [`wire`] frames lines over async streams and defines the reserved
//!   server tokens.
//! - [`registry`] holds the shared maps of names, block lists and admins.
//! - [`context`] bundles the registries with process-wide server state.
//! - [`broadcast`] fans messages out, honouring block lists.
//! - [`command`] parses and executes `-` commands.
//! - [`session`] drives one connection from name negotiation to cleanup.
//! - [`server`] runs the accept loop and the shutdown sequence.
//! - [`cli`] and [`client`] provide the command-line surface and a thin
//!   terminal client.
//!
//! Unit tests live beside each module; `tests/` exercises the server over
//! real TCP connections and through the compiled binary.

pub mod broadcast;
pub mod cli;
pub mod client;
pub mod codec;
pub mod command;
pub mod context;
pub mod registry;
pub mod server;
pub mod session;
pub mod wire;
