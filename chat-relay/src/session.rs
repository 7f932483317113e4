//! One connection's lifecycle: greet, negotiate a name, chat, clean up.
//!
//! ```text
//! Connecting ──greeting──▶ Negotiating ──name accepted──▶ Active ──▶ Terminating
//!                              │  ▲                                      ▲
//!                              └──┘ rejected                             │
//!                              └──────────── stream closed ──────────────┘
//! ```
//!
//! A session only ever touches other sessions through the registries and
//! their outlets. Kicks arrive as an [`Outbound::Kick`] in the session's own
//! inbox and are acted on by the session itself.

use std::{fmt, io, net::SocketAddr, sync::Arc, time::Instant};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    select,
};
use tracing::{debug, info, warn};

use crate::{
    broadcast,
    command::{self, Action, Caller},
    context::ServerContext,
    registry::{Inbox, Outbound, Outlet},
    server,
    wire::{self, ACCEPTED_TOKEN, KICKED_TOKEN, LineReader, SEPARATOR},
};

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationCause {
    SelfQuit,
    Kicked,
    Lost,
}

impl fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TerminationCause::SelfQuit => "left the chat room",
            TerminationCause::Kicked => "was kicked out of the chat room",
            TerminationCause::Lost => "lost connection",
        };
        f.write_str(text)
    }
}

/// How a session ended, returned by [`Session::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    /// Set when the session got past negotiation.
    pub name: Option<String>,
    pub cause: TerminationCause,
}

/// Registration of a validated name.
///
/// Dropping it removes the name from every registry and tells the room,
/// whichever way the session ends.
struct Membership {
    context: Arc<ServerContext>,
    name: String,
    outlet: Outlet,
    joined_at: Instant,
    server_addr: SocketAddr,
}

impl Membership {
    fn caller(&self) -> Caller<'_> {
        Caller {
            name: &self.name,
            joined_at: self.joined_at,
            server_addr: self.server_addr,
        }
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        if self.context.registries.release(&self.name, &self.outlet) {
            broadcast::announce(
                &self.context,
                Some(&self.name),
                &format!("{} has left the chat room.", self.name),
            );
        }
    }
}

enum Event {
    Input(io::Result<Option<String>>),
    Outbound(Outbound),
    Stalled,
}

pub struct Session<R, W> {
    context: Arc<ServerContext>,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
    reader: LineReader<BufReader<R>>,
    writer: W,
    outlet: Outlet,
    inbox: Inbox,
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        context: Arc<ServerContext>,
        reader: R,
        writer: W,
        peer: Option<SocketAddr>,
    ) -> Self {
        let (outlet, inbox) = Outlet::channel();
        Self {
            context,
            peer,
            local: None,
            reader: LineReader::new(BufReader::new(reader)),
            writer,
            outlet,
            inbox,
        }
    }

    /// Records the local end of the connection, reported by `-sip`.
    ///
    /// Without it the listener's bound address is used, which may be a
    /// wildcard.
    pub fn with_local_addr(mut self, local: SocketAddr) -> Self {
        self.local = Some(local);
        self
    }

    /// Drives the session until it ends; never fails, every error becomes
    /// [`TerminationCause::Lost`].
    pub async fn run(mut self) -> Termination {
        let peer = self.peer;
        let (name, cause) = match self.negotiate().await {
            Ok(Some(membership)) => {
                let cause = self.converse(&membership).await;
                (Some(membership.name.clone()), cause)
            }
            Ok(None) => (None, TerminationCause::Lost),
            Err(err) => {
                debug!(?peer, error = %err, "connection failed during negotiation");
                (None, TerminationCause::Lost)
            }
        };

        self.close().await;

        match &name {
            Some(name) => info!(?peer, %name, "{name} {cause}"),
            None => debug!(?peer, "unnamed connection closed"),
        }
        Termination { name, cause }
    }

    /// Greets the peer and loops until a name is accepted.
    ///
    /// `Ok(None)` means the peer hung up first.
    async fn negotiate(&mut self) -> io::Result<Option<Membership>> {
        self.feedback(["Connection has been built successfully.", "Please enter a user name:"])
            .await?;

        loop {
            let Some(line) = self.reader.next_line().await? else {
                return Ok(None);
            };
            let name = line.trim();

            match self.context.registries.claim(name, &self.outlet) {
                Ok(()) => {
                    // Nobody has heard of this name yet, so no leave notice.
                    if let Err(err) = self.welcome(name).await {
                        self.context.registries.release(name, &self.outlet);
                        return Err(err);
                    }
                    let membership = Membership {
                        context: Arc::clone(&self.context),
                        name: name.to_string(),
                        outlet: self.outlet.clone(),
                        joined_at: Instant::now(),
                        server_addr: self.local.unwrap_or_else(|| self.context.address()),
                    };
                    broadcast::announce(
                        &self.context,
                        Some(name),
                        &format!("{name} has entered the chat room."),
                    );
                    return Ok(Some(membership));
                }
                Err(rejection) => {
                    self.feedback([rejection.to_string(), "Try again:".to_string()])
                        .await?;
                }
            }
        }
    }

    async fn welcome(&mut self, name: &str) -> io::Result<()> {
        let lines = [
            ACCEPTED_TOKEN.to_string(),
            wire::server_line(format!("Your user name is {name}.")),
            wire::server_line("Enter '-h' to see the list of request commands."),
            wire::server_line("Enter '-exit' to disconnect."),
            SEPARATOR.to_string(),
            wire::server_line("You can now chat with others."),
        ];
        wire::write_lines(&mut self.writer, lines).await
    }

    /// The active phase: relays input and delivers queued output until the
    /// peer quits, is kicked, or the connection fails.
    async fn converse(&mut self, membership: &Membership) -> TerminationCause {
        loop {
            let event = select! {
                line = self.reader.next_line() => Event::Input(line),
                Some(outbound) = self.inbox.recv() => Event::Outbound(outbound),
                _ = self.outlet.overflowed() => Event::Stalled,
            };

            let step = match event {
                Event::Input(Ok(Some(line))) => self.handle_line(membership, &line).await,
                Event::Input(Ok(None)) => return TerminationCause::Lost,
                Event::Input(Err(err)) => {
                    warn!(name = %membership.name, error = %err, "read failed");
                    return TerminationCause::Lost;
                }
                Event::Outbound(outbound) => self.deliver(outbound).await,
                Event::Stalled => {
                    warn!(name = %membership.name, "peer stopped reading");
                    return TerminationCause::Lost;
                }
            };

            match step {
                Ok(None) => {}
                Ok(Some(cause)) => return cause,
                Err(err) => {
                    warn!(name = %membership.name, error = %err, "write failed");
                    return TerminationCause::Lost;
                }
            }
        }
    }

    async fn handle_line(
        &mut self,
        membership: &Membership,
        line: &str,
    ) -> io::Result<Option<TerminationCause>> {
        if line.is_empty() {
            self.feedback(["You are not allowed to send an empty message."])
                .await?;
            return Ok(None);
        }

        if !line.starts_with('-') {
            broadcast::relay(&self.context, &membership.name, line);
            return Ok(None);
        }

        let outcome = command::dispatch(&self.context, &membership.caller(), line);
        wire::write_lines(&mut self.writer, &outcome.replies).await?;

        match outcome.action {
            Action::Continue => Ok(None),
            Action::Exit => Ok(Some(TerminationCause::SelfQuit)),
            Action::Shutdown => {
                server::shutdown(&self.context, &membership.name).await;
                Ok(None)
            }
        }
    }

    async fn deliver(&mut self, outbound: Outbound) -> io::Result<Option<TerminationCause>> {
        match outbound {
            Outbound::Line(line) => {
                self.write_queued(&line).await?;
                Ok(None)
            }
            Outbound::Kick => {
                self.write_queued(KICKED_TOKEN).await?;
                Ok(Some(TerminationCause::Kicked))
            }
            Outbound::Flush(done) => {
                let _ = done.send(());
                Ok(None)
            }
        }
    }

    /// Writes a queued line, giving up if the outbox overflows meanwhile.
    async fn write_queued(&mut self, line: &str) -> io::Result<()> {
        select! {
            written = wire::write_line(&mut self.writer, line) => written,
            _ = self.outlet.overflowed() => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "outbox overflowed while the peer was not reading",
            )),
        }
    }

    async fn feedback<I, S>(&mut self, lines: I) -> io::Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        wire::write_lines(&mut self.writer, lines.into_iter().map(wire::server_line)).await
    }

    /// Releases the connection; failures are logged and swallowed.
    async fn close(&mut self) {
        if let Err(err) = self.writer.shutdown().await {
            debug!(peer = ?self.peer, error = %err, "failed to shut down writer cleanly");
        }
    }
}
