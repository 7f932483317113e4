//! Fan-out of server notices and user messages to registered sessions.

use std::time::Duration;

use chrono::Local;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info};

use crate::{context::ServerContext, wire};

/// Wall-clock prefix for user lines, e.g. `[14:03:59] `.
pub fn timestamp() -> String {
    Local::now().format("[%H:%M:%S] ").to_string()
}

pub fn chat_line(sender: &str, text: &str, echo: bool) -> String {
    let marker = if echo { "(You)" } else { "" };
    format!("{}{sender}{marker}: {text}", timestamp())
}

pub fn private_line(sender: &str, text: &str) -> String {
    format!("{}{sender}: {text} [Private Message]", timestamp())
}

/// Sends a server-origin notice to everyone except `origin`.
///
/// Returns the number of sessions the notice was queued for.
pub fn announce(context: &ServerContext, origin: Option<&str>, text: &str) -> usize {
    info!("{text}");

    let line = wire::server_line(text);
    let mut queued = 0;
    for (name, outlet) in context.registries.directory.snapshot() {
        if Some(name.as_str()) != origin && outlet.send_line(line.clone()) {
            queued += 1;
        }
    }
    queued
}

/// Relays a user's chat line to every session that does not block `sender`.
///
/// The sender gets a self-echo tagged `(You)`. Returns the number of
/// sessions the line was queued for.
pub fn relay(context: &ServerContext, sender: &str, text: &str) -> usize {
    let registries = &context.registries;
    let mut delivered = 0;

    for (recipient, outlet) in registries.directory.snapshot() {
        let echo = recipient == sender;
        if !echo && registries.blocks.blocks(&recipient, sender) {
            debug!(%sender, %recipient, "message withheld by block list");
            continue;
        }
        if outlet.send_line(chat_line(sender, text, echo)) {
            delivered += 1;
        }
    }

    delivered
}

/// Waits until every session except `skip` has written everything queued
/// for it so far, or until `grace` runs out.
///
/// Returns how many sessions confirmed in time.
pub async fn drain(context: &ServerContext, skip: Option<&str>, grace: Duration) -> usize {
    let deadline = Instant::now() + grace;
    let pending: Vec<_> = context
        .registries
        .directory
        .snapshot()
        .into_iter()
        .filter(|(name, _)| Some(name.as_str()) != skip)
        .filter_map(|(_, outlet)| outlet.flush())
        .collect();

    let mut confirmed = 0;
    for done in pending {
        match timeout_at(deadline, done).await {
            Ok(Ok(())) => confirmed += 1,
            Ok(Err(_)) | Err(_) => {}
        }
    }
    confirmed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Inbox, Outbound, Outlet};

    fn context() -> ServerContext {
        ServerContext::new("127.0.0.1:0".parse().expect("addr"), "4242")
    }

    fn join(context: &ServerContext, name: &str) -> Inbox {
        let (outlet, inbox) = Outlet::channel();
        context.registries.claim(name, &outlet).expect("claim");
        inbox
    }

    fn next_line(inbox: &mut Inbox) -> Option<String> {
        match inbox.try_recv() {
            Ok(Outbound::Line(line)) => Some(line),
            _ => None,
        }
    }

    fn strip_timestamp(line: &str) -> &str {
        // "[HH:MM:SS] " is eleven characters.
        &line[11..]
    }

    #[test]
    fn announce_skips_the_origin() {
        let context = context();
        let mut alice = join(&context, "alice");
        let mut bob = join(&context, "bob");

        let queued = announce(&context, Some("alice"), "alice has entered the chat room.");

        assert_eq!(queued, 1);
        assert_eq!(next_line(&mut alice), None);
        assert_eq!(
            next_line(&mut bob).as_deref(),
            Some("[Server] alice has entered the chat room.")
        );
    }

    #[test]
    fn relay_tags_self_echo_distinctly() {
        let context = context();
        let mut alice = join(&context, "alice");
        let mut bob = join(&context, "bob");

        assert_eq!(relay(&context, "bob", "hello"), 2);

        let to_alice = next_line(&mut alice).expect("alice receives");
        let to_bob = next_line(&mut bob).expect("bob receives echo");
        assert_eq!(strip_timestamp(&to_alice), "bob: hello");
        assert_eq!(strip_timestamp(&to_bob), "bob(You): hello");
    }

    #[test]
    fn relay_never_reaches_a_recipient_who_blocks_the_sender() {
        let context = context();
        let mut alice = join(&context, "alice");
        let mut bob = join(&context, "bob");
        let mut carol = join(&context, "carol");
        context.registries.blocks.block("alice", "bob");

        assert_eq!(relay(&context, "bob", "hello"), 2);

        assert_eq!(next_line(&mut alice), None);
        assert_eq!(
            next_line(&mut carol).map(|line| strip_timestamp(&line).to_string()),
            Some("bob: hello".to_string())
        );
        assert!(next_line(&mut bob).is_some());

        context.registries.blocks.unblock("alice", "bob");
        relay(&context, "bob", "again");
        assert_eq!(
            next_line(&mut alice).map(|line| strip_timestamp(&line).to_string()),
            Some("bob: again".to_string())
        );
    }

    #[test]
    fn timestamp_has_clock_shape() {
        let stamp = timestamp();
        assert_eq!(stamp.len(), 11);
        assert!(stamp.starts_with('[') && stamp.ends_with("] "));
        assert_eq!(&stamp[3..4], ":");
        assert_eq!(&stamp[6..7], ":");
    }

    #[tokio::test]
    async fn drain_counts_sessions_that_acknowledge() {
        let context = context();
        let mut alice = join(&context, "alice");
        let _bob = join(&context, "bob");
        let _admin = join(&context, "admin");

        let responder = tokio::spawn(async move {
            while let Some(outbound) = alice.recv().await {
                if let Outbound::Flush(done) = outbound {
                    let _ = done.send(());
                    break;
                }
            }
        });

        // bob never reads his inbox, so only alice can confirm.
        let confirmed = drain(&context, Some("admin"), Duration::from_millis(100)).await;

        assert_eq!(confirmed, 1);
        responder.await.expect("responder");
    }
}
