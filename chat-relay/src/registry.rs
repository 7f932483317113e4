//! Shared registries: who is connected, who blocks whom, who is an admin.
//!
//! Reads and single inserts/removals go straight to the concurrent maps. The
//! one compound operation, claiming a name during negotiation, runs under
//! `claim_lock` so two sessions can never both win the same name.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
};

use dashmap::{DashMap, DashSet};
use thiserror::Error;
use tokio::sync::{
    Notify,
    mpsc::{self, error::TrySendError},
    oneshot,
};
use tracing::warn;

/// Work queued for a session's writer.
#[derive(Debug)]
pub enum Outbound {
    /// A plain line to deliver.
    Line(String),
    /// Deliver the kick token and end the session.
    Kick,
    /// Acknowledge once everything queued before it has been written.
    Flush(oneshot::Sender<()>),
}

/// Lines a session may have queued before it counts as stalled.
pub const OUTBOX_CAPACITY: usize = 128;

pub type Inbox = mpsc::Receiver<Outbound>;

/// Cloneable output handle for one session.
///
/// The queue is bounded. A push onto a full queue is dropped and raises the
/// overflow signal, which the owning session treats as a lost connection.
#[derive(Debug, Clone)]
pub struct Outlet {
    tx: mpsc::Sender<Outbound>,
    overflow: Arc<Notify>,
}

impl Outlet {
    pub fn channel() -> (Self, Inbox) {
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        let outlet = Self {
            tx,
            overflow: Arc::new(Notify::new()),
        };
        (outlet, rx)
    }

    /// Queues a line; returns `false` if the session is gone or stalled.
    pub fn send_line(&self, line: impl Into<String>) -> bool {
        self.push(Outbound::Line(line.into()))
    }

    pub fn kick(&self) -> bool {
        self.push(Outbound::Kick)
    }

    pub fn flush(&self) -> Option<oneshot::Receiver<()>> {
        let (ack, done) = oneshot::channel();
        self.push(Outbound::Flush(ack)).then_some(done)
    }

    pub fn same_channel(&self, other: &Outlet) -> bool {
        self.tx.same_channel(&other.tx)
    }

    /// Resolves once a push found the queue full.
    pub async fn overflowed(&self) {
        self.overflow.notified().await
    }

    fn push(&self, outbound: Outbound) -> bool {
        match self.tx.try_send(outbound) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("outbox full, dropping the stalled session");
                self.overflow.notify_one();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameRejection {
    #[error("User name should not be empty.")]
    Empty,
    #[error("'{0}' already exists.")]
    Taken(String),
}

/// Validated names and their output handles.
#[derive(Debug, Default)]
pub struct ClientDirectory {
    entries: DashMap<String, Outlet>,
}

impl ClientDirectory {
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn outlet(&self, name: &str) -> Option<Outlet> {
        self.entries.get(name).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copies the current entries so callers never hold shard locks while
    /// they work through recipients.
    pub fn snapshot(&self) -> Vec<(String, Outlet)> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    fn insert(&self, name: &str, outlet: &Outlet) {
        self.entries.insert(name.to_string(), outlet.clone());
    }

    fn remove(&self, name: &str, outlet: &Outlet) -> bool {
        self.entries
            .remove_if(name, |_, current| current.same_channel(outlet))
            .is_some()
    }
}

/// Per-user sets of blocked names. Entries may name users who already left.
#[derive(Debug, Default)]
pub struct BlockLists {
    lists: DashMap<String, HashSet<String>>,
}

impl BlockLists {
    pub fn blocks(&self, owner: &str, target: &str) -> bool {
        self.lists
            .get(owner)
            .is_some_and(|blocked| blocked.contains(target))
    }

    /// Returns `false` if `owner` has no list.
    pub fn block(&self, owner: &str, target: &str) -> bool {
        match self.lists.get_mut(owner) {
            Some(mut blocked) => {
                blocked.insert(target.to_string());
                true
            }
            None => false,
        }
    }

    pub fn unblock(&self, owner: &str, target: &str) -> bool {
        match self.lists.get_mut(owner) {
            Some(mut blocked) => {
                blocked.remove(target);
                true
            }
            None => false,
        }
    }

    fn open(&self, owner: &str) {
        self.lists.insert(owner.to_string(), HashSet::new());
    }

    fn close(&self, owner: &str) {
        self.lists.remove(owner);
    }
}

#[derive(Debug, Default)]
pub struct Admins {
    names: DashSet<String>,
}

impl Admins {
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Returns `true` only when `name` was not already an admin.
    pub fn grant(&self, name: &str) -> bool {
        self.names.insert(name.to_string())
    }

    pub fn revoke(&self, name: &str) -> bool {
        self.names.remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct Registries {
    pub directory: ClientDirectory,
    pub blocks: BlockLists,
    pub admins: Admins,
    claim_lock: Mutex<()>,
}

impl Registries {
    /// Validates `name` and registers it with an empty block list.
    ///
    /// Both checks and both inserts happen while `claim_lock` is held; the
    /// lock is never held across an await point.
    pub fn claim(&self, name: &str, outlet: &Outlet) -> Result<(), NameRejection> {
        let _guard = self
            .claim_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if name.is_empty() {
            return Err(NameRejection::Empty);
        }
        if self.directory.contains(name) {
            return Err(NameRejection::Taken(name.to_string()));
        }

        self.directory.insert(name, outlet);
        self.blocks.open(name);
        Ok(())
    }

    /// Drops every trace of `name`, provided `outlet` still owns it.
    ///
    /// Returns `true` the first time; later calls for the same session are
    /// no-ops.
    pub fn release(&self, name: &str, outlet: &Outlet) -> bool {
        if !self.directory.remove(name, outlet) {
            return false;
        }
        self.blocks.close(name);
        self.admins.revoke(name);
        true
    }
}
