//! The retransmit table: outbound nonces awaiting an acknowledgement.
//!
//! Each entry pairs a completion with the handle of the task that re-sends the packet. Both
//!  the ack path and the retry task mutate the table under the connection's write lock, which
//!  is what makes removal and timer cancellation race-free: whichever side removes the entry
//!  first owns its completion, the other finds the nonce gone and does nothing.

use crate::error::HazelError;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// What resolves when the ack for a nonce arrives.
#[derive(Debug)]
pub enum PendingKind {
    /// A reliable data (or HELLO) send: the caller is parked on the receiver half.
    Data {
        completion: oneshot::Sender<Result<usize, HazelError>>,
    },
    /// A liveness ping: the ack feeds the RTT ring instead of a caller.
    Ping { sent_at: Instant },
}

#[derive(Debug)]
pub struct PendingEntry {
    pub kind: PendingKind,
    /// Handle of the retry task; `None` only while the entry is being registered.
    pub resend_task: Option<JoinHandle<()>>,
    /// Datagram size of the first send, reported to the waiter on success.
    pub sent_len: usize,
}

impl PendingEntry {
    /// Aborts the retry task and fails the completion, if any. Used on every teardown path;
    ///  the ack path instead takes the entry apart by hand to resolve it successfully.
    pub fn cancel(self, error: HazelError) {
        if let Some(task) = self.resend_task {
            task.abort();
        }
        if let PendingKind::Data { completion } = self.kind {
            // the caller may have given up on the receiver; nothing to do then
            completion.send(Err(error)).ok();
        }
    }
}

#[derive(Debug)]
pub struct PendingAckTable {
    entries: FxHashMap<u16, PendingEntry>,
}

impl PendingAckTable {
    pub fn new() -> PendingAckTable {
        PendingAckTable {
            entries: FxHashMap::default(),
        }
    }

    pub fn insert(&mut self, nonce: u16, entry: PendingEntry) {
        let previous = self.entries.insert(nonce, entry);
        debug_assert!(previous.is_none(), "nonce collision in retransmit table");
    }

    pub fn set_resend_task(&mut self, nonce: u16, task: JoinHandle<()>) {
        if let Some(entry) = self.entries.get_mut(&nonce) {
            entry.resend_task = Some(task);
        }
    }

    pub fn remove(&mut self, nonce: u16) -> Option<PendingEntry> {
        self.entries.remove(&nonce)
    }

    pub fn contains(&self, nonce: u16) -> bool {
        self.entries.contains_key(&nonce)
    }

    /// Empties the table, handing the entries to the caller for teardown.
    pub fn drain(&mut self) -> Vec<PendingEntry> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
