//! Table of in-flight commands awaiting settlement.

use crate::error::ClientError;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Outcome delivered to the caller awaiting a command.
pub type CommandResult = Result<Value, ClientError>;

/// A command awaiting its response.
///
/// Settlement consumes the entry, so each one settles at most once.
pub struct PendingEntry {
    pub id: String,
    /// Registration sequence number; distinguishes entries that reuse an id.
    pub seq: u64,
    pub created_at: Instant,
    pub timeout: Duration,
    tx: oneshot::Sender<CommandResult>,
    timer: Option<AbortHandle>,
}

impl PendingEntry {
    /// Time since registration.
    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Settles the entry and cancels its deadline timer.
    pub fn settle(mut self, result: CommandResult) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        // The caller may have stopped waiting.
        let _ = self.tx.send(result);
    }

    /// Settles the entry from its own deadline timer.
    pub fn expire(mut self) {
        self.timer = None;
        let err = ClientError::CommandTimeout {
            id: self.id.clone(),
            timeout: self.timeout,
        };
        self.settle(Err(err));
    }
}

/// In-flight commands keyed by id.
#[derive(Default)]
pub struct PendingTable {
    entries: HashMap<String, PendingEntry>,
    next_seq: u64,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a command. Fails if the id is already in flight.
    pub fn insert(
        &mut self,
        id: String,
        timeout: Duration,
    ) -> Result<(u64, oneshot::Receiver<CommandResult>), ClientError> {
        if self.entries.contains_key(&id) {
            return Err(ClientError::DuplicateCommandId(id));
        }

        self.next_seq += 1;
        let seq = self.next_seq;
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            id.clone(),
            PendingEntry {
                id,
                seq,
                created_at: Instant::now(),
                timeout,
                tx,
                timer: None,
            },
        );
        Ok((seq, rx))
    }

    /// Attaches the deadline timer to a registered entry.
    ///
    /// If the entry already settled the timer is aborted straight away.
    pub fn arm(&mut self, id: &str, seq: u64, timer: AbortHandle) {
        match self.entries.get_mut(id) {
            Some(entry) if entry.seq == seq => entry.timer = Some(timer),
            _ => timer.abort(),
        }
    }

    pub fn take(&mut self, id: &str) -> Option<PendingEntry> {
        self.entries.remove(id)
    }

    /// Removes the entry only if it is still the registration `seq`.
    pub fn take_matching(&mut self, id: &str, seq: u64) -> Option<PendingEntry> {
        match self.entries.get(id) {
            Some(entry) if entry.seq == seq => self.entries.remove(id),
            _ => None,
        }
    }

    pub fn drain(&mut self) -> Vec<PendingEntry> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
