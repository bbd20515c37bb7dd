//! Command correlation: pending registration, response routing, mass rejection.

use crate::error::ClientError;
use crate::event::{ConnectionObserver, ConnectionState};
use crate::metrics::MetricsCollector;
use crate::pending::{CommandResult, PendingTable};
use ctlwire_protocol::{Inbound, Response, ResponseStatus};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;

/// Default capacity for the unsolicited message channel.
const UNSOLICITED_CHANNEL_CAPACITY: usize = 256;

/// Owns the pending table and routes inbound documents to it.
pub(crate) struct Dispatcher {
    this: Weak<Dispatcher>,
    pending: Mutex<PendingTable>,
    metrics: Arc<MetricsCollector>,
    unsolicited: broadcast::Sender<Value>,
}

impl Dispatcher {
    pub fn new(metrics: Arc<MetricsCollector>) -> Arc<Self> {
        let (unsolicited, _) = broadcast::channel(UNSOLICITED_CHANNEL_CAPACITY);
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            pending: Mutex::new(PendingTable::new()),
            metrics,
            unsolicited,
        })
    }

    /// Registers a command and starts its deadline timer.
    ///
    /// Must be called while the connection is known to be `connected`.
    pub fn register(
        &self,
        id: String,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<CommandResult>, ClientError> {
        let mut pending = self.pending.lock();
        let (seq, rx) = pending.insert(id.clone(), timeout)?;

        let deadline = Instant::now() + timeout;
        let this = self.this.clone();
        let timer_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(dispatcher) = this.upgrade() {
                dispatcher.expire(&timer_id, seq);
            }
        });
        pending.arm(&id, seq, timer.abort_handle());

        Ok(rx)
    }

    fn expire(&self, id: &str, seq: u64) {
        let entry = self.pending.lock().take_matching(id, seq);
        if let Some(entry) = entry {
            tracing::debug!("Command id={} timed out after {:?}", id, entry.timeout);
            self.metrics.record_failure();
            entry.expire();
        }
    }

    /// Routes a decoded inbound document.
    pub fn route(&self, inbound: Inbound) {
        match inbound {
            Inbound::Response(response) => self.route_response(response),
            Inbound::Unsolicited(doc) => {
                // No receivers is fine.
                let _ = self.unsolicited.send(doc);
            }
        }
    }

    fn route_response(&self, response: Response) {
        let entry = self.pending.lock().take(&response.command_id);
        let Some(entry) = entry else {
            tracing::debug!(
                "No pending command for id={}, forwarding as unsolicited",
                response.command_id
            );
            if let Ok(doc) = serde_json::to_value(&response) {
                let _ = self.unsolicited.send(doc);
            }
            return;
        };

        let elapsed = entry.elapsed();
        match response.status {
            ResponseStatus::Success => {
                tracing::debug!("Command id={} succeeded in {:?}", entry.id, elapsed);
                self.metrics.record_success(elapsed);
                entry.settle(Ok(response.data.unwrap_or(Value::Null)));
            }
            ResponseStatus::Error => {
                let message = response
                    .error
                    .unwrap_or_else(|| "unknown error".to_string());
                tracing::debug!("Command id={} failed: {}", entry.id, message);
                self.metrics.record_failure();
                let id = entry.id.clone();
                entry.settle(Err(ClientError::CommandFailed { id, message }));
            }
        }
    }

    /// Rejects every pending command with `ConnectionLost`.
    pub fn reject_all(&self) {
        let entries = self.pending.lock().drain();
        if entries.is_empty() {
            return;
        }

        tracing::warn!("Rejecting {} pending commands: connection lost", entries.len());
        for entry in entries {
            self.metrics.record_failure();
            entry.settle(Err(ClientError::ConnectionLost));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn subscribe_unsolicited(&self) -> broadcast::Receiver<Value> {
        self.unsolicited.subscribe()
    }
}

impl ConnectionObserver for Dispatcher {
    fn on_transition(&self, from: ConnectionState, to: ConnectionState) {
        self.metrics.on_connection_state(to);
        if from == ConnectionState::Connected && to != ConnectionState::Connected {
            self.reject_all();
        }
    }

    fn on_inbound(&self, inbound: Inbound) {
        self.route(inbound);
    }
}
