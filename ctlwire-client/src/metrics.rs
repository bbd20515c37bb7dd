//! Command metrics.
//!
//! Counters accumulate until `reset()`. Derived values are computed on read.

use crate::event::ConnectionState;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Raw counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub commands_sent: u64,
    pub commands_succeeded: u64,
    pub commands_failed: u64,
    /// Sum of response times of successful commands.
    pub total_response_time: Duration,
    /// Set when the connection reaches `connected`, cleared when it leaves.
    pub connection_start_time: Option<DateTime<Utc>>,
    pub last_command_time: Option<DateTime<Utc>>,
}

impl MetricsSnapshot {
    /// Percentage of sent commands that succeeded (0 if none sent).
    pub fn success_rate(&self) -> f64 {
        if self.commands_sent == 0 {
            return 0.0;
        }
        self.commands_succeeded as f64 / self.commands_sent as f64 * 100.0
    }

    /// Mean response time of successful commands (zero if none).
    pub fn average_response_time(&self) -> Duration {
        if self.commands_succeeded == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total_response_time.as_nanos() / self.commands_succeeded as u128;
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Time since the connection was established (zero while not connected).
    pub fn uptime_at(&self, now: DateTime<Utc>) -> Duration {
        self.connection_start_time
            .and_then(|start| (now - start).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }
}

/// Snapshot plus derived values, as reported to users.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsReport {
    pub commands_sent: u64,
    pub commands_succeeded: u64,
    pub commands_failed: u64,
    pub success_rate: f64,
    pub average_response_time_ms: f64,
    pub uptime_ms: u64,
    pub connection_start_time: Option<DateTime<Utc>>,
    pub last_command_time: Option<DateTime<Utc>>,
}

impl MetricsReport {
    pub fn from_snapshot(snapshot: &MetricsSnapshot, now: DateTime<Utc>) -> Self {
        Self {
            commands_sent: snapshot.commands_sent,
            commands_succeeded: snapshot.commands_succeeded,
            commands_failed: snapshot.commands_failed,
            success_rate: snapshot.success_rate(),
            average_response_time_ms: snapshot.average_response_time().as_secs_f64() * 1000.0,
            uptime_ms: snapshot.uptime_at(now).as_millis() as u64,
            connection_start_time: snapshot.connection_start_time,
            last_command_time: snapshot.last_command_time,
        }
    }
}

impl fmt::Display for MetricsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Commands sent:      {}", self.commands_sent)?;
        writeln!(f, "Commands succeeded: {}", self.commands_succeeded)?;
        writeln!(f, "Commands failed:    {}", self.commands_failed)?;
        writeln!(f, "Success rate:       {:.1}%", self.success_rate)?;
        writeln!(
            f,
            "Avg response time:  {:.2}ms",
            self.average_response_time_ms
        )?;
        write!(
            f,
            "Uptime:             {:.1}s",
            self.uptime_ms as f64 / 1000.0
        )
    }
}

/// Thread-safe metrics aggregator.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    inner: Mutex<MetricsSnapshot>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self) {
        let mut m = self.inner.lock();
        m.commands_sent += 1;
        m.last_command_time = Some(Utc::now());
    }

    pub fn record_success(&self, elapsed: Duration) {
        let mut m = self.inner.lock();
        m.commands_succeeded += 1;
        m.total_response_time += elapsed;
    }

    pub fn record_failure(&self) {
        self.inner.lock().commands_failed += 1;
    }

    /// Tracks the connection start time from state transitions.
    pub fn on_connection_state(&self, state: ConnectionState) {
        let mut m = self.inner.lock();
        match state {
            ConnectionState::Connected => m.connection_start_time = Some(Utc::now()),
            _ => m.connection_start_time = None,
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().clone()
    }

    pub fn report(&self) -> MetricsReport {
        MetricsReport::from_snapshot(&self.snapshot(), Utc::now())
    }

    /// Clears all counters. The connection start time is kept.
    pub fn reset(&self) {
        let mut m = self.inner.lock();
        *m = MetricsSnapshot {
            connection_start_time: m.connection_start_time,
            ..MetricsSnapshot::default()
        };
    }
}
