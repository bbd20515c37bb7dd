//! # ctlwire-client
//!
//! Client library for ctlwire.
//!
//! This crate provides:
//! - Async command/response API with per-command deadlines
//! - Connection state machine with exponential-backoff reconnection
//! - TCP (newline-delimited JSON) and WebSocket transports
//! - Command metrics (success rate, latency, uptime)
//! - YAML/environment configuration

pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod metrics;
pub mod pending;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use backoff::Backoff;
pub use client::{Client, SendOptions};
pub use config::{ClientConfig, ConfigError, Endpoint, ReconnectConfig};
pub use connection::ConnectionManager;
pub use error::ClientError;
pub use event::{ConnectionState, LifecycleEvent};
pub use metrics::{MetricsCollector, MetricsReport, MetricsSnapshot};
pub use transport::{Connector, FrameSink, FrameSource, TcpConnector, WebSocketConnector};
