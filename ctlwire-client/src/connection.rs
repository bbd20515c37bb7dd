//! Connection management.
//!
//! The connection manager owns the transport and the connection state
//! machine. Every state change happens under one lock and is published both
//! to the observer (the dispatcher) and on the lifecycle channel.

use crate::backoff::Backoff;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::event::{ConnectionObserver, ConnectionState, LifecycleEvent};
use crate::transport::{Connector, FrameSink, FrameSource, TransportHalves};
use bytes::Bytes;
use ctlwire_protocol::Inbound;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};

/// Default capacity for the lifecycle event channel.
const LIFECYCLE_CHANNEL_CAPACITY: usize = 256;

/// How long a closing transport may take to flush and shut down before it is
/// dropped.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

struct Inner {
    state: ConnectionState,
    /// Incremented whenever a transport is opened or abandoned.
    session: u64,
    /// Reconnection attempts since the last successful connection.
    attempts: u32,
    auto_reconnect: bool,
    exhausted: bool,
    destroyed: bool,
    reconnect_timer: Option<AbortHandle>,
    timer_generation: u64,
    read_task: Option<AbortHandle>,
    writer: Option<SessionWriter>,
}

enum ConnectStep {
    Attempt(u64),
    WaitFor(ConnectionState),
}

/// Outbound queue of one session, drained by its writer task.
struct SessionWriter {
    session: u64,
    tx: mpsc::UnboundedSender<Bytes>,
    task: JoinHandle<()>,
}

/// Owns the transport and the connection state machine.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    backoff: Backoff,
    reconnect_enabled: bool,
    max_frame_size: usize,
    inner: Mutex<Inner>,
    observer: Arc<dyn ConnectionObserver>,
    events: broadcast::Sender<LifecycleEvent>,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        config: &ClientConfig,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(LIFECYCLE_CHANNEL_CAPACITY);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            connector,
            backoff: config.reconnect.backoff(),
            reconnect_enabled: config.reconnect.enabled,
            max_frame_size: config.max_frame_size,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                session: 0,
                attempts: 0,
                auto_reconnect: config.reconnect.enabled,
                exhausted: false,
                destroyed: false,
                reconnect_timer: None,
                timer_generation: 0,
                read_task: None,
                writer: None,
            }),
            observer,
            events,
            state_tx,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().destroyed
    }

    /// Reconnection attempts scheduled since the last successful connection.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock().attempts
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Target of the underlying connector.
    pub fn describe(&self) -> String {
        self.connector.describe()
    }

    fn transition(&self, inner: &mut Inner, to: ConnectionState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        tracing::info!("Connection state {} -> {}", from, to);

        self.observer.on_transition(from, to);
        self.state_tx.send_replace(to);
        let _ = self.events.send(LifecycleEvent::StateChanged { from, to });
    }

    fn cancel_reconnect_timer(&self, inner: &mut Inner) {
        inner.timer_generation += 1;
        if let Some(timer) = inner.reconnect_timer.take() {
            tracing::debug!("Cancelling scheduled reconnection");
            timer.abort();
        }
    }

    /// Connects to the remote controller.
    ///
    /// Resolves once the transport is open or the attempt failed. A call made
    /// while another connect is in flight waits for that one.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        loop {
            let step = {
                let mut inner = self.inner.lock();
                if inner.destroyed {
                    return Err(ClientError::Destroyed);
                }
                match inner.state {
                    ConnectionState::Connected => return Ok(()),
                    state @ (ConnectionState::Connecting | ConnectionState::Disconnecting) => {
                        ConnectStep::WaitFor(state)
                    }
                    _ => {
                        self.cancel_reconnect_timer(&mut inner);
                        inner.auto_reconnect = self.reconnect_enabled;
                        if inner.exhausted {
                            inner.exhausted = false;
                            inner.attempts = 0;
                        }
                        inner.session += 1;
                        self.transition(&mut inner, ConnectionState::Connecting);
                        ConnectStep::Attempt(inner.session)
                    }
                }
            };

            let waiting_on = match step {
                ConnectStep::Attempt(session) => return self.attempt(session).await,
                ConnectStep::WaitFor(state) => state,
            };

            let mut state_rx = self.state_tx.subscribe();
            let settled = *state_rx
                .wait_for(|state| *state != waiting_on)
                .await
                .map_err(|_| ClientError::Destroyed)?;

            if waiting_on == ConnectionState::Connecting {
                return match settled {
                    ConnectionState::Connected => Ok(()),
                    _ if self.is_destroyed() => Err(ClientError::Destroyed),
                    _ => Err(ClientError::Transport(format!(
                        "connection to {} failed",
                        self.connector.describe()
                    ))),
                };
            }
        }
    }

    async fn attempt(self: &Arc<Self>, session: u64) -> Result<(), ClientError> {
        tracing::debug!("Opening transport to {}", self.connector.describe());
        match self.connector.open().await {
            Ok(halves) => self.on_open(session, halves).await,
            Err(e) => {
                self.on_open_failed(session, &e);
                Err(e)
            }
        }
    }

    async fn on_open(
        self: &Arc<Self>,
        session: u64,
        halves: TransportHalves,
    ) -> Result<(), ClientError> {
        let TransportHalves { sink, source } = halves;

        let stale = {
            let mut inner = self.inner.lock();
            if inner.destroyed
                || inner.session != session
                || inner.state != ConnectionState::Connecting
            {
                Some((sink, inner.destroyed))
            } else {
                inner.writer = Some(self.spawn_writer(session, sink));
                inner.attempts = 0;
                inner.exhausted = false;

                let task = tokio::spawn(self.clone().read_loop(session, source));
                inner.read_task = Some(task.abort_handle());

                tracing::info!("Connected to {}", self.connector.describe());
                self.transition(&mut inner, ConnectionState::Connected);
                None
            }
        };

        match stale {
            None => Ok(()),
            Some((sink, destroyed)) => {
                tracing::debug!("Discarding transport opened for abandoned session {}", session);
                close_sink(sink).await;
                Err(if destroyed {
                    ClientError::Destroyed
                } else {
                    ClientError::ConnectionLost
                })
            }
        }
    }

    /// Starts the task that owns the sink and writes queued frames in order.
    ///
    /// When the queue's sender is dropped the task closes the sink.
    fn spawn_writer(self: &Arc<Self>, session: u64, mut sink: Box<dyn FrameSink>) -> SessionWriter {
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let this = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    if let Some(manager) = this.upgrade() {
                        manager.on_transport_lost(session, e.to_string());
                    }
                    return;
                }
            }
            if let Err(e) = sink.close().await {
                tracing::debug!("Error closing transport: {}", e);
            }
        });
        SessionWriter { session, tx, task }
    }

    fn on_open_failed(self: &Arc<Self>, session: u64, err: &ClientError) {
        let mut inner = self.inner.lock();
        if inner.session != session || inner.state != ConnectionState::Connecting {
            return;
        }

        tracing::warn!(
            "Connection to {} failed: {}",
            self.connector.describe(),
            err
        );
        let _ = self.events.send(LifecycleEvent::TransportError {
            message: err.to_string(),
        });
        self.transition(&mut inner, ConnectionState::Error);
        self.schedule_reconnect(&mut inner);
    }

    /// Handles loss of an established transport.
    ///
    /// Stale sessions are ignored, so the reader and a failing writer can both
    /// report the same loss.
    fn on_transport_lost(self: &Arc<Self>, session: u64, reason: String) {
        let mut inner = self.inner.lock();
        if inner.session != session || inner.state != ConnectionState::Connected {
            return;
        }

        tracing::warn!(
            "Connection to {} lost: {}",
            self.connector.describe(),
            reason
        );
        let _ = self
            .events
            .send(LifecycleEvent::TransportError { message: reason });

        if let Some(task) = inner.read_task.take() {
            task.abort();
        }
        inner.session += 1;
        self.transition(&mut inner, ConnectionState::Disconnected);

        let this = self.clone();
        tokio::spawn(async move { this.close_writer(session).await });

        self.schedule_reconnect(&mut inner);
    }

    fn schedule_reconnect(self: &Arc<Self>, inner: &mut Inner) {
        if inner.destroyed || !inner.auto_reconnect {
            return;
        }

        if !self.backoff.allows(inner.attempts) {
            if !inner.exhausted {
                inner.exhausted = true;
                tracing::warn!(
                    "Reconnection to {} exhausted after {} attempts",
                    self.connector.describe(),
                    inner.attempts
                );
                let _ = self.events.send(LifecycleEvent::ReconnectionExhausted {
                    attempts: inner.attempts,
                });
            }
            return;
        }

        inner.attempts += 1;
        let attempt = inner.attempts;
        let delay = self.backoff.delay(attempt);
        self.transition(inner, ConnectionState::Reconnecting);

        tracing::info!(
            "Reconnecting in {:?} (attempt {}/{})",
            delay,
            attempt,
            self.backoff.max_attempts()
        );
        let _ = self
            .events
            .send(LifecycleEvent::ReconnectScheduled { attempt, delay });

        inner.timer_generation += 1;
        let generation = inner.timer_generation;
        let this = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = this.upgrade() {
                manager.fire_reconnect(generation).await;
            }
        });
        inner.reconnect_timer = Some(timer.abort_handle());
    }

    async fn fire_reconnect(self: Arc<Self>, generation: u64) {
        let session = {
            let mut inner = self.inner.lock();
            if inner.destroyed
                || inner.timer_generation != generation
                || inner.state != ConnectionState::Reconnecting
            {
                return;
            }
            inner.reconnect_timer = None;
            inner.session += 1;
            self.transition(&mut inner, ConnectionState::Connecting);
            inner.session
        };

        if let Err(e) = self.attempt(session).await {
            tracing::debug!("Reconnection attempt failed: {}", e);
        }
    }

    async fn read_loop(self: Arc<Self>, session: u64, mut source: Box<dyn FrameSource>) {
        let mut decoder = self.connector.framing().decoder(self.max_frame_size);

        let reason = loop {
            let data = match source.recv().await {
                None => break "connection closed by peer".to_string(),
                Some(Err(e)) => break e.to_string(),
                Some(Ok(data)) => data,
            };
            tracing::trace!("Received {} bytes", data.len());

            let frames = match decoder.feed(&data) {
                Ok(frames) => frames,
                Err(e) => break e.to_string(),
            };

            let mut fatal = None;
            for frame in frames {
                match frame.and_then(Inbound::classify) {
                    Ok(inbound) => self.observer.on_inbound(inbound),
                    Err(e) if e.is_fatal() => {
                        fatal = Some(e.to_string());
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Discarding malformed frame: {}", e);
                        let _ = self.events.send(LifecycleEvent::ProtocolError {
                            message: e.to_string(),
                        });
                    }
                }
            }
            if let Some(reason) = fatal {
                break reason;
            }
        };

        self.on_transport_lost(session, reason);
    }

    /// Closes the session's writer, giving queued frames `CLOSE_TIMEOUT` to
    /// drain. A peer that stops reading cannot hold the close up longer.
    async fn close_writer(&self, session: u64) {
        let writer = {
            let mut inner = self.inner.lock();
            if inner.writer.as_ref().map(|w| w.session) == Some(session) {
                inner.writer.take()
            } else {
                None
            }
        };
        let Some(SessionWriter { tx, mut task, .. }) = writer else {
            return;
        };

        drop(tx);
        if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
            tracing::warn!(
                "Transport to {} did not close within {:?}, dropping it",
                self.connector.describe(),
                CLOSE_TIMEOUT
            );
            task.abort();
        }
    }

    /// Runs `f` while holding the state lock, provided the connection is up.
    ///
    /// Returns `f`'s result together with the current session, which is then
    /// passed to `transmit`.
    pub(crate) fn with_connected<R>(
        &self,
        f: impl FnOnce() -> Result<R, ClientError>,
    ) -> Result<(R, u64), ClientError> {
        let inner = self.inner.lock();
        if inner.destroyed {
            return Err(ClientError::Destroyed);
        }
        if inner.state != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let result = f()?;
        Ok((result, inner.session))
    }

    /// Queues one encoded frame on the given session.
    ///
    /// Frames are written in queue order by the session's writer task; a
    /// write failure fails the connection.
    pub(crate) fn transmit(&self, session: u64, frame: Bytes) -> Result<(), ClientError> {
        let inner = self.inner.lock();
        match inner.writer.as_ref() {
            Some(w) if w.session == session => {
                w.tx.send(frame).map_err(|_| ClientError::ConnectionLost)
            }
            _ => Err(ClientError::ConnectionLost),
        }
    }

    /// Waits until the connection reaches `connected`.
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<(), ClientError> {
        let mut events = self.events.subscribe();
        {
            let inner = self.inner.lock();
            if inner.destroyed {
                return Err(ClientError::Destroyed);
            }
            if inner.state == ConnectionState::Connected {
                return Ok(());
            }
            if inner.exhausted {
                return Err(ClientError::ReconnectionExhausted {
                    attempts: inner.attempts,
                });
            }
        }

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(LifecycleEvent::StateChanged {
                        to: ConnectionState::Connected,
                        ..
                    }) => return Ok(()),
                    Ok(LifecycleEvent::ReconnectionExhausted { attempts }) => {
                        return Err(ClientError::ReconnectionExhausted { attempts })
                    }
                    Ok(_) if self.is_destroyed() => return Err(ClientError::Destroyed),
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => {
                        if self.is_connected() {
                            return Ok(());
                        }
                    }
                    Err(RecvError::Closed) => return Err(ClientError::Destroyed),
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ClientError::ConnectTimeout(timeout))?
    }

    /// Closes the connection and disables auto-reconnect until the next
    /// `connect()`.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let session = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return Err(ClientError::Destroyed);
            }
            self.cancel_reconnect_timer(&mut inner);
            inner.auto_reconnect = false;
            if inner.state == ConnectionState::Disconnected {
                return Ok(());
            }

            self.transition(&mut inner, ConnectionState::Disconnecting);
            if let Some(task) = inner.read_task.take() {
                task.abort();
            }
            let session = inner.session;
            inner.session += 1;
            session
        };

        self.close_writer(session).await;

        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Disconnecting {
            self.transition(&mut inner, ConnectionState::Disconnected);
        }
        Ok(())
    }

    /// Tears the connection down for good. Later calls fail with `Destroyed`.
    pub async fn destroy(&self) {
        let session = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return;
            }
            inner.destroyed = true;
            inner.auto_reconnect = false;
            self.cancel_reconnect_timer(&mut inner);
            if let Some(task) = inner.read_task.take() {
                task.abort();
            }
            let session = inner.session;
            inner.session += 1;
            self.transition(&mut inner, ConnectionState::Disconnected);
            session
        };

        self.close_writer(session).await;
        tracing::debug!("Connection manager destroyed");
    }

    /// Stops background tasks without awaiting the transport close.
    pub(crate) fn abort_background(&self) {
        let mut inner = self.inner.lock();
        inner.destroyed = true;
        inner.auto_reconnect = false;
        self.cancel_reconnect_timer(&mut inner);
        if let Some(task) = inner.read_task.take() {
            task.abort();
        }
        if let Some(writer) = inner.writer.take() {
            writer.task.abort();
        }
    }
}

/// Closes a transport that never became the active session.
async fn close_sink(mut sink: Box<dyn FrameSink>) {
    match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!("Error closing transport: {}", e),
        Err(_) => tracing::debug!("Closing discarded transport timed out"),
    }
}
