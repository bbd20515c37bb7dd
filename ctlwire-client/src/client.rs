//! High-level client API.

use crate::config::ClientConfig;
use crate::connection::ConnectionManager;
use crate::dispatch::Dispatcher;
use crate::error::ClientError;
use crate::event::{ConnectionState, LifecycleEvent};
use crate::metrics::{MetricsCollector, MetricsReport, MetricsSnapshot};
use crate::transport::{connector_for, Connector};
use ctlwire_protocol::message::*;
use ctlwire_protocol::Framing;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Per-call options for [`Client::send`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Explicit command id. A fresh UUID is used when absent.
    pub id: Option<String>,
    /// Overrides the configured request timeout.
    pub timeout: Option<Duration>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// High-level client for a remote controller.
pub struct Client {
    conn: Arc<ConnectionManager>,
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<MetricsCollector>,
    framing: Framing,
    request_timeout: Duration,
    auth_token: Mutex<Option<String>>,
}

impl Client {
    /// Creates a new client for the configured endpoint (not yet connected).
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let connector = connector_for(&config)?;
        Ok(Self::build(config, connector))
    }

    /// Creates a client over a custom connector.
    pub fn with_connector(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ClientError> {
        config.reconnect.validate()?;
        Ok(Self::build(config, connector))
    }

    fn build(config: ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let metrics = Arc::new(MetricsCollector::new());
        let dispatcher = Dispatcher::new(metrics.clone());
        let framing = connector.framing();
        let conn = ConnectionManager::new(connector, &config, dispatcher.clone());

        Self {
            conn,
            dispatcher,
            metrics,
            framing,
            request_timeout: config.request_timeout(),
            auth_token: Mutex::new(config.auth_token),
        }
    }

    /// Connects to the remote controller.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.conn.connect().await
    }

    /// Closes the connection. Auto-reconnect stays off until `connect()`.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.conn.disconnect().await
    }

    /// Releases the transport and rejects everything in flight.
    /// The client is unusable afterwards.
    pub async fn destroy(&self) {
        self.conn.destroy().await;
        self.dispatcher.reject_all();
    }

    /// Waits until the connection is established.
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<(), ClientError> {
        self.conn.wait_until_connected(timeout).await
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Returns the number of commands awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.dispatcher.pending_count()
    }

    /// Subscribes to connection lifecycle events.
    pub fn subscribe_lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.conn.subscribe()
    }

    /// Subscribes to events and responses nobody was waiting for.
    pub fn subscribe_unsolicited(&self) -> broadcast::Receiver<Value> {
        self.dispatcher.subscribe_unsolicited()
    }

    pub fn set_auth_token(&self, token: impl Into<String>) {
        *self.auth_token.lock() = Some(token.into());
    }

    pub fn clear_auth_token(&self) {
        *self.auth_token.lock() = None;
    }

    pub fn auth_token(&self) -> Option<String> {
        self.auth_token.lock().clone()
    }

    // =========================================================================
    // Metrics
    // =========================================================================

    /// Returns counters with derived success rate, latency and uptime.
    pub fn metrics(&self) -> Result<MetricsReport, ClientError> {
        self.ensure_alive()?;
        Ok(self.metrics.report())
    }

    /// Returns the raw counters.
    pub fn metrics_snapshot(&self) -> Result<MetricsSnapshot, ClientError> {
        self.ensure_alive()?;
        Ok(self.metrics.snapshot())
    }

    pub fn reset_metrics(&self) -> Result<(), ClientError> {
        self.ensure_alive()?;
        self.metrics.reset();
        Ok(())
    }

    fn ensure_alive(&self) -> Result<(), ClientError> {
        if self.conn.is_destroyed() {
            return Err(ClientError::Destroyed);
        }
        Ok(())
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Sends a command and waits for its response.
    ///
    /// Resolves with the response `data` (JSON `null` when absent), or fails
    /// with `CommandFailed`, `CommandTimeout` or `ConnectionLost`.
    pub async fn send(
        &self,
        command_type: impl Into<String>,
        payload: Value,
        options: SendOptions,
    ) -> Result<Value, ClientError> {
        let id = options.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let timeout = options.timeout.unwrap_or(self.request_timeout);

        let command = Command::new(id.clone(), command_type, payload)
            .with_auth_token(self.auth_token.lock().clone());
        let frame = self.framing.encode(&command)?;

        let (rx, session) = self
            .conn
            .with_connected(|| self.dispatcher.register(id.clone(), timeout))?;
        self.metrics.record_sent();
        tracing::debug!(
            "Sending command id={} type={} ({} bytes)",
            id,
            command.command_type,
            frame.len()
        );

        // A lost session rejects the entry through the dispatcher.
        if let Err(e) = self.conn.transmit(session, frame) {
            tracing::debug!("Transmit of command id={} failed: {}", id, e);
        }

        rx.await.map_err(|_| ClientError::ConnectionLost)?
    }

    async fn command(&self, command_type: CommandType, payload: Value) -> Result<Value, ClientError> {
        self.send(command_type, payload, SendOptions::default())
            .await
    }

    /// Authenticates and stores the returned token for later commands.
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<AuthResult, ClientError> {
        let payload = json!({
            "type": CommandType::Authenticate,
            "username": username,
            "password": password,
        });

        let result = self.command(CommandType::Authenticate, payload).await?;
        let auth: AuthResult = serde_json::from_value(result)?;
        self.set_auth_token(auth.token.clone());
        Ok(auth)
    }

    /// Moves the pointer to absolute coordinates.
    pub async fn mouse_move(&self, x: i32, y: i32) -> Result<Value, ClientError> {
        let payload = json!({
            "type": CommandType::MouseMove,
            "x": x,
            "y": y,
        });

        self.command(CommandType::MouseMove, payload).await
    }

    /// Clicks a mouse button (`left`, `right` or `middle`).
    pub async fn mouse_click(
        &self,
        button: &str,
        x: Option<i32>,
        y: Option<i32>,
        double_click: bool,
    ) -> Result<Value, ClientError> {
        let mut payload = json!({
            "type": CommandType::MouseClick,
            "button": button,
            "double_click": double_click,
        });

        if let Some(x) = x {
            payload["x"] = json!(x);
        }
        if let Some(y) = y {
            payload["y"] = json!(y);
        }

        self.command(CommandType::MouseClick, payload).await
    }

    /// Scrolls by the given deltas.
    pub async fn mouse_scroll(
        &self,
        delta_x: i32,
        delta_y: i32,
        position: Option<(i32, i32)>,
    ) -> Result<Value, ClientError> {
        let mut payload = json!({
            "type": CommandType::MouseScroll,
            "delta_x": delta_x,
            "delta_y": delta_y,
        });

        if let Some((x, y)) = position {
            payload["x"] = json!(x);
            payload["y"] = json!(y);
        }

        self.command(CommandType::MouseScroll, payload).await
    }

    /// Presses a key with optional modifiers.
    pub async fn key_press(&self, key: &str, modifiers: &[String]) -> Result<Value, ClientError> {
        let payload = json!({
            "type": CommandType::KeyPress,
            "key": key,
            "modifiers": modifiers,
        });

        self.command(CommandType::KeyPress, payload).await
    }

    /// Releases a key.
    pub async fn key_release(&self, key: &str, modifiers: &[String]) -> Result<Value, ClientError> {
        let payload = json!({
            "type": CommandType::KeyRelease,
            "key": key,
            "modifiers": modifiers,
        });

        self.command(CommandType::KeyRelease, payload).await
    }

    /// Types text, optionally pausing between characters.
    pub async fn type_text(&self, text: &str, delay_ms: Option<u64>) -> Result<Value, ClientError> {
        let mut payload = json!({
            "type": CommandType::TypeText,
            "text": text,
        });

        if let Some(delay) = delay_ms {
            payload["delay_ms"] = json!(delay);
        }

        self.command(CommandType::TypeText, payload).await
    }

    /// Captures a display (the primary one when `display_id` is absent).
    pub async fn capture_screen(
        &self,
        display_id: Option<u32>,
        format: &str,
        quality: Option<u8>,
    ) -> Result<Value, ClientError> {
        let mut payload = json!({
            "type": CommandType::CaptureScreen,
            "format": format,
        });

        if let Some(id) = display_id {
            payload["display_id"] = json!(id);
        }
        if let Some(q) = quality {
            payload["quality"] = json!(q);
        }

        self.command(CommandType::CaptureScreen, payload).await
    }

    /// Lists attached displays.
    pub async fn get_displays(&self) -> Result<DisplayList, ClientError> {
        let payload = json!({ "type": CommandType::GetDisplays });

        let result = self.command(CommandType::GetDisplays, payload).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Lists top-level windows.
    pub async fn list_windows(&self) -> Result<WindowList, ClientError> {
        let payload = json!({ "type": CommandType::ListWindows });

        let result = self.command(CommandType::ListWindows, payload).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Describes the window at a position, or the focused one.
    pub async fn get_window_info(&self, position: Option<(i32, i32)>) -> Result<Value, ClientError> {
        let mut payload = json!({ "type": CommandType::GetWindowInfo });

        if let Some((x, y)) = position {
            payload["x"] = json!(x);
            payload["y"] = json!(y);
        }

        self.command(CommandType::GetWindowInfo, payload).await
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.conn.abort_background();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectConfig;
    use crate::testing::{MockConnector, MockPeer};
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    fn config() -> ClientConfig {
        ClientConfig::default().with_reconnect(ReconnectConfig::disabled())
    }

    async fn connected(framing: Framing) -> (Arc<Client>, MockPeer, mpsc::UnboundedReceiver<MockPeer>) {
        let (connector, mut peers) = MockConnector::new(framing);
        let client = Client::with_connector(config(), connector).unwrap();
        client.connect().await.unwrap();
        let peer = peers.recv().await.unwrap();
        (Arc::new(client), peer, peers)
    }

    #[test]
    fn test_client_creation() {
        let client = Client::new(ClientConfig::new("127.0.0.1:9000")).unwrap();
        assert!(!client.is_connected());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_client_rejects_tls_endpoint() {
        assert!(matches!(
            Client::new(ClientConfig::new("wss://host:443/ws")),
            Err(ClientError::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_before_connect_fails() {
        let (connector, _peers) = MockConnector::new(Framing::Lines);
        let client = Client::with_connector(config(), connector).unwrap();

        let err = client
            .send("mouse_move", json!({}), SendOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
        assert_eq!(client.pending_count(), 0);
        assert_eq!(client.metrics_snapshot().unwrap().commands_sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mouse_move_success() {
        let (client, mut peer, _peers) = connected(Framing::Lines).await;

        let task = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .send(
                        CommandType::MouseMove,
                        json!({"x": 10, "y": 20}),
                        SendOptions::new().with_id("m1"),
                    )
                    .await
            })
        };

        let cmd = peer.recv_command().await.unwrap();
        assert_eq!(cmd.id, "m1");
        assert_eq!(cmd.command_type, "mouse_move");
        assert!(cmd.auth_token.is_none());
        peer.reply(&Response::success("m1", cmd.payload.clone())).await;

        assert_eq!(task.await.unwrap().unwrap(), json!({"x": 10, "y": 20}));
        let snapshot = client.metrics_snapshot().unwrap();
        assert_eq!(snapshot.commands_sent, 1);
        assert_eq!(snapshot.commands_succeeded, 1);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_framing_roundtrip() {
        let (client, mut peer, _peers) = connected(Framing::Messages).await;

        let task = {
            let client = client.clone();
            tokio::spawn(async move { client.get_displays().await })
        };

        let cmd = peer.recv_command().await.unwrap();
        assert_eq!(cmd.payload["type"], "get_displays");
        peer.reply(&Response::success(
            cmd.id,
            json!({"type": "display_info", "displays": [
                {"id": 1, "name": "HDMI-1", "width": 2560, "height": 1440, "x": 0, "y": 0}
            ]}),
        ))
        .await;

        let displays = task.await.unwrap().unwrap();
        assert_eq!(displays.displays[0].width, 2560);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_lost_before_reply() {
        let (client, mut peer, _peers) = connected(Framing::Lines).await;

        let task = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .send("mouse_move", json!({}), SendOptions::new().with_id("m2"))
                    .await
            })
        };

        assert_eq!(peer.recv_command().await.unwrap().id, "m2");
        drop(peer);

        assert!(matches!(
            task.await.unwrap(),
            Err(ClientError::ConnectionLost)
        ));
        let snapshot = client.metrics_snapshot().unwrap();
        assert_eq!(snapshot.commands_failed, 1);
        assert_eq!(snapshot.average_response_time(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_response() {
        let (client, mut peer, _peers) = connected(Framing::Lines).await;

        let task = {
            let client = client.clone();
            tokio::spawn(async move { client.key_press("F13", &[]).await })
        };

        let cmd = peer.recv_command().await.unwrap();
        assert_eq!(cmd.payload["key"], "F13");
        peer.reply(&Response::error(cmd.id.clone(), "key not found")).await;

        match task.await.unwrap() {
            Err(ClientError::CommandFailed { id, message }) => {
                assert_eq!(id, cmd.id);
                assert_eq!(message, "key not found");
            }
            other => panic!("expected CommandFailed, got {:?}", other),
        }
        assert_eq!(client.metrics_snapshot().unwrap().commands_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_reply() {
        let (client, mut peer, _peers) = connected(Framing::Lines).await;
        let mut unsolicited = client.subscribe_unsolicited();
        let start = Instant::now();

        let task = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .send(
                        "list_windows",
                        json!({}),
                        SendOptions::new()
                            .with_id("slow")
                            .with_timeout(Duration::from_millis(50)),
                    )
                    .await
            })
        };

        peer.recv_command().await.unwrap();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(ClientError::CommandTimeout { ref id, .. }) if id == "slow"));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(client.pending_count(), 0);

        tokio::time::sleep_until(start + Duration::from_millis(60)).await;
        peer.reply(&Response::success("slow", json!({}))).await;

        let late = unsolicited.recv().await.unwrap();
        assert_eq!(late["command_id"], "slow");
        let snapshot = client.metrics_snapshot().unwrap();
        assert_eq!(snapshot.commands_succeeded, 0);
        assert_eq!(snapshot.commands_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_and_unmatched_responses() {
        let (client, mut peer, _peers) = connected(Framing::Lines).await;
        let mut unsolicited = client.subscribe_unsolicited();

        let spawn_send = |id: &'static str| {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .send("mouse_click", json!({}), SendOptions::new().with_id(id))
                    .await
            })
        };
        let a = spawn_send("a");
        let b = spawn_send("b");

        let mut ids = vec![
            peer.recv_command().await.unwrap().id,
            peer.recv_command().await.unwrap().id,
        ];
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);

        peer.reply(&Response::success("zzz", json!("stray"))).await;
        peer.reply(&Response::success("b", json!("B"))).await;
        peer.reply(&Response::success("a", json!("A"))).await;

        assert_eq!(b.await.unwrap().unwrap(), json!("B"));
        assert_eq!(a.await.unwrap().unwrap(), json!("A"));
        assert_eq!(unsolicited.recv().await.unwrap()["command_id"], "zzz");
    }

    #[tokio::test(start_paused = true)]
    async fn test_many_pending_rejected_on_loss() {
        let (client, mut peer, _peers) = connected(Framing::Lines).await;

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.get_window_info(None).await })
            })
            .collect();

        for _ in 0..5 {
            peer.recv_command().await.unwrap();
        }
        assert_eq!(client.pending_count(), 5);
        drop(peer);

        for task in tasks {
            assert!(matches!(
                task.await.unwrap(),
                Err(ClientError::ConnectionLost)
            ));
        }
        assert_eq!(client.pending_count(), 0);
        assert_eq!(client.metrics_snapshot().unwrap().commands_failed, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_id_rejected() {
        let (client, mut peer, _peers) = connected(Framing::Lines).await;

        let first = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .send("type_text", json!({}), SendOptions::new().with_id("dup"))
                    .await
            })
        };
        peer.recv_command().await.unwrap();

        let err = client
            .send("type_text", json!({}), SendOptions::new().with_id("dup"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::DuplicateCommandId(ref id) if id == "dup"));
        assert_eq!(client.pending_count(), 1);

        peer.reply(&Response::success("dup", json!(true))).await;
        assert_eq!(first.await.unwrap().unwrap(), json!(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_authenticate_stores_token() {
        let (client, mut peer, _peers) = connected(Framing::Lines).await;

        let task = {
            let client = client.clone();
            tokio::spawn(async move { client.authenticate("admin", "secret").await })
        };

        let cmd = peer.recv_command().await.unwrap();
        assert_eq!(cmd.command_type, "authenticate");
        assert_eq!(cmd.payload["username"], "admin");
        peer.reply(&Response::success(
            cmd.id,
            json!({"token": "tok-1", "permissions": ["input"]}),
        ))
        .await;

        let auth = task.await.unwrap().unwrap();
        assert_eq!(auth.token, "tok-1");
        assert_eq!(client.auth_token().as_deref(), Some("tok-1"));

        let task = {
            let client = client.clone();
            tokio::spawn(async move { client.mouse_move(1, 2).await })
        };
        let cmd = peer.recv_command().await.unwrap();
        assert_eq!(cmd.auth_token.as_deref(), Some("tok-1"));
        peer.reply(&Response::success(cmd.id, json!({}))).await;
        task.await.unwrap().unwrap();

        client.clear_auth_token();
        assert!(client.auth_token().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsolicited_event_delivery() {
        let (client, mut peer, _peers) = connected(Framing::Lines).await;
        let mut unsolicited = client.subscribe_unsolicited();

        peer.send_raw(b"{\"type\":\"event\",\"name\":\"display_changed\"}\n")
            .await;

        let event = unsolicited.recv().await.unwrap();
        assert_eq!(event["name"], "display_changed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_line_keeps_connection() {
        let (client, mut peer, _peers) = connected(Framing::Lines).await;
        let mut lifecycle = client.subscribe_lifecycle();

        let task = {
            let client = client.clone();
            tokio::spawn(async move { client.type_text("hi", Some(5)).await })
        };
        let cmd = peer.recv_command().await.unwrap();
        assert_eq!(cmd.payload["delay_ms"], 5);

        peer.send_raw(b"{not json}\n").await;
        peer.reply(&Response::success(cmd.id, json!({"typed": 2}))).await;

        assert_eq!(task.await.unwrap().unwrap(), json!({"typed": 2}));
        assert!(client.is_connected());
        assert!(matches!(
            lifecycle.recv().await.unwrap(),
            LifecycleEvent::ProtocolError { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_rejects_and_disables() {
        let (client, mut peer, _peers) = connected(Framing::Lines).await;

        let task = {
            let client = client.clone();
            tokio::spawn(async move { client.capture_screen(None, "png", None).await })
        };
        peer.recv_command().await.unwrap();

        client.destroy().await;

        assert!(matches!(
            task.await.unwrap(),
            Err(ClientError::ConnectionLost)
        ));
        assert!(matches!(
            client.send("x", json!({}), SendOptions::new()).await,
            Err(ClientError::Destroyed)
        ));
        assert!(matches!(client.connect().await, Err(ClientError::Destroyed)));
        assert!(matches!(client.metrics(), Err(ClientError::Destroyed)));
        assert!(matches!(
            client.wait_until_connected(Duration::from_secs(1)).await,
            Err(ClientError::Destroyed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_metrics() {
        let (client, mut peer, _peers) = connected(Framing::Lines).await;

        let task = {
            let client = client.clone();
            tokio::spawn(async move { client.list_windows().await })
        };
        let cmd = peer.recv_command().await.unwrap();
        peer.reply(&Response::success(cmd.id, json!({"windows": []})))
            .await;
        assert!(task.await.unwrap().unwrap().windows.is_empty());

        let report = client.metrics().unwrap();
        assert_eq!(report.success_rate, 100.0);

        client.reset_metrics().unwrap();
        let snapshot = client.metrics_snapshot().unwrap();
        assert_eq!(snapshot.commands_sent, 0);
        assert!(snapshot.connection_start_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_with_stalled_peer() {
        // The peer never reads, so the 64 KiB duplex fills mid-frame.
        let (client, _peer, _peers) = connected(Framing::Lines).await;

        let task = {
            let client = client.clone();
            tokio::spawn(async move {
                let text = "x".repeat(512 * 1024);
                client.type_text(&text, None).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(client.pending_count(), 1);

        tokio::time::timeout(Duration::from_secs(5), client.disconnect())
            .await
            .expect("disconnect stalled behind a blocked write")
            .unwrap();

        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(matches!(
            task.await.unwrap(),
            Err(ClientError::ConnectionLost)
        ));

        // A fresh connect is not held up by the old session.
        tokio::time::timeout(Duration::from_secs(5), client.connect())
            .await
            .expect("connect stalled behind the old session")
            .unwrap();
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_websocket_message_over_limit_fails_connection() {
        use futures_util::SinkExt;
        use tokio_tungstenite::tungstenite::Message;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let big = format!("{{\"type\":\"event\",\"blob\":\"{}\"}}", "x".repeat(8192));
            let _ = ws.send(Message::Text(big)).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let config = ClientConfig::new(format!("ws://{}/ws", addr))
            .with_max_frame_size(2048)
            .with_reconnect(ReconnectConfig::disabled());
        let client = Client::new(config).unwrap();
        let mut lifecycle = client.subscribe_lifecycle();
        client.connect().await.unwrap();

        let dropped = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(LifecycleEvent::StateChanged {
                    to: ConnectionState::Disconnected,
                    ..
                }) = lifecycle.recv().await
                {
                    break;
                }
            }
        })
        .await;
        assert!(dropped.is_ok());
        assert!(!client.is_connected());
    }

    fn echo_reply(line: &str) -> Vec<u8> {
        let cmd: Command = serde_json::from_str(line).unwrap();
        let mut out = serde_json::to_vec(&Response::success(cmd.id, cmd.payload)).unwrap();
        out.push(b'\n');
        out
    }

    #[tokio::test]
    async fn test_tcp_peer_roundtrip() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Some(line) = lines.next_line().await.unwrap() {
                write.write_all(&echo_reply(&line)).await.unwrap();
            }
        });

        let client = Client::new(ClientConfig::new(addr.to_string())).unwrap();
        client.connect().await.unwrap();

        let result = client.mouse_move(10, 20).await.unwrap();
        assert_eq!(result["x"], 10);
        assert_eq!(result["type"], "mouse_move");

        client.disconnect().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_websocket_peer_roundtrip() {
        use futures_util::{SinkExt, StreamExt};
        use tokio_tungstenite::tungstenite::Message;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    let reply = echo_reply(&text);
                    let reply = String::from_utf8(reply).unwrap();
                    ws.send(Message::Text(reply.trim_end().to_string()))
                        .await
                        .unwrap();
                }
            }
        });

        let client = Client::new(ClientConfig::new(format!("ws://{}/ws", addr))).unwrap();
        client.connect().await.unwrap();

        let result = client
            .send("get_displays", json!({"marker": 1}), SendOptions::new())
            .await
            .unwrap();
        assert_eq!(result["marker"], 1);
        assert_eq!(client.metrics().unwrap().commands_succeeded, 1);

        client.destroy().await;
    }
}
