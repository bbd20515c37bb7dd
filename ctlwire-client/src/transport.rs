//! Transport abstraction and the TCP / WebSocket connectors.
//!
//! A `Connector` opens a fresh transport and hands back independent sink and
//! source halves. Correlation, timeouts and reconnection live above this layer
//! and are shared by every transport.

use crate::config::{ClientConfig, Endpoint};
use crate::error::ClientError;
use bytes::Bytes;
use ctlwire_protocol::Framing;
use futures_util::future::BoxFuture;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};

/// Outbound half of an open transport.
pub trait FrameSink: Send {
    /// Writes one encoded frame.
    fn send(&mut self, frame: Bytes) -> BoxFuture<'_, Result<(), ClientError>>;

    /// Closes the transport gracefully.
    fn close(&mut self) -> BoxFuture<'_, Result<(), ClientError>>;
}

/// Inbound half of an open transport.
pub trait FrameSource: Send {
    /// Returns the next chunk of inbound data, or `None` once the peer closed.
    ///
    /// Stream transports return arbitrary byte chunks; message transports
    /// return one whole message per call.
    fn recv(&mut self) -> BoxFuture<'_, Option<Result<Bytes, ClientError>>>;
}

/// Both halves of a freshly opened transport.
pub struct TransportHalves {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

/// Opens transports to the remote controller.
pub trait Connector: Send + Sync + 'static {
    /// Framing spoken over the transports this connector opens.
    fn framing(&self) -> Framing;

    /// Opens a new transport.
    fn open(&self) -> BoxFuture<'_, Result<TransportHalves, ClientError>>;

    /// Human-readable target, for logs.
    fn describe(&self) -> String;
}

/// Builds the connector matching the configured endpoint.
pub fn connector_for(config: &ClientConfig) -> Result<Arc<dyn Connector>, ClientError> {
    let connector: Arc<dyn Connector> = match config.endpoint()? {
        Endpoint::Tcp(addr) => Arc::new(
            TcpConnector::new(addr, config.connect_timeout())
                .with_read_buffer_size(config.read_buffer_size),
        ),
        Endpoint::WebSocket(url) => Arc::new(
            WebSocketConnector::new(url, config.connect_timeout())
                .with_max_frame_size(config.max_frame_size),
        ),
    };
    Ok(connector)
}

// ============================================================================
// Byte streams
// ============================================================================

/// Write half of a byte-stream transport.
pub struct StreamSink<W> {
    writer: W,
}

impl<W> StreamSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W> FrameSink for StreamSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn send(&mut self, frame: Bytes) -> BoxFuture<'_, Result<(), ClientError>> {
        Box::pin(async move {
            self.writer.write_all(&frame).await?;
            self.writer.flush().await?;
            Ok(())
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), ClientError>> {
        Box::pin(async move {
            self.writer.shutdown().await?;
            Ok(())
        })
    }
}

/// Read half of a byte-stream transport.
pub struct StreamSource<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R> StreamSource<R> {
    pub fn new(reader: R, buffer_size: usize) -> Self {
        Self {
            reader,
            buf: vec![0u8; buffer_size],
        }
    }
}

impl<R> FrameSource for StreamSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    fn recv(&mut self) -> BoxFuture<'_, Option<Result<Bytes, ClientError>>> {
        Box::pin(async move {
            match self.reader.read(&mut self.buf).await {
                Ok(0) => None,
                Ok(n) => Some(Ok(Bytes::copy_from_slice(&self.buf[..n]))),
                Err(e) => Some(Err(ClientError::Io(e))),
            }
        })
    }
}

/// Opens newline-delimited JSON sessions over TCP.
pub struct TcpConnector {
    addr: String,
    connect_timeout: Duration,
    read_buffer_size: usize,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
            read_buffer_size: crate::config::DEFAULT_READ_BUFFER_SIZE,
        }
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }
}

impl Connector for TcpConnector {
    fn framing(&self) -> Framing {
        Framing::Lines
    }

    fn open(&self) -> BoxFuture<'_, Result<TransportHalves, ClientError>> {
        Box::pin(async move {
            tracing::debug!("Connecting to tcp://{}...", self.addr);

            let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
                .await
                .map_err(|_| ClientError::ConnectTimeout(self.connect_timeout))??;

            stream.set_nodelay(true).ok();

            let (read_half, write_half) = stream.into_split();
            Ok(TransportHalves {
                sink: Box::new(StreamSink::new(write_half)),
                source: Box::new(StreamSource::new(read_half, self.read_buffer_size)),
            })
        })
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

// ============================================================================
// WebSocket
// ============================================================================

/// Outbound half of a WebSocket session. Frames are sent as text messages.
pub struct WsSink<S> {
    inner: S,
}

impl<S> WsSink<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S> FrameSink for WsSink<S>
where
    S: Sink<WsMessage, Error = WsError> + Unpin + Send,
{
    fn send(&mut self, frame: Bytes) -> BoxFuture<'_, Result<(), ClientError>> {
        Box::pin(async move {
            let text = String::from_utf8(frame.to_vec())
                .map_err(|_| ClientError::Transport("outbound frame is not UTF-8".to_string()))?;
            self.inner.send(WsMessage::Text(text)).await?;
            Ok(())
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), ClientError>> {
        Box::pin(async move {
            self.inner.close().await?;
            Ok(())
        })
    }
}

/// Inbound half of a WebSocket session.
///
/// Control frames are handled by tungstenite and never surface here.
pub struct WsSource<S> {
    inner: S,
}

impl<S> WsSource<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S> FrameSource for WsSource<S>
where
    S: Stream<Item = Result<WsMessage, WsError>> + Unpin + Send,
{
    fn recv(&mut self) -> BoxFuture<'_, Option<Result<Bytes, ClientError>>> {
        Box::pin(async move {
            loop {
                match self.inner.next().await? {
                    Ok(WsMessage::Text(text)) => return Some(Ok(Bytes::from(text))),
                    Ok(WsMessage::Binary(data)) => return Some(Ok(Bytes::from(data))),
                    Ok(WsMessage::Close(frame)) => {
                        tracing::debug!("WebSocket close frame received: {:?}", frame);
                        return None;
                    }
                    Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) | Ok(WsMessage::Frame(_)) => {
                        continue
                    }
                    Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => return None,
                    Err(e) => return Some(Err(e.into())),
                }
            }
        })
    }
}

/// Opens one-document-per-message sessions over WebSocket.
pub struct WebSocketConnector {
    url: String,
    connect_timeout: Duration,
    max_frame_size: usize,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
            max_frame_size: ctlwire_protocol::MAX_FRAME_SIZE,
        }
    }

    /// Caps inbound WebSocket messages and frames at `size` bytes.
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    fn ws_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_frame_size);
        config.max_frame_size = Some(self.max_frame_size);
        config
    }
}

impl Connector for WebSocketConnector {
    fn framing(&self) -> Framing {
        Framing::Messages
    }

    fn open(&self) -> BoxFuture<'_, Result<TransportHalves, ClientError>> {
        Box::pin(async move {
            tracing::debug!("Connecting to {}...", self.url);

            let (ws, _response) = tokio::time::timeout(
                self.connect_timeout,
                tokio_tungstenite::connect_async_with_config(
                    self.url.as_str(),
                    Some(self.ws_config()),
                    true,
                ),
            )
            .await
            .map_err(|_| ClientError::ConnectTimeout(self.connect_timeout))??;

            let (sink, stream) = ws.split();
            Ok(TransportHalves {
                sink: Box::new(WsSink::new(sink)),
                source: Box::new(WsSource::new(stream)),
            })
        })
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}
