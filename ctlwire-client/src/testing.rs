//! In-memory connector used by the unit tests.

use crate::error::ClientError;
use crate::transport::{
    Connector, FrameSink, FrameSource, StreamSink, StreamSource, TransportHalves,
};
use bytes::Bytes;
use ctlwire_protocol::{Command, Framing, Response};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;

/// Hands out the remote end of every transport it opens.
pub(crate) struct MockConnector {
    framing: Framing,
    failing: AtomicBool,
    opens: Mutex<Vec<Instant>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    peers: mpsc::UnboundedSender<MockPeer>,
}

impl MockConnector {
    pub fn new(framing: Framing) -> (Arc<Self>, mpsc::UnboundedReceiver<MockPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            framing,
            failing: AtomicBool::new(false),
            opens: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
            peers,
        });
        (connector, rx)
    }

    /// Makes every following `open` fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Makes every following `open` wait until `release_opens`.
    pub fn hold_opens(&self) {
        *self.gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_opens(&self) {
        if let Some(gate) = self.gate.lock().take() {
            gate.close();
        }
    }

    pub fn open_count(&self) -> usize {
        self.opens.lock().len()
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.opens.lock().clone()
    }
}

impl Connector for MockConnector {
    fn framing(&self) -> Framing {
        self.framing
    }

    fn open(&self) -> BoxFuture<'_, Result<TransportHalves, ClientError>> {
        Box::pin(async move {
            self.opens.lock().push(Instant::now());
            let gate = self.gate.lock().clone();
            if let Some(gate) = gate {
                // Closing the semaphore releases every held open.
                let _ = gate.acquire().await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(ClientError::Transport("connection refused".to_string()));
            }

            let (halves, peer) = match self.framing {
                Framing::Lines => {
                    let (near, far) = tokio::io::duplex(64 * 1024);
                    let (read, write) = tokio::io::split(near);
                    let (far_read, far_write) = tokio::io::split(far);
                    let halves = TransportHalves {
                        sink: Box::new(StreamSink::new(write)),
                        source: Box::new(StreamSource::new(read, 8 * 1024)),
                    };
                    let peer = MockPeer::Stream {
                        reader: BufReader::new(far_read),
                        writer: far_write,
                    };
                    (halves, peer)
                }
                Framing::Messages => {
                    let (to_peer, from_client) = mpsc::unbounded_channel();
                    let (to_client, from_peer) = mpsc::unbounded_channel();
                    let halves = TransportHalves {
                        sink: Box::new(ChannelSink { tx: Some(to_peer) }),
                        source: Box::new(ChannelSource { rx: from_peer }),
                    };
                    let peer = MockPeer::Messages {
                        inbound: from_client,
                        outbound: to_client,
                    };
                    (halves, peer)
                }
            };

            self.peers
                .send(peer)
                .map_err(|_| ClientError::Transport("test harness gone".to_string()))?;
            Ok(halves)
        })
    }

    fn describe(&self) -> String {
        "mock://peer".to_string()
    }
}

struct ChannelSink {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
}

impl FrameSink for ChannelSink {
    fn send(&mut self, frame: Bytes) -> BoxFuture<'_, Result<(), ClientError>> {
        Box::pin(async move {
            let tx = self.tx.as_ref().ok_or(ClientError::ConnectionLost)?;
            tx.send(frame)
                .map_err(|_| ClientError::Transport("peer closed".to_string()))
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), ClientError>> {
        self.tx = None;
        Box::pin(async { Ok(()) })
    }
}

struct ChannelSource {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl FrameSource for ChannelSource {
    fn recv(&mut self) -> BoxFuture<'_, Option<Result<Bytes, ClientError>>> {
        Box::pin(async move { self.rx.recv().await.map(Ok) })
    }
}

/// Remote end of a mock transport. Dropping it closes the transport.
pub(crate) enum MockPeer {
    Stream {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    },
    Messages {
        inbound: mpsc::UnboundedReceiver<Bytes>,
        outbound: mpsc::UnboundedSender<Bytes>,
    },
}

impl MockPeer {
    /// Reads one raw frame written by the client, without the line terminator.
    pub async fn recv_line(&mut self) -> Option<String> {
        match self {
            MockPeer::Stream { reader, .. } => {
                let mut line = String::new();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => None,
                    Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
                }
            }
            MockPeer::Messages { inbound, .. } => {
                let frame = inbound.recv().await?;
                String::from_utf8(frame.to_vec()).ok()
            }
        }
    }

    /// Reads and decodes the next command sent by the client.
    pub async fn recv_command(&mut self) -> Option<Command> {
        let line = self.recv_line().await?;
        serde_json::from_str(&line).ok()
    }

    pub async fn reply(&mut self, response: &Response) {
        let framing = match self {
            MockPeer::Stream { .. } => Framing::Lines,
            MockPeer::Messages { .. } => Framing::Messages,
        };
        let frame = framing.encode(response).unwrap();
        self.send_raw(&frame).await;
    }

    pub async fn send_raw(&mut self, data: &[u8]) {
        match self {
            MockPeer::Stream { writer, .. } => {
                // The client may already be gone.
                let _ = writer.write_all(data).await;
            }
            MockPeer::Messages { outbound, .. } => {
                let _ = outbound.send(Bytes::copy_from_slice(data));
            }
        }
    }
}
