//! Transport seam between a shard and its socket.
//!
//! A shard only ever sees a [`TransportLink`]: a channel pair carrying raw
//! frames out and frames or a close notification in. [`WsConnector`] backs
//! the link with a WebSocket; [`MemoryConnector`] backs it with channels so
//! a shard can be driven from the same process.

use std::future::Future;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use crate::error::ShardError;

const LINK_BUFFER: usize = 32;

/// Close code reported when the transport dropped without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Close code reported when a close frame carried no status.
pub const NO_STATUS: u16 = 1005;

/// Frame written by a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Binary payload.
    Data(Vec<u8>),
    /// Close the transport with this code.
    Close(u16),
}

/// Something read from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Binary payload.
    Frame(Vec<u8>),
    /// The transport closed.
    Closed {
        /// Close code.
        code: u16,
        /// Whether a close frame was received.
        clean: bool,
    },
}

/// An open transport as seen by a shard.
#[derive(Debug)]
pub struct TransportLink {
    outbound: mpsc::Sender<OutboundFrame>,
    inbound: mpsc::Receiver<TransportEvent>,
}

impl TransportLink {
    /// Wrap a channel pair.
    #[must_use]
    pub fn new(
        outbound: mpsc::Sender<OutboundFrame>,
        inbound: mpsc::Receiver<TransportEvent>,
    ) -> Self {
        Self { outbound, inbound }
    }

    /// Queue a frame. Returns `false` if it was dropped.
    pub fn send(&self, frame: Vec<u8>) -> bool {
        self.outbound.try_send(OutboundFrame::Data(frame)).is_ok()
    }

    /// Next event from the transport.
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.inbound.recv().await
    }

    /// Ask the transport to close and release the link.
    pub fn close(self, code: u16) {
        let _ = self.outbound.try_send(OutboundFrame::Close(code));
    }
}

/// Opens transports.
pub trait Connector: Clone + Send + Sync + 'static {
    /// Open a transport to `url`.
    fn connect(&self, url: &str)
    -> impl Future<Output = Result<TransportLink, ShardError>> + Send;
}

/// WebSocket connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl WsConnector {
    /// Create a WebSocket connector.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    async fn reader_task(
        mut read: futures::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
        tx: mpsc::Sender<TransportEvent>,
    ) {
        loop {
            let msg = tokio::select! {
                () = tx.closed() => break,
                msg = read.next() => msg,
            };

            let event = match msg {
                Some(Ok(Message::Binary(data))) => TransportEvent::Frame(data),
                Some(Ok(Message::Text(text))) => TransportEvent::Frame(text.into_bytes()),
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map_or(NO_STATUS, |f| u16::from(f.code));
                    let _ = tx.send(TransportEvent::Closed { code, clean: true }).await;
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(error = %e, "websocket read failed");
                    let _ = tx
                        .send(TransportEvent::Closed {
                            code: ABNORMAL_CLOSURE,
                            clean: false,
                        })
                        .await;
                    break;
                }
                None => {
                    let _ = tx
                        .send(TransportEvent::Closed {
                            code: ABNORMAL_CLOSURE,
                            clean: false,
                        })
                        .await;
                    break;
                }
            };

            if tx.send(event).await.is_err() {
                break;
            }
        }
    }

    async fn writer_task(
        mut write: futures::stream::SplitSink<
            WebSocketStream<MaybeTlsStream<TcpStream>>,
            Message,
        >,
        mut rx: mpsc::Receiver<OutboundFrame>,
    ) {
        while let Some(frame) = rx.recv().await {
            match frame {
                OutboundFrame::Data(bytes) => {
                    trace!(len = bytes.len(), "websocket write");
                    if write.send(Message::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                OutboundFrame::Close(code) => {
                    let close = CloseFrame {
                        code: WsCloseCode::from(code),
                        reason: "".into(),
                    };
                    let _ = write.send(Message::Close(Some(close))).await;
                    break;
                }
            }
        }
        let _ = write.close().await;
    }
}

impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<TransportLink, ShardError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ShardError::GatewayConnection(format!("failed to connect: {e}")))?;

        let (write, read) = ws_stream.split();
        let (out_tx, out_rx) = mpsc::channel::<OutboundFrame>(LINK_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(LINK_BUFFER);

        tokio::spawn(Self::reader_task(read, in_tx));
        tokio::spawn(Self::writer_task(write, out_rx));

        Ok(TransportLink::new(out_tx, in_rx))
    }
}

/// In-process connector. Each connect hands a [`MemoryServer`] to the paired
/// [`MemoryListener`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<MemoryServer>,
}

/// Receives the server ends of [`MemoryConnector`] connections.
#[derive(Debug)]
pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<MemoryServer>,
}

impl MemoryConnector {
    /// Create a connector and its listener. Connects fail once the listener
    /// is dropped.
    #[must_use]
    pub fn pair() -> (Self, MemoryListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { accepted: tx }, MemoryListener { incoming: rx })
    }
}

impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<TransportLink, ShardError> {
        let (out_tx, out_rx) = mpsc::channel(LINK_BUFFER);
        let (in_tx, in_rx) = mpsc::channel(LINK_BUFFER);
        let server = MemoryServer {
            url: url.to_string(),
            outbound: out_rx,
            inbound: in_tx,
        };
        self.accepted
            .send(server)
            .map_err(|_| ShardError::GatewayConnection("memory listener closed".to_string()))?;
        Ok(TransportLink::new(out_tx, in_rx))
    }
}

impl MemoryListener {
    /// Wait for the next connection.
    pub async fn accept(&mut self) -> Option<MemoryServer> {
        self.incoming.recv().await
    }

    /// Take a pending connection without waiting.
    pub fn try_accept(&mut self) -> Option<MemoryServer> {
        self.incoming.try_recv().ok()
    }
}

/// Server end of an in-memory transport.
#[derive(Debug)]
pub struct MemoryServer {
    url: String,
    outbound: mpsc::Receiver<OutboundFrame>,
    inbound: mpsc::Sender<TransportEvent>,
}

impl MemoryServer {
    /// URL the client connected to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Next frame written by the client. `None` once the client released
    /// the link.
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        self.outbound.recv().await
    }

    /// Take a written frame without waiting.
    pub fn try_recv(&mut self) -> Option<OutboundFrame> {
        self.outbound.try_recv().ok()
    }

    /// Deliver a frame to the client. Returns `false` if the client is gone.
    pub async fn send_frame(&self, frame: Vec<u8>) -> bool {
        self.inbound.send(TransportEvent::Frame(frame)).await.is_ok()
    }

    /// Close the transport from the server side.
    pub async fn close(self, code: u16, clean: bool) {
        let _ = self.inbound.send(TransportEvent::Closed { code, clean }).await;
    }
}
