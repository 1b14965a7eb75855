use crate::dispatcher::DEFAULT_MAX_READ_LENGTH;
use crate::error::{KuromeError, Result};
use crate::frame::{self, FrameError};
use crate::message::{self, Message};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Capacity of the channel between the receive loop and its consumer. A full
/// channel suspends the receive loop, so a slow consumer slows the socket
/// down instead of losing messages.
pub const DEFAULT_RECEIVE_CAPACITY: usize = 1;

/// Largest inbound frame when no limit is configured: enough for a read
/// response of [`DEFAULT_MAX_READ_LENGTH`] bytes.
pub const DEFAULT_MAX_FRAME_LEN: usize = message::max_encoded_len(DEFAULT_MAX_READ_LENGTH as usize);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    /// A well-framed payload that is not a valid message. The link survives.
    #[error("Malformed message: {0}")]
    Parse(String),

    /// The socket failed, reached EOF or sent an oversized frame. Always the
    /// last item published.
    #[error("Connection lost: {0}")]
    Connection(String),
}

pub type LinkEvent = std::result::Result<Message, LinkError>;

/// One encrypted socket turned into an ordered stream of [`Message`]s plus a
/// serialized send path.
pub struct Link {
    peer_address: SocketAddr,
    max_frame_len: usize,
    reader: Mutex<Option<BoxedReader>>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    connected_tx: watch::Sender<bool>,
    closed: AtomicBool,
}

impl Link {
    pub fn new<S>(stream: S, peer_address: SocketAddr) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_max_frame_len(stream, peer_address, DEFAULT_MAX_FRAME_LEN)
    }

    /// A link that drops the connection when the peer announces a frame
    /// longer than `max_frame_len`.
    pub fn with_max_frame_len<S>(
        stream: S,
        peer_address: SocketAddr,
        max_frame_len: usize,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (connected_tx, _) = watch::channel(true);

        Arc::new(Self {
            peer_address,
            max_frame_len,
            reader: Mutex::new(Some(Box::new(read_half))),
            writer: tokio::sync::Mutex::new(Some(Box::new(write_half))),
            connected_tx,
            closed: AtomicBool::new(false),
        })
    }

    pub fn peer_address(&self) -> SocketAddr {
        self.peer_address
    }

    pub fn is_connected(&self) -> bool {
        *self.connected_tx.borrow()
    }

    /// Flips to `false` exactly once, when the link closes.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected_tx.subscribe()
    }

    /// Starts the receive loop. Returns `None` if it was already started.
    pub fn start(
        self: &Arc<Self>,
        capacity: usize,
    ) -> Option<(mpsc::Receiver<LinkEvent>, JoinHandle<()>)> {
        let reader = self.reader.lock().take()?;
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let link = self.clone();
        let handle = tokio::spawn(async move {
            link.receive_loop(reader, tx).await;
        });
        Some((rx, handle))
    }

    async fn receive_loop(self: Arc<Self>, mut reader: BoxedReader, tx: mpsc::Sender<LinkEvent>) {
        let mut connected = self.connected();
        debug!("Receive loop started for {}", self.peer_address);

        loop {
            let frame = tokio::select! {
                biased;
                _ = connected.wait_for(|up| !*up) => {
                    debug!("Link to {} closed locally", self.peer_address);
                    break;
                }
                frame = frame::read_frame(&mut reader, self.max_frame_len) => frame,
            };

            match frame {
                Ok(payload) => {
                    let event = match Message::decode(&payload) {
                        Ok(message) => {
                            trace!(
                                "Received {:?} (id={}) from {}",
                                message.component_type(),
                                message.id,
                                self.peer_address
                            );
                            Ok(message)
                        }
                        Err(e) => {
                            warn!(
                                "Dropping malformed frame ({} bytes) from {}: {}",
                                payload.len(),
                                self.peer_address,
                                e
                            );
                            Err(LinkError::Parse(e.to_string()))
                        }
                    };
                    if tx.send(event).await.is_err() {
                        debug!("Consumer for {} went away", self.peer_address);
                        break;
                    }
                }
                Err(e) => {
                    match &e {
                        FrameError::Closed => debug!("Peer {} closed the stream", self.peer_address),
                        _ => warn!("Read from {} failed: {}", self.peer_address, e),
                    }
                    let _ = tx.send(Err(LinkError::Connection(e.to_string()))).await;
                    break;
                }
            }
        }

        drop(reader);
        self.close().await;
        debug!("Receive loop stopped for {}", self.peer_address);
    }

    /// Sends one frame. Failures are logged and close the link; they are not
    /// returned to the caller.
    pub async fn send(&self, payload: &[u8]) {
        if let Err(e) = self.try_send(payload).await {
            if self.is_connected() {
                warn!("Send to {} failed: {}", self.peer_address, e);
            } else {
                debug!("Send to {} skipped: {}", self.peer_address, e);
            }
            self.close().await;
        }
    }

    pub async fn send_message(&self, message: &Message) {
        match message.encode() {
            Ok(payload) => self.send(&payload).await,
            Err(e) => warn!(
                "Failed to encode {:?} for {}: {}",
                message.component_type(),
                self.peer_address,
                e
            ),
        }
    }

    /// Like [`send`](Self::send) but reports the failure.
    pub async fn try_send(&self, payload: &[u8]) -> Result<()> {
        let mut connected = self.connected();
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(KuromeError::NotConnected)?;

        tokio::select! {
            biased;
            _ = connected.wait_for(|up| !*up) => Err(KuromeError::NotConnected),
            written = frame::write_frame(writer, payload) => written.map_err(KuromeError::Io),
        }
    }

    /// Idempotent. The first call flips the connected signal, which stops the
    /// receive loop, and shuts the write half down.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connected_tx.send_replace(false);

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                trace!("Shutdown of {} failed: {}", self.peer_address, e);
            }
        }
        debug!("Link to {} closed", self.peer_address);
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("peer_address", &self.peer_address)
            .field("connected", &self.is_connected())
            .finish()
    }
}
