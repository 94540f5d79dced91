//! # Transport Abstraction
//!
//! A minimal, async interface for moving whole messages between endpoints.
//!
//! ## Philosophy
//!
//! - **Message-Oriented**: The Transport knows nothing about commands or
//!   capabilities. It moves opaque buffers, one per message, in order.
//! - **Reliable**: Messages arrive exactly once and in the order they were
//!   sent, or the transport reports an error. Trust is established before a
//!   transport is handed to a channel.

use std::fmt;
use std::sync::Mutex;
use std::sync::PoisonError;

use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::ReadHalf;
use tokio::io::WriteHalf;
use tokio::sync::mpsc;

use tether_wire::DEFAULT_MAX_FRAME_LEN;

/// Errors that occur at the network/transport layer.
#[derive(Debug, Clone)]
pub enum Error {
    /// The peer is unreachable or the connection was dropped.
    ConnectionLost(String),
    /// The message exceeds what the transport will carry.
    PayloadTooLarge { len: usize, max: usize },
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::PayloadTooLarge { len, max } => {
                write!(f, "Payload of {} bytes too large for transport (max {})", len, max)
            }
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<tether_wire::Error> for Error {
    fn from(e: tether_wire::Error) -> Self {
        match e {
            tether_wire::Error::FrameTooLarge { len, max } => Self::PayloadTooLarge { len, max },
            other => Self::Io(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// An ordered, reliable message pipe to the peer.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one message.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Receives the next message, or `Ok(None)` once the peer has finished.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Stops sending. The peer's `recv` eventually returns `Ok(None)`.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A duplex in-process transport using tokio mpsc channels.
///
/// Messages sent on one half appear on the other half's `recv`.
pub struct DuplexChannelTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl DuplexChannelTransport {
    /// Creates a transport from separate tx and rx channels.
    pub fn new(tx: mpsc::UnboundedSender<Vec<u8>>, rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Creates a pair of transports connected to each other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (Self::new(tx_a, rx_b), Self::new(tx_b, rx_a))
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<Vec<u8>>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait::async_trait]
impl Transport for DuplexChannelTransport {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        let tx = self
            .sender()
            .ok_or_else(|| Error::ConnectionLost("Transport closed".into()))?;
        tx.send(payload.to_vec())
            .map_err(|_| Error::ConnectionLost("Channel closed".into()))
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    async fn close(&self) -> Result<()> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        Ok(())
    }
}

/// A transport over any tokio byte stream, using length-prefixed frames.
pub struct StreamTransport<R, W> {
    reader: tokio::sync::Mutex<R>,
    writer: tokio::sync::Mutex<W>,
    max_frame_len: usize,
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Caps the size of a single message in both directions.
    pub fn with_max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = tether_wire::frame_limit(max);
        self
    }
}

impl<S> StreamTransport<ReadHalf<S>, WriteHalf<S>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Splits a bidirectional stream (a socket, a `tokio::io::duplex` half)
    /// into a transport.
    pub fn from_stream(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

#[async_trait::async_trait]
impl<R, W> Transport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, payload: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        tether_wire::write_frame(&mut *writer, payload, self.max_frame_len).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut reader = self.reader.lock().await;
        Ok(tether_wire::read_frame(&mut *reader, self.max_frame_len).await?)
    }

    async fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await.map_err(|e| Error::Io(e.to_string()))
    }
}
