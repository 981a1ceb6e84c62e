//! The byte-duplex link contract and a TCP reference implementation.
//!
//! The production radio driver is an external collaborator; everything
//! the mesh needs from it is this trait: frame-delimited send/receive, a
//! negotiated maximum frame size, and an optional quality indicator for
//! UI sorting. The TCP implementation exists for integration tests and
//! the demo binary: frames are u32 length-prefixed on the stream, and
//! every operation carries a timeout after which the link counts as
//! broken.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Largest frame a link will accept, with slack over the wire maximum.
pub const MAX_FRAME_LEN: usize = bitchat_proto::MAX_PACKET_LEN + 1024;

/// Default per-operation timeout.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(10);

/// Link failures. All of them mean the link is done; the runtime marks
/// the peer disconnected and tears the reader down.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Underlying transport failure.
    #[error("link i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The per-operation deadline elapsed.
    #[error("link operation timed out")]
    Timeout,

    /// Peer closed the stream.
    #[error("link closed by peer")]
    Closed,

    /// Frame exceeds [`MAX_FRAME_LEN`].
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// One byte-duplex channel to a neighbor.
#[async_trait]
pub trait Link: Send + Sync + 'static {
    /// Write one frame.
    async fn send_frame(&self, frame: &[u8]) -> Result<(), LinkError>;

    /// Read the next frame.
    async fn recv_frame(&self) -> Result<Vec<u8>, LinkError>;

    /// Negotiated maximum frame size.
    fn mtu(&self) -> usize;

    /// Link-quality indicator for UI sorting. Not used by the router.
    fn quality(&self) -> Option<i8> {
        None
    }
}

/// Length-prefixed TCP link.
pub struct TcpLink {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    mtu: usize,
    op_timeout: Duration,
}

impl TcpLink {
    /// Wrap an established stream.
    #[must_use]
    pub fn new(stream: TcpStream, mtu: usize, op_timeout: Duration) -> Self {
        let (reader, writer) = stream.into_split();
        Self { reader: Mutex::new(reader), writer: Mutex::new(writer), mtu, op_timeout }
    }

    /// Connect to a peer's listener.
    pub async fn connect(addr: &str, mtu: usize) -> Result<Self, LinkError> {
        let stream = timeout(DEFAULT_OP_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| LinkError::Timeout)??;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream, mtu, DEFAULT_OP_TIMEOUT))
    }
}

#[async_trait]
impl Link for TcpLink {
    async fn send_frame(&self, frame: &[u8]) -> Result<(), LinkError> {
        if frame.len() > MAX_FRAME_LEN {
            return Err(LinkError::FrameTooLarge(frame.len()));
        }
        let mut writer = self.writer.lock().await;
        let write = async {
            writer.write_all(&(frame.len() as u32).to_be_bytes()).await?;
            writer.write_all(frame).await?;
            writer.flush().await
        };
        timeout(self.op_timeout, write).await.map_err(|_| LinkError::Timeout)??;
        Ok(())
    }

    async fn recv_frame(&self) -> Result<Vec<u8>, LinkError> {
        let mut reader = self.reader.lock().await;
        // No deadline on waiting for the next frame (links are quiet
        // between packets); the deadline covers the frame body, where a
        // stall means a broken peer.
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes).await {
            Ok(_) => {},
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(LinkError::Closed);
            },
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_FRAME_LEN {
            return Err(LinkError::FrameTooLarge(len));
        }
        let mut frame = vec![0u8; len];
        timeout(self.op_timeout, reader.read_exact(&mut frame))
            .await
            .map_err(|_| LinkError::Timeout)?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    LinkError::Closed
                } else {
                    LinkError::Io(e)
                }
            })?;
        Ok(frame)
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}
