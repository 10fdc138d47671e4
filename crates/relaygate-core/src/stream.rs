//! Framed, bidirectional packet transport over any byte stream
//!
//! Frames are length-delimited (u32 big-endian) and carry one JSON encoded
//! [`Packet`]. End-of-stream and cancellation surface as terminal errors so
//! callers can tell a departed peer apart from a transient I/O fault.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::packet::{Packet, PacketError};

/// Largest accepted frame (16 MiB)
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// How long a stream's reader worker waits for its consumer before giving up
pub const DEFAULT_HANDOFF_WAIT: Duration = Duration::from_secs(1);

/// Errors surfaced by a packet stream
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream closed by peer")]
    Eof,

    #[error("stream cancelled")]
    Cancelled,

    #[error("stream already closed")]
    Closed,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed packet: {0}")]
    Decode(#[from] PacketError),
}

impl StreamError {
    /// Terminal errors end the stream; everything else is a transport fault
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamError::Eof | StreamError::Cancelled | StreamError::Closed
        )
    }

    fn normalize(self) -> Self {
        match self {
            StreamError::Io(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::UnexpectedEof
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionAborted
                        | std::io::ErrorKind::BrokenPipe
                ) =>
            {
                StreamError::Eof
            }
            other => other,
        }
    }
}

/// Length-delimited packet codec
#[derive(Debug)]
pub struct PacketCodec {
    inner: LengthDelimitedCodec,
}

impl PacketCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_BYTES)
                .new_codec(),
        }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = StreamError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, StreamError> {
        match self.inner.decode(src)? {
            Some(frame) => Ok(Some(Packet::decode(&frame)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = StreamError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), StreamError> {
        let frame = Bytes::from(item.encode()?);
        self.inner.encode(frame, dst)?;
        Ok(())
    }
}

/// Any byte transport a packet stream can run over (TCP, TLS, in-memory duplex)
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

type BoxedTransport = Box<dyn Transport>;

/// Sending half of a stream, as seen by the session router
#[async_trait]
pub trait PacketSender: Send + Sync {
    async fn send(&self, pkt: Packet) -> Result<(), StreamError>;

    /// Lifetime of the underlying connection
    fn context(&self) -> CancellationToken;

    /// Human-readable peer description for logs
    fn peer(&self) -> &str;
}

/// A persistent bidirectional packet stream
pub struct PacketStream {
    reader: Mutex<FramedRead<ReadHalf<BoxedTransport>, PacketCodec>>,
    writer: Mutex<FramedWrite<WriteHalf<BoxedTransport>, PacketCodec>>,
    lifetime: CancellationToken,
    closed: AtomicBool,
    peer: String,
}

impl PacketStream {
    pub fn new<T>(io: T, peer: impl Into<String>) -> Self
    where
        T: Transport + 'static,
    {
        Self::with_lifetime(io, peer, CancellationToken::new())
    }

    /// Build a stream whose lifetime is a child of `parent` (e.g. server shutdown)
    pub fn with_lifetime<T>(io: T, peer: impl Into<String>, parent: CancellationToken) -> Self
    where
        T: Transport + 'static,
    {
        let boxed: BoxedTransport = Box::new(io);
        let (r, w) = tokio::io::split(boxed);
        Self {
            reader: Mutex::new(FramedRead::new(r, PacketCodec::new())),
            writer: Mutex::new(FramedWrite::new(w, PacketCodec::new())),
            lifetime: parent.child_token(),
            closed: AtomicBool::new(false),
            peer: peer.into(),
        }
    }

    pub async fn send(&self, pkt: Packet) -> Result<(), StreamError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StreamError::Closed);
        }
        if self.lifetime.is_cancelled() {
            return Err(StreamError::Cancelled);
        }
        let result = {
            let mut writer = self.writer.lock().await;
            writer.send(pkt).await
        };
        if let Err(e) = result {
            let e = e.normalize();
            debug!("send to {} failed: {}", self.peer, e);
            self.close().await;
            return Err(e);
        }
        Ok(())
    }

    /// Receive the next packet, returning a terminal error on EOF or cancellation
    pub async fn recv(&self) -> Result<Packet, StreamError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StreamError::Closed);
        }
        let mut reader = self.reader.lock().await;
        tokio::select! {
            _ = self.lifetime.cancelled() => Err(StreamError::Cancelled),
            item = reader.next() => match item {
                Some(Ok(pkt)) => Ok(pkt),
                Some(Err(e)) => Err(e.normalize()),
                None => Err(StreamError::Eof),
            },
        }
    }

    pub fn context(&self) -> CancellationToken {
        self.lifetime.clone()
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Release the connection. Returns `true` only for the call that actually closed it.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.lifetime.cancel();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.close().await {
            debug!("closing {}: {}", self.peer, e);
        }
        debug!("stream {} closed", self.peer);
        true
    }
}

#[async_trait]
impl PacketSender for PacketStream {
    async fn send(&self, pkt: Packet) -> Result<(), StreamError> {
        PacketStream::send(self, pkt).await
    }

    fn context(&self) -> CancellationToken {
        PacketStream::context(self)
    }

    fn peer(&self) -> &str {
        PacketStream::peer(self)
    }
}

/// Spawn the per-stream reader worker.
///
/// Every completed read (packet, EOF or cancellation) is handed to the returned
/// queue. If the consumer does not take an item within `handoff_wait`, the
/// stream's lifetime is cancelled and the worker exits.
pub fn spawn_reader(
    stream: std::sync::Arc<PacketStream>,
    handoff_wait: Duration,
) -> mpsc::Receiver<Result<Packet, StreamError>> {
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        loop {
            let item = stream.recv().await;
            let terminal = item.is_err();
            match tx.send_timeout(item, handoff_wait).await {
                Ok(()) => {}
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    warn!(
                        "consumer of {} stalled for {:?}, cancelling stream",
                        stream.peer(),
                        handoff_wait
                    );
                    stream.context().cancel();
                    break;
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => break,
            }
            if terminal {
                break;
            }
        }
        debug!("reader worker for {} exited", stream.peer());
    });
    rx
}
