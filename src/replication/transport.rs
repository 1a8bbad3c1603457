//! TCP Transport
//!
//! Ordered, reliable message sessions between the hub and its edges.
//!
//! Uses Sans-IO pattern: frame encoding/decoding is separated from I/O for testability.
//!
//! Frame layout: `u32 BE payload length | u32 BE crc32 | bincode payload`.

use crate::domain::errors::SyncError;
use crate::domain::value_objects::{RelPath, SessionId};
use crate::replication::protocol::{message_type_name, Message};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Bytes in a frame header.
pub const FRAME_HEADER_LEN: usize = 8;

/// Upper bound on the encoding of every message that carries file content,
/// not counting the content and the path.
pub const CONTENT_ENVELOPE_BYTES: u64 = 64;

// ==================== Sans-IO Functions ====================

/// Encode a message into one frame (Sans-IO pattern).
pub fn encode_message(msg: &Message) -> anyhow::Result<Bytes> {
    let data = bincode::serialize(msg)?;
    let len = u32::try_from(data.len())?;

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + data.len());
    buf.put_u32(len);
    buf.put_u32(crc32fast::hash(&data));
    buf.extend_from_slice(&data);

    Ok(buf.freeze())
}

/// Encoded payload size of a message.
pub fn payload_len(msg: &Message) -> Result<u64, SyncError> {
    bincode::serialized_size(msg).map_err(|e| SyncError::Protocol(format!("unencodable message: {}", e)))
}

/// Whether `len` bytes of content for `path` fit in one frame.
///
/// Conservative: a file that passes is always sendable, whichever message
/// carries it.
pub fn content_fits(path: &RelPath, len: u64, max_frame_bytes: usize) -> bool {
    len.saturating_add(path.as_str().len() as u64)
        .saturating_add(CONTENT_ENVELOPE_BYTES)
        <= max_frame_bytes as u64
}

/// Frame header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub len: u32,
    pub checksum: u32,
}

/// Decode a frame header (Sans-IO pattern).
pub fn decode_header(buf: &[u8; FRAME_HEADER_LEN]) -> FrameHeader {
    FrameHeader {
        len: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
        checksum: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
    }
}

/// Verify and decode a frame payload (Sans-IO pattern).
pub fn decode_message(header: &FrameHeader, data: &[u8]) -> Result<Message, SyncError> {
    if crc32fast::hash(data) != header.checksum {
        return Err(SyncError::Protocol("frame checksum mismatch".to_string()));
    }
    bincode::deserialize(data).map_err(|e| SyncError::Protocol(format!("undecodable message: {}", e)))
}

/// One read from the wire.
#[derive(Debug)]
pub enum Frame {
    Message(Message),
    /// Frame was delimited correctly but its payload is unusable
    Malformed(String),
}

/// Read one frame.
///
/// Returns `Ok(None)` when the peer closed the stream between frames.
/// An oversized length prefix is a transport error since the stream can
/// no longer be resynchronized.
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<Frame>, SyncError>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(SyncError::Transport(e.to_string())),
    }

    let header = decode_header(&header_buf);
    let len = header.len as usize;
    if len > max_frame_bytes {
        return Err(SyncError::Transport(format!(
            "frame of {} bytes exceeds limit of {}",
            len, max_frame_bytes
        )));
    }

    let mut data = vec![0u8; len];
    reader
        .read_exact(&mut data)
        .await
        .map_err(|e| SyncError::Transport(e.to_string()))?;

    match decode_message(&header, &data) {
        Ok(msg) => Ok(Some(Frame::Message(msg))),
        Err(e) => Ok(Some(Frame::Malformed(e.to_string()))),
    }
}

/// Write one frame.
pub async fn write_frame<W>(writer: &mut W, msg: &Message) -> Result<(), SyncError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_message(msg).map_err(|e| SyncError::Protocol(e.to_string()))?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| SyncError::Transport(e.to_string()))
}

// ==================== Sessions ====================

/// Sending half of a live session.
///
/// Sends are queued and written in order by the session's writer task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    peer: SocketAddr,
    max_frame_bytes: usize,
    outbound: mpsc::UnboundedSender<Message>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queue a message for delivery.
    ///
    /// A message the peer would reject as oversized is refused here with
    /// `FrameTooLarge` and the session is left intact.
    pub fn send(&self, msg: Message) -> Result<(), SyncError> {
        let size = payload_len(&msg)?;
        if size > self.max_frame_bytes as u64 {
            return Err(SyncError::FrameTooLarge {
                size,
                limit: self.max_frame_bytes,
            });
        }
        self.outbound
            .send(msg)
            .map_err(|_| SyncError::Transport(format!("session {} is closed", self.id)))
    }
}

/// Events from the transport layer.
#[derive(Debug)]
pub enum TransportEvent {
    /// A session was established
    Connected(SessionHandle),
    /// Received a message from a session
    MessageReceived { from: SessionId, message: Message },
    /// A frame arrived that could not be decoded
    Malformed { from: SessionId, reason: String },
    /// A session ended
    Disconnected(SessionId),
}

/// Split a stream into reader and writer tasks.
///
/// `Connected` is queued before the reader starts, so it always precedes
/// the session's first message. Returns `None` if `events` is closed.
pub async fn open_session(
    stream: TcpStream,
    peer: SocketAddr,
    events: mpsc::Sender<TransportEvent>,
    max_frame_bytes: usize,
) -> Option<SessionHandle> {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let id = SessionId::new();
    let handle = SessionHandle {
        id,
        peer,
        max_frame_bytes,
        outbound,
    };

    if events.send(TransportEvent::Connected(handle.clone())).await.is_err() {
        return None;
    }

    tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            tracing::trace!("session {} send {}", id, message_type_name(&msg));
            if let Err(e) = write_frame(&mut writer, &msg).await {
                tracing::debug!("session {} write failed: {}", id, e);
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    tokio::spawn(async move {
        loop {
            let event = match read_frame(&mut reader, max_frame_bytes).await {
                Ok(Some(Frame::Message(message))) => TransportEvent::MessageReceived { from: id, message },
                Ok(Some(Frame::Malformed(reason))) => TransportEvent::Malformed { from: id, reason },
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("session {} read failed: {}", id, e);
                    break;
                }
            };
            if events.send(event).await.is_err() {
                return;
            }
        }
        let _ = events.send(TransportEvent::Disconnected(id)).await;
    });

    Some(handle)
}

/// Bind a listener and accept sessions in the background.
///
/// Returns the bound address, the event stream for all sessions, and the
/// accept task so the caller can stop accepting.
#[cfg_attr(coverage_nightly, coverage(off))]
pub async fn listen(
    addr: SocketAddr,
    max_frame_bytes: usize,
    capacity: usize,
) -> anyhow::Result<(SocketAddr, mpsc::Receiver<TransportEvent>, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let (event_tx, event_rx) = mpsc::channel(capacity);

    tracing::info!("transport listening on {}", local_addr);

    let accept = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tracing::debug!("accepted connection from {}", peer);
                    if open_session(stream, peer, event_tx.clone(), max_frame_bytes)
                        .await
                        .is_none()
                    {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!("failed to accept connection: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    });

    Ok((local_addr, event_rx, accept))
}

/// Connect to a listener.
///
/// The first event on the returned stream is `Connected` for this session.
#[cfg_attr(coverage_nightly, coverage(off))]
pub async fn connect(
    addr: &str,
    max_frame_bytes: usize,
    capacity: usize,
) -> Result<(SessionHandle, mpsc::Receiver<TransportEvent>), SyncError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| SyncError::Transport(format!("connect {}: {}", addr, e)))?;
    let peer = stream
        .peer_addr()
        .map_err(|e| SyncError::Transport(e.to_string()))?;

    let (event_tx, event_rx) = mpsc::channel(capacity);
    let handle = open_session(stream, peer, event_tx, max_frame_bytes)
        .await
        .ok_or_else(|| SyncError::Transport("session closed during setup".to_string()))?;

    Ok((handle, event_rx))
}
