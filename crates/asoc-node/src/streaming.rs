//! Payload streaming above the frame layer.
//!
//! Outbound: a payload is split into DATA frames (sequence 0..N-1) followed
//! by one END frame (sequence N) and fed into the session's bounded writer
//! queue; the queue is the backpressure boundary, and concurrent streams
//! interleave at frame granularity because each feeds the queue one chunk at
//! a time.
//!
//! Inbound: a reassembler per session tracks active stream ids, enforces
//! strict sequencing, and exposes each stream to the application as a
//! [`StreamReader`].

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use asoc_wire::protocol::frame::Frame;
use asoc_wire::{NodeId, Role, StreamId};
use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::trace;

use crate::error::NodeError;
use crate::events::Callbacks;

/// Smallest accepted chunk size (4 KiB).
pub const MIN_CHUNK_SIZE: usize = 4 * 1024;

/// Largest accepted chunk size (16 MiB).
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Buffered chunks per inbound stream before the reader task stalls.
const INBOUND_BUFFER_CHUNKS: usize = 32;

/// Per-stream options for [`Node::stream`](crate::node::Node::stream).
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamOptions {
    /// Chunk size for this stream; the node default applies when unset.
    pub chunk_size: Option<usize>,
    /// Application label carried end-to-end with the stream.
    pub stream_tag: Option<u32>,
}

/// Completion value of a finished outbound stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamResult {
    pub stream_id: StreamId,
    pub bytes_sent: u64,
    /// DATA frames plus the END frame.
    pub frames: u32,
}

/// Awaitable completion of an outbound stream.
///
/// Resolves once every frame has been handed to the transport, or with
/// [`NodeError::Aborted`] if the session dies or the node shuts down first.
/// Dropping the handle does not cancel the transfer: once chunks have gone
/// out, the remainder still goes out to keep the wire valid.
pub struct StreamHandle {
    rx: oneshot::Receiver<Result<StreamResult, NodeError>>,
}

impl StreamHandle {
    pub(crate) fn new(rx: oneshot::Receiver<Result<StreamResult, NodeError>>) -> Self {
        Self { rx }
    }
}

impl Future for StreamHandle {
    type Output = Result<StreamResult, NodeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(NodeError::Aborted)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// The inbound stream ended before its END frame (session loss or shutdown).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("stream aborted before its END frame")]
pub struct StreamAborted;

enum ReaderItem {
    Chunk(Bytes),
    End,
}

/// In-order chunk reader for one inbound stream.
pub struct StreamReader {
    peer: NodeId,
    stream_id: StreamId,
    tag: Option<u32>,
    rx: mpsc::Receiver<ReaderItem>,
    finished: bool,
}

impl StreamReader {
    pub fn peer(&self) -> NodeId {
        self.peer
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Application tag announced by the sender, if any.
    pub fn tag(&self) -> Option<u32> {
        self.tag
    }

    /// Next chunk in sequence. `Ok(None)` is a clean end-of-stream; the
    /// error means the stream was cut off mid-flight.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, StreamAborted> {
        if self.finished {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(ReaderItem::Chunk(chunk)) => Ok(Some(chunk)),
            Some(ReaderItem::End) => {
                self.finished = true;
                Ok(None)
            }
            None => Err(StreamAborted),
        }
    }

    /// Drain the stream into one contiguous buffer.
    pub async fn collect(mut self) -> Result<Vec<u8>, StreamAborted> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }
}

impl std::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReader")
            .field("peer", &self.peer)
            .field("stream_id", &self.stream_id)
            .field("tag", &self.tag)
            .finish()
    }
}

// === Outbound ===

/// Outbound stream-id allocator for one session.
///
/// Hands out ids of the session role's parity, wraps at 2^32-1 skipping the
/// reserved id 0, and never reuses an id that is still active.
pub(crate) struct OutboundIds {
    state: Mutex<IdState>,
}

struct IdState {
    next: u32,
    active: HashSet<u32>,
}

impl OutboundIds {
    pub fn new(role: Role) -> Self {
        Self {
            state: Mutex::new(IdState {
                next: role.first_stream_id(),
                active: HashSet::new(),
            }),
        }
    }

    pub fn allocate(&self) -> StreamId {
        let mut state = self.state.lock();
        loop {
            let id = state.next;
            state.next = state.next.wrapping_add(2);
            if state.next == 0 {
                // Even parity wraps through 0; 0 is the handshake stream.
                state.next = 2;
            }
            if id != 0 && !state.active.contains(&id) {
                state.active.insert(id);
                return StreamId(id);
            }
        }
    }

    pub fn release(&self, id: StreamId) {
        self.state.lock().active.remove(&id.0);
    }
}

/// Chunk a payload into frames and feed the session's writer queue.
///
/// Runs as its own task so concurrent streams interleave on the queue.
pub(crate) async fn run_outbound(
    frames: mpsc::Sender<Frame>,
    ids: Arc<OutboundIds>,
    payload: Bytes,
    chunk_size: usize,
    tag: Option<u32>,
    mut shutdown: watch::Receiver<bool>,
    done: oneshot::Sender<Result<StreamResult, NodeError>>,
) {
    let stream_id = ids.allocate();
    let result = pump(&frames, stream_id, payload, chunk_size, tag, &mut shutdown).await;
    ids.release(stream_id);
    let _ = done.send(result);
}

async fn pump(
    frames: &mpsc::Sender<Frame>,
    stream_id: StreamId,
    payload: Bytes,
    chunk_size: usize,
    tag: Option<u32>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<StreamResult, NodeError> {
    if let Some(tag) = tag {
        let announce = Frame::control(stream_id, Bytes::copy_from_slice(&tag.to_be_bytes()));
        feed(frames, shutdown, announce).await?;
    }

    let total = payload.len();
    let mut seq = 0u32;
    let mut offset = 0usize;
    while offset < total {
        let end = usize::min(offset + chunk_size, total);
        feed(frames, shutdown, Frame::data(stream_id, seq, payload.slice(offset..end))).await?;
        seq += 1;
        offset = end;
    }
    feed(frames, shutdown, Frame::end(stream_id, seq)).await?;

    trace!("stream {stream_id} sent: {total} bytes in {seq} chunks");
    Ok(StreamResult {
        stream_id,
        bytes_sent: total as u64,
        frames: seq + 1,
    })
}

/// Enqueue one frame, suspending on queue backpressure, aborting on shutdown.
async fn feed(
    frames: &mpsc::Sender<Frame>,
    shutdown: &mut watch::Receiver<bool>,
    frame: Frame,
) -> Result<(), NodeError> {
    if *shutdown.borrow() {
        return Err(NodeError::Aborted);
    }
    tokio::select! {
        sent = frames.send(frame) => sent.map_err(|_| NodeError::Aborted),
        _ = shutdown.changed() => Err(NodeError::Aborted),
    }
}

// === Inbound ===

/// Session-fatal condition detected while routing inbound frames.
#[derive(Debug, Error)]
pub(crate) enum Violation {
    #[error("sequence gap on stream {stream}: expected {expected}, got {got}")]
    SequenceGap {
        stream: StreamId,
        expected: u32,
        got: u32,
    },
    #[error("stream {0} has the wrong parity for the remote role")]
    WrongParity(StreamId),
    #[error("handshake frame after session establishment")]
    HandshakeFrame,
}

struct InboundStream {
    next_seq: u32,
    tx: mpsc::Sender<ReaderItem>,
}

/// Per-session table of active inbound streams.
pub(crate) struct Reassembler {
    peer: NodeId,
    remote_role: Role,
    streams: HashMap<u32, InboundStream>,
    /// Tags announced by CONTROL frames for streams not yet opened.
    pending_tags: HashMap<u32, u32>,
    callbacks: Arc<Callbacks>,
}

impl Reassembler {
    pub fn new(peer: NodeId, remote_role: Role, callbacks: Arc<Callbacks>) -> Self {
        Self {
            peer,
            remote_role,
            streams: HashMap::new(),
            pending_tags: HashMap::new(),
            callbacks,
        }
    }

    /// CONTROL currently only carries the optional 4-byte stream tag; other
    /// payloads are reserved and ignored.
    pub fn on_control(&mut self, frame: &Frame) {
        if frame.payload.len() == 4 && !self.streams.contains_key(&frame.stream_id.0) {
            let tag = u32::from_be_bytes([
                frame.payload[0],
                frame.payload[1],
                frame.payload[2],
                frame.payload[3],
            ]);
            self.pending_tags.insert(frame.stream_id.0, tag);
        }
    }

    pub async fn on_data(&mut self, frame: Frame) -> Result<(), Violation> {
        if !self.streams.contains_key(&frame.stream_id.0) {
            self.open(frame.stream_id)?;
        }
        let stream = match self.streams.get_mut(&frame.stream_id.0) {
            Some(stream) => stream,
            None => return Ok(()),
        };
        if frame.seq != stream.next_seq {
            return Err(Violation::SequenceGap {
                stream: frame.stream_id,
                expected: stream.next_seq,
                got: frame.seq,
            });
        }
        stream.next_seq += 1;
        // A dropped reader means the application lost interest; keep
        // consuming so the wire stays in sequence.
        let _ = stream.tx.send(ReaderItem::Chunk(frame.payload)).await;
        Ok(())
    }

    pub async fn on_end(&mut self, frame: Frame) -> Result<(), Violation> {
        if !self.streams.contains_key(&frame.stream_id.0) {
            // Zero-length stream: END with sequence 0 and no DATA frames.
            self.open(frame.stream_id)?;
        }
        let stream = match self.streams.remove(&frame.stream_id.0) {
            Some(stream) => stream,
            None => return Ok(()),
        };
        if frame.seq != stream.next_seq {
            return Err(Violation::SequenceGap {
                stream: frame.stream_id,
                expected: stream.next_seq,
                got: frame.seq,
            });
        }
        let _ = stream.tx.send(ReaderItem::End).await;
        trace!("stream {} from {} complete", frame.stream_id, self.peer);
        Ok(())
    }

    /// Register a previously unseen stream and hand its reader out.
    fn open(&mut self, id: StreamId) -> Result<(), Violation> {
        if id.is_handshake() {
            return Err(Violation::HandshakeFrame);
        }
        if id.allocator() != self.remote_role {
            return Err(Violation::WrongParity(id));
        }
        let (tx, rx) = mpsc::channel(INBOUND_BUFFER_CHUNKS);
        let reader = StreamReader {
            peer: self.peer,
            stream_id: id,
            tag: self.pending_tags.remove(&id.0),
            rx,
            finished: false,
        };
        self.streams.insert(id.0, InboundStream { next_seq: 0, tx });
        trace!("stream {id} from {} opened", self.peer);
        self.callbacks.incoming(self.peer, reader);
        Ok(())
    }
}
