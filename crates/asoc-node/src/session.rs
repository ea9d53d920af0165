//! Authenticated sessions: handshake, frame I/O, and lifecycle.
//!
//! A session owns one TCP connection to one peer. The handshake promotes the
//! raw transport: the initiator sends HELLO, the acceptor verifies it,
//! answers with a HELLO of its own (so the initiator learns and
//! authenticates the acceptor's identity) and an ACCEPT carrying the session
//! token. Any verification failure closes the transport with nothing written
//! back.
//!
//! After establishment a single writer task owns the write half (frame
//! atomicity on the wire) and a single reader task owns the read half
//! (wire-order demux into the reassembler). Either task ending tears the
//! session down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use asoc_wire::protocol::frame::{decode_frame_header, encode_frame_header, Frame, FrameCodec};
use asoc_wire::protocol::handshake::{
    decode_and_verify_hello, encode_accept, encode_hello, verify_accept,
};
use asoc_wire::protocol::{FrameType, HEADER_LEN};
use asoc_wire::{ApiKey, NodeId, Role, SessionToken, WireError};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tokio_util::codec::{Encoder, FramedRead};
use tracing::{debug, warn};

use crate::error::DownReason;
use crate::events::Callbacks;
use crate::streaming::{OutboundIds, Reassembler, Violation};

/// Frames buffered in the writer queue before senders suspend.
pub(crate) const SEND_WINDOW_FRAMES: usize = 10;

/// Timeouts applied to one session's transport operations.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SessionParams {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub drain_timeout: Duration,
    pub max_frame_bytes: usize,
}

/// Handshake failure. Logged locally; nothing is reported to the peer.
#[derive(Debug, Error)]
pub(crate) enum HandshakeError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out")]
    Timeout,
    #[error("wire: {0}")]
    Wire(#[from] WireError),
    #[error("unexpected frame during handshake")]
    UnexpectedFrame,
    #[error("peer identity does not match the discovered node id")]
    PeerMismatch,
    #[error("duplicate session with {0}")]
    Duplicate(NodeId),
}

/// A transport that completed the handshake but is not yet running.
pub(crate) struct Established {
    pub peer: NodeId,
    pub role: Role,
    pub token: SessionToken,
    pub stream: TcpStream,
}

/// Read exactly one frame. Strict decoding: anything unrecognized fails.
async fn read_frame(stream: &mut TcpStream, max_payload: usize) -> Result<Frame, HandshakeError> {
    let mut header_buf = [0u8; HEADER_LEN];
    stream.read_exact(&mut header_buf).await?;
    let header = decode_frame_header(&header_buf)?;
    if header.len as usize > max_payload {
        return Err(HandshakeError::Wire(WireError::BadLength {
            len: header.len as usize,
            max: max_payload,
        }));
    }
    let mut payload = vec![0u8; header.len as usize];
    stream.read_exact(&mut payload).await?;
    Ok(Frame {
        frame_type: header.frame_type,
        stream_id: header.stream_id,
        seq: header.seq,
        payload: payload.into(),
    })
}

async fn write_frames(stream: &mut TcpStream, frames: &[Frame]) -> Result<(), HandshakeError> {
    let mut buf = BytesMut::new();
    for frame in frames {
        buf.extend_from_slice(&encode_frame_header(&frame.header()));
        buf.extend_from_slice(&frame.payload);
    }
    stream.write_all(&buf).await?;
    Ok(())
}

/// Dial a peer and run the initiator side of the handshake.
///
/// `expected_peer` is set when the endpoint came from discovery; a mismatch
/// between the discovered id and the one proven in the acceptor's HELLO is
/// fatal for the attempt.
pub(crate) async fn connect_and_handshake(
    addr: SocketAddr,
    local: NodeId,
    api_key: &ApiKey,
    expected_peer: Option<NodeId>,
    params: &SessionParams,
) -> Result<Established, HandshakeError> {
    let mut stream = timeout(params.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| HandshakeError::Timeout)??;
    stream.set_nodelay(true)?;

    let max_frame = params.max_frame_bytes;
    let handshake = async move {
        let hello = encode_hello(local, rand::random(), api_key);
        write_frames(
            &mut stream,
            &[Frame::handshake(FrameType::Hello, Bytes::copy_from_slice(&hello))],
        )
        .await?;

        // The acceptor identifies itself before issuing the token.
        let frame = read_frame(&mut stream, max_frame).await?;
        if frame.frame_type != FrameType::Hello || !frame.stream_id.is_handshake() {
            return Err(HandshakeError::UnexpectedFrame);
        }
        let peer_hello = decode_and_verify_hello(&frame.payload, api_key)?;
        if let Some(expected) = expected_peer {
            if expected != peer_hello.node_id {
                return Err(HandshakeError::PeerMismatch);
            }
        }

        let frame = read_frame(&mut stream, max_frame).await?;
        if frame.frame_type != FrameType::Accept || !frame.stream_id.is_handshake() {
            return Err(HandshakeError::UnexpectedFrame);
        }
        let token = verify_accept(&frame.payload, api_key)?;

        Ok(Established {
            peer: peer_hello.node_id,
            role: Role::Initiator,
            token,
            stream,
        })
    };

    timeout(params.handshake_timeout, handshake)
        .await
        .map_err(|_| HandshakeError::Timeout)?
}

/// Run the acceptor side of the handshake on an inbound connection.
///
/// On any failure the connection is simply dropped: no error frame, no
/// bytes written back.
pub(crate) async fn accept_handshake(
    mut stream: TcpStream,
    local: NodeId,
    api_key: &ApiKey,
    is_established: impl Fn(NodeId) -> bool,
    params: &SessionParams,
) -> Result<Established, HandshakeError> {
    stream.set_nodelay(true)?;
    let max_frame = params.max_frame_bytes;
    let handshake = async move {
        let frame = read_frame(&mut stream, max_frame).await?;
        if frame.frame_type != FrameType::Hello || !frame.stream_id.is_handshake() {
            return Err(HandshakeError::UnexpectedFrame);
        }
        let hello = decode_and_verify_hello(&frame.payload, api_key)?;
        if is_established(hello.node_id) {
            return Err(HandshakeError::Duplicate(hello.node_id));
        }

        let token = SessionToken::generate();
        let our_hello = encode_hello(local, rand::random(), api_key);
        let accept = encode_accept(token, api_key);
        write_frames(
            &mut stream,
            &[
                Frame::handshake(FrameType::Hello, Bytes::copy_from_slice(&our_hello)),
                Frame::handshake(FrameType::Accept, Bytes::copy_from_slice(&accept)),
            ],
        )
        .await?;

        Ok(Established {
            peer: hello.node_id,
            role: Role::Acceptor,
            token,
            stream,
        })
    };

    timeout(params.handshake_timeout, handshake)
        .await
        .map_err(|_| HandshakeError::Timeout)?
}

/// Wait until a shutdown watch flips to true (or its sender is gone).
pub(crate) async fn await_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Notification that a running session ended.
pub(crate) struct SessionDown {
    pub peer: NodeId,
    pub reason: DownReason,
}

/// Handle to a running session, shared through the node's session table.
pub(crate) struct Session {
    pub peer: NodeId,
    pub role: Role,
    #[allow(dead_code)] // retained per protocol; never re-verified
    pub token: SessionToken,
    /// Endpoint this node dialed, when it was the initiator.
    pub dial_addr: Option<SocketAddr>,
    /// FIFO writer queue; the backpressure boundary for outbound streams.
    pub frames: mpsc::Sender<Frame>,
    pub ids: Arc<OutboundIds>,
    closed: watch::Receiver<bool>,
    reader_abort: AbortHandle,
    writer_abort: AbortHandle,
}

impl Session {
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wait until the session's tasks have ended.
    pub async fn wait_closed(&self) {
        let mut closed = self.closed.clone();
        while !*closed.borrow() {
            if closed.changed().await.is_err() {
                break;
            }
        }
    }

    /// Tear the session down without waiting for the writer to drain. The
    /// supervisor still runs to completion and reports the close.
    pub fn abort(&self) {
        self.reader_abort.abort();
        self.writer_abort.abort();
    }
}

/// Spawn the reader, writer, and supervisor for an established transport.
pub(crate) fn spawn_session(
    established: Established,
    dial_addr: Option<SocketAddr>,
    params: SessionParams,
    callbacks: Arc<Callbacks>,
    down_tx: mpsc::UnboundedSender<SessionDown>,
    shutdown: watch::Receiver<bool>,
) -> Arc<Session> {
    let Established {
        peer,
        role,
        token,
        stream,
    } = established;
    let (read_half, write_half) = stream.into_split();
    let (frame_tx, frame_rx) = mpsc::channel(SEND_WINDOW_FRAMES);
    let (closed_tx, closed_rx) = watch::channel(false);

    let mut reader = tokio::spawn(reader_loop(
        read_half,
        peer,
        role.remote(),
        params,
        callbacks,
    ));
    let mut writer = tokio::spawn(writer_loop(write_half, frame_rx, params, shutdown.clone()));
    let reader_abort = reader.abort_handle();
    let writer_abort = writer.abort_handle();

    tokio::spawn(async move {
        let reason = tokio::select! {
            read_end = &mut reader => {
                writer.abort();
                match read_end {
                    Ok(reason) => reason,
                    Err(_) => aborted_reason(&shutdown),
                }
            }
            write_end = &mut writer => {
                reader.abort();
                match write_end {
                    Ok(Ok(())) => DownReason::Shutdown,
                    Ok(Err(reason)) => reason,
                    Err(_) => aborted_reason(&shutdown),
                }
            }
        };
        debug!("session with {peer} ended: {reason}");
        let _ = closed_tx.send(true);
        let _ = down_tx.send(SessionDown { peer, reason });
    });

    Arc::new(Session {
        peer,
        role,
        token,
        dial_addr,
        frames: frame_tx,
        ids: Arc::new(OutboundIds::new(role)),
        closed: closed_rx,
        reader_abort,
        writer_abort,
    })
}

/// Reason for a task that was aborted rather than ran to completion: a
/// forced close during node shutdown, a dead transport otherwise.
fn aborted_reason(shutdown: &watch::Receiver<bool>) -> DownReason {
    if *shutdown.borrow() {
        DownReason::Shutdown
    } else {
        DownReason::Transport
    }
}

/// Pull frames off the FIFO queue and put them on the wire.
///
/// Returns `Ok(())` on a graceful close: every sender gone and the queue
/// drained, or node shutdown after writing out what was already queued.
async fn writer_loop(
    mut write_half: OwnedWriteHalf,
    mut frame_rx: mpsc::Receiver<Frame>,
    params: SessionParams,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), DownReason> {
    let mut codec = FrameCodec::new(params.max_frame_bytes);
    let mut buf = BytesMut::new();

    loop {
        let frame = tokio::select! {
            frame = frame_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = await_shutdown(&mut shutdown) => {
                // Flush what was queued before the shutdown, then close.
                while let Ok(frame) = frame_rx.try_recv() {
                    write_one(&mut write_half, &mut codec, &mut buf, frame, &params).await?;
                }
                break;
            }
        };
        write_one(&mut write_half, &mut codec, &mut buf, frame, &params).await?;
    }

    let _ = write_half.shutdown().await;
    Ok(())
}

async fn write_one(
    write_half: &mut OwnedWriteHalf,
    codec: &mut FrameCodec,
    buf: &mut BytesMut,
    frame: Frame,
    params: &SessionParams,
) -> Result<(), DownReason> {
    buf.clear();
    if codec.encode(frame, buf).is_err() {
        // Chunk sizing upstream should make this unreachable.
        return Err(DownReason::ProtocolViolation);
    }
    match timeout(params.drain_timeout, write_half.write_all(buf)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            debug!("session write failed: {err}");
            Err(DownReason::Transport)
        }
        Err(_) => {
            // The peer stopped draining; treat a stalled transport as dead.
            warn!("session write stalled past the drain deadline");
            Err(DownReason::Transport)
        }
    }
}

/// Read frames in wire order and route them into the reassembler.
async fn reader_loop(
    read_half: OwnedReadHalf,
    peer: NodeId,
    remote_role: Role,
    params: SessionParams,
    callbacks: Arc<Callbacks>,
) -> DownReason {
    let mut codec = FrameCodec::new(params.max_frame_bytes);
    codec.set_established();
    let mut framed = FramedRead::new(read_half, codec);
    let mut reassembler = Reassembler::new(peer, remote_role, callbacks);

    loop {
        let frame = match timeout(params.idle_timeout, framed.next()).await {
            Err(_) => {
                debug!("session with {peer} idle past the receive window");
                return DownReason::IdleTimeout;
            }
            Ok(None) => return DownReason::PeerClosed,
            Ok(Some(Err(WireError::Io(err)))) => {
                debug!("session read failed: {err}");
                return DownReason::Transport;
            }
            Ok(Some(Err(err))) => {
                warn!("protocol violation from {peer}: {err}");
                return DownReason::ProtocolViolation;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        if frame.stream_id.is_handshake() {
            warn!("protocol violation from {peer}: frame on the handshake stream");
            return DownReason::ProtocolViolation;
        }

        let routed: Result<(), Violation> = match frame.frame_type {
            FrameType::Data => reassembler.on_data(frame).await,
            FrameType::End => reassembler.on_end(frame).await,
            FrameType::Control => {
                reassembler.on_control(&frame);
                Ok(())
            }
            FrameType::Hello | FrameType::Accept => Err(Violation::HandshakeFrame),
        };

        if let Err(violation) = routed {
            warn!("protocol violation from {peer}: {violation}");
            return DownReason::ProtocolViolation;
        }
    }
}
