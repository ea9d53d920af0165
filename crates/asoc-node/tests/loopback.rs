//! In-process end-to-end tests: real nodes over 127.0.0.1.
//!
//! Nodes use static peer lists so no UDP broadcast leaves the test
//! environment; discovery behavior has its own unit tests.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use asoc_node::{DownReason, Node, NodeConfig, NodeId, StreamOptions};
use asoc_wire::protocol::frame::{decode_frame_header, encode_frame_header, Frame, FrameHeader};
use asoc_wire::protocol::handshake::{decode_and_verify_hello, encode_hello, verify_accept};
use asoc_wire::protocol::{FrameType, HEADER_LEN};
use asoc_wire::{ApiKey, StreamId};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

static NEXT_PORT: AtomicU16 = AtomicU16::new(21100);

/// Log to the test output; RUST_LOG overrides the default filter.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("asoc_node=debug,asoc_wire=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_test_writer()
        .try_init();
}

fn next_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

const KEY: &[u8; 32] = b"0123456789abcdef0123456789abcdef";

fn config(port: u16) -> NodeConfig {
    NodeConfig::new("loopback-cluster", KEY.to_vec())
        .with_port(port)
        .with_discovery(false)
}

/// Start a connected pair: `a` dials `b` over its static peer list.
async fn start_pair() -> anyhow::Result<(Node, Node)> {
    init_tracing();
    let port_b = next_port();
    let b = Node::new(config(port_b))?;
    let a = Node::new(config(next_port()).with_static_peers([format!("127.0.0.1:{port_b}")]))?;
    b.start().await?;
    a.start().await?;
    Ok((a, b))
}

async fn wait_for_peer(node: &Node, timeout: Duration) -> anyhow::Result<NodeId> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(peer) = node.peers().first().copied() {
            return Ok(peer);
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("timeout waiting for a peer");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Collect (tag, bytes) for every inbound stream on `node`.
fn collect_streams(node: &Node) -> mpsc::UnboundedReceiver<(Option<u32>, Vec<u8>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    node.on_stream(move |_, reader| {
        let tx = tx.clone();
        tokio::spawn(async move {
            let tag = reader.tag();
            if let Ok(bytes) = reader.collect().await {
                let _ = tx.send((tag, bytes));
            }
        });
    });
    rx
}

#[tokio::test]
async fn loopback_single_tensor() -> anyhow::Result<()> {
    let (a, b) = start_pair().await?;
    let mut received = collect_streams(&b);

    let peer = wait_for_peer(&a, Duration::from_secs(5)).await?;
    assert_eq!(wait_for_peer(&b, Duration::from_secs(5)).await?, a.node_id());

    let payload = vec![0xABu8; 1024 * 1024];
    let result = a.stream(peer, payload.clone(), StreamOptions::default())?.await?;
    assert_eq!(result.bytes_sent, 1024 * 1024);
    assert_eq!(result.frames, 2); // one 1 MiB chunk + END

    let (tag, bytes) = received.recv().await.expect("stream delivered");
    assert_eq!(tag, None);
    assert_eq!(bytes.len(), 1_048_576);
    assert!(bytes.iter().all(|&byte| byte == 0xAB));

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn large_payload_chunking() -> anyhow::Result<()> {
    let (a, b) = start_pair().await?;
    let mut received = collect_streams(&b);
    let peer = wait_for_peer(&a, Duration::from_secs(5)).await?;

    // 7 MiB at 1 MiB chunks: DATA sequences 0..=6 plus END with sequence 7.
    let payload: Vec<u8> = (0..7 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let opts = StreamOptions {
        chunk_size: Some(1024 * 1024),
        stream_tag: None,
    };
    let result = a.stream(peer, payload.clone(), opts)?.await?;
    assert_eq!(result.frames, 8);

    let (_, bytes) = received.recv().await.expect("stream delivered");
    assert_eq!(bytes, payload);

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn zero_length_stream() -> anyhow::Result<()> {
    let (a, b) = start_pair().await?;
    let mut received = collect_streams(&b);
    let peer = wait_for_peer(&a, Duration::from_secs(5)).await?;

    let result = a.stream(peer, Vec::new(), StreamOptions::default())?.await?;
    assert_eq!(result.bytes_sent, 0);
    assert_eq!(result.frames, 1); // END only, sequence 0

    let (_, bytes) = received.recv().await.expect("stream delivered");
    assert!(bytes.is_empty());

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn concurrent_streams_interleave() -> anyhow::Result<()> {
    let (a, b) = start_pair().await?;
    let mut received = collect_streams(&b);
    let peer = wait_for_peer(&a, Duration::from_secs(5)).await?;

    // Four concurrent streams, small chunks so they interleave on the wire.
    let mut handles = Vec::new();
    for lane in 0..4u32 {
        let payload = vec![lane as u8; 256 * 1024];
        let opts = StreamOptions {
            chunk_size: Some(4 * 1024),
            stream_tag: Some(lane),
        };
        handles.push(a.stream(peer, payload, opts)?);
    }
    for handle in handles {
        handle.await?;
    }

    let mut seen = [false; 4];
    for _ in 0..4 {
        let (tag, bytes) = received.recv().await.expect("stream delivered");
        let lane = tag.expect("tag carried end-to-end") as usize;
        assert!(!seen[lane]);
        seen[lane] = true;
        // Per-stream order: a contiguous payload of the lane's byte.
        assert_eq!(bytes, vec![lane as u8; 256 * 1024]);
    }
    assert!(seen.iter().all(|&s| s));

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn acceptor_can_stream_back() -> anyhow::Result<()> {
    let (a, b) = start_pair().await?;
    let mut received = collect_streams(&a);

    let peer_of_b = wait_for_peer(&b, Duration::from_secs(5)).await?;
    assert_eq!(peer_of_b, a.node_id());

    // B accepted the transport, so its streams use even ids.
    b.stream(peer_of_b, vec![0x5Au8; 64 * 1024], StreamOptions::default())?
        .await?;
    let (_, bytes) = received.recv().await.expect("stream delivered");
    assert_eq!(bytes, vec![0x5Au8; 64 * 1024]);

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn stream_without_session_fails_synchronously() -> anyhow::Result<()> {
    init_tracing();
    let node = Node::new(config(next_port()))?;
    node.start().await?;

    let stranger = NodeId::generate();
    let result = node.stream(stranger, vec![1u8; 16], StreamOptions::default());
    assert!(matches!(
        result,
        Err(asoc_node::NodeError::NoSession(id)) if id == stranger
    ));

    let bad_opts = StreamOptions {
        chunk_size: Some(16),
        stream_tag: None,
    };
    assert!(matches!(
        node.stream(stranger, vec![1u8; 16], bad_opts),
        Err(asoc_node::NodeError::InvalidChunkSize(16))
    ));

    node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn reconnects_to_static_peer_that_starts_late() -> anyhow::Result<()> {
    init_tracing();
    let port_b = next_port();
    let a = Node::new(config(next_port()).with_static_peers([format!("127.0.0.1:{port_b}")]))?;
    a.start().await?;

    // Let a couple of dial attempts fail before the peer exists.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(a.peers().is_empty());

    let b = Node::new(config(port_b))?;
    let mut received = collect_streams(&b);
    b.start().await?;

    let peer = wait_for_peer(&a, Duration::from_secs(8)).await?;
    a.stream(peer, vec![7u8; 4096], StreamOptions::default())?.await?;
    let (_, bytes) = received.recv().await.expect("stream delivered");
    assert_eq!(bytes, vec![7u8; 4096]);

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn mismatched_keys_never_establish() -> anyhow::Result<()> {
    init_tracing();
    let port_b = next_port();
    let b = Node::new(
        NodeConfig::new("loopback-cluster", b"another-32-byte-key-entirely-ok!".to_vec())
            .with_port(port_b)
            .with_discovery(false),
    )?;
    let a = Node::new(config(next_port()).with_static_peers([format!("127.0.0.1:{port_b}")]))?;
    b.start().await?;
    a.start().await?;

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(a.peers().is_empty());
    assert!(b.peers().is_empty());

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

// === Raw-protocol peers for adversarial scenarios ===

async fn read_raw_frame(stream: &mut TcpStream) -> anyhow::Result<(FrameHeader, Vec<u8>)> {
    let mut header_buf = [0u8; HEADER_LEN];
    stream.read_exact(&mut header_buf).await?;
    let header = decode_frame_header(&header_buf)?;
    let mut payload = vec![0u8; header.len as usize];
    stream.read_exact(&mut payload).await?;
    Ok((header, payload))
}

async fn write_raw_frame(stream: &mut TcpStream, frame: &Frame) -> anyhow::Result<()> {
    stream.write_all(&encode_frame_header(&frame.header())).await?;
    stream.write_all(&frame.payload).await?;
    Ok(())
}

#[tokio::test]
async fn wrong_key_hello_gets_silence() -> anyhow::Result<()> {
    init_tracing();
    let port = next_port();
    let node = Node::new(config(port))?;
    node.start().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let bad_key = ApiKey::from("definitely-not-the-right-key");
    let hello = encode_hello(NodeId::generate(), 0x600D_CAFE, &bad_key);
    write_raw_frame(
        &mut stream,
        &Frame::handshake(FrameType::Hello, Bytes::copy_from_slice(&hello)),
    )
    .await?;

    // The node closes without writing anything back.
    let mut buf = [0u8; 64];
    match stream.read(&mut buf).await {
        Ok(0) => {}
        Ok(n) => anyhow::bail!("node leaked {n} bytes to an unauthenticated peer"),
        Err(_) => {} // reset is as silent as EOF
    }
    assert!(node.peers().is_empty());

    node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn sequence_gap_is_fatal_with_protocol_violation() -> anyhow::Result<()> {
    init_tracing();
    let port = next_port();
    let node = Node::new(config(port))?;

    let (down_tx, mut down_rx) = mpsc::unbounded_channel();
    node.on_peer_down(move |peer, reason| {
        let _ = down_tx.send((peer, reason));
    });
    node.start().await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Complete a legitimate handshake as a raw initiator.
    let key = ApiKey::new(KEY.to_vec());
    let rogue = NodeId::generate();
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let hello = encode_hello(rogue, 1, &key);
    write_raw_frame(
        &mut stream,
        &Frame::handshake(FrameType::Hello, Bytes::copy_from_slice(&hello)),
    )
    .await?;

    let (header, payload) = read_raw_frame(&mut stream).await?;
    assert_eq!(header.frame_type, FrameType::Hello);
    decode_and_verify_hello(&payload, &key)?;
    let (header, payload) = read_raw_frame(&mut stream).await?;
    assert_eq!(header.frame_type, FrameType::Accept);
    verify_accept(&payload, &key)?;

    // DATA sequences 0 then 2: the gap must kill the session.
    write_raw_frame(&mut stream, &Frame::data(StreamId(1), 0, Bytes::from_static(b"a"))).await?;
    write_raw_frame(&mut stream, &Frame::data(StreamId(1), 2, Bytes::from_static(b"c"))).await?;

    let (peer, reason) = tokio::time::timeout(Duration::from_secs(5), down_rx.recv())
        .await?
        .expect("peer down event");
    assert_eq!(peer, rogue);
    assert_eq!(reason, DownReason::ProtocolViolation);
    assert!(node.peers().is_empty());

    node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn peer_up_and_down_fire_once_per_peer() -> anyhow::Result<()> {
    init_tracing();
    let port_b = next_port();
    let b = Node::new(config(port_b))?;
    let a = Node::new(config(next_port()).with_static_peers([format!("127.0.0.1:{port_b}")]))?;

    let (up_tx, mut up_rx) = mpsc::unbounded_channel();
    a.on_peer_up(move |peer| {
        let _ = up_tx.send(peer);
    });
    let (down_tx, mut down_rx) = mpsc::unbounded_channel();
    a.on_peer_down(move |peer, reason| {
        let _ = down_tx.send((peer, reason));
    });

    b.start().await?;
    a.start().await?;

    let up = tokio::time::timeout(Duration::from_secs(5), up_rx.recv())
        .await?
        .expect("peer up");
    assert_eq!(up, b.node_id());

    a.shutdown().await;
    let (down, reason) = tokio::time::timeout(Duration::from_secs(5), down_rx.recv())
        .await?
        .expect("peer down");
    assert_eq!(down, b.node_id());
    assert_eq!(reason, DownReason::Shutdown);

    b.shutdown().await;
    Ok(())
}
