//! The node: lifecycle, session table, connectors, and the public API.
//!
//! A node owns one TCP listener for inbound sessions, the optional discovery
//! service, and at most one session per remote node id. Membership sources
//! are discovery, a static peer list, or both (hybrid). Static peers are
//! redialed forever with doubling backoff; discovered peers get three
//! attempts before their record is evicted to await re-discovery.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use asoc_wire::crypto::community_hash;
use asoc_wire::{ApiKey, NodeId};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::NodeConfig;
use crate::discovery::{Discovery, DiscoveryConfig, PeerRecord};
use crate::error::{DownReason, NodeError};
use crate::events::Callbacks;
use crate::session::{
    accept_handshake, await_shutdown, connect_and_handshake, spawn_session, Established,
    HandshakeError, Session, SessionDown, SessionParams,
};
use crate::streaming::{
    run_outbound, StreamHandle, StreamOptions, StreamReader, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE,
};

/// Time allowed for sessions to drain queued frames during shutdown.
const SHUTDOWN_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Backoff ceiling for static peer redials.
const MAX_STATIC_BACKOFF: Duration = Duration::from_secs(60);

/// Attempts at a discovered peer before its record is evicted.
const DISCOVERED_DIAL_ATTEMPTS: u32 = 3;

/// An ASoc mesh node.
///
/// Construct with a validated [`NodeConfig`], register callbacks, then
/// [`start`](Node::start). All methods take `&self`; the node is cheap to
/// share behind an `Arc`.
pub struct Node {
    inner: Arc<Inner>,
    state: Mutex<RunState>,
}

struct RunState {
    started: bool,
    down_rx: Option<mpsc::UnboundedReceiver<SessionDown>>,
    tasks: Vec<JoinHandle<()>>,
    /// Kept apart from `tasks`: it must outlive them during shutdown so
    /// pending close events still surface with their real reasons.
    down_task: Option<JoinHandle<()>>,
}

struct Inner {
    config: NodeConfig,
    static_peers: Vec<(String, u16)>,
    id: NodeId,
    api_key: ApiKey,
    sessions: DashMap<NodeId, Arc<Session>>,
    /// Guards against concurrent dials to the same discovered peer.
    dialing: DashMap<NodeId, ()>,
    discovery: Option<Discovery>,
    callbacks: Arc<Callbacks>,
    down_tx: mpsc::UnboundedSender<SessionDown>,
    shutdown_tx: watch::Sender<bool>,
    params: SessionParams,
}

impl Node {
    /// Validate the configuration and build a node. No I/O happens here.
    pub fn new(config: NodeConfig) -> Result<Self, NodeError> {
        config.validate()?;
        let static_peers = config.parsed_static_peers()?;
        let id = config
            .node_id
            .map(NodeId::from_uuid)
            .unwrap_or_else(NodeId::generate);
        let api_key = config.api_key();

        let params = SessionParams {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: config.handshake_timeout(),
            idle_timeout: config.idle_timeout(),
            drain_timeout: Duration::from_secs(10),
            max_frame_bytes: config.max_frame_bytes,
        };

        let discovery = config.discovery_enabled().then(|| {
            Discovery::new(DiscoveryConfig {
                node_id: id,
                community_hash: community_hash(&config.community),
                api_key: api_key.clone(),
                advertised_port: config.port,
                discovery_port: config.discovery_port,
                interval: config.broadcast_interval(),
                ttl: config.peer_ttl(),
            })
        });

        let (down_tx, down_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                static_peers,
                id,
                api_key,
                sessions: DashMap::new(),
                dialing: DashMap::new(),
                discovery,
                callbacks: Arc::new(Callbacks::new()),
                down_tx,
                shutdown_tx,
                params,
            }),
            state: Mutex::new(RunState {
                started: false,
                down_rx: Some(down_rx),
                tasks: Vec::new(),
                down_task: None,
            }),
        })
    }

    /// This node's identity.
    pub fn node_id(&self) -> NodeId {
        self.inner.id
    }

    /// Node ids of currently established sessions.
    pub fn peers(&self) -> Vec<NodeId> {
        self.inner
            .sessions
            .iter()
            .map(|entry| *entry.key())
            .collect()
    }

    /// Peers currently visible to discovery (established or not).
    pub fn discovered_peers(&self) -> Vec<PeerRecord> {
        self.inner
            .discovery
            .as_ref()
            .map(|d| d.snapshot())
            .unwrap_or_default()
    }

    /// Register the inbound stream callback. Invoked once per stream with a
    /// reader; hand the reader to a task, don't block in the callback.
    pub fn on_stream(&self, callback: impl Fn(NodeId, StreamReader) + Send + Sync + 'static) {
        self.inner.callbacks.set_stream(callback);
    }

    pub fn on_peer_up(&self, callback: impl Fn(NodeId) + Send + Sync + 'static) {
        self.inner.callbacks.set_peer_up(callback);
    }

    pub fn on_peer_down(&self, callback: impl Fn(NodeId, DownReason) + Send + Sync + 'static) {
        self.inner.callbacks.set_peer_down(callback);
    }

    /// Bind the listener, start discovery and the connector tasks.
    pub async fn start(&self) -> Result<(), NodeError> {
        let mut state = self.state.lock();
        if state.started {
            return Ok(());
        }

        let listener = bind_listener(self.inner.config.port)?;
        info!(
            "node {} listening on TCP {}",
            self.inner.id, self.inner.config.port
        );
        if let Some(discovery) = &self.inner.discovery {
            discovery.start()?;
        }

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(accept_loop(self.inner.clone(), listener)));
        if let Some(down_rx) = state.down_rx.take() {
            state.down_task = Some(tokio::spawn(down_loop(self.inner.clone(), down_rx)));
        }
        for (host, port) in &self.inner.static_peers {
            tasks.push(tokio::spawn(maintain_static_peer(
                self.inner.clone(),
                host.clone(),
                *port,
            )));
        }
        if let Some(discovery) = &self.inner.discovery {
            tasks.push(tokio::spawn(discovered_connector(
                self.inner.clone(),
                discovery.subscribe(),
            )));
        }

        state.tasks = tasks;
        state.started = true;
        Ok(())
    }

    /// Enqueue a payload for delivery to a peer on an established session.
    ///
    /// Fails synchronously when no session exists or the chunk size is out
    /// of range; everything later (session loss, shutdown) resolves the
    /// returned handle with [`NodeError::Aborted`].
    pub fn stream(
        &self,
        peer: NodeId,
        payload: impl Into<Bytes>,
        opts: StreamOptions,
    ) -> Result<StreamHandle, NodeError> {
        let chunk_size = opts.chunk_size.unwrap_or(self.inner.config.chunk_size);
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size)
            || chunk_size > self.inner.config.max_frame_bytes
        {
            return Err(NodeError::InvalidChunkSize(chunk_size));
        }
        let session = self
            .inner
            .sessions
            .get(&peer)
            .map(|entry| entry.value().clone())
            .ok_or(NodeError::NoSession(peer))?;

        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(run_outbound(
            session.frames.clone(),
            session.ids.clone(),
            payload.into(),
            chunk_size,
            opts.stream_tag,
            self.inner.shutdown_tx.subscribe(),
            done_tx,
        ));
        Ok(StreamHandle::new(done_rx))
    }

    /// Close every session (draining queued frames up to 5 s), stop
    /// discovery, and abort the node's tasks. Outstanding `stream()`
    /// awaitables resolve with `Aborted`. Idempotent.
    pub async fn shutdown(&self) {
        let (tasks, down_task) = {
            let mut state = self.state.lock();
            if !state.started {
                return;
            }
            state.started = false;
            (std::mem::take(&mut state.tasks), state.down_task.take())
        };

        info!("node {} shutting down", self.inner.id);
        let _ = self.inner.shutdown_tx.send(true);
        if let Some(discovery) = &self.inner.discovery {
            discovery.stop();
        }
        // The down loop keeps running: close events already in flight (a
        // protocol violation racing the shutdown, say) must surface with
        // their real reasons, not as Shutdown.
        for task in &tasks {
            task.abort();
        }

        let sessions: Vec<Arc<Session>> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN_DEADLINE;
        for session in &sessions {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, session.wait_closed())
                .await
                .is_err()
            {
                session.abort();
            }
        }

        // Every session is closed; give the down loop a moment to dispatch
        // the close events and empty the table.
        let settle = tokio::time::Instant::now() + Duration::from_secs(1);
        while !self.inner.sessions.is_empty() && tokio::time::Instant::now() < settle {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if let Some(task) = down_task {
            task.abort();
        }

        // Whatever the down loop did not get to is reported here.
        for session in &sessions {
            if self.inner.sessions.remove(&session.peer).is_some() {
                self.inner.callbacks.peer_down(session.peer, DownReason::Shutdown);
            }
        }
    }
}

fn bind_listener(port: u16) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    TcpListener::from_std(socket.into())
}

impl Inner {
    /// Put an established transport into the session table and announce it.
    /// A concurrent session with the same peer wins: the newcomer is dropped,
    /// closing its transport.
    fn install_session(
        self: &Arc<Self>,
        established: Established,
        dial_addr: Option<SocketAddr>,
    ) -> Option<Arc<Session>> {
        let peer = established.peer;
        let session = match self.sessions.entry(peer) {
            Entry::Occupied(mut slot) => {
                if !slot.get().is_closed() {
                    debug!("dropping duplicate session with {peer}");
                    return None;
                }
                // The previous session died but has not been reaped yet.
                let session = spawn_session(
                    established,
                    dial_addr,
                    self.params,
                    self.callbacks.clone(),
                    self.down_tx.clone(),
                    self.shutdown_tx.subscribe(),
                );
                slot.insert(session.clone());
                session
            }
            Entry::Vacant(slot) => {
                let session = spawn_session(
                    established,
                    dial_addr,
                    self.params,
                    self.callbacks.clone(),
                    self.down_tx.clone(),
                    self.shutdown_tx.subscribe(),
                );
                slot.insert(session.clone());
                session
            }
        };
        info!("session with {peer} established as {:?}", session.role);
        self.callbacks.peer_up(peer);
        Some(session)
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = await_shutdown(&mut shutdown) => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tokio::spawn(handle_inbound(inner.clone(), stream, addr));
                }
                Err(err) => {
                    debug!("accept failed: {err}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn handle_inbound(inner: Arc<Inner>, stream: TcpStream, addr: SocketAddr) {
    // Refuse duplicates of live sessions only: a dead session that has not
    // been reaped yet must not block the peer's reconnect.
    let result = accept_handshake(
        stream,
        inner.id,
        &inner.api_key,
        |id| {
            inner
                .sessions
                .get(&id)
                .map(|session| !session.is_closed())
                .unwrap_or(false)
        },
        &inner.params,
    )
    .await;
    match result {
        Ok(established) => {
            inner.install_session(established, None);
        }
        // Closed silently; nothing was revealed to the remote.
        Err(err) => debug!("inbound handshake from {addr} failed: {err}"),
    }
}

/// React to session closures: callbacks, then the reconnect policy.
async fn down_loop(inner: Arc<Inner>, mut down_rx: mpsc::UnboundedReceiver<SessionDown>) {
    while let Some(SessionDown { peer, reason }) = down_rx.recv().await {
        // Only act if the closed session is still the registered one.
        if inner
            .sessions
            .remove_if(&peer, |_, session| session.is_closed())
            .is_none()
        {
            continue;
        }
        info!("peer {peer} down: {reason}");
        inner.callbacks.peer_down(peer, reason);

        if *inner.shutdown_tx.borrow() {
            continue;
        }
        // Static peers are redialed by their maintenance task; discovered
        // peers reconnect here while their record stays fresh.
        if let Some(discovery) = &inner.discovery {
            if let Some(record) = discovery.get(peer) {
                tokio::spawn(dial_discovered(inner.clone(), record));
            }
        }
    }
}

/// Keep one static endpoint connected, forever, with doubling backoff.
async fn maintain_static_peer(inner: Arc<Inner>, host: String, port: u16) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    let mut delay = Duration::from_secs(1);
    loop {
        if *shutdown.borrow() {
            return;
        }
        match dial_static(&inner, &host, port).await {
            Ok(session) => {
                delay = Duration::from_secs(1);
                tokio::select! {
                    _ = session.wait_closed() => {}
                    _ = await_shutdown(&mut shutdown) => return,
                }
            }
            Err(err) => {
                debug!("static peer {host}:{port} unreachable: {err}");
                let jitter = rand::thread_rng().gen_range(Duration::ZERO..=delay / 2);
                tokio::select! {
                    _ = tokio::time::sleep(delay + jitter) => {}
                    _ = await_shutdown(&mut shutdown) => return,
                }
                delay = std::cmp::min(delay * 2, MAX_STATIC_BACKOFF);
            }
        }
    }
}

async fn dial_static(
    inner: &Arc<Inner>,
    host: &str,
    port: u16,
) -> Result<Arc<Session>, HandshakeError> {
    let addr = resolve(host, port).await?;

    // An earlier dial to this endpoint may still be alive; watch that one.
    for entry in inner.sessions.iter() {
        if entry.value().dial_addr == Some(addr) && !entry.value().is_closed() {
            return Ok(entry.value().clone());
        }
    }

    let established =
        connect_and_handshake(addr, inner.id, &inner.api_key, None, &inner.params).await?;
    let peer = established.peer;
    match inner.install_session(established, Some(addr)) {
        Some(session) => Ok(session),
        // The peer connected to us first; its session carries the traffic.
        None => inner
            .sessions
            .get(&peer)
            .map(|entry| entry.value().clone())
            .ok_or(HandshakeError::Duplicate(peer)),
    }
}

async fn resolve(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "hostname resolved to nothing")
        })
}

/// Consume new-peer notifications from discovery and dial each one.
async fn discovered_connector(
    inner: Arc<Inner>,
    mut peers_rx: mpsc::UnboundedReceiver<PeerRecord>,
) {
    let mut shutdown = inner.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = await_shutdown(&mut shutdown) => return,
            record = peers_rx.recv() => match record {
                Some(record) => {
                    tokio::spawn(dial_discovered(inner.clone(), record));
                }
                None => return,
            }
        }
    }
}

/// Dial a discovered peer: up to three attempts, then eviction and
/// re-discovery.
async fn dial_discovered(inner: Arc<Inner>, record: PeerRecord) {
    let peer = record.node_id;
    if inner.sessions.contains_key(&peer) {
        return;
    }
    if inner.dialing.insert(peer, ()).is_some() {
        return;
    }

    let mut shutdown = inner.shutdown_tx.subscribe();
    for attempt in 1..=DISCOVERED_DIAL_ATTEMPTS {
        if *shutdown.borrow() || inner.sessions.contains_key(&peer) {
            break;
        }
        match connect_and_handshake(record.addr, inner.id, &inner.api_key, Some(peer), &inner.params)
            .await
        {
            Ok(established) => {
                if let Some(discovery) = &inner.discovery {
                    discovery.report_success(peer);
                }
                inner.install_session(established, Some(record.addr));
                break;
            }
            Err(err) => {
                debug!("dial {peer} attempt {attempt} failed: {err}");
                let evicted = inner
                    .discovery
                    .as_ref()
                    .map(|d| d.report_failure(peer))
                    .unwrap_or(false);
                if evicted {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    _ = await_shutdown(&mut shutdown) => break,
                }
            }
        }
    }

    inner.dialing.remove(&peer);
}
