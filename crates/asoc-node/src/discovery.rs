//! Zero-configuration LAN discovery.
//!
//! Every node broadcasts a 50-byte authenticated datagram on the discovery
//! port and listens for the datagrams of others. Accepted announcements feed
//! a time-bounded peer table; the connection layer subscribes to learn about
//! newly seen peers. Invalid datagrams are dropped silently and counted.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use asoc_wire::crypto::COMMUNITY_HASH_LEN;
use asoc_wire::protocol::discovery::{decode_and_verify_discovery, encode_discovery};
use asoc_wire::{ApiKey, NodeId};
use parking_lot::Mutex;
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// How long a (node id, challenge) pair stays in the replay cache.
const REPLAY_WINDOW: Duration = Duration::from_secs(120);

/// Jitter applied around the broadcast interval, each way.
const EMIT_JITTER: Duration = Duration::from_millis(250);

/// Consecutive connection failures before a peer record is evicted.
const MAX_PEER_FAILURES: u32 = 3;

/// One entry in the peer table.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub node_id: NodeId,
    /// Last-seen endpoint: source address plus the advertised session port.
    pub addr: SocketAddr,
    pub last_seen: Instant,
    /// Consecutive connection failures reported by the connection layer.
    pub failures: u32,
}

pub(crate) struct DiscoveryConfig {
    pub node_id: NodeId,
    pub community_hash: [u8; COMMUNITY_HASH_LEN],
    pub api_key: ApiKey,
    /// TCP port advertised in our datagrams.
    pub advertised_port: u16,
    pub discovery_port: u16,
    pub interval: Duration,
    pub ttl: Duration,
}

/// The discovery service: emit loop, receive loop, peer table.
pub(crate) struct Discovery {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Shared {
    cfg: DiscoveryConfig,
    peers: Mutex<HashMap<NodeId, PeerRecord>>,
    replay: Mutex<HashMap<(NodeId, u32), Instant>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<PeerRecord>>>,
    rejected: AtomicU64,
}

impl Discovery {
    pub fn new(cfg: DiscoveryConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                cfg,
                peers: Mutex::new(HashMap::new()),
                replay: Mutex::new(HashMap::new()),
                subscribers: Mutex::new(Vec::new()),
                rejected: AtomicU64::new(0),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Bind the broadcast socket and start the emit and receive loops.
    pub fn start(&self) -> std::io::Result<()> {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Ok(());
        }

        let socket = Arc::new(bind_broadcast_socket(self.shared.cfg.discovery_port)?);
        info!(
            "discovery listening on UDP {}",
            self.shared.cfg.discovery_port
        );

        tasks.push(tokio::spawn(emit_loop(self.shared.clone(), socket.clone())));
        tasks.push(tokio::spawn(recv_loop(self.shared.clone(), socket)));
        Ok(())
    }

    /// Stop the loops and release the socket. Idempotent.
    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Live peers, most recently seen first.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self.shared.peers.lock().values().cloned().collect();
        peers.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        peers
    }

    /// Register for notifications about newly seen peers.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PeerRecord> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.subscribers.lock().push(tx);
        rx
    }

    pub fn get(&self, node_id: NodeId) -> Option<PeerRecord> {
        self.shared.peers.lock().get(&node_id).cloned()
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.shared.peers.lock().contains_key(&node_id)
    }

    /// Record a connection failure. Returns true when the record was evicted
    /// (third consecutive failure); the peer returns on re-discovery.
    pub fn report_failure(&self, node_id: NodeId) -> bool {
        let mut peers = self.shared.peers.lock();
        if let Some(record) = peers.get_mut(&node_id) {
            record.failures += 1;
            if record.failures >= MAX_PEER_FAILURES {
                peers.remove(&node_id);
                warn!("evicting peer {node_id} after {MAX_PEER_FAILURES} failed connections");
                return true;
            }
        }
        false
    }

    pub fn report_success(&self, node_id: NodeId) {
        if let Some(record) = self.shared.peers.lock().get_mut(&node_id) {
            record.failures = 0;
        }
    }

    /// Datagrams dropped since start (bad length, community, signature,
    /// freshness, or replay).
    #[allow(dead_code)]
    pub fn rejected_count(&self) -> u64 {
        self.shared.rejected.load(Ordering::Relaxed)
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind_broadcast_socket(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default()
}

async fn emit_loop(shared: Arc<Shared>, socket: Arc<UdpSocket>) {
    let dest = SocketAddr::from((Ipv4Addr::BROADCAST, shared.cfg.discovery_port));
    loop {
        shared.prune(Instant::now());

        let datagram = encode_discovery(
            &shared.cfg.community_hash,
            shared.cfg.node_id,
            shared.cfg.advertised_port,
            unix_now(),
            rand::random(),
            &shared.cfg.api_key,
        );
        if let Err(err) = socket.send_to(&datagram, dest).await {
            debug!("discovery broadcast failed: {err}");
        }

        // Jitter de-synchronizes clusters that started together.
        let jitter = rand::thread_rng().gen_range(Duration::ZERO..=EMIT_JITTER * 2);
        tokio::time::sleep(shared.cfg.interval - EMIT_JITTER + jitter).await;
    }
}

async fn recv_loop(shared: Arc<Shared>, socket: Arc<UdpSocket>) {
    let mut buf = [0u8; 128];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => shared.handle_datagram(&buf[..len], from),
            Err(err) => {
                debug!("discovery receive failed: {err}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

impl Shared {
    /// Validate one inbound datagram and update the peer table.
    fn handle_datagram(&self, buf: &[u8], from: SocketAddr) {
        let announcement = match decode_and_verify_discovery(
            buf,
            &self.cfg.community_hash,
            &self.cfg.api_key,
            unix_now(),
        ) {
            Ok(announcement) => announcement,
            Err(err) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                trace!("dropping datagram from {from}: {err}");
                return;
            }
        };

        let now = Instant::now();
        {
            let mut replay = self.replay.lock();
            replay.retain(|_, seen| now.duration_since(*seen) < REPLAY_WINDOW);
            match replay.entry((announcement.node_id, announcement.challenge)) {
                Entry::Occupied(_) => {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    trace!("dropping replayed datagram from {from}");
                    return;
                }
                Entry::Vacant(slot) => {
                    slot.insert(now);
                }
            }
        }

        if announcement.node_id == self.cfg.node_id {
            return;
        }

        let record = PeerRecord {
            node_id: announcement.node_id,
            addr: SocketAddr::new(from.ip(), announcement.port),
            last_seen: now,
            failures: 0,
        };
        let fresh = {
            let mut peers = self.peers.lock();
            match peers.entry(announcement.node_id) {
                Entry::Occupied(mut slot) => {
                    let existing = slot.get_mut();
                    existing.addr = record.addr;
                    existing.last_seen = now;
                    false
                }
                Entry::Vacant(slot) => {
                    slot.insert(record.clone());
                    true
                }
            }
        };

        if fresh {
            debug!("discovered peer {} at {}", record.node_id, record.addr);
            self.subscribers
                .lock()
                .retain(|tx| tx.send(record.clone()).is_ok());
        }
    }

    /// Drop peers whose last datagram is older than the TTL.
    fn prune(&self, now: Instant) {
        let mut peers = self.peers.lock();
        peers.retain(|node_id, record| {
            let live = now.duration_since(record.last_seen) < self.cfg.ttl;
            if !live {
                debug!("peer {node_id} expired from the discovery table");
            }
            live
        });
    }
}
