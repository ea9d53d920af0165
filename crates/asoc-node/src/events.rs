//! Application callback registries.
//!
//! Callbacks are invoked from the node's internal tasks; they must not
//! block. Anything long-running belongs in a task the callback spawns.

use std::sync::Arc;

use asoc_wire::NodeId;
use parking_lot::RwLock;

use crate::error::DownReason;
use crate::streaming::StreamReader;

pub type PeerUpFn = dyn Fn(NodeId) + Send + Sync;
pub type PeerDownFn = dyn Fn(NodeId, DownReason) + Send + Sync;
pub type StreamFn = dyn Fn(NodeId, StreamReader) + Send + Sync;

/// Shared registry of the three application callbacks.
#[derive(Default)]
pub(crate) struct Callbacks {
    on_peer_up: RwLock<Option<Arc<PeerUpFn>>>,
    on_peer_down: RwLock<Option<Arc<PeerDownFn>>>,
    on_stream: RwLock<Option<Arc<StreamFn>>>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_peer_up(&self, f: impl Fn(NodeId) + Send + Sync + 'static) {
        *self.on_peer_up.write() = Some(Arc::new(f));
    }

    pub fn set_peer_down(&self, f: impl Fn(NodeId, DownReason) + Send + Sync + 'static) {
        *self.on_peer_down.write() = Some(Arc::new(f));
    }

    pub fn set_stream(&self, f: impl Fn(NodeId, StreamReader) + Send + Sync + 'static) {
        *self.on_stream.write() = Some(Arc::new(f));
    }

    pub fn peer_up(&self, peer: NodeId) {
        let cb = self.on_peer_up.read().clone();
        if let Some(cb) = cb {
            cb(peer);
        }
    }

    pub fn peer_down(&self, peer: NodeId, reason: DownReason) {
        let cb = self.on_peer_down.read().clone();
        if let Some(cb) = cb {
            cb(peer, reason);
        }
    }

    /// Hand a new inbound stream to the application. Without a registered
    /// receiver the reader is dropped and the stream's chunks are discarded
    /// as they arrive.
    pub fn incoming(&self, peer: NodeId, reader: StreamReader) {
        let cb = self.on_stream.read().clone();
        if let Some(cb) = cb {
            cb(peer, reader);
        }
    }
}
