//! # asoc-node
//!
//! Runtime for an ASoc mesh node: authenticated LAN discovery over UDP
//! broadcast, one HMAC-authenticated TCP session per peer, and multiplexed,
//! backpressured streaming of opaque payloads ("tensors") over those
//! sessions.
//!
//! ## Quick start
//!
//! ```no_run
//! use asoc_node::{Node, NodeConfig, StreamOptions};
//!
//! # async fn example() -> Result<(), asoc_node::NodeError> {
//! let node = Node::new(NodeConfig::new("my-cluster", *b"0123456789abcdef0123456789abcdef"))?;
//! node.on_stream(|peer, reader| {
//!     tokio::spawn(async move {
//!         if let Ok(bytes) = reader.collect().await {
//!             println!("{} sent {} bytes", peer, bytes.len());
//!         }
//!     });
//! });
//! node.start().await?;
//!
//! // ... once a peer is up:
//! for peer in node.peers() {
//!     node.stream(peer, vec![0u8; 1024 * 1024], StreamOptions::default())?.await?;
//! }
//! node.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod node;
pub mod streaming;

mod events;
mod session;

// Re-export commonly used items at crate root
pub use asoc_wire::{NodeId, StreamId};
pub use config::NodeConfig;
pub use discovery::PeerRecord;
pub use error::{DownReason, NodeError};
pub use node::Node;
pub use streaming::{StreamAborted, StreamHandle, StreamOptions, StreamReader, StreamResult};
