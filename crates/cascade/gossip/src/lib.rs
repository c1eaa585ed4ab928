//! Cascade Block Gossip
//!
//! Blocks arrive from peers in any order, but the DAG only accepts a block once every parent
//! and justification is present. This crate sits in front of the importer and holds blocks
//! back until their dependencies show up:
//!
//! ```text
//! Peer                              Local node
//!  │                                    │
//!  │  block C (parent B unknown)        │
//!  │───────────────────────────────────►│ BlockGossip: buffer C under B
//!  │                                    │
//!  │  FetchRequest { hash: B }          │
//!  │◄───────────────────────────────────│
//!  │                                    │
//!  │  block B                           │
//!  │───────────────────────────────────►│ import B, then retry C
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use cascade_gossip::{block_channel, fetch_channel, BlockGossip, GossipConfig};
//!
//! let (block_tx, block_rx) = block_channel(256);
//! let (fetch_tx, fetch_rx) = fetch_channel(256);
//! let gossip = BlockGossip::new(importer, fetch_tx, GossipConfig::default());
//! tokio::spawn(gossip.run(block_rx));
//! ```

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

mod block_gossip;
mod error;

pub use block_gossip::{
    block_channel, fetch_channel, BlockGossip, BlockImporter, BlockReceiver, BlockSender,
    FetchReceiver, FetchRequest, FetchSender,
};
pub use error::{GossipError, ImportError};

/// Gossip configuration constants
pub mod config {
    /// Blocks held back waiting for dependencies before new arrivals are dropped
    pub const DEFAULT_MAX_PENDING_BLOCKS: usize = 4096;

    /// Capacity of the block and fetch channels
    pub const DEFAULT_CHANNEL_SIZE: usize = 256;
}

/// Block gossip settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GossipConfig {
    /// Maximum number of buffered blocks
    pub max_pending_blocks: usize,
    /// Capacity used by the node for its gossip channels
    pub channel_size: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            max_pending_blocks: config::DEFAULT_MAX_PENDING_BLOCKS,
            channel_size: config::DEFAULT_CHANNEL_SIZE,
        }
    }
}

impl GossipConfig {
    /// Set the pending buffer limit
    pub const fn with_max_pending_blocks(mut self, max: usize) -> Self {
        self.max_pending_blocks = max;
        self
    }

    /// Set the channel capacity
    pub const fn with_channel_size(mut self, size: usize) -> Self {
        self.channel_size = size;
        self
    }
}
