mod aggregate;
mod block;
mod config;
mod engine;
mod geometry;
mod hardware;
mod wiring;

pub use block::{Block, BlockRequest, BlockState, Lease};
pub use engine::{BlockEngine, Midplane, poll_teardowns, release_block, reserve_block};
pub use geometry::{BoxShape, Dims};
pub use hardware::{BlockHardware, HardwareReservation, InMemoryHardware, RESERVATION_PREFIX};
pub use wiring::{Connection, Port, SwitchId, Wiring, compute_wiring, resolve_connection};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest block, in multiples of the base block size.
pub const MAX_BLOCK_LEVEL: u32 = 15;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    #[default]
    Mesh,
    Torus,
    /// Sub-midplane block.
    Small,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopologyConfigError {
    #[error("no topology blocks are configured")]
    NoBlocks,
    #[error("block {block}: {reason}")]
    InvalidNodes { block: String, reason: String },
    #[error("block {block} has {nodes} nodes, not a multiple of the base size {base}")]
    BlockSizeNotMultiple {
        block: String,
        nodes: usize,
        base: usize,
    },
    #[error("node {node} is part of blocks {first} and {second}")]
    NodeInTwoBlocks {
        node: String,
        first: String,
        second: String,
    },
    #[error("invalid block size series `{0}`")]
    InvalidBlockSizes(String),
    #[error("block size {size} is not a power-of-two multiple of the base size {base}")]
    SizeNotPowerOfTwo { size: usize, base: usize },
    #[error("block size {size} exceeds the largest allowed size {max}")]
    SizeTooLarge { size: usize, max: usize },
    #[error("block {0} has no coordinates")]
    MissingCoords(String),
    #[error("block {block} has invalid coordinates {coords}")]
    BadCoords { block: String, coords: String },
    #[error("blocks {0} and {1} share coordinates")]
    DuplicateCoords(String, String),
    #[error("aggregated block {0} is not rectangular")]
    NotRectangular(String),
    #[error("ionodes per midplane ({0}) must be a power of two")]
    InvalidIonodeCount(u32),
    #[error("invalid managed node list: {0}")]
    InvalidManagedNodes(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("no block fits the request")]
    NoBlockAvailable,
    #[error("unknown block {0}")]
    UnknownBlock(String),
    #[error("block {0} is in use")]
    BlockBusy(String),
    #[error("invalid block request: {0}")]
    InvalidRequest(String),
    #[error("interconnect hardware error: {0}")]
    Hardware(String),
}
