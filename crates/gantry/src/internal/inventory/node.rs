use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::time::Instant;

use crate::internal::common::ids::NodeIndex;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Unknown,
    Idle,
    Allocated,
    Down,
    Drained,
    Draining,
    Completing,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Unknown => "unknown",
            NodeState::Idle => "idle",
            NodeState::Allocated => "allocated",
            NodeState::Down => "down",
            NodeState::Drained => "drained",
            NodeState::Draining => "draining",
            NodeState::Completing => "completing",
        };
        f.write_str(name)
    }
}

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct NodeFlags: u32 {
        const DRAIN = 0b00001;
        const COMPLETING = 0b00010;
        const FAIL = 0b00100;
        const POWER_SAVE = 0b01000;
        // Node is a member of a topology block
        const TOPOLOGY = 0b10000;
    }
}

pub type Coords = SmallVec<[u16; 5]>;

pub struct Node {
    pub(crate) index: NodeIndex,
    pub(crate) name: String,
    pub(crate) address: Option<String>,
    pub(crate) cpus: u32,
    pub(crate) real_memory: u64,
    pub(crate) tmp_disk: u64,
    pub(crate) features: Vec<String>,
    pub(crate) state: NodeState,
    pub(crate) flags: NodeFlags,
    pub(crate) reason: Option<String>,
    // Midplane coordinates followed by the position inside the midplane
    pub(crate) coords: Coords,
    pub(crate) last_heard: Option<Instant>,
    pub(crate) partitions: SmallVec<[usize; 2]>,
    // Number of jobs holding this node
    pub(crate) job_count: u32,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("cpus", &self.cpus)
            .field("state", &self.state)
            .field("flags", &self.flags)
            .finish()
    }
}

impl Node {
    pub fn new(index: NodeIndex, name: String, cpus: u32) -> Self {
        Node {
            index,
            name,
            address: None,
            cpus,
            real_memory: 0,
            tmp_disk: 0,
            features: Vec::new(),
            state: NodeState::Idle,
            flags: NodeFlags::empty(),
            reason: None,
            coords: Default::default(),
            last_heard: None,
            partitions: Default::default(),
            job_count: 0,
        }
    }

    #[inline]
    pub fn index(&self) -> NodeIndex {
        self.index
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    #[inline]
    pub fn cpus(&self) -> u32 {
        self.cpus
    }

    pub fn real_memory(&self) -> u64 {
        self.real_memory
    }

    pub fn tmp_disk(&self) -> u64 {
        self.tmp_disk
    }

    pub fn features(&self) -> &[String] {
        &self.features
    }

    pub fn has_features(&self, required: &[String]) -> bool {
        required.iter().all(|f| self.features.contains(f))
    }

    #[inline]
    pub fn state(&self) -> NodeState {
        self.state
    }

    #[inline]
    pub fn flags(&self) -> NodeFlags {
        self.flags
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn coords(&self) -> &[u16] {
        &self.coords
    }

    pub fn last_heard(&self) -> Option<Instant> {
        self.last_heard
    }

    pub fn partitions(&self) -> &[usize] {
        &self.partitions
    }

    /// A node is usable by steps unless it is down, unknown or failed.
    /// Drained nodes still serve the jobs that already hold them.
    pub fn is_up(&self) -> bool {
        !matches!(self.state, NodeState::Down | NodeState::Unknown)
            && !self.flags.contains(NodeFlags::FAIL)
    }

    pub(crate) fn refresh_state(&mut self) {
        if matches!(self.state, NodeState::Down | NodeState::Unknown) {
            return;
        }
        let busy = self.job_count > 0;
        self.state = match (self.flags.contains(NodeFlags::DRAIN), busy) {
            (true, true) => NodeState::Draining,
            (true, false) => NodeState::Drained,
            (false, true) => NodeState::Allocated,
            (false, false) if self.flags.contains(NodeFlags::COMPLETING) => NodeState::Completing,
            (false, false) => NodeState::Idle,
        };
    }
}
