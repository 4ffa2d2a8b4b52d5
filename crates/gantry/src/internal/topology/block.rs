use std::fmt;

use smallvec::SmallVec;

use crate::internal::common::bitmap::Bitmap;
use crate::internal::common::ids::StepKey;
use crate::internal::inventory::Coords;
use crate::internal::topology::ConnectionType;
use crate::internal::topology::geometry::BoxShape;
use crate::internal::topology::wiring::Wiring;

/// Ownership of a block by a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub owner: StepKey,
    pub connection: SmallVec<[ConnectionType; 5]>,
    pub wiring: Wiring,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockState {
    Free,
    /// Selected for a step, waiting for the hardware.
    Reserving(Lease),
    Active {
        lease: Lease,
        reservation_id: String,
    },
    /// Released, waiting for the hardware to confirm the teardown.
    TeardownPending {
        lease: Lease,
        reservation_id: String,
    },
}

impl BlockState {
    pub fn lease(&self) -> Option<&Lease> {
        match self {
            BlockState::Free => None,
            BlockState::Reserving(lease)
            | BlockState::Active { lease, .. }
            | BlockState::TeardownPending { lease, .. } => Some(lease),
        }
    }

    pub fn reservation_id(&self) -> Option<&str> {
        match self {
            BlockState::Active { reservation_id, .. }
            | BlockState::TeardownPending { reservation_id, .. } => Some(reservation_id),
            BlockState::Free | BlockState::Reserving(_) => None,
        }
    }
}

/// A rectangular set of midplanes that can be dedicated to one step.
pub struct Block {
    pub(crate) name: String,
    pub(crate) level: u32,
    pub(crate) midplanes: Bitmap,
    pub(crate) first_midplane: usize,
    pub(crate) shape: BoxShape,
    pub(crate) nodes: Bitmap,
    /// Set only for sub-midplane blocks.
    pub(crate) ionodes: Option<Bitmap>,
    pub(crate) state: BlockState,
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("name", &self.name)
            .field("level", &self.level)
            .field("shape", &self.shape.to_string())
            .field("ionodes", &self.ionodes)
            .field("state", &self.state)
            .finish()
    }
}

impl Block {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn midplanes(&self) -> &Bitmap {
        &self.midplanes
    }

    pub fn first_midplane(&self) -> usize {
        self.first_midplane
    }

    pub fn shape(&self) -> &BoxShape {
        &self.shape
    }

    pub fn nodes(&self) -> &Bitmap {
        &self.nodes
    }

    pub fn ionodes(&self) -> Option<&Bitmap> {
        self.ionodes.as_ref()
    }

    pub fn is_small(&self) -> bool {
        self.ionodes.is_some()
    }

    pub fn state(&self) -> &BlockState {
        &self.state
    }

    pub fn is_free(&self) -> bool {
        self.state == BlockState::Free
    }

    pub fn owner(&self) -> Option<StepKey> {
        self.state.lease().map(|lease| lease.owner)
    }
}

/// What a step needs from the topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockRequest {
    /// Whole midplanes. The block must contain `required` and, when given,
    /// be able to host `geometry`.
    Midplanes {
        required: Bitmap,
        geometry: Option<Coords>,
        connection: ConnectionType,
        rotate: bool,
    },
    /// Part of a single midplane, given by its ionodes.
    Small { midplane: usize, ionodes: Bitmap },
}
