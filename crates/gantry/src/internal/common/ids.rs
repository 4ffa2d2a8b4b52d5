use crate::define_id_type;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};

define_id_type!(JobId, u32);
define_id_type!(StepId, u32);

pub type Uid = u32;
pub type Gid = u32;

/// Slot of a node in the inventory; also the bit index in node bitmaps.
pub type NodeIndex = usize;

/// Uniquely identifies a step within the controller.
#[derive(Default, Copy, Clone, Hash, PartialOrd, Ord, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepKey {
    job_id: JobId,
    step_id: StepId,
}

impl Display for StepKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.job_id, self.step_id)
    }
}

impl Debug for StepKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl StepKey {
    #[inline]
    pub fn new(job_id: JobId, step_id: StepId) -> Self {
        Self { job_id, step_id }
    }

    #[inline]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    #[inline]
    pub fn step_id(&self) -> StepId {
        self.step_id
    }
}
