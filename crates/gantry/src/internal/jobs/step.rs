use std::fmt;
use std::time::{Duration, Instant};

use crate::internal::common::bitmap::Bitmap;
use crate::internal::common::ids::{JobId, StepId, StepKey};
use crate::internal::credential::Credential;
use crate::internal::interconnect::InterconnectContext;
use crate::internal::steps::{Distribution, TaskLayout};

/// A step of a job. The job owns its steps, a step refers back only by id.
pub struct Step {
    pub(crate) job_id: JobId,
    pub(crate) step_id: StepId,
    pub(crate) node_bitmap: Bitmap,
    pub(crate) layout: TaskLayout,
    pub(crate) distribution: Distribution,
    pub(crate) interconnect: InterconnectContext,
    pub(crate) credential: Credential,
    pub(crate) start_time: Instant,
    pub(crate) time_limit: Option<Duration>,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("key", &self.key())
            .field("nodes", &self.node_bitmap)
            .field("tasks", &self.layout.task_count())
            .field("interconnect", &self.interconnect)
            .finish()
    }
}

impl Step {
    #[inline]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    #[inline]
    pub fn step_id(&self) -> StepId {
        self.step_id
    }

    #[inline]
    pub fn key(&self) -> StepKey {
        StepKey::new(self.job_id, self.step_id)
    }

    pub fn node_bitmap(&self) -> &Bitmap {
        &self.node_bitmap
    }

    pub fn layout(&self) -> &TaskLayout {
        &self.layout
    }

    pub fn distribution(&self) -> Distribution {
        self.distribution
    }

    pub fn interconnect(&self) -> &InterconnectContext {
        &self.interconnect
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    pub fn time_limit(&self) -> Option<Duration> {
        self.time_limit
    }
}
