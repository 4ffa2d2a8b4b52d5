mod association;
mod job;
mod step;

pub use association::{
    AllowAll, AssociationFilter, JsonTransactionLog, MemoryTransactionLog, Transaction,
    TransactionKind, TransactionSink,
};
pub use job::{CpuGroups, Job, JobDescription, JobState};
pub use step::Step;

use std::time::Instant;

use crate::internal::common::Map;
use crate::internal::common::ids::{JobId, StepId};

/// Admitted jobs, keyed by id.
#[derive(Debug)]
pub struct JobTable {
    jobs: Map<JobId, Job>,
    id_counter: JobId,
    last_job_update: u64,
}

impl Default for JobTable {
    fn default() -> Self {
        JobTable {
            jobs: Default::default(),
            id_counter: JobId::new(1),
            last_job_update: 0,
        }
    }
}

impl JobTable {
    #[inline]
    pub fn find_job(&self, job_id: JobId) -> Option<&Job> {
        self.jobs.get(&job_id)
    }

    #[inline]
    pub(crate) fn find_job_mut(&mut self, job_id: JobId) -> Option<&mut Job> {
        self.jobs.get_mut(&job_id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub(crate) fn jobs_mut(&mut self) -> impl Iterator<Item = &mut Job> {
        self.jobs.values_mut()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Generation counter that changes on every job or step mutation.
    pub fn last_job_update(&self) -> u64 {
        self.last_job_update
    }

    pub(crate) fn touch(&mut self) {
        self.last_job_update += 1;
    }

    pub(crate) fn new_job_id(&mut self) -> JobId {
        self.id_counter.take_next()
    }

    pub(crate) fn add_job(&mut self, job: Job) -> JobId {
        let job_id = job.id;
        assert!(self.jobs.insert(job_id, job).is_none());
        self.touch();
        job_id
    }

    pub(crate) fn remove_job(&mut self, job_id: JobId) -> Option<Job> {
        let job = self.jobs.remove(&job_id);
        if job.is_some() {
            self.touch();
        }
        job
    }

    /// Moves a job into a terminal state; returns `false` if it already was terminal.
    pub(crate) fn complete_job(&mut self, job_id: JobId, state: JobState, now: Instant) -> bool {
        debug_assert!(state.is_terminal());
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return false;
        };
        if job.is_terminal() {
            return false;
        }
        log::debug!("Job {job_id} changed state {} -> {state}", job.state);
        job.state = state;
        job.end_time = Some(now);
        self.touch();
        true
    }

    /// Marks the job as failed by a node loss and returns its live steps.
    pub(crate) fn mark_node_fail(&mut self, job_id: JobId, now: Instant) -> Vec<StepId> {
        if !self.complete_job(job_id, JobState::NodeFail, now) {
            return Vec::new();
        }
        self.jobs
            .get(&job_id)
            .map(|job| job.steps.iter().map(|s| s.step_id()).collect())
            .unwrap_or_default()
    }
}
