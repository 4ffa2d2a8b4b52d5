use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::internal::common::bitmap::Bitmap;
use crate::internal::common::ids::{Gid, JobId, NodeIndex, StepId, Uid};
use crate::internal::credential::Credential;
use crate::internal::jobs::step::Step;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Suspended,
    Completing,
    Complete,
    Failed,
    Timeout,
    NodeFail,
}

impl JobState {
    /// Terminal jobs accept no new steps.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completing
                | JobState::Complete
                | JobState::Failed
                | JobState::Timeout
                | JobState::NodeFail
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Suspended => "SUSPENDED",
            JobState::Completing => "COMPLETING",
            JobState::Complete => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Timeout => "TIMEOUT",
            JobState::NodeFail => "NODE_FAIL",
        };
        f.write_str(name)
    }
}

/// Per-node cpu counts of a job in run-length form.
///
/// `cpus_per_node[i]` is repeated `repeat_count[i]` times, in node bitmap order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuGroups {
    cpus_per_node: Vec<u32>,
    repeat_count: Vec<u32>,
}

impl CpuGroups {
    pub fn from_counts<I: IntoIterator<Item = u32>>(counts: I) -> Self {
        let mut groups = CpuGroups::default();
        for cpus in counts {
            match (groups.cpus_per_node.last(), groups.repeat_count.last_mut()) {
                (Some(last), Some(repeat)) if *last == cpus => *repeat += 1,
                _ => {
                    groups.cpus_per_node.push(cpus);
                    groups.repeat_count.push(1);
                }
            }
        }
        groups
    }

    pub fn cpus_per_node(&self) -> &[u32] {
        &self.cpus_per_node
    }

    pub fn repeat_count(&self) -> &[u32] {
        &self.repeat_count
    }

    pub fn node_count(&self) -> u32 {
        self.repeat_count.iter().sum()
    }

    pub fn total_cpus(&self) -> u32 {
        self.cpus_per_node
            .iter()
            .zip(&self.repeat_count)
            .map(|(cpus, repeat)| cpus * repeat)
            .sum()
    }

    /// Cpu count shared by every node, if the job is uniform.
    pub fn uniform(&self) -> Option<u32> {
        match self.cpus_per_node.as_slice() {
            [cpus] => Some(*cpus),
            _ => None,
        }
    }

    /// Cpu count of the node at position `rank` of the job's node bitmap.
    pub fn cpus_at(&self, rank: usize) -> Option<u32> {
        let mut offset = 0;
        for (cpus, repeat) in self.cpus_per_node.iter().zip(&self.repeat_count) {
            offset += *repeat as usize;
            if rank < offset {
                return Some(*cpus);
            }
        }
        None
    }

    pub fn expand(&self) -> impl Iterator<Item = u32> + '_ {
        self.cpus_per_node
            .iter()
            .zip(&self.repeat_count)
            .flat_map(|(cpus, repeat)| std::iter::repeat_n(*cpus, *repeat as usize))
    }
}

/// Request to admit a new job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescription {
    pub uid: Uid,
    pub gid: Gid,
    pub account: String,
    pub partition: String,
    /// Node name expression of the allocation.
    pub nodes: String,
    /// Uses the partition default when missing.
    pub time_limit: Option<Duration>,
}

pub struct Job {
    pub(crate) id: JobId,
    pub(crate) uid: Uid,
    pub(crate) gid: Gid,
    pub(crate) account: String,
    pub(crate) partition: String,
    pub(crate) state: JobState,
    pub(crate) node_bitmap: Bitmap,
    pub(crate) cpu_groups: CpuGroups,
    pub(crate) next_step_id: StepId,
    pub(crate) steps: Vec<Step>,
    pub(crate) time_limit: Option<Duration>,
    pub(crate) start_time: Instant,
    pub(crate) end_time: Option<Instant>,
    pub(crate) credential: Option<Credential>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("uid", &self.uid)
            .field("state", &self.state)
            .field("nodes", &self.node_bitmap)
            .field("steps", &self.steps.len())
            .finish()
    }
}

impl Job {
    pub(crate) fn new(
        id: JobId,
        description: JobDescription,
        node_bitmap: Bitmap,
        cpu_groups: CpuGroups,
        time_limit: Option<Duration>,
        now: Instant,
    ) -> Self {
        Job {
            id,
            uid: description.uid,
            gid: description.gid,
            account: description.account,
            partition: description.partition,
            state: JobState::Running,
            node_bitmap,
            cpu_groups,
            next_step_id: StepId::new(0),
            steps: Vec::new(),
            time_limit,
            start_time: now,
            end_time: None,
            credential: None,
        }
    }

    #[inline]
    pub fn id(&self) -> JobId {
        self.id
    }

    #[inline]
    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn gid(&self) -> Gid {
        self.gid
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    #[inline]
    pub fn state(&self) -> JobState {
        self.state
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    #[inline]
    pub fn node_bitmap(&self) -> &Bitmap {
        &self.node_bitmap
    }

    pub fn cpu_groups(&self) -> &CpuGroups {
        &self.cpu_groups
    }

    /// Pairs of node index and the job's cpu count on that node.
    pub fn node_cpus(&self) -> impl Iterator<Item = (NodeIndex, u32)> + '_ {
        self.node_bitmap.iter().zip(self.cpu_groups.expand())
    }

    pub fn cpus_on_node(&self, index: NodeIndex) -> Option<u32> {
        self.node_cpus()
            .find(|(node, _)| *node == index)
            .map(|(_, cpus)| cpus)
    }

    pub fn next_step_id(&self) -> StepId {
        self.next_step_id
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn find_step(&self, step_id: StepId) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_id() == step_id)
    }

    pub fn time_limit(&self) -> Option<Duration> {
        self.time_limit
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    pub fn end_time(&self) -> Option<Instant> {
        self.end_time
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// Time at which the job runs out of its time limit.
    pub fn deadline(&self) -> Option<Instant> {
        self.time_limit.map(|limit| self.start_time + limit)
    }

    pub(crate) fn attach_step(&mut self, step: Step) {
        debug_assert!(step.node_bitmap().is_subset_of(&self.node_bitmap));
        self.steps.push(step);
    }

    pub(crate) fn detach_step(&mut self, step_id: StepId) -> Option<Step> {
        let position = self.steps.iter().position(|s| s.step_id() == step_id)?;
        Some(self.steps.remove(position))
    }

    /// Unlinks every step, leaving the step list empty.
    pub(crate) fn detach_all_steps(&mut self) -> Vec<Step> {
        std::mem::take(&mut self.steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_groups_run_length() {
        let groups = CpuGroups::from_counts([4, 4, 8, 8, 8, 4]);
        assert_eq!(groups.cpus_per_node(), &[4, 8, 4]);
        assert_eq!(groups.repeat_count(), &[2, 3, 1]);
        assert_eq!(groups.node_count(), 6);
        assert_eq!(groups.total_cpus(), 36);
        assert_eq!(groups.uniform(), None);
        assert_eq!(groups.cpus_at(0), Some(4));
        assert_eq!(groups.cpus_at(2), Some(8));
        assert_eq!(groups.cpus_at(5), Some(4));
        assert_eq!(groups.cpus_at(6), None);
        assert_eq!(groups.expand().collect::<Vec<_>>(), vec![4, 4, 8, 8, 8, 4]);
    }

    #[test]
    fn test_cpu_groups_uniform() {
        assert_eq!(CpuGroups::from_counts([2, 2, 2]).uniform(), Some(2));
        assert_eq!(CpuGroups::from_counts([]).uniform(), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobState::Running.is_terminal());
        assert!(!JobState::Suspended.is_terminal());
        assert!(JobState::Completing.is_terminal());
        assert!(JobState::NodeFail.is_terminal());
        assert_eq!(JobState::NodeFail.to_string(), "NODE_FAIL");
    }
}
