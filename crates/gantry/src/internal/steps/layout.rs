use serde::{Deserialize, Serialize};

use crate::internal::common::ids::NodeIndex;
use crate::internal::steps::{Distribution, PickError, StepError};

/// Placement of the global task ids of a step on its nodes.
///
/// `tasks_per_node[n]` and `global_tids[n]` describe the `n`-th node of the
/// step in node index order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLayout {
    nodes: Vec<NodeIndex>,
    tasks_per_node: Vec<u32>,
    global_tids: Vec<Vec<u32>>,
}

impl TaskLayout {
    pub fn nodes(&self) -> &[NodeIndex] {
        &self.nodes
    }

    pub fn tasks_per_node(&self) -> &[u32] {
        &self.tasks_per_node
    }

    pub fn global_tids(&self) -> &[Vec<u32>] {
        &self.global_tids
    }

    pub fn task_count(&self) -> u32 {
        self.tasks_per_node.iter().sum()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn tasks_on(&self, index: NodeIndex) -> &[u32] {
        self.nodes
            .iter()
            .position(|n| *n == index)
            .map(|pos| self.global_tids[pos].as_slice())
            .unwrap_or_default()
    }

    pub fn node_of_task(&self, task_id: u32) -> Option<NodeIndex> {
        self.global_tids
            .iter()
            .position(|tids| tids.contains(&task_id))
            .map(|pos| self.nodes[pos])
    }
}

/// Spreads `num_tasks` tasks over `nodes`, given as (node, cpus) pairs.
///
/// Nodes are filled round-robin up to their cpu count, the remaining tasks
/// overcommit the nodes round-robin.
pub fn compute_layout(
    nodes: &[(NodeIndex, u32)],
    num_tasks: u32,
    distribution: Distribution,
) -> Result<TaskLayout, StepError> {
    if distribution == Distribution::Plane(0) {
        return Err(StepError::BadDistribution(distribution.to_string()));
    }
    let node_count = nodes.len() as u32;
    if num_tasks < node_count || node_count == 0 {
        return Err(PickError::TooFewTasks {
            tasks: num_tasks,
            nodes: node_count,
        }
        .into());
    }

    let counts = task_counts(nodes, num_tasks);
    let mut global_tids: Vec<Vec<u32>> = counts
        .iter()
        .map(|c| Vec::with_capacity(*c as usize))
        .collect();

    match distribution {
        Distribution::Block | Distribution::Arbitrary => {
            let mut next = 0;
            for (tids, count) in global_tids.iter_mut().zip(&counts) {
                tids.extend(next..next + count);
                next += count;
            }
        }
        Distribution::Cyclic => deal(&mut global_tids, &counts, num_tasks, 1),
        Distribution::Plane(size) => deal(&mut global_tids, &counts, num_tasks, size),
    }

    Ok(TaskLayout {
        nodes: nodes.iter().map(|(index, _)| *index).collect(),
        tasks_per_node: counts,
        global_tids,
    })
}

fn task_counts(nodes: &[(NodeIndex, u32)], num_tasks: u32) -> Vec<u32> {
    let mut counts = vec![0u32; nodes.len()];
    let mut remaining = num_tasks;
    while remaining > 0 {
        let mut progressed = false;
        for (count, (_, cpus)) in counts.iter_mut().zip(nodes) {
            if remaining == 0 {
                break;
            }
            if *count < *cpus {
                *count += 1;
                remaining -= 1;
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    let len = counts.len();
    for i in 0..remaining as usize {
        counts[i % len] += 1;
    }
    counts
}

/// Deals task ids to nodes in chunks of `chunk`, skipping nodes that are full.
fn deal(global_tids: &mut [Vec<u32>], counts: &[u32], num_tasks: u32, chunk: u32) {
    let mut next = 0;
    while next < num_tasks {
        for (tids, count) in global_tids.iter_mut().zip(counts) {
            let free = count - tids.len() as u32;
            let take = free.min(chunk).min(num_tasks - next);
            tids.extend(next..next + take);
            next += take;
        }
    }
}
