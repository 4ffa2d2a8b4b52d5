use crate::internal::common::bitmap::Bitmap;
use crate::internal::inventory::NodeInventory;
use crate::internal::jobs::Job;
use crate::internal::steps::{ALL_NODES, PickError, StepSpec};

/// Selects the nodes of `job` that a step described by `spec` runs on.
///
/// Nodes are taken first-fit in node index order, so the result is
/// deterministic for a given inventory. Steps of one job may overlap.
pub fn pick_step_nodes(
    job: &Job,
    spec: &StepSpec,
    inventory: &NodeInventory,
) -> Result<Bitmap, PickError> {
    let up_nodes = inventory.up_nodes();
    let mut avail = job.node_bitmap().and(&up_nodes);
    if !spec.features.is_empty() {
        avail.and_assign(&inventory.nodes_with_features(&spec.features));
    }

    if spec.node_count == ALL_NODES {
        if avail.is_clear() {
            return Err(PickError::EmptySelection);
        }
        return Ok(avail);
    }

    let mut picked = inventory.empty_bitmap();
    if let Some(host_list) = &spec.host_list {
        let requested = inventory
            .name2bitmap(host_list)
            .map_err(|_| PickError::InvalidNodeList(host_list.clone()))?;
        if !requested.is_subset_of(job.node_bitmap()) {
            return Err(PickError::NotPartOfJob);
        }
        if !requested.is_subset_of(&up_nodes) {
            return Err(PickError::NodesDown);
        }
        avail.and_not_assign(&requested);
        picked = requested;
    } else if let Some(relative) = spec.relative {
        let available = avail.count() as u32;
        if avail.take_n(relative as usize).is_none() {
            return Err(PickError::RelativeOutOfRange {
                relative,
                available,
            });
        }
    }

    let mut job_cpus = vec![0u32; inventory.node_count()];
    for (index, cpus) in job.node_cpus() {
        job_cpus[index] = cpus;
    }

    let mut node_count = spec.node_count;
    let mut cpu_count = spec.cpu_count;
    if cpu_count > 0 {
        if let Some(cpus) = job.cpu_groups().uniform().filter(|c| *c > 0) {
            node_count = node_count.max(cpu_count.div_ceil(cpus));
            cpu_count = 0;
        }
    }

    let have = picked.count() as u32;
    if node_count > have {
        let extra = avail
            .take_n((node_count - have) as usize)
            .ok_or_else(|| PickError::InsufficientNodes {
                requested: node_count,
                available: have + avail.count() as u32,
            })?;
        picked.or_assign(&extra);
    }

    if cpu_count > 0 {
        let mut total: u32 = picked.iter().map(|index| job_cpus[index]).sum();
        for index in avail.iter() {
            if total >= cpu_count {
                break;
            }
            picked.set(index);
            total += job_cpus[index];
        }
        if total < cpu_count {
            return Err(PickError::InsufficientCpus {
                requested: cpu_count,
                available: total,
            });
        }
    }

    log::debug!(
        "Picked nodes {} for step of job {}",
        picked.to_range_expr(),
        job.id()
    );
    Ok(picked)
}
