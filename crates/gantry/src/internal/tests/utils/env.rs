use std::sync::Arc;
use std::time::Instant;

use crate::internal::common::ids::{JobId, Uid};
use crate::internal::inventory::NodeInventory;
use crate::internal::jobs::{CpuGroups, Job, JobDescription, MemoryTransactionLog};
use crate::internal::server::config::ControllerConfig;
use crate::internal::server::controller::Controller;
use crate::internal::steps::StepSpecBuilder;
use crate::internal::topology::InMemoryHardware;

pub const USER: Uid = 1000;

pub fn job_description(uid: Uid, nodes: &str) -> JobDescription {
    JobDescription {
        uid,
        gid: uid,
        account: "default".to_string(),
        partition: "batch".to_string(),
        nodes: nodes.to_string(),
        time_limit: None,
    }
}

/// A running job on `nodes`, outside of any job table.
pub fn job_on(inventory: &NodeInventory, id: u32, nodes: &str) -> Job {
    let bitmap = inventory.name2bitmap(nodes).unwrap();
    let cpu_groups = CpuGroups::from_counts(bitmap.iter().map(|i| inventory.node(i).cpus()));
    Job::new(
        id.into(),
        job_description(USER, nodes),
        bitmap,
        cpu_groups,
        None,
        Instant::now(),
    )
}

/// Step spec for `job_id` submitted by [`USER`].
pub fn spec(job_id: JobId) -> StepSpecBuilder {
    StepSpecBuilder::default().job_id(job_id).uid(USER)
}

pub struct TestEnv {
    controller: Controller,
    hardware: Arc<InMemoryHardware>,
    transactions: Arc<MemoryTransactionLog>,
}

impl TestEnv {
    pub fn new(config: ControllerConfig) -> TestEnv {
        Self::with_hardware(config, InMemoryHardware::new())
    }

    pub fn with_hardware(config: ControllerConfig, hardware: InMemoryHardware) -> TestEnv {
        let hardware = Arc::new(hardware);
        let transactions = Arc::new(MemoryTransactionLog::default());
        let controller = Controller::from_config(&config, Box::new(hardware.clone()))
            .unwrap()
            .with_transactions(Box::new(transactions.clone()));
        TestEnv {
            controller,
            hardware,
            transactions,
        }
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn hardware(&self) -> &InMemoryHardware {
        &self.hardware
    }

    pub fn transactions(&self) -> &MemoryTransactionLog {
        &self.transactions
    }

    /// Submits a job of [`USER`] into partition `batch`.
    pub fn submit(&self, nodes: &str) -> JobId {
        self.controller
            .submit_job(job_description(USER, nodes))
            .unwrap()
    }
}
