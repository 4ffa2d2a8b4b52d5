use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard};
use std::time::Instant;

use chrono::Utc;

use crate::internal::agent::{Agent, AgentTransport, Destination, DispatchReport};
use crate::internal::common::bitmap::Bitmap;
use crate::internal::common::error::GantryError;
use crate::internal::common::ids::{JobId, StepId, StepKey, Uid};
use crate::internal::common::sync::{lock, read, write};
use crate::internal::credential::{Credential, CredentialSigner};
use crate::internal::interconnect::{InterconnectContext, SwitchTable};
use crate::internal::inventory::{NodeInventory, PartitionList, PolicyError};
use crate::internal::jobs::{
    AllowAll, AssociationFilter, CpuGroups, Job, JobDescription, JobState, JobTable,
    MemoryTransactionLog, Step, Transaction, TransactionKind, TransactionSink,
};
use crate::internal::messages::agent::{AgentMessage, AgentPayload};
use crate::internal::server::config::{AgentConfig, ControllerConfig};
use crate::internal::steps::{
    Distribution, PickError, StepError, StepSpec, TaskLayout, compute_layout, pick_step_nodes,
};
use crate::internal::topology::{
    BlockEngine, BlockError, BlockHardware, ConnectionType, poll_teardowns, release_block,
    reserve_block,
};

/// Step id under which the credential of the whole job is issued.
pub const JOB_STEP_ID: StepId = StepId::new(u32::MAX);

const SIGKILL: i32 = 9;

/// Result of a successful step creation, everything the launcher needs.
#[derive(Debug, Clone)]
pub struct StepLaunchInfo {
    pub job_id: JobId,
    pub step_id: StepId,
    pub nodes: Bitmap,
    pub node_list: String,
    pub layout: TaskLayout,
    pub credential: Credential,
    pub reservation_id: Option<String>,
    pub destinations: Vec<Destination>,
}

impl StepLaunchInfo {
    pub fn key(&self) -> StepKey {
        StepKey::new(self.job_id, self.step_id)
    }
}

struct PreparedStep {
    key: StepKey,
    uid: Uid,
    nodes: Bitmap,
    node_list: String,
    layout: TaskLayout,
    credential: Credential,
    destinations: Vec<Destination>,
}

/// A step unlinked from its job whose nodes still have to be notified.
#[derive(Debug, Clone)]
pub struct CompletedStep {
    pub key: StepKey,
    pub node_list: String,
    pub destinations: Vec<Destination>,
}

/// A step that ran out of time, with the message that cancels it.
#[derive(Debug, Clone)]
pub struct StepCancellation {
    pub message: AgentMessage,
    pub destinations: Vec<Destination>,
}

/// Controller context owning every registry.
///
/// Locks are taken in the order jobs, nodes, partitions, topology. The
/// block engine lock is never held while the interconnect hardware is called.
pub struct Controller {
    jobs: RwLock<JobTable>,
    inventory: RwLock<NodeInventory>,
    partitions: RwLock<PartitionList>,
    blocks: Option<Mutex<BlockEngine>>,
    switches: Option<Mutex<SwitchTable>>,
    hardware: Box<dyn BlockHardware>,
    signer: CredentialSigner,
    associations: Box<dyn AssociationFilter>,
    transactions: Box<dyn TransactionSink>,
    agent_config: AgentConfig,
    admin_uid: Uid,
    unblocked_nodes: Vec<String>,
}

impl Controller {
    pub fn from_config(
        config: &ControllerConfig,
        hardware: Box<dyn BlockHardware>,
    ) -> crate::Result<Self> {
        if config.topology.is_some() && config.switch.is_some() {
            return Err(GantryError::ConfigError(
                "`topology` and `switch` sections cannot be combined".to_string(),
            ));
        }
        let mut inventory = NodeInventory::from_config(&config.nodes)?;
        let partitions = inventory.build_partitions(&config.partitions)?;
        let (blocks, unblocked_nodes) = match &config.topology {
            Some(topology) => {
                let (engine, unblocked) = BlockEngine::from_config(topology, &mut inventory)?;
                (Some(Mutex::new(engine)), unblocked)
            }
            None => (None, Vec::new()),
        };
        let switches = config.switch.as_ref().map(|switch| {
            Mutex::new(SwitchTable::new(
                inventory.node_count(),
                switch.windows_per_node,
            ))
        });
        let lifetime = config.credential.lifetime;
        let signer = match &config.credential.key_file {
            Some(path) => {
                let key = std::fs::read(path)?;
                CredentialSigner::from_key_bytes(&key, lifetime)?
            }
            None => {
                log::info!("No credential key file configured, using a random key");
                CredentialSigner::generate(lifetime)
            }
        };
        log::info!(
            "Controller configured with {} nodes and {} partitions",
            inventory.node_count(),
            partitions.iter().count()
        );
        Ok(Controller {
            jobs: Default::default(),
            inventory: RwLock::new(inventory),
            partitions: RwLock::new(partitions),
            blocks,
            switches,
            hardware,
            signer,
            associations: Box::new(AllowAll),
            transactions: Box::new(MemoryTransactionLog::default()),
            agent_config: config.agent.clone(),
            admin_uid: config.admin_uid,
            unblocked_nodes,
        })
    }

    pub fn with_associations(mut self, associations: Box<dyn AssociationFilter>) -> Self {
        self.associations = associations;
        self
    }

    pub fn with_transactions(mut self, transactions: Box<dyn TransactionSink>) -> Self {
        self.transactions = transactions;
        self
    }

    pub fn with_signer(mut self, signer: CredentialSigner) -> Self {
        self.signer = signer;
        self
    }

    pub fn jobs(&self) -> RwLockReadGuard<'_, JobTable> {
        read(&self.jobs)
    }

    pub fn inventory(&self) -> RwLockReadGuard<'_, NodeInventory> {
        read(&self.inventory)
    }

    pub fn partitions(&self) -> RwLockReadGuard<'_, PartitionList> {
        read(&self.partitions)
    }

    pub fn block_engine(&self) -> Option<MutexGuard<'_, BlockEngine>> {
        self.blocks.as_ref().map(lock)
    }

    pub fn switch_table(&self) -> Option<MutexGuard<'_, SwitchTable>> {
        self.switches.as_ref().map(lock)
    }

    pub fn signer(&self) -> &CredentialSigner {
        &self.signer
    }

    pub fn agent_config(&self) -> &AgentConfig {
        &self.agent_config
    }

    /// Topology-managed nodes that no block covers.
    pub fn unblocked_nodes(&self) -> &[String] {
        &self.unblocked_nodes
    }

    fn destinations(&self, inventory: &NodeInventory, nodes: &Bitmap) -> Vec<Destination> {
        nodes
            .iter()
            .map(|index| {
                Destination::new(
                    inventory.node(index).name(),
                    inventory.agent_address(index, self.agent_config.port),
                )
            })
            .collect()
    }

    /// Admits a job on the nodes it names.
    pub fn submit_job(&self, description: JobDescription) -> crate::Result<JobId> {
        let mut jobs = write(&self.jobs);
        let mut inventory = write(&self.inventory);
        let partitions = read(&self.partitions);

        let nodes = inventory.name2bitmap(&description.nodes)?;
        if nodes.is_clear() {
            return Err(GantryError::GenericError("Job requests no nodes".to_string()));
        }
        let partition = partitions.find(&description.partition).ok_or_else(|| {
            GantryError::ConfigError(format!("Unknown partition {}", description.partition))
        })?;
        let policy = partition
            .admits(description.uid, self.admin_uid, &nodes)
            .and_then(|()| {
                if self.associations.permits(
                    description.uid,
                    &description.account,
                    &description.partition,
                ) {
                    Ok(())
                } else {
                    Err(PolicyError::AccountNotPermitted {
                        uid: description.uid,
                        account: description.account.clone(),
                        partition: description.partition.clone(),
                    })
                }
            });
        if let Err(error) = policy {
            log::info!("Job of user {} rejected: {error}", description.uid);
            return Err(error.into());
        }

        let cpu_groups = CpuGroups::from_counts(nodes.iter().map(|i| inventory.node(i).cpus()));
        let time_limit = description.time_limit.or(partition.default_time());
        let node_list = inventory.bitmap2name(&nodes);
        let job_id = jobs.new_job_id();
        let credential =
            self.signer
                .sign(job_id, JOB_STEP_ID, description.uid, node_list.clone(), Utc::now())?;
        let uid = description.uid;
        let mut job = Job::new(
            job_id,
            description,
            nodes,
            cpu_groups,
            time_limit,
            Instant::now(),
        );
        job.credential = Some(credential);
        inventory.allocate_nodes(job.node_bitmap());
        jobs.add_job(job);
        log::info!("Job {job_id} started on {node_list}");
        self.transactions
            .record(Transaction::new(TransactionKind::JobStart, node_list).job(job_id, uid));
        Ok(job_id)
    }

    /// Creates a step inside a running job.
    ///
    /// On success the step is attached to its job before this returns. The
    /// job table is not locked while the interconnect is being set up.
    pub fn step_create(&self, spec: &StepSpec) -> Result<StepLaunchInfo, StepError> {
        let prepared = self.prepare_step(spec)?;
        let key = prepared.key;

        let interconnect = self
            .setup_interconnect(key, &prepared.nodes, &prepared.layout, spec.connection)
            .map_err(|error| {
                log::error!("Interconnect setup for step {key} failed: {error}");
                StepError::InterconnectFailure(error)
            })?;

        let step = Step {
            job_id: key.job_id(),
            step_id: key.step_id(),
            node_bitmap: prepared.nodes.clone(),
            layout: prepared.layout.clone(),
            distribution: spec.distribution,
            interconnect,
            credential: prepared.credential.clone(),
            start_time: Instant::now(),
            time_limit: spec.time_limit,
        };
        let reservation_id = step.interconnect().reservation_id().map(|id| id.to_string());

        let mut jobs = write(&self.jobs);
        let running = match jobs.find_job(key.job_id()) {
            None => Err(StepError::InvalidJobId(key.job_id())),
            Some(job) if job.is_terminal() => Err(StepError::AlreadyDone(job.id())),
            Some(job) if job.state() != JobState::Running => {
                Err(StepError::JobNotRunning(job.id()))
            }
            Some(_) => Ok(()),
        };
        if let Err(error) = running {
            drop(jobs);
            log::info!("Job of step {key} stopped while the step was being set up");
            self.release_interconnect(&step);
            return Err(error);
        }
        if let Some(job) = jobs.find_job_mut(key.job_id()) {
            job.attach_step(step);
        }
        jobs.touch();
        drop(jobs);

        log::info!(
            "Step {key} created on {} with {} tasks",
            prepared.node_list,
            prepared.layout.task_count()
        );
        self.transactions.record(
            Transaction::new(TransactionKind::StepStart, prepared.node_list.clone())
                .job(key.job_id(), prepared.uid)
                .step(key.step_id()),
        );
        Ok(StepLaunchInfo {
            job_id: key.job_id(),
            step_id: key.step_id(),
            nodes: prepared.nodes,
            node_list: prepared.node_list,
            layout: prepared.layout,
            credential: prepared.credential,
            reservation_id,
            destinations: prepared.destinations,
        })
    }

    /// Validates a step request, picks its nodes and issues its id and
    /// credential.
    fn prepare_step(&self, spec: &StepSpec) -> Result<PreparedStep, StepError> {
        let mut jobs = write(&self.jobs);
        let inventory = read(&self.inventory);

        let job = jobs
            .find_job_mut(spec.job_id)
            .ok_or(StepError::InvalidJobId(spec.job_id))?;
        if job.is_terminal() {
            return Err(StepError::AlreadyDone(job.id()));
        }
        if spec.uid != job.uid() && spec.uid != self.admin_uid {
            log::info!(
                "User {} may not create steps in job {} of user {}",
                spec.uid,
                job.id(),
                job.uid()
            );
            return Err(StepError::AccessDenied);
        }
        if job.state() != JobState::Running {
            return Err(StepError::JobNotRunning(job.id()));
        }
        if spec.distribution == Distribution::Arbitrary && self.blocks.is_some() {
            return Err(StepError::BadDistribution(spec.distribution.to_string()));
        }

        let nodes = if spec.node_count == 0 && spec.cpu_count == 0 && spec.host_list.is_none() {
            let mut single = spec.clone();
            single.node_count = 1;
            pick_step_nodes(job, &single, &inventory)?
        } else {
            pick_step_nodes(job, spec, &inventory)?
        };
        if nodes.is_clear() {
            return Err(PickError::EmptySelection.into());
        }

        let node_cpus: Vec<_> = job
            .node_cpus()
            .filter(|(index, _)| nodes.test(*index))
            .collect();
        let num_tasks = if spec.num_tasks > 0 {
            spec.num_tasks
        } else {
            spec.cpu_count.max(node_cpus.len() as u32)
        };
        let layout = compute_layout(&node_cpus, num_tasks, spec.distribution)?;

        let job_id = job.id();
        let uid = job.uid();
        let step_id = job.next_step_id.take_next();
        let key = StepKey::new(job_id, step_id);
        let node_list = inventory.bitmap2name(&nodes);
        let credential = self
            .signer
            .sign(job_id, step_id, uid, node_list.clone(), Utc::now())
            .map_err(|e| StepError::CredentialFailure(e.to_string()))?;
        Ok(PreparedStep {
            key,
            uid,
            destinations: self.destinations(&inventory, &nodes),
            nodes,
            node_list,
            layout,
            credential,
        })
    }

    fn setup_interconnect(
        &self,
        key: StepKey,
        nodes: &Bitmap,
        layout: &TaskLayout,
        connection: ConnectionType,
    ) -> Result<InterconnectContext, String> {
        if let Some(engine) = &self.blocks {
            let request = lock(engine)
                .request_for_nodes(nodes, connection)
                .map_err(|e| e.to_string())?;
            return match request {
                Some(request) => reserve_block(engine, self.hardware.as_ref(), &request, key)
                    .map(InterconnectContext::Block)
                    .map_err(|e| e.to_string()),
                None => Ok(InterconnectContext::None),
            };
        }
        if let Some(switches) = &self.switches {
            return lock(switches)
                .allocate(layout)
                .map(InterconnectContext::Switch)
                .map_err(|e| e.to_string());
        }
        Ok(InterconnectContext::None)
    }

    fn release_interconnect(&self, step: &Step) {
        match step.interconnect() {
            InterconnectContext::Block(context) => {
                if let Some(engine) = &self.blocks {
                    if let Err(error) =
                        release_block(engine, self.hardware.as_ref(), &context.reservation_id)
                    {
                        log::error!(
                            "Releasing block {} of step {} failed: {error}",
                            context.block_name,
                            step.key()
                        );
                    }
                }
            }
            InterconnectContext::Switch(context) => {
                if let Some(switches) = &self.switches {
                    lock(switches).release(context);
                }
            }
            InterconnectContext::None => {}
        }
    }

    fn finish_unlinked(&self, step: &Step, uid: Uid, info: &str) -> CompletedStep {
        self.release_interconnect(step);
        let inventory = read(&self.inventory);
        let node_list = inventory.bitmap2name(step.node_bitmap());
        self.transactions.record(
            Transaction::new(TransactionKind::StepEnd, info.to_string())
                .job(step.job_id(), uid)
                .step(step.step_id()),
        );
        CompletedStep {
            key: step.key(),
            destinations: self.destinations(&inventory, step.node_bitmap()),
            node_list,
        }
    }

    /// Unlinks a step from its job and frees its interconnect resources.
    pub fn step_complete(
        &self,
        job_id: JobId,
        step_id: StepId,
    ) -> Result<CompletedStep, StepError> {
        let (step, uid) = {
            let mut jobs = write(&self.jobs);
            let job = jobs
                .find_job_mut(job_id)
                .ok_or(StepError::InvalidJobId(job_id))?;
            let uid = job.uid();
            let step = job
                .detach_step(step_id)
                .ok_or(StepError::NotFound(job_id, step_id))?;
            jobs.touch();
            (step, uid)
        };
        log::debug!("Step {} completed", step.key());
        Ok(self.finish_unlinked(&step, uid, "completed"))
    }

    /// Completes a step and revokes its credential on its nodes.
    ///
    /// The revocation starts only after the step is unlinked from its job.
    pub async fn finish_step<T: AgentTransport>(
        &self,
        agent: &Agent<T>,
        job_id: JobId,
        step_id: StepId,
    ) -> Result<DispatchReport, StepError> {
        let completed = self.step_complete(job_id, step_id)?;
        let message = AgentMessage::new(completed.key, AgentPayload::RevokeCredential);
        let report = agent.dispatch(&message, &completed.destinations).await;
        report.log_failures();
        Ok(report)
    }

    /// Drains the nodes that failed an agent dispatch; returns how many were drained.
    pub fn apply_drain_actions(&self, failed: &[String], reason: &str) -> usize {
        let mut inventory = write(&self.inventory);
        failed
            .iter()
            .filter(|name| match inventory.drain_node(name, Some(reason)) {
                Ok(()) => true,
                Err(error) => {
                    log::warn!("Cannot drain node {name}: {error}");
                    false
                }
            })
            .count()
    }

    /// Ends a job, releasing its nodes and every remaining step.
    pub fn complete_job(
        &self,
        job_id: JobId,
        state: JobState,
    ) -> Result<Vec<CompletedStep>, StepError> {
        if !state.is_terminal() {
            return Err(StepError::JobNotRunning(job_id));
        }
        let (steps, uid) = {
            let mut jobs = write(&self.jobs);
            let job = jobs
                .find_job(job_id)
                .ok_or(StepError::InvalidJobId(job_id))?;
            let uid = job.uid();
            if !jobs.complete_job(job_id, state, Instant::now()) {
                return Err(StepError::AlreadyDone(job_id));
            }
            let job = jobs
                .find_job_mut(job_id)
                .ok_or(StepError::InvalidJobId(job_id))?;
            let steps = job.detach_all_steps();
            let nodes = job.node_bitmap().clone();
            write(&self.inventory).release_nodes(&nodes);
            (steps, uid)
        };
        log::info!("Job {job_id} ended with state {state}");
        let completed = steps
            .iter()
            .map(|step| self.finish_unlinked(step, uid, "job ended"))
            .collect();
        self.transactions.record(
            Transaction::new(TransactionKind::JobEnd, state.to_string()).job(job_id, uid),
        );
        Ok(completed)
    }

    /// Sets a node down and fails every running job that uses it.
    ///
    /// Returns the steps whose remaining tasks have to be killed.
    pub fn node_failed(&self, name: &str, reason: &str) -> crate::Result<Vec<StepCancellation>> {
        let mut jobs = write(&self.jobs);
        let mut inventory = write(&self.inventory);
        let index = inventory
            .node_index(name)
            .ok_or_else(|| GantryError::UnknownNode(name.to_string()))?;
        inventory.set_node_down(name, reason)?;
        self.transactions
            .record(Transaction::new(TransactionKind::NodeDown, format!("{name}: {reason}")));

        let affected: Vec<JobId> = jobs
            .jobs()
            .filter(|job| !job.is_terminal() && job.node_bitmap().test(index))
            .map(|job| job.id())
            .collect();
        let mut unlinked = Vec::new();
        for job_id in affected {
            let live = jobs.mark_node_fail(job_id, Instant::now());
            let Some(job) = jobs.find_job_mut(job_id) else {
                continue;
            };
            log::warn!(
                "Job {job_id} failed with node {name}, {} steps to cancel",
                live.len()
            );
            inventory.release_nodes(job.node_bitmap());
            let uid = job.uid();
            unlinked.extend(job.detach_all_steps().into_iter().map(|step| (step, uid)));
            self.transactions.record(
                Transaction::new(TransactionKind::JobEnd, JobState::NodeFail.to_string())
                    .job(job_id, uid),
            );
        }
        drop(inventory);
        drop(jobs);

        Ok(unlinked
            .iter()
            .map(|(step, uid)| {
                let completed = self.finish_unlinked(step, *uid, "node failure");
                StepCancellation {
                    message: AgentMessage::new(
                        completed.key,
                        AgentPayload::KillTasks { signal: SIGKILL },
                    ),
                    destinations: completed.destinations,
                }
            })
            .collect())
    }

    /// The earlier of the step's own limit and the job's time limit.
    pub fn step_deadline(&self, job_id: JobId, step_id: StepId) -> Option<Instant> {
        let jobs = read(&self.jobs);
        let job = jobs.find_job(job_id)?;
        step_deadline(job, job.find_step(step_id)?)
    }

    /// Cancellations for the steps whose deadline passed before `now`.
    pub fn cancel_expired_steps(&self, now: Instant) -> Vec<StepCancellation> {
        let jobs = read(&self.jobs);
        let inventory = read(&self.inventory);
        jobs.jobs()
            .filter(|job| !job.is_terminal())
            .flat_map(|job| {
                job.steps()
                    .iter()
                    .filter(move |step| step_deadline(job, step).is_some_and(|d| d <= now))
            })
            .map(|step| {
                log::info!("Step {} reached its time limit", step.key());
                StepCancellation {
                    message: AgentMessage::new(
                        step.key(),
                        AgentPayload::KillTasks { signal: SIGKILL },
                    ),
                    destinations: self.destinations(&inventory, step.node_bitmap()),
                }
            })
            .collect()
    }

    /// Frees blocks whose teardown the hardware confirmed.
    pub fn poll_teardowns(&self) -> usize {
        match &self.blocks {
            Some(engine) => poll_teardowns(engine, self.hardware.as_ref()),
            None => 0,
        }
    }

    /// Re-attaches a reservation that survived a restart to its owning step.
    /// The hardware learns about the reservation so new ids do not reuse it.
    pub fn recover_block(
        &self,
        block_name: &str,
        reservation_id: &str,
        owner: StepKey,
        connection: ConnectionType,
    ) -> Result<(), BlockError> {
        let engine = self
            .blocks
            .as_ref()
            .ok_or_else(|| BlockError::UnknownBlock(block_name.to_string()))?;
        lock(engine).recover(block_name, reservation_id, owner, connection)?;
        self.hardware.recover(&[reservation_id]);
        Ok(())
    }

    pub fn set_node_down(&self, name: &str, reason: &str) -> crate::Result<()> {
        write(&self.inventory).set_node_down(name, reason)
    }

    pub fn drain_node(&self, name: &str, reason: Option<&str>) -> crate::Result<()> {
        write(&self.inventory).drain_node(name, reason)
    }

    pub fn resume_node(&self, name: &str) -> crate::Result<()> {
        write(&self.inventory).resume_node(name)
    }
}

fn step_deadline(job: &Job, step: &Step) -> Option<Instant> {
    let own = step.time_limit().map(|limit| step.start_time() + limit);
    match (own, job.deadline()) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
