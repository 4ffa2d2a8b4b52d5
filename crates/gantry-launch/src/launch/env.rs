use gantry::server::StepLaunchInfo;
use gantry::{JobId, StepId};

macro_rules! create_gantry_env {
    ($name: literal) => {
        concat!("GANTRY_", $name)
    };
}

/// Known environment variables
pub const GANTRY_JOB_ID: &str = create_gantry_env!("JOB_ID");
pub const GANTRY_STEP_ID: &str = create_gantry_env!("STEP_ID");
pub const GANTRY_TASK_ID: &str = create_gantry_env!("TASK_ID");
pub const GANTRY_NPROCS: &str = create_gantry_env!("NPROCS");
pub const GANTRY_NNODES: &str = create_gantry_env!("NNODES");
pub const GANTRY_NODELIST: &str = create_gantry_env!("NODELIST");
pub const GANTRY_RESV_ID: &str = create_gantry_env!("RESV_ID");

/// Step-wide part of the environment of launched tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEnvironment {
    job_id: JobId,
    step_id: StepId,
    nprocs: u32,
    nnodes: usize,
    node_list: String,
    reservation_id: Option<String>,
}

impl TaskEnvironment {
    pub fn from_launch(info: &StepLaunchInfo) -> Self {
        TaskEnvironment {
            job_id: info.job_id,
            step_id: info.step_id,
            nprocs: info.layout.task_count(),
            nnodes: info.layout.node_count(),
            node_list: info.node_list.clone(),
            reservation_id: info.reservation_id.clone(),
        }
    }

    pub fn nprocs(&self) -> u32 {
        self.nprocs
    }

    /// Variables of task `task_id`. The reservation id is present only when
    /// the step holds a block.
    pub fn variables(&self, task_id: u32) -> Vec<(&'static str, String)> {
        let mut variables = vec![
            (GANTRY_JOB_ID, self.job_id.to_string()),
            (GANTRY_STEP_ID, self.step_id.to_string()),
            (GANTRY_TASK_ID, task_id.to_string()),
            (GANTRY_NPROCS, self.nprocs.to_string()),
            (GANTRY_NNODES, self.nnodes.to_string()),
            (GANTRY_NODELIST, self.node_list.clone()),
        ];
        if let Some(reservation_id) = &self.reservation_id {
            variables.push((GANTRY_RESV_ID, reservation_id.clone()));
        }
        variables
    }

    /// Sets the variables of task `task_id` on a command before it is spawned.
    pub fn apply(&self, task_id: u32, command: &mut tokio::process::Command) {
        command.envs(self.variables(task_id));
    }
}

/// Environment of task `task_id` of a launched step.
pub fn task_environment(info: &StepLaunchInfo, task_id: u32) -> Vec<(&'static str, String)> {
    TaskEnvironment::from_launch(info).variables(task_id)
}
