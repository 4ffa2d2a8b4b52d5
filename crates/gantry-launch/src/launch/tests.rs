use std::sync::Mutex;

use gantry::agent::{AgentMessage, AgentPayload, AgentReply, AgentTransport};
use gantry::jobs::JobDescription;
use gantry::server::{Controller, ControllerConfig, StepLaunchInfo};
use gantry::steps::StepSpecBuilder;
use gantry::topology::InMemoryHardware;

const NODES: &str = r#"
[[nodes]]
names = "n[0-3]"
cpus = 4

[[partitions]]
name = "batch"
nodes = "n[0-3]"
"#;

const BLOCKS: &str = r#"
[[topology.blocks]]
name = "mp0"
nodes = "n[0-1]"

[[topology.blocks]]
name = "mp1"
nodes = "n[2-3]"
"#;

fn create_step(config: &str, node_count: u32, num_tasks: u32) -> StepLaunchInfo {
    let config = ControllerConfig::from_toml_str(config).unwrap();
    let controller = Controller::from_config(&config, Box::new(InMemoryHardware::new())).unwrap();
    let job_id = controller
        .submit_job(JobDescription {
            uid: 1000,
            gid: 1000,
            account: "default".to_string(),
            partition: "batch".to_string(),
            nodes: "n[0-3]".to_string(),
            time_limit: None,
        })
        .unwrap();
    let spec = StepSpecBuilder::default()
        .job_id(job_id)
        .uid(1000)
        .node_count(node_count)
        .num_tasks(num_tasks)
        .build()
        .unwrap();
    controller.step_create(&spec).unwrap()
}

/// Step of `num_tasks` tasks on the first `node_count` of four plain nodes.
pub(crate) fn launch_info(node_count: u32, num_tasks: u32) -> StepLaunchInfo {
    create_step(NODES, node_count, num_tasks)
}

/// Step holding a topology block.
pub(crate) fn block_launch_info(node_count: u32, num_tasks: u32) -> StepLaunchInfo {
    create_step(&format!("{NODES}{BLOCKS}"), node_count, num_tasks)
}

/// Acknowledges every message and remembers where it went.
#[derive(Default)]
pub(crate) struct RecordingTransport {
    pub sent: Mutex<Vec<(String, AgentMessage)>>,
}

impl RecordingTransport {
    pub fn payloads(&self) -> Vec<AgentPayload> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, message)| message.payload.clone())
            .collect()
    }
}

impl AgentTransport for RecordingTransport {
    async fn send(&self, address: &str, message: &AgentMessage) -> gantry::Result<AgentReply> {
        self.sent
            .lock()
            .unwrap()
            .push((address.to_string(), message.clone()));
        Ok(AgentReply::Ok)
    }
}
