use serde::{Deserialize, Serialize};

use crate::internal::common::ids::{JobId, StepId, StepKey};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum AgentPayload {
    RevokeCredential,
    KillTasks { signal: i32 },
    /// New inbound I/O address for every task of the step.
    ReattachStreams { addresses: Vec<String> },
    StepComplete { exit_code: i32 },
}

/// Control message sent by the agent to node daemons.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AgentMessage {
    pub job_id: JobId,
    pub step_id: StepId,
    pub payload: AgentPayload,
}

impl AgentMessage {
    pub fn new(key: StepKey, payload: AgentPayload) -> Self {
        AgentMessage {
            job_id: key.job_id(),
            step_id: key.step_id(),
            payload,
        }
    }

    pub fn step_key(&self) -> StepKey {
        StepKey::new(self.job_id, self.step_id)
    }

    pub fn kind(&self) -> &'static str {
        match self.payload {
            AgentPayload::RevokeCredential => "REVOKE_CREDENTIAL",
            AgentPayload::KillTasks { .. } => "KILL_TASKS",
            AgentPayload::ReattachStreams { .. } => "REATTACH_STREAMS",
            AgentPayload::StepComplete { .. } => "STEP_COMPLETE",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum AgentReply {
    Ok,
    Error(String),
}
