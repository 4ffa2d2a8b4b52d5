#[macro_use]
pub mod internal;

pub use crate::internal::common::bitmap::Bitmap;
pub use crate::internal::common::hostlist::{compress_hostlist, expand_hostlist};
pub use crate::internal::common::ids::{Gid, JobId, NodeIndex, StepId, StepKey, Uid};
pub use crate::internal::common::{Map, Set};

pub type Error = internal::common::error::GantryError;
pub type Result<T> = std::result::Result<T, Error>;

/// Largest agent message accepted on the wire.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

pub mod agent {
    pub use crate::internal::agent::{
        Agent, AgentTransport, Destination, DestinationState, DestinationStatus, DispatchReport,
        NodeAgent, TcpAgentTransport, serve_node_agent,
    };
    pub use crate::internal::messages::agent::{AgentMessage, AgentPayload, AgentReply};
}

pub mod credential {
    pub use crate::internal::credential::{
        Credential, CredentialBody, CredentialCache, CredentialError, CredentialSigner, SIG_LEN,
        Signature,
    };
}

pub mod stream {
    pub use crate::internal::messages::stream::{
        STREAM_HEADER_LEN, STREAM_PROTOCOL_VERSION, StreamHeader, StreamHeaderError, StreamType,
    };
}

pub mod inventory {
    pub use crate::internal::inventory::{
        Node, NodeFlags, NodeInventory, NodeState, Partition, PartitionList, PartitionState,
        PolicyError, SharedPolicy,
    };
}

pub mod jobs {
    pub use crate::internal::jobs::{
        AllowAll, AssociationFilter, CpuGroups, Job, JobDescription, JobState, JobTable,
        JsonTransactionLog, MemoryTransactionLog, Step, Transaction, TransactionKind,
        TransactionSink,
    };
}

pub mod steps {
    pub use crate::internal::steps::{
        ALL_NODES, Distribution, PickError, StepError, StepSpec, StepSpecBuilder, TaskLayout,
        compute_layout, pick_step_nodes,
    };
}

pub mod topology {
    pub use crate::internal::topology::{
        Block, BlockEngine, BlockError, BlockHardware, BlockRequest, BlockState, ConnectionType,
        HardwareReservation, InMemoryHardware, TopologyConfigError,
    };
}

pub mod server {
    pub use crate::internal::server::config::{
        AgentConfig, BlockConfig, ControllerConfig, CredentialConfig, NodeConfig, PartitionConfig,
        SwitchConfig, TopologyConfig,
    };
    pub use crate::internal::server::controller::{
        CompletedStep, Controller, StepCancellation, StepLaunchInfo,
    };
}
