mod layout;
mod select;

pub use layout::{TaskLayout, compute_layout};
pub use select::pick_step_nodes;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::internal::common::ids::{JobId, StepId, Uid};
use crate::internal::topology::ConnectionType;

/// Node count requesting every usable node of the job.
pub const ALL_NODES: u32 = u32::MAX;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Distribution {
    /// Consecutive task ids on each node.
    #[default]
    Block,
    /// Task ids dealt to nodes round-robin.
    Cyclic,
    /// Chunks of the given size dealt to nodes round-robin.
    Plane(u32),
    /// Placement chosen by the caller.
    Arbitrary,
}

impl FromStr for Distribution {
    type Err = StepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || StepError::BadDistribution(s.to_string());
        match s {
            "block" => Ok(Distribution::Block),
            "cyclic" => Ok(Distribution::Cyclic),
            "arbitrary" => Ok(Distribution::Arbitrary),
            _ => {
                let size = s.strip_prefix("plane=").ok_or_else(bad)?;
                let size: u32 = size.parse().map_err(|_| bad())?;
                Ok(Distribution::Plane(size))
            }
        }
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Distribution::Block => f.write_str("block"),
            Distribution::Cyclic => f.write_str("cyclic"),
            Distribution::Plane(size) => write!(f, "plane={size}"),
            Distribution::Arbitrary => f.write_str("arbitrary"),
        }
    }
}

/// Request to create a step inside a job.
#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(pattern = "owned")]
pub struct StepSpec {
    #[builder(setter(into))]
    pub job_id: JobId,
    pub uid: Uid,
    /// 0 derives the count from `cpu_count`, [`ALL_NODES`] takes every usable node.
    #[builder(default)]
    pub node_count: u32,
    /// 0 derives the count from `node_count`.
    #[builder(default)]
    pub cpu_count: u32,
    /// 0 runs one task per cpu if `cpu_count` is given, else one task per node.
    #[builder(default)]
    pub num_tasks: u32,
    #[builder(default, setter(into, strip_option))]
    pub host_list: Option<String>,
    /// Skip this many leading nodes of the job.
    #[builder(default, setter(strip_option))]
    pub relative: Option<u32>,
    #[builder(default)]
    pub distribution: Distribution,
    #[builder(default)]
    pub features: Vec<String>,
    #[builder(default)]
    pub connection: ConnectionType,
    #[builder(default, setter(strip_option))]
    pub time_limit: Option<Duration>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PickError {
    #[error("invalid node list `{0}`")]
    InvalidNodeList(String),
    #[error("requested nodes not part of job")]
    NotPartOfJob,
    #[error("some requested nodes down")]
    NodesDown,
    #[error("relative offset {relative} exceeds {available} usable nodes")]
    RelativeOutOfRange { relative: u32, available: u32 },
    #[error("requested {requested} nodes, only {available} usable")]
    InsufficientNodes { requested: u32, available: u32 },
    #[error("requested {requested} cpus, only {available} usable")]
    InsufficientCpus { requested: u32, available: u32 },
    #[error("no nodes selected")]
    EmptySelection,
    #[error("{tasks} tasks cannot be spread over {nodes} nodes")]
    TooFewTasks { tasks: u32, nodes: u32 },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error("invalid job id {0}")]
    InvalidJobId(JobId),
    #[error("access denied")]
    AccessDenied,
    #[error("job {0} already done")]
    AlreadyDone(JobId),
    #[error("job {0} is not running")]
    JobNotRunning(JobId),
    #[error("bad distribution `{0}`")]
    BadDistribution(String),
    #[error("requested node configuration unavailable: {0}")]
    ConfigUnavailable(#[from] PickError),
    #[error("interconnect failure: {0}")]
    InterconnectFailure(String),
    #[error("step {1} of job {0} not found")]
    NotFound(JobId, StepId),
    #[error("cannot create step credential: {0}")]
    CredentialFailure(String),
}

impl StepError {
    /// Well-known code reported to clients.
    pub fn code(&self) -> i32 {
        match self {
            StepError::InvalidJobId(_) => -1,
            StepError::AccessDenied => -2,
            StepError::AlreadyDone(_) => -3,
            StepError::JobNotRunning(_) => -4,
            StepError::BadDistribution(_) => -5,
            StepError::ConfigUnavailable(_) => -6,
            StepError::InterconnectFailure(_) => -7,
            StepError::NotFound(_, _) => -8,
            StepError::CredentialFailure(_) => -9,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_distribution() {
        assert_eq!("block".parse::<Distribution>(), Ok(Distribution::Block));
        assert_eq!("cyclic".parse::<Distribution>(), Ok(Distribution::Cyclic));
        assert_eq!("plane=4".parse::<Distribution>(), Ok(Distribution::Plane(4)));
        assert_eq!(Distribution::Plane(4).to_string(), "plane=4");
        assert!(matches!(
            "plane=x".parse::<Distribution>(),
            Err(StepError::BadDistribution(s)) if s == "plane=x"
        ));
        assert!("spread".parse::<Distribution>().is_err());
    }

    #[test]
    fn test_builder_defaults() {
        let spec = StepSpecBuilder::default()
            .job_id(3)
            .uid(1000)
            .node_count(2)
            .build()
            .unwrap();
        assert_eq!(spec.job_id, JobId::new(3));
        assert_eq!(spec.cpu_count, 0);
        assert!(spec.host_list.is_none());
        assert_eq!(spec.distribution, Distribution::Block);
        assert!(StepSpecBuilder::default().uid(1).build().is_err());
    }

    #[test]
    fn test_error_codes() {
        let errors = [
            StepError::InvalidJobId(1.into()),
            StepError::AccessDenied,
            StepError::AlreadyDone(1.into()),
            StepError::JobNotRunning(1.into()),
            StepError::BadDistribution("x".into()),
            StepError::ConfigUnavailable(PickError::NodesDown),
            StepError::InterconnectFailure("x".into()),
            StepError::NotFound(1.into(), 2.into()),
            StepError::CredentialFailure("x".into()),
        ];
        let mut codes: Vec<i32> = errors.iter().map(|e| e.code()).collect();
        assert!(codes.iter().all(|c| *c < 0));
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }
}
