use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::internal::common::bitmap::Bitmap;
use crate::internal::common::ids::Uid;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionState {
    #[default]
    Up,
    Down,
    Drain,
    Inactive,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharedPolicy {
    #[default]
    No,
    Yes,
    Exclusive,
    Force,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("partition {0} is restricted to the administrator")]
    RootOnly(String),
    #[error("partition {0} is not accepting jobs")]
    PartitionUnavailable(String),
    #[error("partition {partition} allows at most {max} nodes per job")]
    TooManyNodes { partition: String, max: u32 },
    #[error("requested nodes are not part of partition {0}")]
    NodesOutsidePartition(String),
    #[error("user {uid} may not use account {account} in partition {partition}")]
    AccountNotPermitted {
        uid: Uid,
        account: String,
        partition: String,
    },
}

#[derive(Debug, Clone)]
pub struct Partition {
    pub(crate) name: String,
    pub(crate) node_bitmap: Bitmap,
    pub(crate) default_time: Option<Duration>,
    pub(crate) max_nodes: Option<u32>,
    pub(crate) root_only: bool,
    pub(crate) shared: SharedPolicy,
    pub(crate) state: PartitionState,
}

impl Partition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_bitmap(&self) -> &Bitmap {
        &self.node_bitmap
    }

    pub fn default_time(&self) -> Option<Duration> {
        self.default_time
    }

    pub fn shared(&self) -> SharedPolicy {
        self.shared
    }

    pub fn state(&self) -> PartitionState {
        self.state
    }

    /// Checks the partition policy knobs for a job of `nodes` submitted by `uid`.
    pub fn admits(&self, uid: Uid, admin_uid: Uid, nodes: &Bitmap) -> Result<(), PolicyError> {
        if self.root_only && uid != admin_uid {
            return Err(PolicyError::RootOnly(self.name.clone()));
        }
        if self.state != PartitionState::Up {
            return Err(PolicyError::PartitionUnavailable(self.name.clone()));
        }
        if let Some(max) = self.max_nodes {
            if nodes.count() > max as usize {
                return Err(PolicyError::TooManyNodes {
                    partition: self.name.clone(),
                    max,
                });
            }
        }
        if !nodes.is_subset_of(&self.node_bitmap) {
            return Err(PolicyError::NodesOutsidePartition(self.name.clone()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct PartitionList {
    partitions: Vec<Partition>,
}

impl PartitionList {
    pub(crate) fn new(partitions: Vec<Partition>) -> Self {
        PartitionList { partitions }
    }

    pub fn find(&self, name: &str) -> Option<&Partition> {
        self.partitions.iter().find(|p| p.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.iter()
    }

    pub fn set_state(&mut self, name: &str, state: PartitionState) -> bool {
        match self.partitions.iter_mut().find(|p| p.name == name) {
            Some(partition) => {
                partition.state = state;
                true
            }
            None => false,
        }
    }
}
