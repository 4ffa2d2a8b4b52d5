use thiserror::Error;

use crate::internal::common::hostlist::HostlistError;
use crate::internal::inventory::PolicyError;
use crate::internal::steps::StepError;
use crate::internal::topology::{BlockError, TopologyConfigError};

#[allow(clippy::enum_variant_names)]
#[derive(Debug, Error)]
pub enum GantryError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Invalid node list: {0}")]
    HostlistError(#[from] HostlistError),
    #[error("Unknown node: {0}")]
    UnknownNode(String),
    #[error("Job rejected: {0}")]
    PolicyError(#[from] PolicyError),
    #[error("Step error: {0}")]
    StepError(#[from] StepError),
    #[error("Topology configuration error: {0}")]
    TopologyConfigError(#[from] TopologyConfigError),
    #[error("Block error: {0}")]
    BlockError(#[from] BlockError),
    #[error("Interconnect error: {0}")]
    InterconnectError(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<serde_json::error::Error> for GantryError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<bincode::Error> for GantryError {
    fn from(e: bincode::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<toml::de::Error> for GantryError {
    fn from(e: toml::de::Error) -> Self {
        Self::ConfigError(e.to_string())
    }
}

impl From<orion::errors::UnknownCryptoError> for GantryError {
    fn from(_: orion::errors::UnknownCryptoError) -> Self {
        Self::GenericError("Cryptographic operation failed".to_string())
    }
}

impl From<String> for GantryError {
    fn from(e: String) -> Self {
        Self::GenericError(e)
    }
}

impl From<&str> for GantryError {
    fn from(e: &str) -> Self {
        Self::GenericError(e.to_string())
    }
}
