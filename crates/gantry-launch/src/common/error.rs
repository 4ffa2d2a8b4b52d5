use thiserror::Error;

use crate::common::error::LaunchError::GenericError;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Gantry error: {0}")]
    GantryError(#[from] gantry::Error),
    #[error("Invalid header: {0}")]
    StreamHeaderError(#[from] gantry::stream::StreamHeaderError),
    #[error("Signal handling error: {0}")]
    SignalError(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<anyhow::Error> for LaunchError {
    fn from(error: anyhow::Error) -> Self {
        Self::GenericError(error.to_string())
    }
}

pub fn error<T>(message: String) -> crate::Result<T> {
    Err(GenericError(message))
}

impl From<String> for LaunchError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}

impl From<&str> for LaunchError {
    fn from(e: &str) -> Self {
        GenericError(e.to_string())
    }
}
