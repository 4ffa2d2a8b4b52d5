pub mod common;
pub mod launch;

pub type Error = crate::common::error::LaunchError;
pub type Result<T> = std::result::Result<T, Error>;
