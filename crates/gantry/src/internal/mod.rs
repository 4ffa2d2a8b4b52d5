#[macro_use]
pub(crate) mod common;
pub mod agent;
pub mod credential;
pub mod interconnect;
pub mod inventory;
pub mod jobs;
pub mod messages;
pub mod server;
pub mod steps;
pub mod topology;
pub(crate) mod transfer;

#[cfg(test)]
pub mod tests;
