//! Client side of a step launch: task environment, output multiplexing and
//! signal forwarding.
pub mod env;
pub mod iomux;
pub mod session;
pub mod signals;

#[cfg(test)]
pub(crate) mod tests;
