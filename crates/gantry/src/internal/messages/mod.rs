pub mod agent;
pub mod stream;
