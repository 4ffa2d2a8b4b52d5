#[cfg(test)]
mod test_agent;
#[cfg(test)]
mod test_topology;

pub mod utils;
