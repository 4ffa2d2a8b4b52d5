use std::time::Duration;

use crate::internal::server::config::{
    BlockConfig, ControllerConfig, NodeConfig, PartitionConfig, TopologyConfig,
};

pub fn node_config(names: &str, cpus: u32) -> NodeConfig {
    NodeConfig {
        names: names.to_string(),
        cpus,
        real_memory: 0,
        tmp_disk: 0,
        features: Vec::new(),
        address: None,
    }
}

pub fn partition_config(name: &str, nodes: &str) -> PartitionConfig {
    PartitionConfig {
        name: name.to_string(),
        nodes: nodes.to_string(),
        default_time: None,
        max_nodes: None,
        root_only: false,
        shared: Default::default(),
        state: Default::default(),
    }
}

/// Configuration with one partition `batch` holding every node.
pub fn controller_config(nodes: Vec<NodeConfig>, partition_nodes: &str) -> ControllerConfig {
    ControllerConfig {
        admin_uid: 0,
        agent: Default::default(),
        credential: Default::default(),
        nodes,
        partitions: vec![partition_config("batch", partition_nodes)],
        topology: None,
        switch: None,
    }
}

/// A linear topology of `midplanes` blocks named `mpN`, each of `base`
/// consecutive nodes `n0`, `n1`, ...
pub fn linear_topology(
    midplanes: usize,
    base: usize,
    block_sizes: Option<&str>,
) -> (NodeConfig, TopologyConfig) {
    let nodes = node_config(&format!("n[0-{}]", midplanes * base - 1), 4);
    let blocks = (0..midplanes)
        .map(|m| BlockConfig {
            name: format!("mp{m}"),
            nodes: format!("n[{}-{}]", m * base, (m + 1) * base - 1),
            coords: None,
        })
        .collect();
    let topology = TopologyConfig {
        block_sizes: block_sizes.map(|s| s.to_string()),
        blocks,
        ..Default::default()
    };
    (nodes, topology)
}

pub fn hours(count: u64) -> Duration {
    Duration::from_secs(count * 3600)
}
