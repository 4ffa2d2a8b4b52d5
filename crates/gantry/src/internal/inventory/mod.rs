mod node;
mod partition;

pub use node::{Coords, Node, NodeFlags, NodeState};
pub use partition::{Partition, PartitionList, PartitionState, PolicyError, SharedPolicy};

use std::time::Instant;

use crate::internal::common::Map;
use crate::internal::common::bitmap::Bitmap;
use crate::internal::common::error::GantryError;
use crate::internal::common::hostlist::{compress_hostlist, expand_hostlist};
use crate::internal::common::ids::NodeIndex;
use crate::internal::server::config::{NodeConfig, PartitionConfig};

/// Table of compute nodes, indexed by slot.
///
/// Every node bitmap in the controller is sized by [`NodeInventory::node_count`]
/// and bit `i` refers to the node in slot `i`.
#[derive(Debug, Default)]
pub struct NodeInventory {
    nodes: Vec<Node>,
    names: Map<String, NodeIndex>,
    last_node_update: u64,
}

impl NodeInventory {
    pub fn from_config(configs: &[NodeConfig]) -> crate::Result<Self> {
        let mut inventory = NodeInventory::default();
        for config in configs {
            let names = expand_hostlist(&config.names)?;
            if config.address.is_some() && names.len() != 1 {
                return Err(GantryError::ConfigError(format!(
                    "Node entry `{}` sets an address but names {} nodes",
                    config.names,
                    names.len()
                )));
            }
            for name in names {
                if inventory.names.contains_key(&name) {
                    return Err(GantryError::ConfigError(format!(
                        "Node {name} is defined twice"
                    )));
                }
                let index = inventory.nodes.len();
                let mut node = Node::new(index, name.clone(), config.cpus);
                node.address.clone_from(&config.address);
                node.real_memory = config.real_memory;
                node.tmp_disk = config.tmp_disk;
                node.features.clone_from(&config.features);
                inventory.names.insert(name, index);
                inventory.nodes.push(node);
            }
        }
        log::debug!("Node inventory created with {} nodes", inventory.nodes.len());
        Ok(inventory)
    }

    /// Resolves partition definitions and records the membership on every node.
    pub fn build_partitions(&mut self, configs: &[PartitionConfig]) -> crate::Result<PartitionList> {
        let mut partitions = Vec::with_capacity(configs.len());
        for (position, config) in configs.iter().enumerate() {
            if configs[..position].iter().any(|c| c.name == config.name) {
                return Err(GantryError::ConfigError(format!(
                    "Partition {} is defined twice",
                    config.name
                )));
            }
            let node_bitmap = self.name2bitmap(&config.nodes)?;
            for index in node_bitmap.iter() {
                self.nodes[index].partitions.push(position);
            }
            partitions.push(Partition {
                name: config.name.clone(),
                node_bitmap,
                default_time: config.default_time,
                max_nodes: config.max_nodes,
                root_only: config.root_only,
                shared: config.shared,
                state: config.state,
            });
        }
        Ok(PartitionList::new(partitions))
    }

    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    #[inline]
    pub fn node(&self, index: NodeIndex) -> &Node {
        &self.nodes[index]
    }

    pub fn find_node(&self, name: &str) -> Option<&Node> {
        self.node_index(name).map(|index| &self.nodes[index])
    }

    pub fn node_index(&self, name: &str) -> Option<NodeIndex> {
        self.names.get(name).copied()
    }

    pub fn empty_bitmap(&self) -> Bitmap {
        Bitmap::new(self.nodes.len())
    }

    /// Resolves a node-name expression. Unknown names are an error.
    pub fn name2bitmap(&self, expr: &str) -> crate::Result<Bitmap> {
        let mut bitmap = self.empty_bitmap();
        for name in expand_hostlist(expr)? {
            let index = self
                .node_index(&name)
                .ok_or_else(|| GantryError::UnknownNode(name.clone()))?;
            bitmap.set(index);
        }
        Ok(bitmap)
    }

    pub fn bitmap2name(&self, bitmap: &Bitmap) -> String {
        compress_hostlist(bitmap.iter().map(|index| self.nodes[index].name.as_str()))
    }

    pub fn count_cpus(&self, bitmap: &Bitmap) -> u32 {
        bitmap.iter().map(|index| self.nodes[index].cpus).sum()
    }

    pub fn up_nodes(&self) -> Bitmap {
        Bitmap::from_indices(
            self.nodes.len(),
            self.nodes.iter().filter(|n| n.is_up()).map(|n| n.index),
        )
    }

    pub fn nodes_with_features(&self, features: &[String]) -> Bitmap {
        Bitmap::from_indices(
            self.nodes.len(),
            self.nodes
                .iter()
                .filter(|n| n.has_features(features))
                .map(|n| n.index),
        )
    }

    /// Address of the node agent; the node name is used when no address is configured.
    pub fn agent_address(&self, index: NodeIndex, port: u16) -> String {
        let node = &self.nodes[index];
        let host = node.address.as_deref().unwrap_or(&node.name);
        if host.contains(':') {
            host.to_string()
        } else {
            format!("{host}:{port}")
        }
    }

    /// Generation counter that changes on every node mutation.
    pub fn last_node_update(&self) -> u64 {
        self.last_node_update
    }

    fn node_mut(&mut self, name: &str) -> crate::Result<&mut Node> {
        let index = self
            .node_index(name)
            .ok_or_else(|| GantryError::UnknownNode(name.to_string()))?;
        self.last_node_update += 1;
        Ok(&mut self.nodes[index])
    }

    pub fn set_node_down(&mut self, name: &str, reason: &str) -> crate::Result<()> {
        let node = self.node_mut(name)?;
        log::info!("Node {} set DOWN: {reason}", node.name);
        node.state = NodeState::Down;
        node.reason = Some(reason.to_string());
        Ok(())
    }

    /// Marks the node for draining. A later request without a reason keeps
    /// the reason recorded by the earlier one.
    pub fn drain_node(&mut self, name: &str, reason: Option<&str>) -> crate::Result<()> {
        let node = self.node_mut(name)?;
        node.flags.insert(NodeFlags::DRAIN);
        if let Some(reason) = reason {
            node.reason = Some(reason.to_string());
        }
        node.refresh_state();
        log::info!(
            "Node {} draining: {}",
            node.name,
            node.reason.as_deref().unwrap_or("no reason given")
        );
        Ok(())
    }

    pub fn resume_node(&mut self, name: &str) -> crate::Result<()> {
        let node = self.node_mut(name)?;
        node.flags.remove(NodeFlags::DRAIN | NodeFlags::FAIL);
        node.reason = None;
        if matches!(node.state, NodeState::Down | NodeState::Unknown) {
            node.state = NodeState::Idle;
        }
        node.refresh_state();
        log::info!("Node {} resumed, state {}", node.name, node.state);
        Ok(())
    }

    pub fn set_power_save(&mut self, name: &str, enabled: bool) -> crate::Result<()> {
        let node = self.node_mut(name)?;
        node.flags.set(NodeFlags::POWER_SAVE, enabled);
        Ok(())
    }

    pub fn touch_node(&mut self, name: &str, now: Instant) -> crate::Result<()> {
        let index = self
            .node_index(name)
            .ok_or_else(|| GantryError::UnknownNode(name.to_string()))?;
        self.nodes[index].last_heard = Some(now);
        Ok(())
    }

    pub(crate) fn allocate_nodes(&mut self, bitmap: &Bitmap) {
        for index in bitmap.iter() {
            let node = &mut self.nodes[index];
            node.job_count += 1;
            node.refresh_state();
        }
        self.last_node_update += 1;
    }

    pub(crate) fn release_nodes(&mut self, bitmap: &Bitmap) {
        for index in bitmap.iter() {
            let node = &mut self.nodes[index];
            node.job_count = node.job_count.saturating_sub(1);
            node.refresh_state();
        }
        self.last_node_update += 1;
    }

    pub(crate) fn set_completing(&mut self, bitmap: &Bitmap, completing: bool) {
        for index in bitmap.iter() {
            let node = &mut self.nodes[index];
            node.flags.set(NodeFlags::COMPLETING, completing);
            node.refresh_state();
        }
        self.last_node_update += 1;
    }

    pub(crate) fn set_topology(&mut self, index: NodeIndex, coords: Coords) {
        let node = &mut self.nodes[index];
        node.flags.insert(NodeFlags::TOPOLOGY);
        node.coords = coords;
        self.last_node_update += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::tests::utils::config::{node_config, partition_config};

    fn inventory() -> NodeInventory {
        NodeInventory::from_config(&[node_config("n[0-3]", 4), node_config("big[1-2]", 16)])
            .unwrap()
    }

    #[test]
    fn test_lookup() {
        let inv = inventory();
        assert_eq!(inv.node_count(), 6);
        assert_eq!(inv.node_index("n2"), Some(2));
        assert_eq!(inv.find_node("big2").unwrap().cpus(), 16);
        assert!(inv.find_node("n9").is_none());
    }

    #[test]
    fn test_name2bitmap_roundtrip() {
        let inv = inventory();
        let bitmap = inv.name2bitmap("n[0-1,3],big2").unwrap();
        assert_eq!(bitmap.iter().collect::<Vec<_>>(), vec![0, 1, 3, 5]);
        assert_eq!(inv.bitmap2name(&bitmap), "n[0-1,3],big2");
        assert_eq!(inv.name2bitmap(&inv.bitmap2name(&bitmap)).unwrap(), bitmap);
        assert_eq!(inv.count_cpus(&bitmap), 4 * 3 + 16);
        assert!(matches!(
            inv.name2bitmap("n[0-7]"),
            Err(GantryError::UnknownNode(name)) if name == "n4"
        ));
        assert!(inv.name2bitmap("n[0-").is_err());
    }

    #[test]
    fn test_duplicate_node() {
        assert!(
            NodeInventory::from_config(&[node_config("n[0-3]", 4), node_config("n3", 4)])
                .is_err()
        );
    }

    #[test]
    fn test_down_and_resume() {
        let mut inv = inventory();
        let before = inv.last_node_update();
        inv.set_node_down("n1", "not responding").unwrap();
        assert!(inv.last_node_update() > before);
        assert_eq!(inv.find_node("n1").unwrap().state(), NodeState::Down);
        assert!(!inv.up_nodes().test(1));
        assert_eq!(inv.up_nodes().count(), 5);

        inv.resume_node("n1").unwrap();
        assert_eq!(inv.find_node("n1").unwrap().state(), NodeState::Idle);
        assert!(inv.up_nodes().test(1));
    }

    #[test]
    fn test_drain_reason_order() {
        let mut inv = inventory();
        inv.drain_node("n0", Some("bad dimm")).unwrap();
        inv.drain_node("n0", None).unwrap();
        let node = inv.find_node("n0").unwrap();
        assert_eq!(node.reason(), Some("bad dimm"));
        assert_eq!(node.state(), NodeState::Drained);

        inv.drain_node("n0", Some("replaced dimm")).unwrap();
        assert_eq!(inv.find_node("n0").unwrap().reason(), Some("replaced dimm"));
        // Drained nodes remain usable for steps of jobs that hold them
        assert!(inv.up_nodes().test(0));
    }

    #[test]
    fn test_allocation_states() {
        let mut inv = inventory();
        let bitmap = inv.name2bitmap("n[0-1]").unwrap();
        inv.allocate_nodes(&bitmap);
        assert_eq!(inv.find_node("n0").unwrap().state(), NodeState::Allocated);
        inv.drain_node("n0", Some("maintenance")).unwrap();
        assert_eq!(inv.find_node("n0").unwrap().state(), NodeState::Draining);
        inv.release_nodes(&bitmap);
        assert_eq!(inv.find_node("n0").unwrap().state(), NodeState::Drained);
        assert_eq!(inv.find_node("n1").unwrap().state(), NodeState::Idle);
    }

    #[test]
    fn test_partitions() {
        let mut inv = inventory();
        let partitions = inv
            .build_partitions(&[partition_config("batch", "n[0-3]"), partition_config("fat", "big[1-2]")])
            .unwrap();
        assert_eq!(partitions.find("batch").unwrap().node_bitmap().count(), 4);
        assert_eq!(inv.find_node("big1").unwrap().partitions(), &[1]);
        assert!(inv.build_partitions(&[partition_config("x", "nope1")]).is_err());
    }

    #[test]
    fn test_agent_address() {
        let inv = inventory();
        assert_eq!(inv.agent_address(0, 6818), "n0:6818");
    }
}
