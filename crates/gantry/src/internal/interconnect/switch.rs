use serde::{Deserialize, Serialize};

use crate::internal::common::ids::NodeIndex;
use crate::internal::steps::TaskLayout;

/// Adapter windows held by one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchContext {
    windows: Vec<(NodeIndex, u32)>,
}

impl SwitchContext {
    /// Pairs of node and the number of windows held on it.
    pub fn windows(&self) -> &[(NodeIndex, u32)] {
        &self.windows
    }
}

/// Adapter windows of switch-attached nodes. Every task of a step needs
/// one window on the node it runs on.
#[derive(Debug)]
pub struct SwitchTable {
    windows_per_node: u32,
    used: Vec<u32>,
}

impl SwitchTable {
    pub fn new(node_count: usize, windows_per_node: u32) -> Self {
        SwitchTable {
            windows_per_node,
            used: vec![0; node_count],
        }
    }

    pub fn free_windows(&self, index: NodeIndex) -> u32 {
        self.windows_per_node - self.used[index]
    }

    /// Takes windows for every task of `layout`; nothing is taken on failure.
    pub fn allocate(&mut self, layout: &TaskLayout) -> crate::Result<SwitchContext> {
        let windows: Vec<(NodeIndex, u32)> = layout
            .nodes()
            .iter()
            .copied()
            .zip(layout.tasks_per_node().iter().copied())
            .collect();
        if let Some((index, needed)) = windows
            .iter()
            .find(|(index, needed)| self.free_windows(*index) < *needed)
        {
            return Err(crate::Error::InterconnectError(format!(
                "node {index} needs {needed} adapter windows, {} free",
                self.free_windows(*index)
            )));
        }
        for (index, needed) in &windows {
            self.used[*index] += needed;
        }
        Ok(SwitchContext { windows })
    }

    pub fn release(&mut self, context: &SwitchContext) {
        for (index, count) in &context.windows {
            self.used[*index] = self.used[*index].saturating_sub(*count);
        }
    }
}
