mod switch;

pub use switch::{SwitchContext, SwitchTable};

use serde::{Deserialize, Serialize};

/// Interconnect resources held by a step, per platform back-end.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterconnectContext {
    #[default]
    None,
    Block(BlockContext),
    Switch(SwitchContext),
}

/// A topology block reserved for a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockContext {
    pub reservation_id: String,
    pub block_name: String,
}

impl InterconnectContext {
    pub fn reservation_id(&self) -> Option<&str> {
        match self {
            InterconnectContext::Block(block) => Some(&block.reservation_id),
            InterconnectContext::None | InterconnectContext::Switch(_) => None,
        }
    }
}
