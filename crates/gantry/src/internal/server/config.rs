use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::internal::common::ids::Uid;
use crate::internal::common::timeutils::{duration, opt_duration};
use crate::internal::inventory::{PartitionState, SharedPolicy};

pub const DEFAULT_FANOUT_WIDTH: usize = 32;
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_AGENT_PORT: u16 = 6818;
pub const DEFAULT_CREDENTIAL_LIFETIME: Duration = Duration::from_secs(60 * 60 * 24);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    #[serde(default)]
    pub admin_uid: Uid,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub credential: CredentialConfig,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub partitions: Vec<PartitionConfig>,
    #[serde(default)]
    pub topology: Option<TopologyConfig>,
    #[serde(default)]
    pub switch: Option<SwitchConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Maximum number of destinations in flight during one dispatch.
    #[serde(default = "default_fanout_width")]
    pub fanout_width: usize,
    #[serde(default = "default_command_timeout", with = "duration")]
    pub command_timeout: Duration,
    #[serde(default = "default_agent_port")]
    pub port: u16,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            fanout_width: DEFAULT_FANOUT_WIDTH,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            port: DEFAULT_AGENT_PORT,
        }
    }
}

fn default_fanout_width() -> usize {
    DEFAULT_FANOUT_WIDTH
}

fn default_command_timeout() -> Duration {
    DEFAULT_COMMAND_TIMEOUT
}

fn default_agent_port() -> u16 {
    DEFAULT_AGENT_PORT
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialConfig {
    #[serde(default = "default_credential_lifetime", with = "duration")]
    pub lifetime: Duration,
    /// File with the raw signing key. A fresh key is generated when missing.
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        CredentialConfig {
            lifetime: DEFAULT_CREDENTIAL_LIFETIME,
            key_file: None,
        }
    }
}

fn default_credential_lifetime() -> Duration {
    DEFAULT_CREDENTIAL_LIFETIME
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Node name expression, e.g. `n[0-15]`.
    pub names: String,
    pub cpus: u32,
    #[serde(default)]
    pub real_memory: u64,
    #[serde(default)]
    pub tmp_disk: u64,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartitionConfig {
    pub name: String,
    pub nodes: String,
    #[serde(default, with = "opt_duration")]
    pub default_time: Option<Duration>,
    #[serde(default)]
    pub max_nodes: Option<u32>,
    #[serde(default)]
    pub root_only: bool,
    #[serde(default)]
    pub shared: SharedPolicy,
    #[serde(default)]
    pub state: PartitionState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopologyConfig {
    /// Comma separated node counts of the allowed block sizes, e.g. `4,8,16`.
    /// Every level is allowed when missing.
    #[serde(default)]
    pub block_sizes: Option<String>,
    /// Midplane grid dimensions. A linear layout is assumed when empty.
    #[serde(default)]
    pub dims: Vec<u16>,
    #[serde(default)]
    pub ionodes_per_midplane: u32,
    /// Nodes that must be covered by some block.
    #[serde(default)]
    pub managed_nodes: Option<String>,
    #[serde(default)]
    pub blocks: Vec<BlockConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockConfig {
    pub name: String,
    pub nodes: String,
    #[serde(default)]
    pub coords: Option<Vec<u16>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SwitchConfig {
    pub windows_per_node: u32,
}

impl ControllerConfig {
    pub fn from_toml_str(text: &str) -> crate::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read configuration file {}", path.display()))?;
        let config = Self::from_toml_str(&text)
            .with_context(|| format!("Cannot parse configuration file {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CONFIG: &str = r#"
admin_uid = 0

[agent]
fanout_width = 8
command_timeout = "500ms"

[credential]
lifetime = "2h"

[[nodes]]
names = "n[0-3]"
cpus = 4
features = ["ib"]

[[nodes]]
names = "fat0"
cpus = 64
real_memory = 1024000
address = "10.0.0.9"

[[partitions]]
name = "batch"
nodes = "n[0-3]"
default_time = "1h"
max_nodes = 4

[[partitions]]
name = "admin"
nodes = "fat0"
root_only = true
state = "drain"
shared = "exclusive"

[topology]
block_sizes = "2,4"
ionodes_per_midplane = 4

[[topology.blocks]]
name = "mp0"
nodes = "n[0-1]"

[[topology.blocks]]
name = "mp1"
nodes = "n[2-3]"
"#;

    #[test]
    fn test_parse_config() {
        let config = ControllerConfig::from_toml_str(CONFIG).unwrap();
        assert_eq!(config.agent.fanout_width, 8);
        assert_eq!(config.agent.command_timeout, Duration::from_millis(500));
        assert_eq!(config.agent.port, DEFAULT_AGENT_PORT);
        assert_eq!(config.credential.lifetime, Duration::from_secs(7200));
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[1].address.as_deref(), Some("10.0.0.9"));
        assert_eq!(
            config.partitions[0].default_time,
            Some(Duration::from_secs(3600))
        );
        assert_eq!(config.partitions[1].state, PartitionState::Drain);
        assert_eq!(config.partitions[1].shared, SharedPolicy::Exclusive);
        let topology = config.topology.unwrap();
        assert_eq!(topology.blocks.len(), 2);
        assert!(topology.dims.is_empty());
        assert!(config.switch.is_none());
    }

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::from_toml_str("").unwrap();
        assert_eq!(config.agent.fanout_width, DEFAULT_FANOUT_WIDTH);
        assert_eq!(config.agent.command_timeout, DEFAULT_COMMAND_TIMEOUT);
        assert!(config.nodes.is_empty());
    }

    #[test]
    fn test_invalid_config() {
        assert!(ControllerConfig::from_toml_str("[agent]\ncommand_timeout = \"soon\"").is_err());
        assert!(ControllerConfig::from_toml_str("unknown_key = 1").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();
        let config = ControllerConfig::load(file.path()).unwrap();
        assert_eq!(config.partitions.len(), 2);

        let missing = file.path().with_extension("missing");
        assert!(ControllerConfig::load(&missing).is_err());
    }
}
