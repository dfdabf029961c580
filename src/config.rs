use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{NomadToolError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_name: String,
    pub host: String,
    pub port: u16,
    pub storage_path: PathBuf,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_user() -> String {
    "nomad".to_string()
}

fn default_concurrency() -> usize {
    8
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl NodeConfig {
    pub fn new(node_name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        let node_name = node_name.into();
        Self {
            storage_path: PathBuf::from("/var/lib/nomad").join(&node_name),
            node_name,
            host: host.into(),
            port,
            user: default_user(),
            concurrency: default_concurrency(),
            timeout_ms: default_timeout_ms(),
        }
    }

    /// Reads a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&text)
            .map_err(|e| NomadToolError::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_name.trim().is_empty() {
            return Err(NomadToolError::InvalidConfig("node_name is empty".to_string()));
        }
        if self.concurrency == 0 {
            return Err(NomadToolError::InvalidConfig("concurrency must be at least 1".to_string()));
        }
        Ok(())
    }
}

impl From<&NodeConfig> for network::NodeAddress {
    fn from(config: &NodeConfig) -> Self {
        network::NodeAddress::new(&config.node_name, &config.host, config.port)
    }
}

impl From<&NodeConfig> for network::ClientConfig {
    fn from(config: &NodeConfig) -> Self {
        network::ClientConfig {
            host: config.host.clone(),
            user: config.user.clone(),
            concurrency: config.concurrency,
            timeout_ms: config.timeout_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(
            &path,
            concat!(
                r#"{"node_name":"node-1","host":"10.0.0.1","port":9410,"#,
                r#""storage_path":"/tmp/nomad/node-1"}"#
            ),
        )
        .unwrap();

        let config = NodeConfig::load(&path).unwrap();
        assert_eq!(config.user, "nomad");
        assert_eq!(config.timeout_ms, 10_000);

        let address = network::NodeAddress::from(&config);
        assert_eq!(address.to_string(), "node-1@10.0.0.1:9410");

        let client = network::ClientConfig::from(&config);
        assert_eq!(client.host, "10.0.0.1");
        assert_eq!(client.concurrency, 8);
    }

    #[test]
    fn rejects_bad_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(NodeConfig::load(&path), Err(NomadToolError::InvalidConfig(_))));

        let mut config = NodeConfig::new("node-1", "localhost", 9410);
        config.concurrency = 0;
        assert!(config.validate().is_err());
    }
}
