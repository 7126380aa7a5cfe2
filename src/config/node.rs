use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use super::invalid;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NodeConfig {
    /// Directory holding the state store and snapshot spool files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Address the Raft transport binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Address other replicas and clients use to reach this node.
    /// Falls back to `bind_address` when empty.
    #[serde(default)]
    pub advertise_address: String,

    /// Peers contacted when bootstrapping the cluster
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            bind_address: default_bind_address(),
            advertise_address: String::new(),
            bootstrap_peers: Vec::new(),
        }
    }
}

impl NodeConfig {
    pub fn advertise_address(&self) -> &str {
        if self.advertise_address.is_empty() {
            &self.bind_address
        } else {
            &self.advertise_address
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(invalid("node.data_dir path cannot be empty"));
        }
        self.bind_address
            .parse::<SocketAddr>()
            .map_err(|e| invalid(format!("invalid node.bind_address {}: {}", self.bind_address, e)))?;
        Ok(())
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data/metastore")
}
fn default_bind_address() -> String {
    "0.0.0.0:9099".to_string()
}
