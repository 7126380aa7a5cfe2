//! Configuration of a metastore node.
//!
//! Sources are merged with the following priority (lowest first):
//! 1. Default values (hardcoded)
//! 2. File pointed to by `CONFIG_PATH`
//! 3. Environment variables prefixed with `METASTORE__`
mod cleaner;
mod compaction;
mod index;
mod node;
mod raft;
pub use cleaner::*;
pub use compaction::*;
pub use index::*;
pub use node::*;
pub use raft::*;


use std::env;
use std::fmt::Debug;

use config::Config;
use config::ConfigError;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

const ENV_PREFIX: &str = "METASTORE";

#[derive(Serialize, Deserialize, Clone, Default)]
pub struct MetastoreConfig {
    /// Data directory, addresses and peers of this node
    #[serde(default)]
    pub node: NodeConfig,
    /// Apply and read-index tuning
    #[serde(default)]
    pub raft: RaftConfig,
    /// Block index layout
    #[serde(default)]
    pub index: IndexConfig,
    /// Compaction scheduling
    #[serde(default)]
    pub compaction: CompactionConfig,
    /// Deletion of compacted blocks
    #[serde(default)]
    pub cleaner: CleanerConfig,
}

impl Debug for MetastoreConfig {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("MetastoreConfig").field("node", &self.node).finish()
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .ignore_empty(true)
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("node.bootstrap_peers")
}

impl MetastoreConfig {
    /// Builds the configuration from defaults, the optional `CONFIG_PATH`
    /// file and the environment. Validation is left to [`Self::validate`].
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        builder = builder.add_source(environment());

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Layers the file at `path` over `self`; environment still wins.
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(environment())
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    pub fn validate(self) -> Result<Self> {
        self.node.validate()?;
        self.raft.validate()?;
        self.index.validate()?;
        self.compaction.validate()?;
        self.cleaner.validate()?;
        Ok(self)
    }
}

pub(super) fn invalid(msg: impl Into<String>) -> Error {
    Error::Config(ConfigError::Message(msg.into()))
}

pub(super) fn ensure_positive(
    value: u64,
    name: &str,
) -> Result<()> {
    if value == 0 {
        return Err(invalid(format!("{name} must be greater than 0")));
    }
    Ok(())
}
