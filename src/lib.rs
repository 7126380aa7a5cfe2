//! Raft-replicated metastore.
//!
//! Keeps the metadata of stored blocks, schedules their compaction across a
//! pool of workers and deletes compacted blocks after a grace period. All
//! state changes go through the replicated log and are applied by [`fsm::Fsm`]
//! to a redb store; in-memory projections are rebuilt from that store on
//! start-up and after snapshot restores.

pub mod cleaner;
pub mod compaction;
mod config;
mod constants;
mod errors;
pub mod fsm;
pub mod index;
pub mod markers;
pub mod metastore;
mod metrics;
pub mod proto;
pub mod raft_log;
pub mod raftnode;
pub mod storage;
pub(crate) mod utils;

pub use config::*;
pub use constants::HEALTH_SERVICE_NAME;
pub use errors::*;
pub use metastore::Metastore;
pub use metastore::MetastoreState;
pub use metrics::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
