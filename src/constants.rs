// -
// Database tables

/// Raft bookkeeping of the state machine (applied index/term).
pub(crate) const RAFT_META_TABLE: &str = "raft";
/// Block metadata, keyed by partition/shard/tenant/block.
pub(crate) const PARTITION_TABLE: &str = "partition";
/// Compaction jobs, keyed by shard/tenant/job name.
pub(crate) const COMPACTION_JOB_TABLE: &str = "compaction_job";
/// Blocks waiting to be planned into a job, keyed by shard/tenant/level.
pub(crate) const COMPACTION_BLOCK_QUEUE_TABLE: &str = "compaction_block_queue";
/// Deletion markers, keyed by shard/block/expiry/tenant.
pub(crate) const REMOVED_BLOCKS_TABLE: &str = "removed_blocks";

/// Entry key namespaces
pub(crate) const RAFT_META_KEY_APPLIED_INDEX: &[u8] = b"term.applied_index";

/// Store files
pub(crate) const STATE_DB_FILE: &str = "metastore.redb";
pub(crate) const RESTORE_DB_FILE: &str = "metastore.restore.redb";
pub(crate) const SNAPSHOT_SPOOL_FILE: &str = "metastore.snapshot.in";

/// Snapshot stream header
pub(crate) const SNAPSHOT_MAGIC: &[u8; 4] = b"MSNP";
pub(crate) const SNAPSHOT_VERSION: u32 = 1;
pub(crate) const SNAPSHOT_CHECKSUM_LEN: usize = 32;

/// Width of the command type tag prefixed to every log entry.
pub(crate) const COMMAND_TAG_LEN: usize = 4;

/// Upper bound for tenant and block identifiers embedded in store keys.
pub(crate) const MAX_ID_LEN: usize = 1024;

/// Service name reported through the gRPC health service.
pub const HEALTH_SERVICE_NAME: &str = "metastore.v1.MetastoreService";
