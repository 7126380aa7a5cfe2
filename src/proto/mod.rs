//! Protocol Buffer messages shared by the service, the replicated log and the
//! store.
//!
//! Messages are declared with the `prost` derive macros directly; every
//! command payload carried by a log entry and every record persisted in the
//! store is one of these types.

/// Label attached to a block (e.g. `service_name=api`).
#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct Label {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BlockMeta {
    #[prost(string, tag = "1")]
    pub id: String,
    /// Empty for blocks that mix data of several tenants (level 0 only).
    #[prost(string, tag = "2")]
    pub tenant_id: String,
    #[prost(uint32, tag = "3")]
    pub shard: u32,
    #[prost(uint32, tag = "4")]
    pub compaction_level: u32,
    #[prost(int64, tag = "5")]
    pub min_time: i64,
    #[prost(int64, tag = "6")]
    pub max_time: i64,
    #[prost(uint64, tag = "7")]
    pub size: u64,
    #[prost(message, repeated, tag = "8")]
    pub labels: Vec<Label>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum CompactionJobStatus {
    Unspecified = 0,
    InProgress = 1,
    Success = 2,
    Failure = 3,
    Cancelled = 4,
}

/// Compaction job as persisted in the store and held by the job queue.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CompactionJob {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, repeated, tag = "2")]
    pub blocks: Vec<String>,
    #[prost(uint32, tag = "3")]
    pub shard: u32,
    #[prost(string, tag = "4")]
    pub tenant_id: String,
    #[prost(uint32, tag = "5")]
    pub compaction_level: u32,
    #[prost(enumeration = "CompactionJobStatus", tag = "6")]
    pub status: i32,
    /// Nanoseconds since the epoch; zero when never leased.
    #[prost(int64, tag = "7")]
    pub lease_expires_at: i64,
    /// Fencing token: index of the log entry that granted the lease.
    #[prost(uint64, tag = "8")]
    pub raft_log_index: u64,
    #[prost(uint32, tag = "9")]
    pub failures: u32,
}

/// Blocks accumulated for one (tenant, shard, level) before a job is planned.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BlockQueueRecord {
    #[prost(string, tag = "1")]
    pub tenant_id: String,
    #[prost(uint32, tag = "2")]
    pub shard: u32,
    #[prost(uint32, tag = "3")]
    pub compaction_level: u32,
    #[prost(string, repeated, tag = "4")]
    pub blocks: Vec<String>,
    /// Append time of the entry that last pushed to the queue, in ns.
    #[prost(int64, tag = "5")]
    pub updated_at: i64,
}

// ----------------------------------------------------------------------------
// Commands

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddBlockRequest {
    #[prost(message, optional, tag = "1")]
    pub block: Option<BlockMeta>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AddBlockResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CompactionJobStatusUpdate {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(uint64, tag = "2")]
    pub raft_log_index: u64,
    #[prost(enumeration = "CompactionJobStatus", tag = "3")]
    pub status: i32,
    /// Output blocks, set when the job succeeded.
    #[prost(message, repeated, tag = "4")]
    pub compacted_blocks: Vec<BlockMeta>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PollCompactionJobsRequest {
    #[prost(message, repeated, tag = "1")]
    pub status_updates: Vec<CompactionJobStatusUpdate>,
    /// Number of new jobs the worker can take.
    #[prost(uint32, tag = "2")]
    pub job_capacity: u32,
}

/// Job handed to a worker along with the metadata of its source blocks.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AssignedJob {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "2")]
    pub blocks: Vec<BlockMeta>,
    #[prost(uint32, tag = "3")]
    pub shard: u32,
    #[prost(string, tag = "4")]
    pub tenant_id: String,
    #[prost(uint32, tag = "5")]
    pub compaction_level: u32,
    #[prost(uint64, tag = "6")]
    pub raft_log_index: u64,
    #[prost(int64, tag = "7")]
    pub lease_expires_at: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PollCompactionJobsResponse {
    #[prost(message, repeated, tag = "1")]
    pub compaction_jobs: Vec<AssignedJob>,
    /// Jobs the worker must stop working on.
    #[prost(string, repeated, tag = "2")]
    pub cancelled_jobs: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JobRef {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(uint64, tag = "2")]
    pub raft_log_index: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CompletedJob {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(uint64, tag = "2")]
    pub raft_log_index: u64,
    #[prost(message, repeated, tag = "3")]
    pub compacted_blocks: Vec<BlockMeta>,
}

/// Scheduling decision computed by the leader and applied by every replica.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CompactionPlanUpdate {
    #[prost(message, repeated, tag = "1")]
    pub completed: Vec<CompletedJob>,
    #[prost(message, repeated, tag = "2")]
    pub renewed: Vec<JobRef>,
    #[prost(message, repeated, tag = "3")]
    pub failed: Vec<JobRef>,
    /// Cancelled jobs whose cancellation was acknowledged by a worker.
    #[prost(message, repeated, tag = "4")]
    pub evicted: Vec<JobRef>,
    #[prost(message, repeated, tag = "5")]
    pub new_jobs: Vec<CompactionJob>,
    #[prost(string, repeated, tag = "6")]
    pub assigned: Vec<String>,
}

/// Outcome of applying a [`CompactionPlanUpdate`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CompactionPlanResult {
    #[prost(message, repeated, tag = "1")]
    pub assigned: Vec<AssignedJob>,
    #[prost(string, repeated, tag = "2")]
    pub cancelled: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CleanBlocksRequest {
    #[prost(string, tag = "1")]
    pub request_id: String,
}

// ----------------------------------------------------------------------------
// Queries

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryMetadataRequest {
    #[prost(string, repeated, tag = "1")]
    pub tenant_id: Vec<String>,
    #[prost(int64, tag = "2")]
    pub start_time: i64,
    #[prost(int64, tag = "3")]
    pub end_time: i64,
    /// Label selector, e.g. `{service_name="api", env!="dev"}`.
    #[prost(string, tag = "4")]
    pub query: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryMetadataResponse {
    #[prost(message, repeated, tag = "1")]
    pub blocks: Vec<BlockMeta>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ReadIndexResponse {
    #[prost(uint64, tag = "1")]
    pub commit_index: u64,
    #[prost(uint64, tag = "2")]
    pub term: u64,
}
