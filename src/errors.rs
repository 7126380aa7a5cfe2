//! Metastore Error Hierarchy
//!
//! Errors are grouped by the layer that produced them. Storage failures that
//! happen while a command is being applied are promoted to [`Error::Fatal`] by
//! the FSM; everything else is an ordinary, recoverable result.

use config::ConfigError;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Infrastructure-level failures (storage, codec)
    #[error(transparent)]
    System(#[from] SystemError),

    /// Configuration validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Retryable consensus failures
    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    /// Command rejected before any state was mutated
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Follower read could not be served
    #[error("consistent read failed: {0}")]
    ConsistentRead(#[from] ConsistentReadError),

    /// Unrecoverable failures requiring process termination
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage engine error: {0}")]
    Engine(#[from] redb::StorageError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot stream is malformed or failed verification
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// A stored record does not have the expected layout
    #[error("Corrupted record in {table}: {reason}")]
    Corrupted { table: &'static str, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Protobuf decode error: {0}")]
    ProtoDecode(#[from] prost::DecodeError),

    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Unknown command type: {0}")]
    UnknownCommand(u32),

    #[error("Log entry too short: {len} bytes")]
    EntryTooShort { len: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    /// Request must go to the leader. Carries the best-known leader address.
    #[error("Not leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<String> },

    #[error("Leadership lost while serving the request")]
    LeadershipLost,

    #[error("Node is shutting down")]
    ShuttingDown,

    /// Proposal was not applied in time
    #[error("Proposal timed out")]
    Timeout,
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid block metadata: {0}")]
    InvalidBlock(String),

    #[error("Block {0} is marked for deletion")]
    BlockRemoved(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConsistentReadError {
    /// Local applied index is too far behind the leader commit index
    #[error("replica lags behind the leader: applied {applied}, required {required}")]
    LagBehind { applied: u64, required: u64 },

    /// State changed underneath the read, e.g. by a snapshot restore
    #[error("read aborted: applied index moved from {expected} to {actual}")]
    Aborted { expected: u64, actual: u64 },

    /// Leader could not confirm the read index
    #[error("leader unavailable: {0}")]
    Leader(#[source] Box<Error>),

    /// Applied index did not reach the read index in time
    #[error("timed out waiting for applied index {required}")]
    Timeout { required: u64 },
}

// ============== Conversion Implementations ============== //
impl From<StorageError> for Error {
    fn from(e: StorageError) -> Self {
        Error::System(SystemError::Storage(e))
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Error::System(SystemError::Codec(e))
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(e: redb::DatabaseError) -> Self {
        StorageError::Database(e).into()
    }
}

impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Self {
        StorageError::Transaction(e).into()
    }
}

impl From<redb::TableError> for Error {
    fn from(e: redb::TableError) -> Self {
        StorageError::Table(e).into()
    }
}

impl From<redb::StorageError> for Error {
    fn from(e: redb::StorageError) -> Self {
        StorageError::Engine(e).into()
    }
}

impl From<redb::CommitError> for Error {
    fn from(e: redb::CommitError) -> Self {
        StorageError::Commit(e).into()
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e).into()
    }
}

impl From<prost::DecodeError> for Error {
    fn from(e: prost::DecodeError) -> Self {
        CodecError::ProtoDecode(e).into()
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        CodecError::Bincode(e).into()
    }
}

impl Error {
    pub fn not_leader(leader_hint: Option<String>) -> Self {
        Error::Consensus(ConsensusError::NotLeader { leader_hint })
    }

    pub fn is_not_leader(&self) -> bool {
        matches!(self, Error::Consensus(ConsensusError::NotLeader { .. }))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_))
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Consensus(ConsensusError::NotLeader { leader_hint }) => {
                let mut status = tonic::Status::failed_precondition("not leader");
                if let Some(leader) = leader_hint {
                    if let Ok(v) = leader.parse() {
                        status.metadata_mut().insert("x-metastore-leader", v);
                    }
                }
                status
            }
            Error::Consensus(e) => tonic::Status::unavailable(e.to_string()),
            Error::Validation(e) => tonic::Status::invalid_argument(e.to_string()),
            Error::ConsistentRead(e) => tonic::Status::unavailable(e.to_string()),
            e => tonic::Status::internal(e.to_string()),
        }
    }
}
