//! Composite key layouts.
//!
//! All integers are big-endian so that a table scan visits keys in numeric
//! order. Variable-length strings that are followed by more fields carry a
//! 2-byte length prefix.
//!
//! | table                    | key                                                   |
//! |--------------------------|-------------------------------------------------------|
//! | `partition`              | `{partition:8}{shard:4}{len:2}{tenant}{block_id}`     |
//! | `compaction_job`         | `{shard:4}{len:2}{tenant}{job_name}`                  |
//! | `compaction_block_queue` | `{shard:4}{len:2}{tenant}{level:4}`                   |
//! | `removed_blocks`         | `{shard:4}{len:2}{block_id}{expiry:8}{tenant}`        |

use crate::constants::COMPACTION_BLOCK_QUEUE_TABLE;
use crate::constants::COMPACTION_JOB_TABLE;
use crate::constants::PARTITION_TABLE;
use crate::constants::REMOVED_BLOCKS_TABLE;
use crate::utils::convert::from_order_preserving_i64;
use crate::utils::convert::order_preserving_i64;
use crate::utils::convert::safe_kv;
use crate::StorageError;

type KeyResult<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionKey {
    pub partition: i64,
    pub shard: u32,
    pub tenant: String,
    pub block_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobKey {
    pub shard: u32,
    pub tenant: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockQueueKey {
    pub shard: u32,
    pub tenant: String,
    pub level: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedBlockKey {
    pub shard: u32,
    pub block_id: String,
    pub expiry: i64,
    pub tenant: String,
}

fn put_str(
    buf: &mut Vec<u8>,
    s: &str,
) {
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

struct Cursor<'a> {
    table: &'static str,
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(
        table: &'static str,
        buf: &'a [u8],
    ) -> Self {
        Self { table, buf }
    }

    fn corrupted(
        &self,
        reason: &str,
    ) -> StorageError {
        StorageError::Corrupted {
            table: self.table,
            reason: reason.to_string(),
        }
    }

    fn take(
        &mut self,
        n: usize,
    ) -> KeyResult<&'a [u8]> {
        if self.buf.len() < n {
            return Err(self.corrupted("key truncated"));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u16(&mut self) -> KeyResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> KeyResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> KeyResult<u64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    fn string(
        &mut self,
        n: usize,
    ) -> KeyResult<String> {
        let b = self.take(n)?;
        String::from_utf8(b.to_vec()).map_err(|_| self.corrupted("invalid utf-8"))
    }

    fn prefixed_string(&mut self) -> KeyResult<String> {
        let n = self.u16()? as usize;
        self.string(n)
    }

    fn rest(&mut self) -> KeyResult<String> {
        let n = self.buf.len();
        self.string(n)
    }
}

impl PartitionKey {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(8 + 4 + 2 + self.tenant.len() + self.block_id.len());
        buf.extend_from_slice(&partition_prefix(self.partition));
        buf.extend_from_slice(&self.shard.to_be_bytes());
        put_str(&mut buf, &self.tenant);
        buf.extend_from_slice(self.block_id.as_bytes());
        buf
    }

    pub fn decode(key: &[u8]) -> KeyResult<Self> {
        let mut c = Cursor::new(PARTITION_TABLE, key);
        Ok(Self {
            partition: from_order_preserving_i64(c.u64()?),
            shard: c.u32()?,
            tenant: c.prefixed_string()?,
            block_id: c.rest()?,
        })
    }
}

/// Leading bytes shared by all keys of one partition.
pub fn partition_prefix(partition: i64) -> [u8; 8] {
    safe_kv(order_preserving_i64(partition))
}

impl JobKey {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + 2 + self.tenant.len() + self.name.len());
        buf.extend_from_slice(&self.shard.to_be_bytes());
        put_str(&mut buf, &self.tenant);
        buf.extend_from_slice(self.name.as_bytes());
        buf
    }

    pub fn decode(key: &[u8]) -> KeyResult<Self> {
        let mut c = Cursor::new(COMPACTION_JOB_TABLE, key);
        Ok(Self {
            shard: c.u32()?,
            tenant: c.prefixed_string()?,
            name: c.rest()?,
        })
    }
}

impl BlockQueueKey {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + 2 + self.tenant.len() + 4);
        buf.extend_from_slice(&self.shard.to_be_bytes());
        put_str(&mut buf, &self.tenant);
        buf.extend_from_slice(&self.level.to_be_bytes());
        buf
    }

    pub fn decode(key: &[u8]) -> KeyResult<Self> {
        let mut c = Cursor::new(COMPACTION_BLOCK_QUEUE_TABLE, key);
        let key = Self {
            shard: c.u32()?,
            tenant: c.prefixed_string()?,
            level: c.u32()?,
        };
        if !c.buf.is_empty() {
            return Err(c.corrupted("trailing bytes"));
        }
        Ok(key)
    }
}

impl RemovedBlockKey {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(4 + 2 + self.block_id.len() + 8 + self.tenant.len());
        buf.extend_from_slice(&self.shard.to_be_bytes());
        put_str(&mut buf, &self.block_id);
        buf.extend_from_slice(&safe_kv(order_preserving_i64(self.expiry)));
        buf.extend_from_slice(self.tenant.as_bytes());
        buf
    }

    pub fn decode(key: &[u8]) -> KeyResult<Self> {
        let mut c = Cursor::new(REMOVED_BLOCKS_TABLE, key);
        Ok(Self {
            shard: c.u32()?,
            block_id: c.prefixed_string()?,
            expiry: from_order_preserving_i64(c.u64()?),
            tenant: c.rest()?,
        })
    }
}
