//! Blocks waiting to be grouped into compaction jobs.

use std::collections::BTreeMap;

use prost::Message;
use redb::ReadTransaction;
use redb::ReadableTable;
use redb::WriteTransaction;

use crate::proto::BlockQueueRecord;
use crate::storage::keys::BlockQueueKey;
use crate::storage::BLOCK_QUEUES;
use crate::CompactionConfig;
use crate::Result;

/// Queue identity. Levels come first so that iteration visits lower levels
/// before higher ones.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueKey {
    pub level: u32,
    pub tenant: String,
    pub shard: u32,
}

impl QueueKey {
    fn storage_key(&self) -> BlockQueueKey {
        BlockQueueKey {
            shard: self.shard,
            tenant: self.tenant.clone(),
            level: self.level,
        }
    }
}

/// Blocks of one queue and the log time of the last push.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct StagedBlocks {
    blocks: Vec<String>,
    updated_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockQueues {
    queues: BTreeMap<QueueKey, StagedBlocks>,
}

impl BlockQueues {
    /// `appended_at` is the time of the log entry adding the block.
    pub fn push(
        &mut self,
        key: QueueKey,
        block_id: String,
        appended_at: i64,
    ) -> &[String] {
        let staged = self.queues.entry(key).or_default();
        staged.blocks.push(block_id);
        staged.updated_at = appended_at;
        &staged.blocks
    }

    pub fn get(
        &self,
        key: &QueueKey,
    ) -> &[String] {
        self.queues.get(key).map(|q| q.blocks.as_slice()).unwrap_or_default()
    }

    /// Log time of the last push to the queue.
    pub fn updated_at(
        &self,
        key: &QueueKey,
    ) -> Option<i64> {
        self.queues.get(key).map(|q| q.updated_at)
    }

    /// Removes `blocks` from the front of the queue. Returns false, leaving
    /// the queue untouched, if the queue does not start with them.
    pub fn take_prefix(
        &mut self,
        key: &QueueKey,
        blocks: &[String],
    ) -> bool {
        let Some(staged) = self.queues.get_mut(key) else {
            return false;
        };
        if blocks.is_empty() || !staged.blocks.starts_with(blocks) {
            return false;
        }
        staged.blocks.drain(..blocks.len());
        if staged.blocks.is_empty() {
            self.queues.remove(key);
        }
        true
    }

    /// Batches to turn into jobs at `now`, lowest level first.
    ///
    /// A queue that reached its level's threshold yields exactly the
    /// threshold. A shorter queue that has not been pushed to for longer than
    /// the maximum batch age is flushed whole.
    pub fn ready(
        &self,
        config: &CompactionConfig,
        now: i64,
    ) -> Vec<(QueueKey, Vec<String>)> {
        self.queues
            .iter()
            .filter_map(|(key, staged)| {
                let threshold = config.threshold(key.level);
                if staged.blocks.len() >= threshold {
                    Some((key.clone(), staged.blocks[..threshold].to_vec()))
                } else if config.exceeds_max_age(staged.updated_at, now) {
                    Some((key.clone(), staged.blocks.clone()))
                } else {
                    None
                }
            })
            .collect()
    }

    /// True if `blocks` is a batch [`BlockQueues::ready`] could yield for the
    /// queue at `now`.
    pub fn is_ready_batch(
        &self,
        key: &QueueKey,
        blocks: &[String],
        config: &CompactionConfig,
        now: i64,
    ) -> bool {
        let Some(staged) = self.queues.get(key) else {
            return false;
        };
        if blocks.is_empty() || !staged.blocks.starts_with(blocks) {
            return false;
        }
        let threshold = config.threshold(key.level);
        blocks.len() == threshold
            || (blocks.len() < threshold
                && blocks.len() == staged.blocks.len()
                && config.exceeds_max_age(staged.updated_at, now))
    }

    /// Block count per queue.
    pub fn sizes(&self) -> impl Iterator<Item = (&QueueKey, usize)> {
        self.queues.iter().map(|(k, v)| (k, v.blocks.len()))
    }

    /// Mirrors the current content of one queue into the store.
    pub fn persist(
        &self,
        tx: &WriteTransaction,
        key: &QueueKey,
    ) -> Result<()> {
        let mut table = tx.open_table(BLOCK_QUEUES)?;
        let storage_key = key.storage_key().encode();
        match self.queues.get(key) {
            Some(staged) => {
                let record = BlockQueueRecord {
                    tenant_id: key.tenant.clone(),
                    shard: key.shard,
                    compaction_level: key.level,
                    blocks: staged.blocks.clone(),
                    updated_at: staged.updated_at,
                };
                table.insert(storage_key.as_slice(), record.encode_to_vec().as_slice())?;
            }
            None => {
                table.remove(storage_key.as_slice())?;
            }
        }
        Ok(())
    }

    pub fn load(tx: &ReadTransaction) -> Result<Self> {
        let table = tx.open_table(BLOCK_QUEUES)?;
        let mut queues = BTreeMap::new();
        for item in table.iter()? {
            let (k, v) = item?;
            let key = BlockQueueKey::decode(k.value())?;
            let record = BlockQueueRecord::decode(v.value())?;
            if record.blocks.is_empty() {
                continue;
            }
            queues.insert(
                QueueKey {
                    level: key.level,
                    tenant: key.tenant,
                    shard: key.shard,
                },
                StagedBlocks {
                    blocks: record.blocks,
                    updated_at: record.updated_at,
                },
            );
        }
        Ok(Self { queues })
    }
}
