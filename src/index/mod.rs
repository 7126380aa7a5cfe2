//! Block metadata index.
//!
//! Blocks are stored in the `partition` table under
//! `(partition, shard, tenant, block id)`, where the partition is the block's
//! `min_time` truncated to the configured partition duration. The in-memory
//! side keeps the location of every block and, per partition, the latest
//! `max_time` seen, so queries only visit partitions that can overlap.

mod query;
pub use query::*;


use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;

use parking_lot::RwLock;
use prost::Message;
use redb::ReadTransaction;
use redb::ReadableTable;
use redb::WriteTransaction;
use tracing::debug;

use crate::constants::MAX_ID_LEN;
use crate::fsm::StateRestorer;
use crate::proto::BlockMeta;
use crate::proto::QueryMetadataRequest;
use crate::storage::keys::partition_prefix;
use crate::storage::keys::PartitionKey;
use crate::storage::PARTITIONS;
use crate::IndexConfig;
use crate::Result;
use crate::ValidationError;

/// Checks a block before it is written anywhere.
pub fn validate_block(block: &BlockMeta) -> std::result::Result<(), ValidationError> {
    if block.id.is_empty() {
        return Err(ValidationError::InvalidBlock("block id is empty".to_string()));
    }
    if block.id.len() > MAX_ID_LEN || block.tenant_id.len() > MAX_ID_LEN {
        return Err(ValidationError::InvalidBlock(format!(
            "identifier of block {} is too long",
            block.id
        )));
    }
    if block.min_time > block.max_time {
        return Err(ValidationError::InvalidBlock(format!(
            "block {} ends before it starts",
            block.id
        )));
    }
    Ok(())
}

#[derive(Default)]
struct IndexState {
    blocks: HashMap<String, PartitionKey>,
    /// partition -> greatest max_time of the blocks it holds
    partitions: BTreeMap<i64, i64>,
}

pub struct BlockIndex {
    partition_duration: i64,
    state: RwLock<IndexState>,
}

impl std::fmt::Debug for BlockIndex {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("BlockIndex").field("blocks", &self.len()).finish()
    }
}

impl BlockIndex {
    pub fn new(config: &IndexConfig) -> Self {
        Self {
            partition_duration: config.partition_duration().as_nanos() as i64,
            state: RwLock::new(IndexState::default()),
        }
    }

    pub fn partition_of(
        &self,
        t: i64,
    ) -> i64 {
        t.div_euclid(self.partition_duration) * self.partition_duration
    }

    pub fn contains(
        &self,
        block_id: &str,
    ) -> bool {
        self.state.read().blocks.contains_key(block_id)
    }

    pub fn len(&self) -> usize {
        self.state.read().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn key_of(
        &self,
        block: &BlockMeta,
    ) -> PartitionKey {
        PartitionKey {
            partition: self.partition_of(block.min_time),
            shard: block.shard,
            tenant: block.tenant_id.clone(),
            block_id: block.id.clone(),
        }
    }

    /// Writes the block. Returns false, without writing, if a block with the
    /// same id is already indexed.
    pub fn insert(
        &self,
        tx: &WriteTransaction,
        block: &BlockMeta,
    ) -> Result<bool> {
        if self.contains(&block.id) {
            return Ok(false);
        }
        let key = self.key_of(block);
        {
            let mut table = tx.open_table(PARTITIONS)?;
            table.insert(key.encode().as_slice(), block.encode_to_vec().as_slice())?;
        }
        let mut state = self.state.write();
        let max_end = state.partitions.entry(key.partition).or_insert(block.max_time);
        *max_end = (*max_end).max(block.max_time);
        state.blocks.insert(block.id.clone(), key);
        Ok(true)
    }

    /// Deletes the given blocks and returns the locations of those that were
    /// indexed.
    pub fn remove(
        &self,
        tx: &WriteTransaction,
        block_ids: &[String],
    ) -> Result<Vec<PartitionKey>> {
        let keys: Vec<PartitionKey> = {
            let state = self.state.read();
            block_ids.iter().filter_map(|id| state.blocks.get(id).cloned()).collect()
        };
        let mut touched: Vec<i64> = keys.iter().map(|k| k.partition).collect();
        touched.sort_unstable();
        touched.dedup();

        let mut max_ends = Vec::with_capacity(touched.len());
        {
            let mut table = tx.open_table(PARTITIONS)?;
            for key in &keys {
                table.remove(key.encode().as_slice())?;
            }
            for partition in touched {
                max_ends.push((partition, partition_max_end(&table, partition)?));
            }
        }
        let mut state = self.state.write();
        for key in &keys {
            state.blocks.remove(&key.block_id);
        }
        for (partition, max_end) in max_ends {
            match max_end {
                Some(max_end) => state.partitions.insert(partition, max_end),
                None => state.partitions.remove(&partition),
            };
        }
        Ok(keys)
    }

    /// Loads the metadata of the given blocks, skipping unknown ids.
    pub fn get_blocks<T>(
        &self,
        table: &T,
        block_ids: &[String],
    ) -> Result<Vec<BlockMeta>>
    where
        T: ReadableTable<&'static [u8], &'static [u8]>,
    {
        let keys: Vec<PartitionKey> = {
            let state = self.state.read();
            block_ids.iter().filter_map(|id| state.blocks.get(id).cloned()).collect()
        };
        let mut blocks = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(v) = table.get(key.encode().as_slice())? {
                blocks.push(BlockMeta::decode(v.value())?);
            }
        }
        Ok(blocks)
    }

    pub fn query(
        &self,
        tx: &ReadTransaction,
        request: &QueryMetadataRequest,
    ) -> Result<Vec<BlockMeta>> {
        if request.tenant_id.is_empty() {
            return Err(ValidationError::InvalidQuery("no tenant specified".to_string()).into());
        }
        if request.start_time > request.end_time {
            return Err(
                ValidationError::InvalidQuery("start time is after end time".to_string()).into(),
            );
        }
        let selector = LabelSelector::parse(&request.query)?;
        let tenants: HashSet<&str> = request.tenant_id.iter().map(|t| t.as_str()).collect();

        let partitions: Vec<i64> = {
            let state = self.state.read();
            state
                .partitions
                .range(..=self.partition_of(request.end_time))
                .filter(|(_, max_end)| **max_end >= request.start_time)
                .map(|(p, _)| *p)
                .collect()
        };

        let table = tx.open_table(PARTITIONS)?;
        let mut blocks = Vec::new();
        for partition in partitions {
            let prefix = partition_prefix(partition);
            for item in table.range(prefix.as_slice()..)? {
                let (k, v) = item?;
                if !k.value().starts_with(&prefix) {
                    break;
                }
                let key = PartitionKey::decode(k.value())?;
                if !tenants.contains(key.tenant.as_str()) {
                    continue;
                }
                let block = BlockMeta::decode(v.value())?;
                if block.min_time > request.end_time || block.max_time < request.start_time {
                    continue;
                }
                if selector.matches(&block) {
                    blocks.push(block);
                }
            }
        }
        debug!(found = blocks.len(), "metadata query");
        Ok(blocks)
    }
}

/// Greatest `max_time` among the blocks stored in the partition.
fn partition_max_end<T>(
    table: &T,
    partition: i64,
) -> Result<Option<i64>>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let prefix = partition_prefix(partition);
    let mut max_end: Option<i64> = None;
    for item in table.range(prefix.as_slice()..)? {
        let (k, v) = item?;
        if !k.value().starts_with(&prefix) {
            break;
        }
        let block = BlockMeta::decode(v.value())?;
        max_end = Some(max_end.map_or(block.max_time, |m| m.max(block.max_time)));
    }
    Ok(max_end)
}

impl StateRestorer for BlockIndex {
    fn name(&self) -> &'static str {
        "block_index"
    }

    fn restore(
        &self,
        tx: &ReadTransaction,
    ) -> Result<()> {
        let table = tx.open_table(PARTITIONS)?;
        let mut state = IndexState::default();
        for item in table.iter()? {
            let (k, v) = item?;
            let key = PartitionKey::decode(k.value())?;
            let block = BlockMeta::decode(v.value())?;
            let max_end = state.partitions.entry(key.partition).or_insert(block.max_time);
            *max_end = (*max_end).max(block.max_time);
            state.blocks.insert(key.block_id.clone(), key);
        }
        *self.state.write() = state;
        Ok(())
    }
}
