//! Deletion markers.
//!
//! Source blocks of a completed compaction job are not deleted right away:
//! they are marked, and become eligible for removal from object storage once
//! the configured delay has passed. Expiry is derived from the time the log
//! entry was appended, so every replica expires the same markers when it
//! applies the same clean-up command.


use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use redb::ReadTransaction;
use redb::ReadableTable;
use redb::WriteTransaction;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::fsm::StateRestorer;
use crate::storage::keys::PartitionKey;
use crate::storage::keys::RemovedBlockKey;
use crate::storage::REMOVED_BLOCKS;
use crate::CleanerConfig;
use crate::Metrics;
use crate::Result;

const ANONYMOUS_TENANT: &str = "anonymous";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
struct MarkerValue {
    marked_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRemovalContext {
    pub shard: u32,
    pub tenant: String,
    /// Milliseconds since the epoch.
    pub expiry: i64,
}

/// Block whose marker has expired and whose object can be deleted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ExpiredBlock {
    pub block_id: String,
    pub shard: u32,
    pub tenant: String,
}

impl ExpiredBlock {
    /// Location of the block object in the bucket.
    pub fn object_path(&self) -> String {
        let tenant = if self.tenant.is_empty() {
            ANONYMOUS_TENANT
        } else {
            self.tenant.as_str()
        };
        format!("blocks/{}/{}/{}/block.bin", self.shard, tenant, self.block_id)
    }
}

pub struct DeletionMarkers {
    delay_ms: i64,
    markers: Mutex<HashMap<String, BlockRemovalContext>>,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for DeletionMarkers {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("DeletionMarkers").field("markers", &self.len()).finish()
    }
}

fn storage_key(
    block_id: &str,
    ctx: &BlockRemovalContext,
) -> Vec<u8> {
    RemovedBlockKey {
        shard: ctx.shard,
        block_id: block_id.to_string(),
        expiry: ctx.expiry,
        tenant: ctx.tenant.clone(),
    }
    .encode()
}

impl DeletionMarkers {
    pub fn new(
        config: &CleanerConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            delay_ms: config.cleanup_delay_ms as i64,
            markers: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    pub fn len(&self) -> usize {
        self.markers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_marked(
        &self,
        block_id: &str,
    ) -> bool {
        self.markers.lock().contains_key(block_id)
    }

    pub fn get(
        &self,
        block_id: &str,
    ) -> Option<BlockRemovalContext> {
        self.markers.lock().get(block_id).cloned()
    }

    /// Marks the blocks at `now_ms`. Blocks already marked keep their
    /// original expiry.
    pub fn mark(
        &self,
        tx: &WriteTransaction,
        blocks: &[PartitionKey],
        now_ms: i64,
    ) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }
        let value = bincode::serialize(&MarkerValue { marked_at: now_ms })?;
        let mut markers = self.markers.lock();
        let mut table = tx.open_table(REMOVED_BLOCKS)?;
        for block in blocks {
            if markers.contains_key(&block.block_id) {
                continue;
            }
            let ctx = BlockRemovalContext {
                shard: block.shard,
                tenant: block.tenant.clone(),
                expiry: now_ms + self.delay_ms,
            };
            table.insert(storage_key(&block.block_id, &ctx).as_slice(), value.as_slice())?;
            markers.insert(block.block_id.clone(), ctx);
        }
        debug!(blocks = blocks.len(), now_ms, "blocks marked for deletion");
        self.metrics.deletion_markers.set(markers.len() as i64);
        Ok(())
    }

    /// Markers whose expiry is strictly before `now_ms`, sorted by block id.
    pub fn find_expired(
        &self,
        now_ms: i64,
    ) -> Vec<ExpiredBlock> {
        let markers = self.markers.lock();
        let mut expired: Vec<ExpiredBlock> = markers
            .iter()
            .filter(|(_, ctx)| ctx.expiry < now_ms)
            .map(|(id, ctx)| ExpiredBlock {
                block_id: id.clone(),
                shard: ctx.shard,
                tenant: ctx.tenant.clone(),
            })
            .collect();
        expired.sort();
        expired
    }

    /// Drops every marker expired at `now_ms` and returns the blocks whose
    /// objects may now be deleted.
    pub fn remove_expired(
        &self,
        tx: &WriteTransaction,
        now_ms: i64,
    ) -> Result<Vec<ExpiredBlock>> {
        let expired = self.find_expired(now_ms);
        if expired.is_empty() {
            return Ok(expired);
        }
        let mut markers = self.markers.lock();
        let mut table = tx.open_table(REMOVED_BLOCKS)?;
        for block in &expired {
            if let Some(ctx) = markers.remove(&block.block_id) {
                table.remove(storage_key(&block.block_id, &ctx).as_slice())?;
            }
        }
        debug!(expired = expired.len(), now_ms, "deletion markers expired");
        self.metrics.deletion_markers.set(markers.len() as i64);
        Ok(expired)
    }
}

impl StateRestorer for DeletionMarkers {
    fn name(&self) -> &'static str {
        "deletion_markers"
    }

    fn restore(
        &self,
        tx: &ReadTransaction,
    ) -> Result<()> {
        let table = tx.open_table(REMOVED_BLOCKS)?;
        let mut restored = HashMap::new();
        for item in table.iter()? {
            let (k, v) = item?;
            let key = RemovedBlockKey::decode(k.value())?;
            let _: MarkerValue = bincode::deserialize(v.value())?;
            restored.insert(
                key.block_id,
                BlockRemovalContext {
                    shard: key.shard,
                    tenant: key.tenant,
                    expiry: key.expiry,
                },
            );
        }
        self.metrics.deletion_markers.set(restored.len() as i64);
        *self.markers.lock() = restored;
        Ok(())
    }
}
