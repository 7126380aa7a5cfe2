//! Command dispatch of the replicated state.

use std::sync::Arc;

use prost::Message;
use redb::WriteTransaction;
use tracing::debug;
use tracing::info;

use crate::cleaner::Cleaner;
use crate::compaction::Compactor;
use crate::fsm::CommandHandler;
use crate::fsm::Fsm;
use crate::fsm::StateRestorer;
use crate::index::validate_block;
use crate::index::BlockIndex;
use crate::markers::DeletionMarkers;
use crate::proto::AddBlockRequest;
use crate::proto::AddBlockResponse;
use crate::proto::CleanBlocksRequest;
use crate::proto::CompactionPlanUpdate;
use crate::raft_log::Command;
use crate::raft_log::RaftLog;
use crate::storage::Store;
use crate::MetastoreConfig;
use crate::Metrics;
use crate::Result;
use crate::ValidationError;

/// Every in-memory projection of the replicated state.
pub struct MetastoreState {
    index: Arc<BlockIndex>,
    compactor: Arc<Compactor>,
    markers: Arc<DeletionMarkers>,
    cleaner: Arc<Cleaner>,
}

impl std::fmt::Debug for MetastoreState {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("MetastoreState")
            .field("index", &self.index)
            .field("compactor", &self.compactor)
            .field("markers", &self.markers)
            .finish()
    }
}

impl MetastoreState {
    pub fn new(
        config: &MetastoreConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            index: Arc::new(BlockIndex::new(&config.index)),
            compactor: Arc::new(Compactor::new(config.compaction.clone(), metrics.clone())),
            markers: Arc::new(DeletionMarkers::new(&config.cleaner, metrics.clone())),
            cleaner: Arc::new(Cleaner::new(config.cleaner.clone(), metrics)),
        }
    }

    pub fn index(&self) -> &Arc<BlockIndex> {
        &self.index
    }

    pub fn compactor(&self) -> &Arc<Compactor> {
        &self.compactor
    }

    pub fn markers(&self) -> &Arc<DeletionMarkers> {
        &self.markers
    }

    pub fn cleaner(&self) -> &Arc<Cleaner> {
        &self.cleaner
    }

    /// Projections rebuilt from the store, in restore order.
    pub fn restorers(&self) -> Vec<Arc<dyn StateRestorer>> {
        vec![self.index.clone(), self.compactor.clone(), self.markers.clone()]
    }

    /// Builds the state machine driving this state over `store`.
    pub fn open_fsm(
        self: &Arc<Self>,
        store: Store,
        metrics: Arc<Metrics>,
    ) -> Result<Fsm> {
        Fsm::new(store, self.clone(), self.restorers(), metrics)
    }

    fn add_block(
        &self,
        tx: &WriteTransaction,
        log: &RaftLog,
        request: AddBlockRequest,
    ) -> Result<Vec<u8>> {
        let block = request
            .block
            .ok_or_else(|| ValidationError::InvalidBlock("block metadata is missing".to_string()))?;
        validate_block(&block)?;
        if self.markers.is_marked(&block.id) {
            return Err(ValidationError::BlockRemoved(block.id).into());
        }
        if self.index.insert(tx, &block)? {
            self.compactor.add_block(tx, log, &block)?;
            debug!(
                block = %block.id,
                tenant = %block.tenant_id,
                shard = block.shard,
                level = block.compaction_level,
                index = log.index,
                "block added"
            );
        } else {
            debug!(block = %block.id, "block already indexed");
        }
        Ok(AddBlockResponse {}.encode_to_vec())
    }

    fn update_compaction_plan(
        &self,
        tx: &WriteTransaction,
        log: &RaftLog,
        plan: CompactionPlanUpdate,
    ) -> Result<Vec<u8>> {
        let result = self
            .compactor
            .apply_plan(tx, log, plan, &self.index, &self.markers)?;
        Ok(result.encode_to_vec())
    }

    fn clean_blocks(
        &self,
        tx: &WriteTransaction,
        log: &RaftLog,
        request: CleanBlocksRequest,
    ) -> Result<Vec<u8>> {
        let expired = self.markers.remove_expired(tx, log.appended_at_millis())?;
        if !expired.is_empty() {
            info!(
                request_id = %request.request_id,
                expired = expired.len(),
                "deletion markers expired"
            );
        }
        self.cleaner.on_clean_applied(&request.request_id, expired);
        Ok(Vec::new())
    }
}

impl CommandHandler for MetastoreState {
    fn handle(
        &self,
        tx: &WriteTransaction,
        log: &RaftLog,
        command: Command,
    ) -> Result<Vec<u8>> {
        match command {
            Command::AddBlock(request) => self.add_block(tx, log, request),
            Command::UpdateCompactionPlan(plan) => self.update_compaction_plan(tx, log, plan),
            Command::CleanBlocks(request) => self.clean_blocks(tx, log, request),
        }
    }
}
