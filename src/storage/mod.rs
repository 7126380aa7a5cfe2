//! Durable state of the metastore.
//!
//! A single redb database holds every table of the state machine. The handle
//! lives behind an [`ArcSwap`] so that a snapshot restore can install a new
//! database file without blocking readers that still hold the previous one.

pub mod keys;
mod snapshot;

#[cfg(test)]
mod storage_test;

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use redb::Database;
use redb::ReadTransaction;
use redb::ReadableTable;
use redb::TableDefinition;
use redb::WriteTransaction;
pub use snapshot::*;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::constants::COMPACTION_BLOCK_QUEUE_TABLE;
use crate::constants::COMPACTION_JOB_TABLE;
use crate::constants::PARTITION_TABLE;
use crate::constants::RAFT_META_KEY_APPLIED_INDEX;
use crate::constants::RAFT_META_TABLE;
use crate::constants::REMOVED_BLOCKS_TABLE;
use crate::constants::RESTORE_DB_FILE;
use crate::constants::SNAPSHOT_SPOOL_FILE;
use crate::constants::STATE_DB_FILE;
use crate::utils::convert::safe_kv;
use crate::utils::convert::safe_vk;
use crate::Error;
use crate::Result;
use crate::StorageError;

pub type BytesTable = TableDefinition<'static, &'static [u8], &'static [u8]>;

pub const RAFT_META: BytesTable = TableDefinition::new(RAFT_META_TABLE);
pub const PARTITIONS: BytesTable = TableDefinition::new(PARTITION_TABLE);
pub const COMPACTION_JOBS: BytesTable = TableDefinition::new(COMPACTION_JOB_TABLE);
pub const BLOCK_QUEUES: BytesTable = TableDefinition::new(COMPACTION_BLOCK_QUEUE_TABLE);
pub const REMOVED_BLOCKS: BytesTable = TableDefinition::new(REMOVED_BLOCKS_TABLE);

/// Every table with its stable id in the snapshot stream.
pub(crate) const ALL_TABLES: [(u8, BytesTable); 5] = [
    (1, RAFT_META),
    (2, PARTITIONS),
    (3, COMPACTION_JOBS),
    (4, BLOCK_QUEUES),
    (5, REMOVED_BLOCKS),
];

/// Last applied position recorded by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AppliedIndex {
    pub term: u64,
    pub index: u64,
}

impl AppliedIndex {
    fn encode(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&safe_kv(self.term));
        buf[8..].copy_from_slice(&safe_kv(self.index));
        buf
    }

    fn decode(v: &[u8]) -> Result<Self> {
        if v.len() != 16 {
            return Err(StorageError::Corrupted {
                table: RAFT_META_TABLE,
                reason: format!("applied index has {} bytes", v.len()),
            }
            .into());
        }
        Ok(Self {
            term: safe_vk(&v[..8])?,
            index: safe_vk(&v[8..])?,
        })
    }
}

pub fn read_applied_index<T>(table: &T) -> Result<AppliedIndex>
where T: ReadableTable<&'static [u8], &'static [u8]> {
    match table.get(RAFT_META_KEY_APPLIED_INDEX)? {
        Some(v) => AppliedIndex::decode(v.value()),
        None => Ok(AppliedIndex::default()),
    }
}

pub fn write_applied_index(
    tx: &WriteTransaction,
    applied: AppliedIndex,
) -> Result<()> {
    let mut table = tx.open_table(RAFT_META)?;
    table.insert(RAFT_META_KEY_APPLIED_INDEX, applied.encode().as_slice())?;
    Ok(())
}

/// Creates missing tables so read transactions can always open them.
pub fn init_tables(db: &Database) -> Result<()> {
    let tx = db.begin_write()?;
    for (_, def) in ALL_TABLES {
        tx.open_table(def)?;
    }
    tx.commit()?;
    Ok(())
}

pub struct Store {
    dir: PathBuf,
    db: ArcSwap<Database>,
}

impl std::fmt::Debug for Store {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Store").field("dir", &self.dir).finish()
    }
}

impl Store {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let path = dir.join(STATE_DB_FILE);
        debug!(?path, "opening state store");

        let db = Database::create(&path).map_err(|e| {
            warn!("Try to open DB at this location: {:?} and failed: {:?}", path, e);
            StorageError::Database(e)
        })?;
        init_tables(&db)?;

        Ok(Self {
            dir,
            db: ArcSwap::from_pointee(db),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn db(&self) -> Arc<Database> {
        self.db.load_full()
    }

    pub fn begin_write(&self) -> Result<WriteTransaction> {
        Ok(self.db.load().begin_write()?)
    }

    pub fn begin_read(&self) -> Result<ReadTransaction> {
        Ok(self.db.load().begin_read()?)
    }

    pub fn applied_index(&self) -> Result<AppliedIndex> {
        let tx = self.begin_read()?;
        let table = tx.open_table(RAFT_META)?;
        read_applied_index(&table)
    }

    /// Opens a frozen read transaction. Nothing is copied until
    /// [`StoreSnapshot::persist`] is called.
    pub fn snapshot(&self) -> Result<StoreSnapshot> {
        StoreSnapshot::new(self.begin_read()?)
    }

    /// Replaces the live database with the snapshot read from `reader`.
    ///
    /// The stream is spooled to disk, verified, decoded into a side database
    /// and opened standalone before it is renamed over the live file. The
    /// live database is left untouched if any step before the rename fails;
    /// any failure after it is fatal.
    pub fn restore<R: std::io::Read>(
        &self,
        reader: R,
    ) -> Result<AppliedIndex> {
        let spool_path = self.dir.join(SNAPSHOT_SPOOL_FILE);
        let side_path = self.dir.join(RESTORE_DB_FILE);
        let live_path = self.dir.join(STATE_DB_FILE);

        let result = self.restore_side_db(reader, &spool_path, &side_path);
        if let Err(e) = fs::remove_file(&spool_path) {
            debug!(?e, "snapshot spool cleanup");
        }
        let applied = match result {
            Ok(applied) => applied,
            Err(e) => {
                if let Err(e) = fs::remove_file(&side_path) {
                    debug!(?e, "side database cleanup");
                }
                return Err(e);
            }
        };

        if let Err(e) = fs::rename(&side_path, &live_path) {
            if let Err(e) = fs::remove_file(&side_path) {
                debug!(?e, "side database cleanup");
            }
            return Err(e.into());
        }
        self.reopen_live(&live_path)?;

        info!(term = applied.term, index = applied.index, "restored state store from snapshot");
        Ok(applied)
    }

    /// Switches to the database now at `live_path`. The handle in use points
    /// at the replaced file, so nothing may be applied if this fails.
    fn reopen_live(
        &self,
        live_path: &Path,
    ) -> Result<()> {
        let reopen = || -> Result<Database> {
            fs::File::open(&self.dir)?.sync_all()?;
            let db = Database::create(live_path)?;
            init_tables(&db)?;
            Ok(db)
        };
        match reopen() {
            Ok(db) => {
                self.db.store(Arc::new(db));
                Ok(())
            }
            Err(e) => {
                error!(?e, path = %live_path.display(), "state store replaced but not reopened");
                Err(Error::Fatal(format!("failed to reopen restored state store: {}", e)))
            }
        }
    }

    fn restore_side_db<R: std::io::Read>(
        &self,
        reader: R,
        spool_path: &Path,
        side_path: &Path,
    ) -> Result<AppliedIndex> {
        spool_snapshot(reader, spool_path)?;

        if side_path.exists() {
            fs::remove_file(side_path)?;
        }
        {
            let side = Database::create(side_path)?;
            load_snapshot(spool_path, &side)?;
        }

        // Never trust the snapshot before it opens standalone.
        let side = Database::open(side_path)?;
        let tx = side.begin_read()?;
        for (_, def) in ALL_TABLES {
            tx.open_table(def)?;
        }
        let table = tx.open_table(RAFT_META)?;
        read_applied_index(&table)
    }
}
