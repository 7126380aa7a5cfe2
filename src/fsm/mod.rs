//! Replicated state machine.
//!
//! Each log entry is applied inside exactly one store write transaction
//! together with the new applied index. A handler may reject a command with a
//! [`crate::ValidationError`] before it mutates anything; such a rejection is
//! returned to the proposer and the transaction is rolled back. Any other
//! failure once a write transaction is open is fatal: the replica must stop
//! applying rather than diverge from its peers.


use std::io::Read;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

#[cfg(test)]
use mockall::automock;
use parking_lot::RwLock;
use redb::ReadTransaction;
use redb::WriteTransaction;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::raft_log::Command;
use crate::raft_log::RaftLog;
use crate::storage::write_applied_index;
use crate::storage::AppliedIndex;
use crate::storage::Store;
use crate::storage::StoreSnapshot;
use crate::Error;
use crate::Metrics;
use crate::Result;

/// Applies decoded commands to the store.
///
/// Called strictly sequentially, in log order.
#[cfg_attr(test, automock)]
pub trait CommandHandler: Send + Sync + 'static {
    fn handle(
        &self,
        tx: &WriteTransaction,
        log: &RaftLog,
        command: Command,
    ) -> Result<Vec<u8>>;
}

/// In-memory projection rebuilt from the store on start-up and after a
/// snapshot restore.
#[cfg_attr(test, automock)]
pub trait StateRestorer: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn restore(
        &self,
        tx: &ReadTransaction,
    ) -> Result<()>;
}

pub struct Fsm {
    store: Store,
    handler: Arc<dyn CommandHandler>,
    restorers: Vec<Arc<dyn StateRestorer>>,
    applied_index: AtomicU64,
    applied_term: AtomicU64,
    /// Held shared by readers and exclusively by restore.
    restore_lock: RwLock<()>,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for Fsm {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Fsm")
            .field("store", &self.store)
            .field("applied_index", &self.applied_index())
            .finish()
    }
}

impl Fsm {
    pub fn new(
        store: Store,
        handler: Arc<dyn CommandHandler>,
        restorers: Vec<Arc<dyn StateRestorer>>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let fsm = Self {
            store,
            handler,
            restorers,
            applied_index: AtomicU64::new(0),
            applied_term: AtomicU64::new(0),
            restore_lock: RwLock::new(()),
            metrics,
        };
        let applied = fsm.store.applied_index()?;
        fsm.replay_projections()?;
        fsm.set_applied(applied);
        info!(term = applied.term, index = applied.index, "state machine initialized");
        Ok(fsm)
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index.load(Ordering::Acquire)
    }

    pub fn applied_term(&self) -> u64 {
        self.applied_term.load(Ordering::Acquire)
    }

    fn set_applied(
        &self,
        applied: AppliedIndex,
    ) {
        self.applied_term.store(applied.term, Ordering::Release);
        self.applied_index.store(applied.index, Ordering::Release);
        self.metrics.applied_index.set(applied.index as i64);
    }

    /// Applies one log entry.
    ///
    /// `Ok` carries the command response; `Err(Error::Fatal)` means the
    /// replica must stop. Other errors are command rejections.
    pub fn apply(
        &self,
        log: &RaftLog,
        entry: &[u8],
    ) -> Result<Vec<u8>> {
        if log.index <= self.applied_index() {
            debug!(index = log.index, applied = self.applied_index(), "skipping applied entry");
            return Ok(Vec::new());
        }

        let command = match Command::decode(entry) {
            Ok(command) => command,
            Err(e) => {
                warn!(index = log.index, ?e, "rejecting malformed log entry");
                self.record_applied(log)?;
                self.metrics.commands_applied.with_label_values(&["unknown", "rejected"]).inc();
                return Err(Error::Validation(e.into()));
            }
        };

        let command_name = command.command_type().as_str();
        let started = Instant::now();
        let result = self.apply_command(log, command);
        self.metrics
            .apply_duration
            .with_label_values(&[command_name])
            .observe(started.elapsed().as_secs_f64());

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) if e.is_fatal() => "fatal",
            Err(_) => "rejected",
        };
        self.metrics.commands_applied.with_label_values(&[command_name, outcome]).inc();
        result
    }

    fn apply_command(
        &self,
        log: &RaftLog,
        command: Command,
    ) -> Result<Vec<u8>> {
        let tx = self
            .store
            .begin_write()
            .map_err(|e| Error::Fatal(format!("failed to begin transaction: {}", e)))?;

        match self.handler.handle(&tx, log, command) {
            Ok(response) => {
                write_applied_index(&tx, applied_of(log))
                    .map_err(|e| Error::Fatal(format!("failed to record applied index: {}", e)))?;
                tx.commit()
                    .map_err(|e| Error::Fatal(format!("failed to commit transaction: {}", e)))?;
                self.set_applied(applied_of(log));
                Ok(response)
            }
            Err(e @ Error::Validation(_)) => {
                debug!(index = log.index, %e, "command rejected");
                tx.abort()
                    .map_err(|e| Error::Fatal(format!("failed to roll back transaction: {}", e)))?;
                self.record_applied(log)?;
                Err(e)
            }
            Err(e) => {
                // In-memory projections may already reflect the command.
                Err(Error::Fatal(format!("command at index {} failed: {}", log.index, e)))
            }
        }
    }

    /// Advances the applied index for an entry that changed nothing else.
    fn record_applied(
        &self,
        log: &RaftLog,
    ) -> Result<()> {
        let tx = self
            .store
            .begin_write()
            .map_err(|e| Error::Fatal(format!("failed to begin transaction: {}", e)))?;
        write_applied_index(&tx, applied_of(log))
            .and_then(|_| tx.commit().map_err(Error::from))
            .map_err(|e| Error::Fatal(format!("failed to record applied index: {}", e)))?;
        self.set_applied(applied_of(log));
        Ok(())
    }

    /// Applies the entry and aborts the process on a fatal error.
    pub fn apply_or_halt(
        &self,
        log: &RaftLog,
        entry: &[u8],
    ) -> Result<Vec<u8>> {
        match self.apply(log, entry) {
            Err(Error::Fatal(msg)) => {
                error!(index = log.index, term = log.term, "{}; halting", msg);
                std::process::abort();
            }
            result => result,
        }
    }

    /// Opens a frozen view of the store. Cheap; the data is only read when
    /// the returned snapshot is persisted.
    pub fn snapshot(&self) -> Result<StoreSnapshot> {
        let _guard = self.restore_lock.read();
        self.store.snapshot()
    }

    /// Replaces the whole state with the snapshot and rebuilds every
    /// projection. Blocks readers for the duration.
    pub fn restore<R: Read>(
        &self,
        reader: R,
    ) -> Result<()> {
        let _guard = self.restore_lock.write();
        let applied = self.store.restore(reader)?;
        self.replay_projections()
            .map_err(|e| Error::Fatal(format!("failed to rebuild state after restore: {}", e)))?;
        self.set_applied(applied);
        Ok(())
    }

    fn replay_projections(&self) -> Result<()> {
        let tx = self.store.begin_read()?;
        for restorer in &self.restorers {
            debug!(restorer = restorer.name(), "restoring in-memory state");
            restorer.restore(&tx)?;
        }
        Ok(())
    }

    /// Runs `f` against a read transaction, excluded from restores.
    /// `f` also receives the applied index observed under the guard.
    pub fn read<F, T>(
        &self,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(&ReadTransaction, u64) -> Result<T>,
    {
        let _guard = self.restore_lock.read();
        let tx = self.store.begin_read()?;
        f(&tx, self.applied_index())
    }
}

fn applied_of(log: &RaftLog) -> AppliedIndex {
    AppliedIndex {
        term: log.term,
        index: log.index,
    }
}
