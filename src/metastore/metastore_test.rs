use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tempfile::tempdir;
use tempfile::TempDir;
use tonic::async_trait;

use super::*;
use crate::cleaner::BucketError;
use crate::cleaner::MockObjectBucket;
use crate::proto::CompactionJobStatus;
use crate::proto::CompactionJobStatusUpdate;
use crate::raft_log::RaftLog;
use crate::storage::Store;
use crate::test_utils::block;
use crate::test_utils::enable_logger;
use crate::test_utils::test_metrics;
use crate::test_utils::HOUR_NANOS;
use crate::CleanerConfig;
use crate::CompactionConfig;
use crate::ConsensusError;
use crate::Error;
use crate::RaftConfig;
use crate::ValidationError;

/// Single-voter log: every proposal is committed and applied at once.
struct LocalRaft {
    fsm: Arc<Fsm>,
    leader: AtomicBool,
    last_index: AtomicU64,
    /// Added to the wall clock when stamping entries.
    clock_skew: AtomicI64,
    transferred: AtomicBool,
}

impl LocalRaft {
    fn new(fsm: Arc<Fsm>) -> Self {
        let last_index = AtomicU64::new(fsm.applied_index());
        Self {
            fsm,
            leader: AtomicBool::new(true),
            last_index,
            clock_skew: AtomicI64::new(0),
            transferred: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl RaftHandle for LocalRaft {
    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    fn leader_addr(&self) -> Option<String> {
        self.is_leader().then(|| "127.0.0.1:9099".to_string())
    }

    fn current_term(&self) -> u64 {
        1
    }

    fn commit_index(&self) -> u64 {
        self.last_index.load(Ordering::SeqCst)
    }

    fn last_index(&self) -> u64 {
        self.last_index.load(Ordering::SeqCst)
    }

    async fn verify_leader(&self) -> Result<()> {
        if self.is_leader() {
            Ok(())
        } else {
            Err(Error::not_leader(None))
        }
    }

    async fn apply(
        &self,
        entry: Vec<u8>,
        _timeout: Duration,
    ) -> Result<Vec<u8>> {
        if !self.is_leader() {
            return Err(Error::not_leader(None));
        }
        let index = self.last_index.fetch_add(1, Ordering::SeqCst) + 1;
        let now = now_nanos() + self.clock_skew.load(Ordering::SeqCst);
        self.fsm.apply(&RaftLog::new(index, 1, now), &entry)
    }

    async fn transfer_leadership(&self) -> Result<()> {
        if !self.is_leader() {
            return Err(Error::not_leader(None));
        }
        self.leader.store(false, Ordering::SeqCst);
        self.transferred.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn config() -> MetastoreConfig {
    MetastoreConfig {
        raft: RaftConfig {
            apply_timeout_ms: 1_000,
            log_index_check_interval_ms: 5,
            shutdown_grace_period_ms: 100,
            ..Default::default()
        },
        compaction: CompactionConfig {
            lease_duration_ms: 60_000,
            max_failures: 2,
            level0_threshold: 2,
            level_threshold: 2,
            max_level: 2,
            max_batch_age_ms: 0,
        },
        cleaner: CleanerConfig {
            cleanup_interval_ms: 60_000,
            cleanup_delay_ms: 1_000,
            cleanup_max_concurrency: 2,
        },
        ..Default::default()
    }
}

struct Node {
    _dir: TempDir,
    raft: Arc<LocalRaft>,
    metastore: Metastore<LocalRaft>,
}

fn new_node() -> Node {
    let dir = tempdir().unwrap();
    let config = config();
    let metrics = test_metrics();
    let store = Store::open(dir.path()).unwrap();
    let state = Arc::new(MetastoreState::new(&config, metrics.clone()));
    let fsm = Arc::new(state.open_fsm(store, metrics.clone()).unwrap());
    let raft = Arc::new(LocalRaft::new(fsm.clone()));
    let node = Arc::new(RaftNode::new(config.raft.clone(), raft.clone(), metrics.clone()));
    let (health, _) = tonic_health::server::health_reporter();
    let metastore = Metastore::new(config, node.clone(), node, fsm, state, health, metrics);
    Node {
        _dir: dir,
        raft,
        metastore,
    }
}

fn add_request(id: &str) -> AddBlockRequest {
    AddBlockRequest {
        block: Some(block(id, "t1", 1, 0)),
    }
}

fn poll_request(
    updates: Vec<CompactionJobStatusUpdate>,
    capacity: u32,
) -> PollCompactionJobsRequest {
    PollCompactionJobsRequest {
        status_updates: updates,
        job_capacity: capacity,
    }
}

fn query_all() -> QueryMetadataRequest {
    QueryMetadataRequest {
        tenant_id: vec!["t1".to_string()],
        start_time: 0,
        end_time: 3 * HOUR_NANOS,
        query: "{service_name=\"api\"}".to_string(),
    }
}

#[tokio::test]
async fn test_added_blocks_are_visible_to_queries() {
    enable_logger();
    let node = new_node();
    let m = &node.metastore;
    m.add_block(add_request("b1")).await.unwrap();
    m.add_block(add_request("b2")).await.unwrap();
    // Retried request.
    m.add_block(add_request("b1")).await.unwrap();

    let mut ids: Vec<String> = m
        .query_metadata(query_all())
        .await
        .unwrap()
        .blocks
        .into_iter()
        .map(|b| b.id)
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["b1", "b2"]);
    assert_eq!(m.fsm().applied_index(), 3);
}

#[tokio::test]
async fn test_invalid_query_is_rejected() {
    let node = new_node();
    let mut request = query_all();
    request.query = "{service_name=".to_string();
    let err = node.metastore.query_metadata(request).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_poll_without_work_does_not_touch_the_log() {
    let node = new_node();
    let m = &node.metastore;
    m.add_block(add_request("b1")).await.unwrap();

    let response = m.poll_compaction_jobs(poll_request(vec![], 4)).await.unwrap();
    assert!(response.compaction_jobs.is_empty());
    assert!(response.cancelled_jobs.is_empty());
    assert_eq!(m.fsm().applied_index(), 1);
}

#[tokio::test]
async fn test_compaction_round_trip() {
    enable_logger();
    let node = new_node();
    let m = &node.metastore;
    m.add_block(add_request("b1")).await.unwrap();
    m.add_block(add_request("b2")).await.unwrap();

    let response = m.poll_compaction_jobs(poll_request(vec![], 1)).await.unwrap();
    assert_eq!(response.compaction_jobs.len(), 1);
    let job = &response.compaction_jobs[0];
    let mut sources: Vec<&str> = job.blocks.iter().map(|b| b.id.as_str()).collect();
    sources.sort();
    assert_eq!(sources, vec!["b1", "b2"]);
    assert_eq!(job.raft_log_index, 3);

    let done = CompactionJobStatusUpdate {
        name: job.name.clone(),
        raft_log_index: job.raft_log_index,
        status: CompactionJobStatus::Success as i32,
        compacted_blocks: vec![block("c1", "t1", 1, 1)],
    };
    let response = m.poll_compaction_jobs(poll_request(vec![done], 1)).await.unwrap();
    assert!(response.compaction_jobs.is_empty());

    let ids: Vec<String> = m
        .query_metadata(query_all())
        .await
        .unwrap()
        .blocks
        .into_iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(ids, vec!["c1"]);

    let err = m.add_block(add_request("b1")).await.unwrap_err();
    assert!(matches!(err, Error::Validation(ValidationError::BlockRemoved(_))));
}

#[tokio::test]
async fn test_unknown_jobs_are_cancelled() {
    let node = new_node();
    let unknown = CompactionJobStatusUpdate {
        name: "L0-S1-0000000000000000".to_string(),
        raft_log_index: 7,
        status: CompactionJobStatus::InProgress as i32,
        compacted_blocks: vec![],
    };
    let response = node
        .metastore
        .poll_compaction_jobs(poll_request(vec![unknown.clone(), unknown], 1))
        .await
        .unwrap();
    assert_eq!(response.cancelled_jobs, vec!["L0-S1-0000000000000000"]);
}

#[tokio::test]
async fn test_poll_on_follower_points_to_leader() {
    let node = new_node();
    node.raft.leader.store(false, Ordering::SeqCst);
    let err = node
        .metastore
        .poll_compaction_jobs(poll_request(vec![], 1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Consensus(ConsensusError::NotLeader { .. })
    ));
}

#[tokio::test]
async fn test_read_index_reports_commit_index() {
    let node = new_node();
    let m = &node.metastore;
    m.add_block(add_request("b1")).await.unwrap();
    let read_index = m.read_index().await.unwrap();
    assert_eq!(read_index.commit_index, 1);
    assert_eq!(read_index.term, 1);
    m.check_ready().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cleaner_deletes_expired_sources() {
    enable_logger();
    let node = new_node();
    let m = &node.metastore;
    m.add_block(add_request("b1")).await.unwrap();
    m.add_block(add_request("b2")).await.unwrap();
    let job = m
        .poll_compaction_jobs(poll_request(vec![], 1))
        .await
        .unwrap()
        .compaction_jobs
        .remove(0);
    let done = CompactionJobStatusUpdate {
        name: job.name.clone(),
        raft_log_index: job.raft_log_index,
        status: CompactionJobStatus::Success as i32,
        compacted_blocks: vec![block("c1", "t1", 1, 1)],
    };
    m.poll_compaction_jobs(poll_request(vec![done], 0)).await.unwrap();
    assert_eq!(m.state().markers().len(), 2);

    // Entries are stamped past the deletion delay from here on.
    node.raft.clock_skew.store(10 * 1_000_000_000, Ordering::SeqCst);

    let mut bucket = MockObjectBucket::new();
    bucket
        .expect_delete()
        .withf(|path| path == "blocks/1/t1/b1/block.bin")
        .times(1)
        .returning(|_| Ok(()));
    bucket
        .expect_delete()
        .withf(|path| path == "blocks/1/t1/b2/block.bin")
        .times(1)
        .returning(|_| Err(BucketError::NotFound));

    let handle = m.run_cleaner(Arc::new(bucket));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(m.state().markers().is_empty());

    m.shutdown().await;
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_transfers_leadership() {
    let node = new_node();
    let m = &node.metastore;
    assert!(!m.is_shutting_down());

    let started = tokio::time::Instant::now();
    m.shutdown().await;
    assert!(m.is_shutting_down());
    assert!(node.raft.transferred.load(Ordering::SeqCst));
    assert!(started.elapsed() >= Duration::from_millis(100));

    let err = m.add_block(add_request("late")).await.unwrap_err();
    assert!(matches!(err, Error::Consensus(ConsensusError::ShuttingDown)));
    let err = m.poll_compaction_jobs(poll_request(vec![], 1)).await.unwrap_err();
    assert!(matches!(err, Error::Consensus(ConsensusError::ShuttingDown)));

    // A node that does not lead has nothing to hand over.
    let follower = new_node();
    follower.raft.leader.store(false, Ordering::SeqCst);
    let started = tokio::time::Instant::now();
    follower.metastore.shutdown().await;
    assert!(!follower.raft.transferred.load(Ordering::SeqCst));
    assert_eq!(started.elapsed(), Duration::ZERO);
}
