use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tempfile::tempdir;
use tempfile::TempDir;

use super::*;
use crate::fsm::Fsm;
use crate::fsm::MockCommandHandler;
use crate::proto::CleanBlocksRequest;
use crate::raft_log::RaftLog;
use crate::storage::Store;
use crate::test_utils::enable_logger;
use crate::test_utils::test_metrics;
use crate::ConsistentReadError;

const INTERVAL: Duration = Duration::from_millis(10);

fn new_fsm() -> (TempDir, Arc<Fsm>) {
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path()).unwrap();
    let mut handler = MockCommandHandler::new();
    handler.expect_handle().returning(|_, _, _| Ok(Vec::new()));
    let fsm = Fsm::new(store, Arc::new(handler), Vec::new(), test_metrics()).unwrap();
    (dir, Arc::new(fsm))
}

fn apply(
    fsm: &Fsm,
    index: u64,
) {
    let entry = Command::CleanBlocks(CleanBlocksRequest {
        request_id: format!("r-{}", index),
    })
    .encode();
    fsm.apply(&RaftLog::new(index, 1, 0), &entry).unwrap();
}

fn leader_at(commit_index: u64) -> Arc<dyn Leader> {
    let mut leader = MockLeader::new();
    leader.expect_read_index().returning(move || {
        Ok(ReadIndex {
            commit_index,
            term: 1,
        })
    });
    Arc::new(leader)
}

fn reader(
    leader: Arc<dyn Leader>,
    fsm: Arc<Fsm>,
    max_distance: u64,
) -> StateReader {
    let config = RaftConfig {
        log_index_check_interval_ms: INTERVAL.as_millis() as u64,
        read_index_max_distance: max_distance,
        apply_timeout_ms: 1_000,
        ..Default::default()
    };
    StateReader::new(leader, fsm, &config, test_metrics())
}

#[tokio::test(start_paused = true)]
async fn test_wait_returns_immediately_when_reached() {
    wait_index_reached(|| 5, 5, INTERVAL, 0).await.unwrap();
    wait_index_reached(|| 7, 5, INTERVAL, 1).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_wait_polls_until_index_catches_up() {
    let index = Arc::new(AtomicU64::new(0));
    let writer = index.clone();
    tokio::spawn(async move {
        for i in 1..=3 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            writer.store(i, Ordering::SeqCst);
        }
    });

    let started = tokio::time::Instant::now();
    let reader = index.clone();
    wait_index_reached(move || reader.load(Ordering::SeqCst), 3, INTERVAL, 10)
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(75));
    assert_eq!(index.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_wait_fails_fast_when_too_far_behind() {
    let started = tokio::time::Instant::now();
    let err = wait_index_reached(|| 10, 100, INTERVAL, 50).await.unwrap_err();
    assert!(matches!(
        err,
        ConsistentReadError::LagBehind {
            applied: 10,
            required: 100
        }
    ));
    assert_eq!(started.elapsed(), Duration::ZERO);

    // Exactly at the bound is still allowed to wait.
    let waited = tokio::time::timeout(
        Duration::from_millis(100),
        wait_index_reached(|| 50, 100, INTERVAL, 50),
    )
    .await;
    assert!(waited.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_consistent_read_sees_committed_state() {
    enable_logger();
    let (_dir, fsm) = new_fsm();
    for i in 1..=3 {
        apply(&fsm, i);
    }
    let reader = reader(leader_at(3), fsm, 10);

    let (applied, read_index) = reader
        .consistent_read(|_, read_index| Ok((read_index.commit_index, read_index)))
        .await
        .unwrap();
    assert_eq!(applied, 3);
    assert_eq!(read_index.term, 1);
}

#[tokio::test(start_paused = true)]
async fn test_follower_waits_for_apply_before_reading() {
    let (_dir, fsm) = new_fsm();
    apply(&fsm, 1);
    let reader = reader(leader_at(2), fsm.clone(), 10);

    let applier = fsm.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        apply(&applier, 2);
    });

    let seen = reader
        .consistent_read(|_, _| Ok(fsm.applied_index()))
        .await
        .unwrap();
    assert_eq!(seen, 2);
}

#[tokio::test(start_paused = true)]
async fn test_lagging_replica_fails_with_consistent_read_error() {
    let (_dir, fsm) = new_fsm();
    let reader = reader(leader_at(100), fsm, 10);

    let err = reader.consistent_read(|_, _| Ok(())).await.unwrap_err();
    assert!(matches!(
        err,
        Error::ConsistentRead(ConsistentReadError::LagBehind { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_stalled_replica_times_out() {
    let (_dir, fsm) = new_fsm();
    let reader = reader(leader_at(5), fsm, 0);

    let err = reader.consistent_read(|_, _| Ok(())).await.unwrap_err();
    assert!(matches!(
        err,
        Error::ConsistentRead(ConsistentReadError::Timeout { required: 5 })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_leader_failure_is_wrapped() {
    let (_dir, fsm) = new_fsm();
    let mut leader = MockLeader::new();
    leader
        .expect_read_index()
        .returning(|| Err(Error::not_leader(Some("10.0.0.2:9099".to_string()))));
    let reader = reader(Arc::new(leader), fsm, 10);

    let err = reader.consistent_read(|_, _| Ok(())).await.unwrap_err();
    match err {
        Error::ConsistentRead(ConsistentReadError::Leader(inner)) => {
            assert!(inner.is_not_leader());
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_read_errors_are_passed_through() {
    let (_dir, fsm) = new_fsm();
    let reader = reader(leader_at(0), fsm, 10);

    let err = reader
        .consistent_read(|_, _| -> Result<()> {
            Err(crate::ValidationError::InvalidQuery("bad".to_string()).into())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}
