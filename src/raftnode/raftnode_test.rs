use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use super::*;
use crate::proto::CleanBlocksRequest;
use crate::raft_log::CommandType;
use crate::test_utils::test_metrics;
use crate::ConsistentReadError;

fn config() -> RaftConfig {
    RaftConfig {
        apply_timeout_ms: 500,
        log_index_check_interval_ms: 10,
        read_index_max_distance: 100,
        ..Default::default()
    }
}

fn node(raft: MockRaftHandle) -> RaftNode<MockRaftHandle> {
    RaftNode::new(config(), Arc::new(raft), test_metrics())
}

fn clean_blocks() -> Command {
    Command::CleanBlocks(CleanBlocksRequest {
        request_id: "r-1".to_string(),
    })
}

#[tokio::test(start_paused = true)]
async fn test_read_index_returns_commit_index_of_current_term() {
    let mut raft = MockRaftHandle::new();
    raft.expect_current_term().return_const(3u64);
    raft.expect_last_index().return_const(42u64);
    raft.expect_commit_index().return_const(42u64);
    raft.expect_verify_leader().times(1).returning(|| Ok(()));

    let read_index = node(raft).read_index().await.unwrap();
    assert_eq!(
        read_index,
        ReadIndex {
            commit_index: 42,
            term: 3
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_read_index_waits_for_entry_of_current_term() {
    let commit = Arc::new(AtomicU64::new(40));
    let mut raft = MockRaftHandle::new();
    raft.expect_current_term().return_const(3u64);
    raft.expect_last_index().return_const(42u64);
    let c = commit.clone();
    raft.expect_commit_index().returning(move || c.load(Ordering::SeqCst));
    raft.expect_verify_leader().returning(|| Ok(()));

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        commit.store(42, Ordering::SeqCst);
    });

    let read_index = node(raft).read_index().await.unwrap();
    assert_eq!(read_index.commit_index, 42);
}

#[tokio::test(start_paused = true)]
async fn test_read_index_times_out_when_commit_stalls() {
    let mut raft = MockRaftHandle::new();
    raft.expect_current_term().return_const(3u64);
    raft.expect_last_index().return_const(42u64);
    raft.expect_commit_index().return_const(41u64);
    raft.expect_verify_leader().never();

    let err = node(raft).read_index().await.unwrap_err();
    assert!(matches!(err, Error::Consensus(ConsensusError::Timeout)));
}

#[tokio::test(start_paused = true)]
async fn test_read_index_fails_fast_when_commit_lags() {
    let mut raft = MockRaftHandle::new();
    raft.expect_current_term().return_const(3u64);
    raft.expect_last_index().return_const(500u64);
    raft.expect_commit_index().return_const(10u64);
    raft.expect_verify_leader().never();

    let err = node(raft).read_index().await.unwrap_err();
    assert!(matches!(
        err,
        Error::ConsistentRead(ConsistentReadError::LagBehind { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_read_index_rejects_term_change() {
    let calls = AtomicU64::new(0);
    let mut raft = MockRaftHandle::new();
    raft.expect_current_term()
        .returning(move || 3 + calls.fetch_add(1, Ordering::SeqCst).min(1));
    raft.expect_last_index().return_const(42u64);
    raft.expect_commit_index().return_const(42u64);
    raft.expect_verify_leader().returning(|| Ok(()));

    let err = node(raft).read_index().await.unwrap_err();
    assert!(matches!(err, Error::Consensus(ConsensusError::LeadershipLost)));
}

#[tokio::test(start_paused = true)]
async fn test_not_leader_carries_leader_hint() {
    let mut raft = MockRaftHandle::new();
    raft.expect_current_term().return_const(3u64);
    raft.expect_last_index().return_const(42u64);
    raft.expect_commit_index().return_const(42u64);
    raft.expect_verify_leader().returning(|| Err(Error::not_leader(None)));
    raft.expect_leader_addr().return_const(Some("10.0.0.7:9099".to_string()));

    let err = node(raft).read_index().await.unwrap_err();
    match err {
        Error::Consensus(ConsensusError::NotLeader { leader_hint }) => {
            assert_eq!(leader_hint.as_deref(), Some("10.0.0.7:9099"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_propose_encodes_command() {
    let mut raft = MockRaftHandle::new();
    raft.expect_apply()
        .withf(|entry, timeout| {
            *timeout == Duration::from_millis(500)
                && Command::decode(entry)
                    .map(|c| c.command_type() == CommandType::CleanBlocks)
                    .unwrap_or(false)
        })
        .times(1)
        .returning(|_, _| Ok(b"ok".to_vec()));

    let response = node(raft).propose(clean_blocks()).await.unwrap();
    assert_eq!(response, b"ok".to_vec());
}

#[tokio::test]
async fn test_propose_on_follower_points_to_leader() {
    let mut raft = MockRaftHandle::new();
    raft.expect_apply().returning(|_, _| Err(Error::not_leader(None)));
    raft.expect_leader_addr().return_const(Some("10.0.0.1:9099".to_string()));

    let err = node(raft).propose(clean_blocks()).await.unwrap_err();
    match err {
        Error::Consensus(ConsensusError::NotLeader { leader_hint }) => {
            assert_eq!(leader_hint.as_deref(), Some("10.0.0.1:9099"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_propose_passes_command_rejection_through() {
    let mut raft = MockRaftHandle::new();
    raft.expect_apply()
        .returning(|_, _| Err(crate::ValidationError::BlockRemoved("b1".to_string()).into()));

    let err = node(raft).propose(clean_blocks()).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_transfer_leadership_is_best_effort() {
    let mut raft = MockRaftHandle::new();
    raft.expect_transfer_leadership()
        .times(1)
        .returning(|| Err(Error::not_leader(None)));
    assert!(!node(raft).transfer_leadership().await);
}

#[test]
fn test_ensure_leader() {
    let mut raft = MockRaftHandle::new();
    raft.expect_is_leader().times(1).return_const(true);
    assert!(node(raft).ensure_leader().is_ok());

    let mut raft = MockRaftHandle::new();
    raft.expect_is_leader().return_const(false);
    raft.expect_leader_addr().return_const(Some("10.0.0.3:9099".to_string()));
    let err = node(raft).ensure_leader().unwrap_err();
    match err {
        Error::Consensus(ConsensusError::NotLeader { leader_hint }) => {
            assert_eq!(leader_hint.as_deref(), Some("10.0.0.3:9099"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}
