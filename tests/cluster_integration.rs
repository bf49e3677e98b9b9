//! Integration tests for partition servers talking over the in-memory router

use quorum::raft::{AppendError, AppendEvent, InMemoryRaftCluster, RaftConfig, RaftHandle, Role};
use quorum::Member;
use std::time::Duration;

const ELECTION_WAIT: Duration = Duration::from_secs(30);

async fn next_event(events: &mut tokio::sync::mpsc::UnboundedReceiver<AppendEvent>) -> AppendEvent {
    tokio::time::timeout(ELECTION_WAIT, events.recv())
        .await
        .expect("timed out waiting for append event")
        .expect("append listener dropped")
}

async fn wait_for_new_leader(cluster: &InMemoryRaftCluster, old: &RaftHandle) -> RaftHandle {
    let old_id = old.id();
    tokio::time::timeout(ELECTION_WAIT, async {
        loop {
            if let Some(leader) = cluster.leader() {
                if leader.id() != old_id {
                    return leader.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("no new leader elected")
}

#[tokio::test(start_paused = true)]
async fn test_appends_commit_in_submission_order() {
    let cluster = InMemoryRaftCluster::start(vec![1, 2, 3], RaftConfig::default()).await.unwrap();
    let leader = cluster.wait_for_leader(ELECTION_WAIT).await.unwrap();

    let mut receivers: Vec<_> = (1..=10u64)
        .map(|position| leader.append(position, position, position.to_le_bytes().to_vec()))
        .collect();

    let mut committed = Vec::new();
    for events in &mut receivers {
        let written = match next_event(events).await {
            AppendEvent::Written(indexed) => indexed,
            other => panic!("expected write, got {:?}", other),
        };
        match next_event(events).await {
            AppendEvent::Committed(indexed) => {
                assert_eq!(indexed.index(), written.index());
                committed.push((indexed.lowest_position(), indexed.index()));
            }
            other => panic!("expected commit, got {:?}", other),
        }
    }

    let positions: Vec<u64> = committed.iter().map(|(position, _)| *position).collect();
    assert_eq!(positions, (1..=10).collect::<Vec<_>>());
    assert!(committed.windows(2).all(|pair| pair[0].1 < pair[1].1));

    let last_index = committed.last().map(|(_, index)| *index).unwrap();
    for handle in cluster.handles() {
        handle.wait_for(|status| status.commit_index >= last_index).await.unwrap();
    }

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_isolated_leader_is_replaced_and_fails_uncommitted_appends() {
    let cluster = InMemoryRaftCluster::start(vec![1, 2, 3], RaftConfig::default()).await.unwrap();
    let old_leader = cluster.wait_for_leader(ELECTION_WAIT).await.unwrap();
    let old_term = old_leader.current_status().term;

    cluster.router().disconnect(old_leader.id()).await;

    let mut events = old_leader.append(1, 1, b"lost".to_vec());
    assert!(matches!(next_event(&mut events).await, AppendEvent::Written(_)));

    let new_leader = wait_for_new_leader(&cluster, &old_leader).await;
    assert!(new_leader.current_status().term > old_term);

    cluster.router().reconnect(old_leader.id()).await;

    match next_event(&mut events).await {
        AppendEvent::CommitFailed(_, AppendError::LeaderClosed(_)) => {}
        other => panic!("expected commit failure, got {:?}", other),
    }
    let status = old_leader
        .wait_for(|status| status.role == Role::Follower && status.leader_id == Some(new_leader.id()))
        .await
        .unwrap();
    assert!(status.term > old_term);

    let mut events = old_leader.append(2, 2, Vec::new());
    assert!(matches!(
        next_event(&mut events).await,
        AppendEvent::WriteFailed(AppendError::LeaderClosed(_))
    ));

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_passive_member_replicates_but_never_leads() {
    let members = vec![Member::active(1), Member::active(2), Member::active(3), Member::passive(4)];
    let cluster = InMemoryRaftCluster::start_with_members(members, RaftConfig::default())
        .await
        .unwrap();

    let leader = cluster.wait_for_leader(ELECTION_WAIT).await.unwrap();
    assert_ne!(leader.id(), 4);

    let mut events = leader.append(1, 3, b"abc".to_vec());
    assert!(matches!(next_event(&mut events).await, AppendEvent::Written(_)));
    let committed = match next_event(&mut events).await {
        AppendEvent::Committed(indexed) => indexed.index(),
        other => panic!("expected commit, got {:?}", other),
    };

    let passive = cluster.handle(4).unwrap();
    let status = passive.wait_for(|status| status.commit_index >= committed).await.unwrap();
    assert_eq!(status.role, Role::Passive);

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_leader_steps_down_on_request() {
    let cluster = InMemoryRaftCluster::start(vec![1, 2, 3], RaftConfig::default()).await.unwrap();
    let leader = cluster.wait_for_leader(ELECTION_WAIT).await.unwrap();

    leader.step_down().unwrap();
    let status = leader.wait_for(|status| status.role != Role::Leader).await.unwrap();
    assert_eq!(status.role, Role::Follower);

    cluster.wait_for_leader(ELECTION_WAIT).await.unwrap();
    cluster.shutdown().await;
}
