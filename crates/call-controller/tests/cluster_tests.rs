//! Multi-process coordination tests: several cores sharing one in-memory
//! store stand in for controller processes sharing one Redis.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use call_controller::config::CoordinatorConfig;
use call_controller::lifecycle::Component;
use cc_test_utils::fixtures::TestRequest;
use cc_test_utils::{MemoryStore, TestCore};
use common::ChannelId;
use std::sync::Arc;
use std::time::Duration;

fn two_nodes() -> (TestCore, TestCore, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let node_a = TestCore::builder()
        .node_id("node-a")
        .store(store.clone())
        .build();
    let node_b = TestCore::builder()
        .node_id("node-b")
        .store(store.clone())
        .build();
    (node_a, node_b, store)
}

#[tokio::test]
async fn test_concurrent_match_attempts_create_exactly_one_call() {
    let (node_a, node_b, _store) = two_nodes();

    // Repeat with fresh channels to exercise different interleavings
    for round in 0..20u64 {
        let ch_a = 100 + round * 2;
        let ch_b = 101 + round * 2;

        let request_a = TestRequest::for_channel(ch_a).build();
        let request_b = TestRequest::for_channel(ch_b).build();
        node_a.queue.enqueue(&request_a).await.unwrap();
        node_b.queue.enqueue(&request_b).await.unwrap();

        // Both processes race to match the same pair
        let (outcome_a, outcome_b) = tokio::join!(
            node_a.matching.find_match(&request_a),
            node_b.matching.find_match(&request_b),
        );

        let wins = usize::from(outcome_a.unwrap().matched)
            + usize::from(outcome_b.unwrap().matched);
        assert_eq!(wins, 1, "round {round}: exactly one side creates the call");

        // Both requests are gone and both channels share one call
        assert_eq!(node_a.queue.queue_len().await.unwrap(), 0);
        let call_a = node_b
            .state
            .active_call_by_channel(ChannelId(ch_a))
            .await
            .unwrap()
            .expect("call visible from either process");
        assert!(call_a.participant(ChannelId(ch_b)).is_some());
    }
}

#[tokio::test]
async fn test_hangup_races_match_exactly_one_winner() {
    let (node_a, node_b, _store) = two_nodes();

    for round in 0..20u64 {
        let ch_a = 500 + round * 2;
        let ch_b = 501 + round * 2;

        let request_a = TestRequest::for_channel(ch_a).build();
        let request_b = TestRequest::for_channel(ch_b).build();
        node_a.queue.enqueue(&request_a).await.unwrap();
        node_b.queue.enqueue(&request_b).await.unwrap();

        // Channel A hangs up on one process while the other sweeps
        let (hangup, sweep) = tokio::join!(
            node_a.manager.hangup_call(ChannelId(ch_a)),
            node_b.matching.run_sweep(),
        );
        let sweep_pairs = sweep.unwrap();

        // The request is out of the queue regardless of who won
        assert!(!node_a.queue.is_in_queue(ChannelId(ch_a)).await.unwrap());

        let in_call = node_a
            .state
            .active_call_by_channel(ChannelId(ch_a))
            .await
            .unwrap()
            .is_some();
        if sweep_pairs == 1 {
            // Match won the dequeue race. Hangup then either ended the
            // fresh call or reported nothing to cancel.
            assert!(hangup.success || !in_call);
        } else {
            // Cancellation won: no call was created for this channel
            assert!(!in_call);
            assert!(hangup.success, "{}", hangup.message);
        }

        // Clean up whatever is left (queued request or live call)
        node_b.manager.hangup_call(ChannelId(ch_b)).await;
    }
}

#[tokio::test]
async fn test_exactly_one_leader_cluster_wide() {
    let store = Arc::new(MemoryStore::new());
    let config = CoordinatorConfig {
        lease_ttl: Duration::from_millis(200),
    };
    let nodes: Vec<TestCore> = (0..3)
        .map(|n| {
            TestCore::builder()
                .node_id(format!("node-{n}"))
                .store(store.clone())
                .coordinator_config(config.clone())
                .build()
        })
        .collect();

    for node in &nodes {
        node.coordinator.start().await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let leaders: Vec<&TestCore> = nodes.iter().filter(|n| n.coordinator.is_leader()).collect();
    assert_eq!(leaders.len(), 1, "exactly one leader");

    for node in &nodes {
        node.coordinator.stop().await;
    }
}

#[tokio::test]
async fn test_leadership_fails_over_when_leader_stops() {
    let store = Arc::new(MemoryStore::new());
    let config = CoordinatorConfig {
        lease_ttl: Duration::from_millis(150),
    };
    let node_a = TestCore::builder()
        .node_id("node-a")
        .store(store.clone())
        .coordinator_config(config.clone())
        .build();
    let node_b = TestCore::builder()
        .node_id("node-b")
        .store(store.clone())
        .coordinator_config(config)
        .build();

    node_a.coordinator.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(node_a.coordinator.is_leader());

    node_b.coordinator.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!node_b.coordinator.is_leader());

    // The leader stops (graceful shutdown releases the lease); the
    // follower takes over within its next acquisition attempt
    node_a.coordinator.stop().await;

    let mut took_over = false;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if node_b.coordinator.is_leader() {
            took_over = true;
            break;
        }
    }
    assert!(took_over, "follower must take over after the leader stops");

    node_b.coordinator.stop().await;
}

#[tokio::test]
async fn test_call_state_is_visible_across_processes() {
    let (node_a, node_b, _store) = two_nodes();

    node_a
        .manager
        .initiate_call(
            call_controller::manager::ChannelRef {
                channel_id: ChannelId(1),
                guild_id: common::GuildId(10),
                webhook_url: "https://hooks.example/1".to_string(),
            },
            common::UserId(100),
        )
        .await;
    node_b
        .manager
        .initiate_call(
            call_controller::manager::ChannelRef {
                channel_id: ChannelId(2),
                guild_id: common::GuildId(20),
                webhook_url: "https://hooks.example/2".to_string(),
            },
            common::UserId(200),
        )
        .await;

    // The call was created by whichever process matched; both see it
    let from_a = node_a
        .manager
        .get_active_call(ChannelId(1))
        .await
        .unwrap()
        .unwrap();
    let from_b = node_b
        .manager
        .get_active_call(ChannelId(2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from_a.id, from_b.id);

    // A hangup on one process tears the call down for both
    node_b.manager.hangup_call(ChannelId(2)).await;
    assert!(node_a
        .manager
        .get_active_call(ChannelId(1))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_queue_is_shared_across_processes() {
    let (node_a, node_b, _store) = two_nodes();

    let request = TestRequest::for_channel(1).build();
    node_a.queue.enqueue(&request).await.unwrap();

    // The other process sees the entry and can claim it
    assert!(node_b.queue.is_in_queue(ChannelId(1)).await.unwrap());
    assert!(node_b.queue.dequeue(request.id).await.unwrap());
    assert!(!node_a.queue.dequeue(request.id).await.unwrap());
}
