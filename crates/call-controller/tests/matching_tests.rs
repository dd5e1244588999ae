//! Matching engine integration tests over the in-memory store.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use call_controller::events::{CallEvent, EventBus};
use call_controller::models::EndReason;
use cc_test_utils::fixtures::TestRequest;
use cc_test_utils::TestCore;
use common::ChannelId;
use std::time::Duration;

#[tokio::test]
async fn test_lone_request_stays_queued() {
    let core = TestCore::builder().build();

    let a = TestRequest::for_channel(1).build();
    core.queue.enqueue(&a).await.unwrap();

    let outcome = core.matching.find_match(&a).await.unwrap();
    assert!(!outcome.matched);
    assert!(core.queue.is_in_queue(ChannelId(1)).await.unwrap());
}

#[tokio::test]
async fn test_immediate_match_pairs_two_compatible_channels() {
    let core = TestCore::builder().build();

    let a = TestRequest::for_channel(1).build();
    core.queue.enqueue(&a).await.unwrap();
    assert!(!core.matching.find_match(&a).await.unwrap().matched);

    // A second channel from another community asks shortly after
    tokio::time::sleep(Duration::from_millis(200)).await;
    let b = TestRequest::for_channel(2).build();
    core.queue.enqueue(&b).await.unwrap();
    let outcome = core.matching.find_match(&b).await.unwrap();

    assert!(outcome.matched);
    assert!(outcome.call_id.is_some());
    assert!(
        outcome.match_time < Duration::from_secs(1),
        "immediate match must resolve sub-second"
    );

    // Both requests are gone from the queue
    assert_eq!(core.queue.queue_len().await.unwrap(), 0);

    // One call with two participants, visible from either channel
    let call = core
        .state
        .active_call_by_channel(ChannelId(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(call.participants.len(), 2);
    let same = core
        .state
        .active_call_by_channel(ChannelId(2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(call.id, same.id);
}

#[tokio::test]
async fn test_same_guild_requests_never_pair() {
    let core = TestCore::builder().build();

    let a = TestRequest::for_channel(1).guild(7).build();
    let b = TestRequest::for_channel(2).guild(7).build();
    core.queue.enqueue(&a).await.unwrap();
    core.queue.enqueue(&b).await.unwrap();

    assert!(!core.matching.find_match(&b).await.unwrap().matched);
    assert_eq!(core.matching.run_sweep().await.unwrap(), 0);
    assert_eq!(core.queue.queue_len().await.unwrap(), 2);
}

#[tokio::test]
async fn test_same_initiator_requests_never_pair() {
    let core = TestCore::builder().build();

    let a = TestRequest::for_channel(1).initiator(42).build();
    let b = TestRequest::for_channel(2).initiator(42).build();
    core.queue.enqueue(&a).await.unwrap();
    core.queue.enqueue(&b).await.unwrap();

    assert!(!core.matching.find_match(&b).await.unwrap().matched);
    assert_eq!(core.matching.run_sweep().await.unwrap(), 0);
}

#[tokio::test]
async fn test_recent_match_cooldown_blocks_rematch() {
    let core = TestCore::builder().build();

    let a = TestRequest::for_channel(1).initiator(100).build();
    let b = TestRequest::for_channel(2).initiator(200).build();
    core.queue.enqueue(&a).await.unwrap();
    core.queue.enqueue(&b).await.unwrap();
    assert!(core.matching.find_match(&b).await.unwrap().matched);

    let call = core
        .state
        .active_call_by_channel(ChannelId(1))
        .await
        .unwrap()
        .unwrap();
    core.state
        .end_call(call.id, EndReason::Hangup, false)
        .await
        .unwrap();

    // The same two users ask again right away
    let a2 = TestRequest::for_channel(1).initiator(100).build();
    let b2 = TestRequest::for_channel(2).initiator(200).build();
    core.queue.enqueue(&a2).await.unwrap();
    core.queue.enqueue(&b2).await.unwrap();

    assert!(
        !core.matching.find_match(&b2).await.unwrap().matched,
        "cooldown must block the rematch"
    );
    assert_eq!(core.matching.run_sweep().await.unwrap(), 0);
    assert_eq!(core.queue.queue_len().await.unwrap(), 2);

    // A third, uncooled pair still matches
    let c = TestRequest::for_channel(3).initiator(300).build();
    core.queue.enqueue(&c).await.unwrap();
    assert!(core.matching.find_match(&c).await.unwrap().matched);
}

#[tokio::test]
async fn test_age_gap_defers_fresh_to_stale_pairing() {
    let core = TestCore::builder().build();

    // 7 minutes old: past the 5 minute gap threshold relative to a fresh
    // request, but not yet past the 10 minute grace period
    let stale = TestRequest::for_channel(1).queued_secs_ago(420).build();
    let fresh = TestRequest::for_channel(2).build();
    core.queue.enqueue(&stale).await.unwrap();
    core.queue.enqueue(&fresh).await.unwrap();

    assert!(!core.matching.find_match(&fresh).await.unwrap().matched);
    assert_eq!(core.matching.run_sweep().await.unwrap(), 0);
}

#[tokio::test]
async fn test_desperate_request_pairs_despite_age_gap() {
    let core = TestCore::builder().build();

    // Past the grace period the stale request takes anyone
    let stale = TestRequest::for_channel(1).queued_secs_ago(700).build();
    let fresh = TestRequest::for_channel(2).build();
    core.queue.enqueue(&stale).await.unwrap();
    core.queue.enqueue(&fresh).await.unwrap();

    assert!(core.matching.find_match(&fresh).await.unwrap().matched);
}

#[tokio::test]
async fn test_sweep_pairs_in_queue_order() {
    let core = TestCore::builder().build();

    // Four compatible channels queued in order
    for n in 1..=4u64 {
        let request = TestRequest::for_channel(n).queued_secs_ago(10 - n as i64).build();
        core.queue.enqueue(&request).await.unwrap();
    }

    let pairs = core.matching.run_sweep().await.unwrap();
    assert_eq!(pairs, 2);
    assert_eq!(core.queue.queue_len().await.unwrap(), 0);

    // FIFO bias: the two oldest requests paired with each other
    let first = core
        .state
        .active_call_by_channel(ChannelId(1))
        .await
        .unwrap()
        .unwrap();
    assert!(first.participant(ChannelId(2)).is_some());

    let second = core
        .state
        .active_call_by_channel(ChannelId(3))
        .await
        .unwrap()
        .unwrap();
    assert!(second.participant(ChannelId(4)).is_some());
}

#[tokio::test]
async fn test_sweep_skips_incompatible_and_pairs_around_them() {
    let core = TestCore::builder().build();

    // Channels 1 and 2 share a guild; 3 is compatible with both
    core.queue
        .enqueue(&TestRequest::for_channel(1).guild(7).queued_secs_ago(3).build())
        .await
        .unwrap();
    core.queue
        .enqueue(&TestRequest::for_channel(2).guild(7).queued_secs_ago(2).build())
        .await
        .unwrap();
    core.queue
        .enqueue(&TestRequest::for_channel(3).guild(9).queued_secs_ago(1).build())
        .await
        .unwrap();

    let pairs = core.matching.run_sweep().await.unwrap();
    assert_eq!(pairs, 1);

    // Oldest compatible pair is (1, 3); 2 keeps waiting
    let call = core
        .state
        .active_call_by_channel(ChannelId(1))
        .await
        .unwrap()
        .unwrap();
    assert!(call.participant(ChannelId(3)).is_some());
    assert!(core.queue.is_in_queue(ChannelId(2)).await.unwrap());
}

#[tokio::test]
async fn test_match_emits_matched_event() {
    let core = TestCore::builder().build();
    let mut rx = core.bus.subscribe();

    let a = TestRequest::for_channel(1).build();
    let b = TestRequest::for_channel(2).build();
    core.queue.enqueue(&a).await.unwrap();
    core.queue.enqueue(&b).await.unwrap();
    assert!(core.matching.find_match(&b).await.unwrap().matched);

    let mut saw_matched = false;
    while let Ok(event) = rx.try_recv() {
        if let CallEvent::Matched { sides, .. } = event {
            let channels: Vec<u64> = sides.iter().map(|s| s.channel_id.0).collect();
            assert!(channels.contains(&1) && channels.contains(&2));
            saw_matched = true;
        }
    }
    assert!(saw_matched, "Matched event must be published");
}

#[tokio::test]
async fn test_match_statistics() {
    let core = TestCore::builder().build();

    let a = TestRequest::for_channel(1).build();
    core.queue.enqueue(&a).await.unwrap();
    core.matching.find_match(&a).await.unwrap();

    let b = TestRequest::for_channel(2).build();
    core.queue.enqueue(&b).await.unwrap();
    core.matching.find_match(&b).await.unwrap();

    let snapshot = core.matching.stats().snapshot();
    assert_eq!(snapshot.attempts, 2);
    assert_eq!(snapshot.matches, 1);
    assert!((snapshot.success_rate - 0.5).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_leader_sweep_task_pairs_queued_requests() {
    let core = TestCore::builder().build();
    use call_controller::lifecycle::Component;

    // Elect this process, then start the sweep task
    assert!(core.coordinator.try_acquire().await);
    core.matching.start().await.unwrap();

    core.queue
        .enqueue(&TestRequest::for_channel(1).build())
        .await
        .unwrap();
    core.queue
        .enqueue(&TestRequest::for_channel(2).build())
        .await
        .unwrap();

    // Within one sweep interval (50ms in the harness) the pair resolves
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(core.queue.queue_len().await.unwrap(), 0);
    assert!(core
        .state
        .active_call_by_channel(ChannelId(1))
        .await
        .unwrap()
        .is_some());

    core.matching.stop().await;
}
