/// Session resume: reconnecting with the same (name, sessionId) replays
/// persisted unacked deliveries in stored seq order before new traffic.
use relay_test_utils::{wait_until, MockAgent, ScratchRoot};
use relay_protocol::{Body, EntityKind};
use relayd::delivery::RetryConfig;
use relayd::RelayDaemon;
use std::time::Duration;

fn test_config(root: &std::path::Path) -> relayd::config::RelayConfig {
    let mut config = relayd::config::load_config_from_str("").unwrap();
    config.root_dir = root.to_owned();
    config.socket_path = root.join("relay.sock");
    config.watchdog.reconcile_interval = Duration::from_secs(60);
    // Slow retries so the replay, not the retry loop, is what we observe.
    config.delivery = RetryConfig {
        base: Duration::from_secs(30),
        multiplier: 2,
        max_attempts: 3,
        ttl: Duration::from_secs(120),
    };
    config
}

#[tokio::test]
async fn reconnect_with_same_session_replays_unacked_in_seq_order() {
    let root = ScratchRoot::new().unwrap();
    let daemon = RelayDaemon::start(test_config(root.path())).await.unwrap();
    let socket = daemon.config().socket_path.clone();

    let mut b = MockAgent::connect_with_session(&socket, "B", "s-9", EntityKind::Agent)
        .await
        .unwrap();
    let mut a = MockAgent::connect(&socket, "A").await.unwrap();
    let router = daemon.router().clone();
    wait_until(Duration::from_secs(2), || {
        router.agent_connection("A").is_some() && router.agent_connection("B").is_some()
    })
    .await;

    // Three deliveries land; B receives but never acks.
    let mut sent_ids = Vec::new();
    for body in ["one", "two", "three"] {
        a.send_message("B", body).await.unwrap();
        let deliver = b.recv_deliver(Duration::from_secs(2)).await.unwrap();
        sent_ids.push(deliver.id.clone());
    }
    let tracker = daemon.router().tracker().clone();
    assert!(wait_until(Duration::from_secs(1), || tracker.pending_count() == 3).await);

    // B drops; pending entries are cancelled without being failed.
    b.close().await.unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || tracker.pending_count() == 0).await,
        "unregister should cancel pending entries"
    );

    // Reconnect with the SAME session id: all three replay in seq order.
    let mut b = MockAgent::connect_with_session(&socket, "B", "s-9", EntityKind::Agent)
        .await
        .unwrap();
    let mut replayed = Vec::new();
    let mut seqs = Vec::new();
    for _ in 0..3 {
        let deliver = b.recv_deliver(Duration::from_secs(2)).await.unwrap();
        let Body::Deliver { delivery, .. } = &deliver.body else {
            panic!("expected DELIVER");
        };
        seqs.push(delivery.seq);
        replayed.push(deliver.id.clone());
    }
    assert_eq!(replayed, sent_ids, "replay keeps ids and original order");
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    assert_eq!(seqs, sorted, "replay is ordered by stored delivery seq");

    // Replayed deliveries are re-tracked until acked.
    assert!(wait_until(Duration::from_secs(1), || tracker.pending_count() == 3).await);
    for id in &replayed {
        b.ack(id).await.unwrap();
    }
    assert!(wait_until(Duration::from_secs(2), || tracker.pending_count() == 0).await);

    daemon.stop().await;
}

#[tokio::test]
async fn reconnect_with_new_session_does_not_replay() {
    let root = ScratchRoot::new().unwrap();
    let daemon = RelayDaemon::start(test_config(root.path())).await.unwrap();
    let socket = daemon.config().socket_path.clone();

    let mut b = MockAgent::connect_with_session(&socket, "B", "s-old", EntityKind::Agent)
        .await
        .unwrap();
    let mut a = MockAgent::connect(&socket, "A").await.unwrap();
    let router = daemon.router().clone();
    wait_until(Duration::from_secs(2), || {
        router.agent_connection("A").is_some() && router.agent_connection("B").is_some()
    })
    .await;

    a.send_message("B", "lost to the old session").await.unwrap();
    b.recv_deliver(Duration::from_secs(2)).await.unwrap();
    b.close().await.unwrap();
    let tracker = daemon.router().tracker().clone();
    wait_until(Duration::from_secs(2), || tracker.pending_count() == 0).await;

    // A different session id does not resume the old session's deliveries.
    let mut b = MockAgent::connect_with_session(&socket, "B", "s-new", EntityKind::Agent)
        .await
        .unwrap();
    assert!(
        b.recv_deliver(Duration::from_millis(400)).await.is_err(),
        "no replay for a fresh session"
    );

    daemon.stop().await;
}
