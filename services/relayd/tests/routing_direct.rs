/// Direct message delivery over a live daemon socket.
///
/// Validates:
/// - DELIVER carries the sender, body, seq 1, and the recipient's session id
/// - ACK settles the pending delivery
/// - the recipient's processing flag clears when it next sends
use relay_test_utils::{wait_until, MockAgent, ScratchRoot};
use relay_protocol::{Body, EntityKind};
use relayd::delivery::RetryConfig;
use relayd::RelayDaemon;
use std::time::Duration;

fn test_config(root: &std::path::Path) -> relayd::config::RelayConfig {
    let mut config = relayd::config::load_config_from_str("").unwrap();
    config.root_dir = root.to_owned();
    config.socket_path = root.join("relay.sock");
    config.watchdog.settle = Duration::from_millis(50);
    config.watchdog.reconcile_interval = Duration::from_secs(60);
    config.delivery = RetryConfig {
        base: Duration::from_millis(200),
        multiplier: 2,
        max_attempts: 3,
        ttl: Duration::from_secs(5),
    };
    config
}

#[tokio::test]
async fn direct_message_deliver_ack_processing() {
    let root = ScratchRoot::new().unwrap();
    let daemon = RelayDaemon::start(test_config(root.path())).await.unwrap();
    let socket = daemon.config().socket_path.clone();

    let mut b = MockAgent::connect_with_session(&socket, "B", "s-42", EntityKind::Agent)
        .await
        .unwrap();
    let mut a = MockAgent::connect(&socket, "A").await.unwrap();
    let router = daemon.router().clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            router.agent_connection("A").is_some() && router.agent_connection("B").is_some()
        })
        .await,
        "both agents should register"
    );

    a.send_message("B", "hi").await.unwrap();

    let deliver = b.recv_deliver(Duration::from_secs(2)).await.unwrap();
    assert_eq!(deliver.from.as_deref(), Some("A"));
    assert_eq!(deliver.to.as_deref(), Some("B"));
    let Body::Deliver { payload, delivery } = &deliver.body else {
        panic!("expected DELIVER");
    };
    assert_eq!(payload.body, "hi");
    assert_eq!(delivery.seq, 1);
    assert_eq!(delivery.session_id, "s-42");
    assert!(delivery.original_to.is_none());

    // Tracked until acked; B is marked processing.
    let tracker = daemon.router().tracker().clone();
    assert!(wait_until(Duration::from_secs(1), || tracker.pending_count() == 1).await);
    assert!(wait_until(Duration::from_secs(1), || router.is_processing("B")).await);

    b.ack(&deliver.id).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || tracker.pending_count() == 0).await,
        "pending count should drop after ack"
    );
    // The ACK is a message from B, so B's processing flag has cleared.
    assert!(
        wait_until(Duration::from_secs(1), || !router.is_processing("B")).await,
        "processing flag should clear once B speaks"
    );

    // Seq is strictly increasing for the same (topic, sender) pair.
    a.send_message("B", "again").await.unwrap();
    let second = b.recv_deliver(Duration::from_secs(2)).await.unwrap();
    let Body::Deliver { delivery, .. } = &second.body else {
        panic!("expected DELIVER");
    };
    assert_eq!(delivery.seq, 2);
    b.ack(&second.id).await.unwrap();

    daemon.stop().await;
}

#[tokio::test]
async fn unacked_delivery_is_retried() {
    let root = ScratchRoot::new().unwrap();
    let daemon = RelayDaemon::start(test_config(root.path())).await.unwrap();
    let socket = daemon.config().socket_path.clone();

    let mut b = MockAgent::connect(&socket, "B").await.unwrap();
    let mut a = MockAgent::connect(&socket, "A").await.unwrap();
    let router = daemon.router().clone();
    wait_until(Duration::from_secs(2), || {
        router.agent_connection("A").is_some() && router.agent_connection("B").is_some()
    })
    .await;

    a.send_message("B", "needs ack").await.unwrap();

    // First delivery, then a retry with the same envelope id.
    let first = b.recv_deliver(Duration::from_secs(2)).await.unwrap();
    let retry = b.recv_deliver(Duration::from_secs(2)).await.unwrap();
    assert_eq!(first.id, retry.id, "retries carry the same delivery id");

    b.ack(&first.id).await.unwrap();
    let tracker = daemon.router().tracker().clone();
    assert!(wait_until(Duration::from_secs(2), || tracker.pending_count() == 0).await);

    daemon.stop().await;
}

#[tokio::test]
async fn duplicate_envelope_id_is_suppressed() {
    let root = ScratchRoot::new().unwrap();
    let mut config = test_config(root.path());
    // Slow retries so a retransmit of the first delivery cannot be mistaken
    // for a duplicate-induced second delivery.
    config.delivery.base = Duration::from_secs(5);
    let daemon = RelayDaemon::start(config).await.unwrap();
    let socket = daemon.config().socket_path.clone();

    let mut b = MockAgent::connect(&socket, "B").await.unwrap();
    let mut a = MockAgent::connect(&socket, "A").await.unwrap();
    let router = daemon.router().clone();
    wait_until(Duration::from_secs(2), || {
        router.agent_connection("A").is_some() && router.agent_connection("B").is_some()
    })
    .await;

    // The same SEND envelope arrives twice (a client retransmit); only one
    // delivery results.
    let envelope = relay_protocol::Envelope::new(Body::Send {
        payload: relay_protocol::MessagePayload {
            kind: "message".to_owned(),
            body: "once only".to_owned(),
            data: None,
            thread: None,
        },
    })
    .with_from("A")
    .with_to("B");
    a.send(envelope.clone()).await.unwrap();
    a.send(envelope).await.unwrap();

    let first = b.recv_deliver(Duration::from_secs(2)).await.unwrap();
    b.ack(&first.id).await.unwrap();
    assert!(
        b.recv_deliver(Duration::from_millis(400)).await.is_err(),
        "the duplicate must produce no second delivery"
    );

    daemon.stop().await;
}

#[tokio::test]
async fn processing_state_clears_on_timeout() {
    let root = ScratchRoot::new().unwrap();
    let mut config = test_config(root.path());
    config.processing_timeout = Duration::from_millis(200);
    let daemon = RelayDaemon::start(config).await.unwrap();
    let socket = daemon.config().socket_path.clone();

    let mut b = MockAgent::connect(&socket, "B").await.unwrap();
    let mut a = MockAgent::connect(&socket, "A").await.unwrap();
    let router = daemon.router().clone();
    wait_until(Duration::from_secs(2), || {
        router.agent_connection("A").is_some() && router.agent_connection("B").is_some()
    })
    .await;

    a.send_message("B", "think about it").await.unwrap();
    let deliver = b.recv_deliver(Duration::from_secs(2)).await.unwrap();
    b.ack(&deliver.id).await.unwrap();

    // B acked (clearing once), then another delivery arrives and B stays
    // silent: the watchdog clears the flag on its own.
    a.send_message("B", "and this").await.unwrap();
    let second = b.recv_deliver(Duration::from_secs(2)).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(1), || router.is_processing("B")).await,
        "delivery should set the processing flag"
    );
    assert!(
        wait_until(Duration::from_secs(2), || !router.is_processing("B")).await,
        "the 200 ms watchdog should clear the flag without any send from B"
    );
    b.ack(&second.id).await.unwrap();

    daemon.stop().await;
}

#[tokio::test]
async fn newer_connection_wins_name_collision() {
    let root = ScratchRoot::new().unwrap();
    let daemon = RelayDaemon::start(test_config(root.path())).await.unwrap();
    let socket = daemon.config().socket_path.clone();

    let _first = MockAgent::connect(&socket, "Twin").await.unwrap();
    let router = daemon.router().clone();
    wait_until(Duration::from_secs(2), || {
        router.agent_connection("Twin").is_some()
    })
    .await;
    let first_id = daemon.router().agent_connection("Twin").unwrap().id;

    let _second = MockAgent::connect(&socket, "Twin").await.unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            router
                .agent_connection("Twin")
                .is_some_and(|conn| conn.id != first_id)
        })
        .await,
        "the newer connection should replace the older one"
    );

    daemon.stop().await;
}
