/// Spawn manager contract with the router.
///
/// Validates:
/// - a failed SPAWN replies with success=false and clears the spawning flag
/// - messages sent to a spawning name are queued, not dropped, and arrive
///   once the child's HELLO registers
/// - RELEASE for an unknown name reports failure
use relay_test_utils::{wait_until, MockAgent, ScratchRoot};
use relay_protocol::{Body, Envelope, ReleasePayload, SpawnPayload};
use relayd::RelayDaemon;
use std::time::Duration;

fn test_config(root: &std::path::Path) -> relayd::config::RelayConfig {
    let mut config = relayd::config::load_config_from_str("").unwrap();
    config.root_dir = root.to_owned();
    config.socket_path = root.join("relay.sock");
    config.watchdog.reconcile_interval = Duration::from_secs(60);
    config
}

#[tokio::test]
async fn failed_spawn_reports_error_and_clears_spawning() {
    let root = ScratchRoot::new().unwrap();
    let daemon = RelayDaemon::start(test_config(root.path())).await.unwrap();
    let socket = daemon.config().socket_path.clone();

    let mut caller = MockAgent::connect(&socket, "Caller").await.unwrap();
    let router = daemon.router().clone();
    wait_until(Duration::from_secs(2), || {
        router.agent_connection("Caller").is_some()
    })
    .await;

    caller
        .send(
            Envelope::new(Body::Spawn {
                payload: SpawnPayload {
                    name: "Ghost".to_owned(),
                    cli: "relayd-no-such-binary".to_owned(),
                    task: None,
                    model: None,
                    cwd: None,
                },
            })
            .with_from("Caller"),
        )
        .await
        .unwrap();

    let reply = caller.recv(Duration::from_secs(2)).await.unwrap();
    let Body::SpawnResult { payload } = &reply.body else {
        panic!("expected SPAWN_RESULT, got {:?}", reply.body);
    };
    assert!(!payload.success);
    assert!(payload.pid.is_none());
    assert!(payload.error.is_some());
    assert!(
        !daemon.router().is_spawning("Ghost"),
        "failed spawn must clear the spawning flag"
    );

    daemon.stop().await;
}

#[tokio::test]
async fn messages_to_a_spawning_name_are_queued_until_hello() {
    let root = ScratchRoot::new().unwrap();
    let daemon = RelayDaemon::start(test_config(root.path())).await.unwrap();
    let socket = daemon.config().socket_path.clone();

    let mut a = MockAgent::connect(&socket, "A").await.unwrap();
    let router = daemon.router().clone();
    wait_until(Duration::from_secs(2), || {
        router.agent_connection("A").is_some()
    })
    .await;

    // The spawner marks the name before the child can HELLO.
    daemon.router().mark_spawning("Newbie");
    assert!(daemon.router().is_spawning("Newbie"));

    a.send_message("Newbie", "early mail").await.unwrap();
    let storage = daemon.storage().clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            storage
                .try_lock()
                .map(|store| {
                    store
                        .offline_queued_for("Newbie")
                        .map(|rows| rows.len() == 1)
                        .unwrap_or(false)
                })
                .unwrap_or(false)
        })
        .await,
        "messages during spawn are queued, not dropped"
    );

    // The child's HELLO clears the flag and drains the queue.
    let mut newbie = MockAgent::connect(&socket, "Newbie").await.unwrap();
    let deliver = newbie.recv_deliver(Duration::from_secs(2)).await.unwrap();
    let Body::Deliver { payload, .. } = &deliver.body else {
        panic!("expected DELIVER");
    };
    assert_eq!(payload.body, "early mail");
    assert!(!daemon.router().is_spawning("Newbie"));

    daemon.stop().await;
}

#[tokio::test]
async fn release_of_unknown_agent_reports_failure() {
    let root = ScratchRoot::new().unwrap();
    let daemon = RelayDaemon::start(test_config(root.path())).await.unwrap();
    let socket = daemon.config().socket_path.clone();

    let mut caller = MockAgent::connect(&socket, "Caller").await.unwrap();
    let router = daemon.router().clone();
    wait_until(Duration::from_secs(2), || {
        router.agent_connection("Caller").is_some()
    })
    .await;

    caller
        .send(
            Envelope::new(Body::Release {
                payload: ReleasePayload {
                    name: "NeverSpawned".to_owned(),
                },
            })
            .with_from("Caller"),
        )
        .await
        .unwrap();

    let reply = caller.recv(Duration::from_secs(2)).await.unwrap();
    let Body::ReleaseResult { payload } = &reply.body else {
        panic!("expected RELEASE_RESULT, got {:?}", reply.body);
    };
    assert!(!payload.success);
    assert!(payload.error.is_some());

    daemon.stop().await;
}
