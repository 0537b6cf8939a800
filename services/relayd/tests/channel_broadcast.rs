/// Channel membership and fan-out.
///
/// Validates:
/// - every member except the sender receives a channel message exactly once
/// - exactly one row is stored for the fan-out, addressed to the channel
/// - membership matching is case-insensitive
use relay_test_utils::{wait_until, MockAgent, ScratchRoot};
use relay_protocol::{Body, ChannelMemberPayload, ChannelMessagePayload, Envelope};
use relayd::RelayDaemon;
use std::time::Duration;

fn test_config(root: &std::path::Path) -> relayd::config::RelayConfig {
    let mut config = relayd::config::load_config_from_str("").unwrap();
    config.root_dir = root.to_owned();
    config.socket_path = root.join("relay.sock");
    config.watchdog.reconcile_interval = Duration::from_secs(60);
    config
}

async fn join(agent: &mut MockAgent, channel: &str) {
    agent
        .send(
            Envelope::new(Body::ChannelJoin {
                payload: ChannelMemberPayload {
                    channel: channel.to_owned(),
                    member: None,
                },
            })
            .with_from(agent.name.clone()),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn channel_message_reaches_every_member_but_the_sender() {
    let root = ScratchRoot::new().unwrap();
    let daemon = RelayDaemon::start(test_config(root.path())).await.unwrap();
    let socket = daemon.config().socket_path.clone();

    let mut lead = MockAgent::connect(&socket, "Lead").await.unwrap();
    let mut worker1 = MockAgent::connect(&socket, "Worker1").await.unwrap();
    let mut worker2 = MockAgent::connect(&socket, "Worker2").await.unwrap();

    join(&mut lead, "#general").await;
    join(&mut worker1, "#general").await;
    join(&mut worker2, "#general").await;
    let router = daemon.router().clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            router.channel_members("#general").len() == 3
        })
        .await,
        "all three members should join"
    );

    let sent = Envelope::new(Body::ChannelMessage {
        payload: ChannelMessagePayload {
            channel: "#general".to_owned(),
            body: "done".to_owned(),
            thread: None,
            mentions: None,
        },
    })
    .with_from("Worker1");
    worker1.send(sent.clone()).await.unwrap();

    // Lead and Worker2 each receive it; join notifications may arrive first.
    for agent in [&mut lead, &mut worker2] {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .expect("channel message should arrive");
            let envelope = agent.recv(remaining).await.unwrap();
            if let Body::ChannelMessage { payload } = &envelope.body {
                assert_eq!(envelope.from.as_deref(), Some("Worker1"));
                assert_eq!(payload.body, "done");
                break;
            }
        }
    }

    // No echo to the sender (join notifications may still drain through).
    let echo_deadline = tokio::time::Instant::now() + Duration::from_millis(300);
    while let Some(remaining) =
        echo_deadline.checked_duration_since(tokio::time::Instant::now())
    {
        match worker1.recv(remaining).await {
            Ok(envelope) => assert!(
                !matches!(envelope.body, Body::ChannelMessage { .. }),
                "sender must not receive its own channel message"
            ),
            Err(_) => break,
        }
    }

    // Exactly one stored row, addressed to the channel.
    let storage = daemon.storage().clone();
    let row = {
        let store = storage.lock().await;
        store.get_message(&sent.id).unwrap().expect("row stored")
    };
    assert_eq!(row.recipient.as_deref(), Some("#general"));
    assert!(row.is_channel_message);
    assert!(row.is_broadcast);
    assert_eq!(
        row.data
            .as_ref()
            .and_then(|d| d.get("_isChannelMessage"))
            .and_then(serde_json::Value::as_bool),
        Some(true)
    );

    daemon.stop().await;
}

#[tokio::test]
async fn membership_is_case_insensitive_and_empty_channels_vanish() {
    let root = ScratchRoot::new().unwrap();
    let daemon = RelayDaemon::start(test_config(root.path())).await.unwrap();
    let socket = daemon.config().socket_path.clone();

    let mut lead = MockAgent::connect(&socket, "Lead").await.unwrap();
    join(&mut lead, "#Builds").await;
    let router = daemon.router().clone();
    assert!(
        wait_until(Duration::from_secs(2), || {
            router.channel_members("#builds") == vec!["Lead".to_owned()]
        })
        .await,
        "lookup under different casing should find the member with stored casing"
    );

    // Leave under different casing; the channel empties and is deleted.
    lead.send(
        Envelope::new(Body::ChannelLeave {
            payload: ChannelMemberPayload {
                channel: "#BUILDS".to_owned(),
                member: None,
            },
        })
        .with_from("Lead"),
    )
    .await
    .unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            router.channel_members("#builds").is_empty()
        })
        .await,
        "empty channel should be deleted"
    );

    daemon.stop().await;
}

#[tokio::test]
async fn membership_survives_reconnect_via_auto_rejoin() {
    let root = ScratchRoot::new().unwrap();
    let daemon = RelayDaemon::start(test_config(root.path())).await.unwrap();
    let socket = daemon.config().socket_path.clone();

    let mut bot = MockAgent::connect(&socket, "Bot").await.unwrap();
    join(&mut bot, "#ops").await;
    let router = daemon.router().clone();
    wait_until(Duration::from_secs(2), || {
        router.channel_members("#ops").len() == 1
    })
    .await;

    bot.close().await.unwrap();
    wait_until(Duration::from_secs(2), || {
        router.channel_members("#ops").is_empty()
    })
    .await;

    // Reconnect: persisted membership silently restores.
    let _bot = MockAgent::connect(&socket, "Bot").await.unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            router.channel_members("#ops") == vec!["Bot".to_owned()]
        })
        .await,
        "membership should auto-rejoin from the store"
    );

    daemon.stop().await;
}
