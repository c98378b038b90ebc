//! Client ↔ server integration over the in-memory loopback.

use snapnet_client::{ConnState, ConnectionEvent};
use snapnet_server::PeerPhase;
use snapnet_shared::config::{ClientConfig, ServerConfig};
use snapnet_shared::error::NetError;
use snapnet_shared::math::Vec3;
use snapnet_shared::protocol::{cs, info_value_for_key};
use snapnet_shared::state::EntityState;
use snapnet_tests::Loopback;

fn entity(number: u16, x: f32) -> EntityState {
    let mut es = EntityState::with_number(number);
    es.origin = Vec3::new(x, 0.0, 0.0);
    es
}

fn client_entity(lb: &Loopback, number: u16) -> Option<EntityState> {
    lb.client.entities().into_iter().find(|e| e.number == number)
}

#[test]
fn handshake_reaches_active_for_both_protocols() -> anyhow::Result<()> {
    for protocol in [8, 17] {
        let mut lb = Loopback::new(protocol)?;
        lb.connect()?;

        assert_eq!(lb.client.server_id(), lb.server.server_id());
        assert_eq!(lb.client.checksum_feed(), 0x5eed);
        assert_eq!(lb.client.client_num(), 0);
        assert_eq!(lb.server.player_name(), "tester");

        let serverinfo = lb.client.config_string(cs::SERVERINFO).unwrap_or_default();
        assert_eq!(info_value_for_key(serverinfo, "mapname"), Some("dm/flat"));
        assert_eq!(
            info_value_for_key(serverinfo, "protocol"),
            Some(protocol.to_string().as_str())
        );

        let gamestates = lb
            .events
            .iter()
            .filter(|e| matches!(e, ConnectionEvent::GamestateLoaded { .. }))
            .count();
        assert_eq!(gamestates, 1, "protocol {protocol}");
        assert!(lb.client.snapshot().is_some());
    }
    Ok(())
}

#[test]
fn baselines_and_deltas_replicate_entities() -> anyhow::Result<()> {
    let mut lb = Loopback::new(8)?;
    lb.server.spawn_entity(entity(3, 64.0));
    lb.connect()?;
    lb.run_ms(200)?;
    assert_eq!(client_entity(&lb, 3).map(|e| e.origin.x), Some(64.0));

    // new entity without a baseline
    lb.server.spawn_entity(entity(40, -16.0));
    lb.run_ms(200)?;
    assert_eq!(client_entity(&lb, 40), Some(entity(40, -16.0)));

    if let Some(es) = lb.server.entity_mut(3) {
        es.origin.x = 96.0;
    }
    lb.run_ms(200)?;
    assert_eq!(client_entity(&lb, 3).map(|e| e.origin.x), Some(96.0));
    // unchanged entities carry over from the delta base
    assert_eq!(client_entity(&lb, 40), Some(entity(40, -16.0)));

    lb.server.remove_entity(40);
    lb.run_ms(200)?;
    assert_eq!(client_entity(&lb, 40), None);

    // a re-added entity starts from its baseline, not the removed state
    lb.server.spawn_entity(entity(40, 8.0));
    lb.run_ms(200)?;
    assert_eq!(client_entity(&lb, 40), Some(entity(40, 8.0)));

    let numbers: Vec<u16> = lb.client.entities().iter().map(|e| e.number).collect();
    assert_eq!(numbers, vec![3, 40]);
    Ok(())
}

#[test]
fn snapshots_are_delta_compressed_once_acknowledged() -> anyhow::Result<()> {
    let mut lb = Loopback::new(17)?;
    lb.connect()?;
    lb.run_ms(500)?;
    let snap = lb.client.snapshot().expect("snapshot");
    assert!(snap.delta_num.is_some());
    assert!(snap.ping.is_some());

    let mut lb = Loopback::with_configs(
        ServerConfig::default(),
        ClientConfig {
            no_delta: true,
            ..ClientConfig::default()
        },
    )?;
    lb.connect()?;
    lb.run_ms(500)?;
    assert_eq!(lb.client.snapshot().and_then(|s| s.delta_num), None);
    Ok(())
}

#[test]
fn reliable_commands_arrive_once_and_in_order_under_loss() -> anyhow::Result<()> {
    let mut lb = Loopback::new(8)?;
    lb.connect()?;
    lb.set_loss(3);

    let mut received = Vec::new();
    for i in 0..12 {
        lb.client.add_reliable_command(&format!("say {i}"))?;
        lb.server.queue_server_command(&format!("print {i}"))?;
        lb.run_ms(60)?;
        received.extend(lb.server.take_client_commands());
    }
    lb.run_ms(1_500)?;
    received.extend(lb.server.take_client_commands());

    let texts: Vec<String> = received.into_iter().map(|(_, text)| text).collect();
    let expected: Vec<String> = (0..12).map(|i| format!("say {i}")).collect();
    assert_eq!(texts, expected);

    let expected: Vec<String> = (0..12).map(|i| format!("print {i}")).collect();
    assert_eq!(lb.server_commands(), expected);

    // moves kept flowing through the loss with a consistent integrity key
    assert_eq!(lb.client.state(), ConnState::Active);
    assert!(lb.server.player_state().command_time > 0);
    Ok(())
}

#[test]
fn oversized_command_leaves_the_channel_usable() -> anyhow::Result<()> {
    let mut lb = Loopback::new(8)?;
    lb.connect()?;
    lb.server.take_client_commands();

    let long = format!("say {}", "x".repeat(1_100));
    assert!(matches!(
        lb.client.add_reliable_command(&long),
        Err(NetError::StringTooLong(_))
    ));
    lb.client.add_reliable_command("say after")?;
    lb.run_ms(300)?;

    let texts: Vec<String> = lb
        .server
        .take_client_commands()
        .into_iter()
        .map(|(_, text)| text)
        .collect();
    assert_eq!(texts, vec!["say after".to_string()]);
    assert_eq!(lb.client.state(), ConnState::Active);
    assert!(!lb
        .events
        .iter()
        .any(|e| matches!(e, ConnectionEvent::ProtocolError(_))));
    Ok(())
}

#[test]
fn full_command_window_drains_after_server_silence() -> anyhow::Result<()> {
    let mut lb = Loopback::new(8)?;
    lb.connect()?;
    lb.server.take_client_commands();

    // 60 unacknowledged commands of ~300 bytes do not fit one datagram
    lb.server_running = false;
    let padding = "x".repeat(300);
    for i in 0..60 {
        lb.client.add_reliable_command(&format!("say {i:02} {padding}"))?;
        lb.run_ms(10)?;
    }
    lb.run_ms(200)?;

    lb.server_running = true;
    let mut received = Vec::new();
    for _ in 0..300 {
        lb.step()?;
        received.extend(lb.server.take_client_commands());
        if received.len() >= 60 {
            break;
        }
    }

    let texts: Vec<String> = received.into_iter().map(|(_, text)| text).collect();
    let expected: Vec<String> = (0..60).map(|i| format!("say {i:02} {padding}")).collect();
    assert_eq!(texts, expected);
    assert_eq!(lb.client.state(), ConnState::Active);
    Ok(())
}

#[test]
fn prediction_agrees_with_server_once_settled() -> anyhow::Result<()> {
    let mut lb = Loopback::new(8)?;
    lb.connect()?;

    lb.input.forward = 1.0;
    lb.input.view_angles.y = 90.0;
    lb.run_ms(1_000)?;
    lb.input.forward = 0.0;
    lb.run_ms(1_500)?;

    let server = lb.server.player_state().origin;
    let predicted = lb.client.predicted_state().origin;
    assert!(server.y > 50.0, "server did not move: {server:?}");
    assert!(server.x.abs() < 1.0);
    assert!(
        (server - predicted).len() < 0.5,
        "server {server:?} predicted {predicted:?}"
    );
    assert!(lb.client.predicted_state().velocity.len() < 1.0);
    Ok(())
}

#[test]
fn configstrings_and_unreliable_records_reach_the_client() -> anyhow::Result<()> {
    let mut lb = Loopback::new(17)?;
    lb.connect()?;

    lb.server.set_configstring(20, "models/crate.tik")?;
    lb.server.centerprint("round start");
    lb.server.locprint(10, 20, "objective");
    lb.server.cgame_message(&[1, 2, 3]);
    lb.server.download_block(0, b"data");
    lb.run_ms(200)?;

    assert_eq!(lb.client.config_string(20), Some("models/crate.tik"));
    assert!(lb
        .events
        .iter()
        .any(|e| matches!(e, ConnectionEvent::Centerprint(t) if t == "round start")));
    assert!(lb.events.iter().any(|e| matches!(
        e,
        ConnectionEvent::Locprint { x: 10, y: 20, text } if text == "objective"
    )));
    assert!(lb
        .events
        .iter()
        .any(|e| matches!(e, ConnectionEvent::CgameMessage(d) if d == &[1, 2, 3])));
    assert!(lb.events.iter().any(|e| matches!(
        e,
        ConnectionEvent::DownloadBlock { block: 0, data } if data == b"data"
    )));
    Ok(())
}

#[test]
fn map_restart_sends_a_new_gamestate() -> anyhow::Result<()> {
    let mut lb = Loopback::new(8)?;
    lb.connect()?;
    let old_id = lb.server.server_id();

    lb.server.restart_map();
    let back = lb.run_until(2_000, |lb| {
        lb.client.server_id() == lb.server.server_id()
            && lb.client.state() == ConnState::Active
            && lb.server.phase() == PeerPhase::Active
    })?;
    assert!(back);
    assert_ne!(lb.client.server_id(), old_id);

    let gamestates = lb
        .events
        .iter()
        .filter(|e| matches!(e, ConnectionEvent::GamestateLoaded { .. }))
        .count();
    assert_eq!(gamestates, 2);

    // commands queued after the restart still pass the integrity check
    lb.input.forward = 1.0;
    let before = lb.server.player_state().origin;
    lb.run_ms(500)?;
    assert!(lb.server.player_state().origin.x > before.x);
    Ok(())
}

#[test]
fn kick_disconnects_with_reason() -> anyhow::Result<()> {
    let mut lb = Loopback::new(8)?;
    lb.connect()?;

    lb.server.kick("kicked for testing")?;
    lb.run_ms(100)?;

    assert_eq!(lb.client.state(), ConnState::Disconnected);
    assert_eq!(lb.server.phase(), PeerPhase::Free);
    assert!(lb.events.iter().any(|e| matches!(
        e,
        ConnectionEvent::Disconnected { reason } if reason == "kicked for testing"
    )));
    Ok(())
}

#[test]
fn client_disconnect_frees_the_server_slot() -> anyhow::Result<()> {
    let mut lb = Loopback::new(17)?;
    lb.connect()?;

    lb.client.disconnect()?;
    lb.run_ms(100)?;
    assert_eq!(lb.server.phase(), PeerPhase::Free);
    assert_eq!(lb.client.state(), ConnState::Disconnected);
    Ok(())
}

#[test]
fn silent_server_times_out_once() -> anyhow::Result<()> {
    let mut lb = Loopback::with_configs(
        ServerConfig::default(),
        ClientConfig {
            timeout_ms: 1_000,
            ..ClientConfig::default()
        },
    )?;
    lb.connect()?;

    lb.server_running = false;
    lb.run_ms(3_000)?;
    let timeouts = lb
        .events
        .iter()
        .filter(|e| matches!(e, ConnectionEvent::TimedOut))
        .count();
    assert_eq!(timeouts, 1);

    // traffic resumes and the connection carries on
    lb.server_running = true;
    lb.run_ms(300)?;
    assert_eq!(lb.client.state(), ConnState::Active);
    Ok(())
}
