use std::time::Duration;

use snapnet_client::{ClientConnection, ConnState, InputState};
use snapnet_server::{GameServer, PeerPhase};
use snapnet_shared::config::ClientConfig;
use snapnet_shared::net::{DeflateCompressor, SystemClock, UdpTransport};

/// Smoke test: server can run a few ticks without a client.
#[tokio::test]
async fn server_runs_few_ticks() -> anyhow::Result<()> {
    let mut server = GameServer::bind_ephemeral(8)?;
    server.run_for_ticks(3).await?;
    assert_eq!(server.frame_count(), 3);
    assert_eq!(server.phase(), PeerPhase::Free);
    Ok(())
}

/// Full handshake over real UDP sockets with deflated userinfo.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn udp_client_reaches_active() -> anyhow::Result<()> {
    snapnet_tests::init_tracing();

    let mut server = GameServer::bind_ephemeral(17)?;
    let addr = server.local_addr()?;

    let socket = UdpTransport::connect(addr)?;
    let mut client = ClientConnection::new(
        ClientConfig {
            server_addr: addr.to_string(),
            protocol: 17,
            player_name: "udp".into(),
            ..ClientConfig::default()
        },
        socket,
        SystemClock::new(),
        Box::new(DeflateCompressor),
    )?;
    client.connect()?;

    let input = InputState {
        forward: 1.0,
        ..InputState::default()
    };
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        server.frame()?;
        for _ in 0..5 {
            client.tick(&input)?;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if client.state() == ConnState::Active && server.phase() == PeerPhase::Active {
            break;
        }
    }

    assert_eq!(client.state(), ConnState::Active);
    assert_eq!(server.phase(), PeerPhase::Active);
    assert_eq!(server.player_name(), "udp");

    client.disconnect()?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.frame()?;
    assert_eq!(server.phase(), PeerPhase::Free);
    Ok(())
}
