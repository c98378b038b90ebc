//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p snapnet_client -- [--addr 127.0.0.1:12203] [--protocol 8] [--name Player]
//!                                  [--config client.json]
//!
//! Console commands:
//!   status      - Show connection status
//!   forward <f> - Set the forward axis (-1..1)
//!   turn <yaw>  - Set the view yaw in degrees
//!   disconnect  - Leave the server
//!   quit        - Exit client
//! Anything else is sent to the server as a reliable command.

use std::env;
use std::io::{BufRead, Write};
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use snapnet_client::{ClientConnection, ConnState, ConnectionEvent, InputState};
use snapnet_shared::config::ClientConfig;
use snapnet_shared::net::{DeflateCompressor, SystemClock, UdpTransport};
use tokio::sync::mpsc;
use tracing::{info, warn};

const FRAME: Duration = Duration::from_millis(16);

fn parse_args() -> anyhow::Result<ClientConfig> {
    let args: Vec<String> = env::args().collect();
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => {
            let text = std::fs::read_to_string(&args[i + 1]).context("read config")?;
            ClientConfig::from_json_str(&text).context("parse config")?
        }
        _ => ClientConfig::default(),
    };
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--protocol" if i + 1 < args.len() => {
                cfg.protocol = args[i + 1].parse().context("parse protocol")?;
                i += 2;
            }
            "--name" if i + 1 < args.len() => {
                cfg.player_name = args[i + 1].clone();
                i += 2;
            }
            "--no-predict" => {
                cfg.predict = false;
                i += 1;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

fn report(event: ConnectionEvent) {
    match event {
        ConnectionEvent::ServerCommand { sequence, text } => {
            info!(sequence, %text, "server command")
        }
        ConnectionEvent::GamestateLoaded {
            server_id,
            client_num,
        } => info!(server_id, client_num, "gamestate"),
        ConnectionEvent::SnapshotReceived {
            message_num,
            server_time,
        } => {
            if message_num % 100 == 0 {
                info!(message_num, server_time, "snapshot");
            }
        }
        ConnectionEvent::Centerprint(text) => println!("{text}"),
        ConnectionEvent::Locprint { x, y, text } => println!("[{x},{y}] {text}"),
        ConnectionEvent::CgameMessage(data) => info!(bytes = data.len(), "cgame message"),
        ConnectionEvent::DownloadBlock { block, data } => {
            info!(block, bytes = data.len(), "download block")
        }
        ConnectionEvent::ProtocolError(err) => warn!(%err, "protocol error"),
        ConnectionEvent::TimedOut => warn!("server is not responding"),
        ConnectionEvent::Disconnected { reason } => info!(%reason, "disconnected"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    let server: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
    info!(%server, protocol = cfg.protocol, "Starting client");

    let socket = UdpTransport::connect(server).context("bind udp")?;
    let mut client = ClientConnection::new(
        cfg,
        socket,
        SystemClock::new(),
        Box::new(DeflateCompressor),
    )
    .context("create connection")?;
    client.connect().context("connect")?;

    // Set up console input channel.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);

    // Spawn stdin reader thread.
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            if stdin.lock().read_line(&mut line).is_err() {
                break;
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    let mut input = InputState::default();
    let mut interval = tokio::time::interval(FRAME);

    loop {
        while let Ok(line) = console_rx.try_recv() {
            let (cmd, arg) = line.split_once(' ').unwrap_or((line.as_str(), ""));
            match cmd {
                "quit" => {
                    client.disconnect()?;
                    return Ok(());
                }
                "disconnect" => client.disconnect()?,
                "status" => {
                    let ps = client.predicted_state();
                    println!(
                        "state: {}  server time: {}  origin: {:?}",
                        client.state(),
                        client.server_time(),
                        ps.origin
                    );
                    if let Some(snap) = client.snapshot() {
                        println!(
                            "snapshot {} ({} entities, ping {:?})",
                            snap.message_num, snap.num_entities, snap.ping
                        );
                    }
                }
                "forward" => input.forward = arg.parse().unwrap_or(0.0),
                "turn" => input.view_angles.y = arg.parse().unwrap_or(0.0),
                _ => {
                    if let Err(e) = client.add_reliable_command(&line) {
                        println!("Error: {e}");
                    }
                }
            }
        }

        if let Err(e) = client.tick(&input) {
            warn!(%e, "tick failed");
        }
        for event in client.drain_events() {
            report(event);
        }

        if client.state() == ConnState::Disconnected {
            println!("Disconnected from server.");
            break;
        }

        interval.tick().await;
    }

    Ok(())
}
