//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p snapnet_server -- [--addr 127.0.0.1:12203] [--protocol 8] [--tick-hz 20]
//!                                  [--map dm/flat] [--config server.json]
//!
//! The server waits for one client, sends it a gamestate and then a snapshot
//! every frame.
//!
//! Console commands:
//!   status           - Show server status
//!   spawn <n> <x> <y> - Add entity n at (x, y, 0)
//!   remove <n>       - Remove entity n
//!   say <text>       - Centerprint to the client
//!   restart          - Restart the map (new server id)
//!   kick [reason]    - Disconnect the client
//!   quit             - Shutdown server
//! Anything else is sent to the client as a reliable command.

use std::env;
use std::io::{BufRead, Write};
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use snapnet_server::GameServer;
use snapnet_shared::config::ServerConfig;
use snapnet_shared::math::Vec3;
use snapnet_shared::net::{DeflateCompressor, UdpTransport};
use snapnet_shared::state::EntityState;
use tokio::sync::mpsc;
use tracing::{info, warn};

fn parse_args() -> anyhow::Result<ServerConfig> {
    let args: Vec<String> = env::args().collect();
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => {
            let text = std::fs::read_to_string(&args[i + 1]).context("read config")?;
            ServerConfig::from_json_str(&text).context("parse config")?
        }
        _ => ServerConfig::default(),
    };
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.addr = args[i + 1].clone();
                i += 2;
            }
            "--protocol" if i + 1 < args.len() => {
                cfg.protocol = args[i + 1].parse().context("parse protocol")?;
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().unwrap_or(20);
                i += 2;
            }
            "--map" if i + 1 < args.len() => {
                cfg.map = args[i + 1].clone();
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

fn console_command(server: &mut GameServer<UdpTransport>, line: &str) -> anyhow::Result<bool> {
    let mut words = line.split_whitespace();
    match words.next().unwrap_or_default() {
        "quit" => {
            server.kick("server quit")?;
            return Ok(false);
        }
        "status" => {
            let ps = server.player_state();
            println!(
                "time: {}  phase: {:?}  player: {:?}  origin: {:?}",
                server.time(),
                server.phase(),
                server.player_name(),
                ps.origin
            );
        }
        "spawn" => {
            let mut nums = words.map(|w| w.parse::<f32>().unwrap_or(0.0));
            let number = nums.next().unwrap_or(1.0) as u16;
            let mut es = EntityState::with_number(number);
            es.origin = Vec3::new(nums.next().unwrap_or(0.0), nums.next().unwrap_or(0.0), 0.0);
            server.spawn_entity(es);
        }
        "remove" => {
            if let Some(n) = words.next().and_then(|w| w.parse().ok()) {
                server.remove_entity(n);
            }
        }
        "say" => {
            let text = line.split_once(' ').map_or("", |(_, t)| t);
            server.centerprint(text);
        }
        "restart" => server.restart_map(),
        "kick" => {
            let reason = line.split_once(' ').map_or("kicked", |(_, t)| t);
            server.kick(reason)?;
        }
        _ => {
            if let Err(e) = server.queue_server_command(line) {
                println!("Error: {e}");
            }
        }
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    let addr: SocketAddr = cfg.addr.parse().context("parse addr")?;
    info!(%addr, protocol = cfg.protocol, tick_hz = cfg.tick_hz, map = %cfg.map, "Starting server");

    let socket = UdpTransport::listen(addr).context("bind udp")?;
    info!(local = %socket.local_addr()?, "Server listening");
    let tick_interval = Duration::from_millis(cfg.frame_msec() as u64);
    let mut server =
        GameServer::new(cfg, socket, Box::new(DeflateCompressor)).context("create server")?;

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

    println!("Server ready. Type 'status' for info, 'quit' to exit.");
    println!();

    // Main server loop.
    let mut next_tick = tokio::time::Instant::now();
    loop {
        while let Ok(line) = console_rx.try_recv() {
            if !console_command(&mut server, &line)? {
                return Ok(());
            }
        }

        if let Err(e) = server.frame() {
            warn!(%e, "server frame failed");
        }
        for (seq, text) in server.take_client_commands() {
            info!(seq, %text, "client command");
        }

        // Wait for next tick.
        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }
}
