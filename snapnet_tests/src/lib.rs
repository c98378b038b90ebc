//! Lockstep loopback harness.
//!
//! Runs a [`GameServer`] and a [`ClientConnection`] over an in-memory
//! datagram pair on a manual clock. The client ticks every
//! [`CLIENT_TICK_MS`]; the server runs a frame whenever a full server frame
//! has elapsed.

use snapnet_client::{ClientConnection, ConnState, ConnectionEvent, InputState};
use snapnet_server::{GameServer, PeerPhase};
use snapnet_shared::config::{ClientConfig, ServerConfig};
use snapnet_shared::net::{ManualClock, MemorySocket, PassthroughCompressor};

pub const CLIENT_TICK_MS: u64 = 10;

pub type TestClient = ClientConnection<MemorySocket, ManualClock>;

pub struct Loopback {
    pub server: GameServer<MemorySocket>,
    pub client: TestClient,
    pub clock: ManualClock,
    pub input: InputState,
    /// Every event the client produced, in order.
    pub events: Vec<ConnectionEvent>,
    /// Whether the server runs its frames; off simulates a dead server.
    pub server_running: bool,
    since_frame: u64,
}

impl Loopback {
    pub fn new(protocol: u32) -> anyhow::Result<Self> {
        Self::with_configs(
            ServerConfig {
                protocol,
                checksum_feed: Some(0x5eed),
                ..ServerConfig::default()
            },
            ClientConfig {
                protocol,
                qport: Some(27960),
                player_name: "tester".into(),
                ..ClientConfig::default()
            },
        )
    }

    pub fn with_configs(server: ServerConfig, client: ClientConfig) -> anyhow::Result<Self> {
        init_tracing();
        let (server_end, client_end) = MemorySocket::pair();
        let clock = ManualClock::new(1_000);
        let server = GameServer::new(server, server_end, Box::new(PassthroughCompressor))?;
        let client = ClientConnection::new(
            client,
            client_end,
            clock.clone(),
            Box::new(PassthroughCompressor),
        )?;
        Ok(Self {
            server,
            client,
            clock,
            input: InputState::default(),
            events: Vec::new(),
            server_running: true,
            since_frame: 0,
        })
    }

    /// One client tick, plus a server frame when one is due.
    pub fn step(&mut self) -> anyhow::Result<()> {
        self.clock.advance(CLIENT_TICK_MS);
        self.since_frame += CLIENT_TICK_MS;
        let frame_msec = u64::from(self.server.cfg.frame_msec());
        if self.since_frame >= frame_msec {
            self.since_frame -= frame_msec;
            if self.server_running {
                self.server.frame()?;
            }
        }
        self.client.tick(&self.input)?;
        self.events.extend(self.client.drain_events());
        Ok(())
    }

    pub fn run_ms(&mut self, ms: u64) -> anyhow::Result<()> {
        for _ in 0..ms / CLIENT_TICK_MS {
            self.step()?;
        }
        Ok(())
    }

    /// Steps until `done` holds or `max_ms` passes; returns whether it held.
    pub fn run_until(
        &mut self,
        max_ms: u64,
        mut done: impl FnMut(&Self) -> bool,
    ) -> anyhow::Result<bool> {
        for _ in 0..max_ms / CLIENT_TICK_MS {
            if done(self) {
                return Ok(true);
            }
            self.step()?;
        }
        Ok(done(self))
    }

    /// Connects and runs until both ends are in the game.
    pub fn connect(&mut self) -> anyhow::Result<()> {
        self.client.connect()?;
        let active = self.run_until(2_000, |lb| {
            lb.client.state() == ConnState::Active && lb.server.phase() == PeerPhase::Active
        })?;
        anyhow::ensure!(
            active,
            "not active: client {} server {:?}",
            self.client.state(),
            self.server.phase()
        );
        Ok(())
    }

    /// Datagram loss on both directions; 0 turns it off.
    pub fn set_loss(&self, drop_every: u64) {
        self.server.socket().set_drop_every(drop_every);
        self.client.socket().set_drop_every(drop_every);
    }

    pub fn server_commands(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ConnectionEvent::ServerCommand { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Test logging; the first call wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}
