//! Server implementation.
//!
//! A single-peer authoritative server that speaks the same wire protocol as
//! the client. It exists to produce real gamestates and delta snapshots and
//! to consume real client packets:
//! - Connectionless handshake (challenge, connect)
//! - Reliable server commands, acknowledged client commands
//! - Keyed user commands run through the shared movement routine
//! - Delta snapshots merged against whatever frame the client acknowledged
//!
//! Determinism notes:
//! - Server time only advances in whole frames.
//! - Entities are kept in number order so the merge walks them in order.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use snapnet_shared::config::ServerConfig;
use snapnet_shared::delta::{read_eyes, read_usercmd, DeltaCodec};
use snapnet_shared::error::{NetError, NetResult};
use snapnet_shared::msg::{BitReader, BitWriter, MAX_MSGLEN, MAX_STRING_CHARS};
use snapnet_shared::net::{
    oob_packet, oob_payload, Compressor, DeflateCompressor, Socket, UdpTransport,
};
use snapnet_shared::pmove::{GroundMovement, MovementSimulator};
use snapnet_shared::protocol::{
    cs, info_set_value, info_value_for_key, strategy_for, ClientOp, GamestateTrailer,
    ProtocolStrategy, ServerOp, KEY_HASH_CHARS, MAX_CONFIGSTRINGS, MAX_RELIABLE_COMMANDS,
    PACKET_BACKUP,
};
use snapnet_shared::ring::SequenceRing;
use snapnet_shared::state::{
    EntityState, PlayerState, ServerSound, SnapFlags, UserCommand, UserEyes, ENTITYNUM_NONE,
};
use tracing::{debug, info, warn};

/// Room kept after server commands for the gamestate or snapshot.
const FRAME_RESERVE: usize = MAX_MSGLEN / 2;

/// Where the peer is in the connection flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeerPhase {
    Free,
    /// Challenge handed out, waiting for `connect`.
    Challenged,
    /// Connected; the next message carries the gamestate.
    Connected,
    /// Gamestate sent, no user command seen yet.
    Primed,
    Active,
}

/// What one snapshot contained, for deltas against it later.
#[derive(Debug, Clone)]
struct ClientFrame {
    ps: PlayerState,
    entities: Vec<EntityState>,
}

/// One-shot records sent with the next message.
#[derive(Debug, Clone)]
enum Unreliable {
    Centerprint(String),
    Locprint { x: i16, y: i16, text: String },
    CgameMessage(Vec<u8>),
    Download { block: u16, data: Vec<u8> },
}

struct Peer {
    phase: PeerPhase,
    challenge: i32,
    qport: u16,
    name: String,

    /// Newest client packet sequence.
    incoming_sequence: i32,
    outgoing_sequence: i32,
    /// Server message the client last heard.
    message_acknowledge: i32,
    delta_message: Option<i32>,

    reliable: SequenceRing<String>,
    reliable_sequence: i32,
    reliable_acknowledge: i32,
    /// Newest client command executed.
    last_client_command: i32,

    gamestate_message_num: i32,
    gamestate_command_seq: i32,

    ps: PlayerState,
    eyes: UserEyes,
    frames: SequenceRing<ClientFrame>,
    unreliable: Vec<Unreliable>,
}

impl Peer {
    fn new() -> Self {
        Self {
            phase: PeerPhase::Free,
            challenge: 0,
            qport: 0,
            name: String::new(),
            incoming_sequence: 0,
            outgoing_sequence: 1,
            message_acknowledge: 0,
            delta_message: None,
            // room for the acknowledged command next to a full window
            reliable: SequenceRing::new(2 * MAX_RELIABLE_COMMANDS),
            reliable_sequence: 0,
            reliable_acknowledge: 0,
            last_client_command: 0,
            gamestate_message_num: -1,
            gamestate_command_seq: 0,
            ps: PlayerState {
                ground_entity_num: ENTITYNUM_NONE,
                ..PlayerState::default()
            },
            eyes: UserEyes::default(),
            frames: SequenceRing::new(PACKET_BACKUP),
            unreliable: Vec::new(),
        }
    }

    /// Key the client used for this packet's user commands.
    fn integrity_key(&self, strategy: &dyn ProtocolStrategy) -> u32 {
        let last = if self.reliable_acknowledge > self.gamestate_command_seq {
            self.reliable
                .get(self.reliable_acknowledge)
                .map_or("", String::as_str)
        } else {
            ""
        };
        self.challenge as u32
            ^ self.message_acknowledge as u32
            ^ strategy.hash_key(last, KEY_HASH_CHARS)
    }
}

/// Game server.
pub struct GameServer<S: Socket> {
    pub cfg: ServerConfig,
    socket: S,
    compressor: Box<dyn Compressor>,
    strategy: &'static dyn ProtocolStrategy,
    codec: DeltaCodec,
    movement: Box<dyn MovementSimulator>,

    time: i32,
    frame_count: u64,
    server_id: i32,
    checksum_feed: i32,
    snap_flags: SnapFlags,
    config_strings: Vec<String>,

    entities: BTreeMap<u16, EntityState>,
    baselines: BTreeMap<u16, EntityState>,
    sounds: Vec<ServerSound>,

    peer: Peer,
    client_commands: Vec<(i32, String)>,
}

impl<S: Socket> GameServer<S> {
    pub fn new(cfg: ServerConfig, socket: S, compressor: Box<dyn Compressor>) -> NetResult<Self> {
        let strategy = strategy_for(cfg.protocol)?;
        let checksum_feed = cfg.checksum_feed.unwrap_or_else(rand::random);

        let mut config_strings = vec![String::new(); MAX_CONFIGSTRINGS];
        let mut serverinfo = String::new();
        info_set_value(&mut serverinfo, "mapname", &cfg.map);
        info_set_value(&mut serverinfo, "protocol", &cfg.protocol.to_string());
        config_strings[cs::SERVERINFO] = serverinfo;

        let mut server = Self {
            codec: strategy.delta_codec(cfg.server_delta_time),
            strategy,
            cfg,
            socket,
            compressor,
            movement: Box::new(GroundMovement::default()),
            time: 0,
            frame_count: 0,
            server_id: 0,
            checksum_feed,
            snap_flags: SnapFlags::empty(),
            config_strings,
            entities: BTreeMap::new(),
            baselines: BTreeMap::new(),
            sounds: Vec::new(),
            peer: Peer::new(),
            client_commands: Vec::new(),
        };
        server.new_server_id();
        info!(
            protocol = server.cfg.protocol,
            strategy = server.strategy.name(),
            map = %server.cfg.map,
            "server started"
        );
        Ok(server)
    }

    fn new_server_id(&mut self) {
        self.server_id = rand::random::<i32>() & 0x7FFF_FFFF;
        let mut systeminfo = String::new();
        info_set_value(&mut systeminfo, "sv_serverid", &self.server_id.to_string());
        self.config_strings[cs::SYSTEMINFO] = systeminfo;
    }

    pub fn time(&self) -> i32 {
        self.time
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn server_id(&self) -> i32 {
        self.server_id
    }

    pub fn checksum_feed(&self) -> i32 {
        self.checksum_feed
    }

    pub fn phase(&self) -> PeerPhase {
        self.peer.phase
    }

    pub fn player_name(&self) -> &str {
        &self.peer.name
    }

    pub fn player_state(&self) -> &PlayerState {
        &self.peer.ps
    }

    pub fn player_state_mut(&mut self) -> &mut PlayerState {
        &mut self.peer.ps
    }

    /// Eye offset and angles from the client's newest move.
    pub fn eyes(&self) -> UserEyes {
        self.peer.eyes
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    /// Client commands executed since the last call, in order.
    pub fn take_client_commands(&mut self) -> Vec<(i32, String)> {
        std::mem::take(&mut self.client_commands)
    }

    /// Adds or replaces an entity. Entities present when a gamestate is
    /// built become baselines.
    pub fn spawn_entity(&mut self, es: EntityState) {
        self.entities.insert(es.number, es);
    }

    pub fn entity_mut(&mut self, number: u16) -> Option<&mut EntityState> {
        self.entities.get_mut(&number)
    }

    pub fn remove_entity(&mut self, number: u16) -> Option<EntityState> {
        self.entities.remove(&number)
    }

    /// Queues a reliable command for the client.
    pub fn queue_server_command(&mut self, text: &str) -> NetResult<i32> {
        if text.len() >= MAX_STRING_CHARS {
            return Err(NetError::StringTooLong(MAX_STRING_CHARS));
        }
        let p = &mut self.peer;
        let pending = p.reliable_sequence - p.reliable_acknowledge;
        if pending >= MAX_RELIABLE_COMMANDS as i32 {
            warn!(pending, "server command overflow");
            return Err(NetError::ReliableOverflow {
                pending: pending as u32,
            });
        }
        p.reliable_sequence += 1;
        p.reliable.insert(p.reliable_sequence, text.to_string());
        debug!(sequence = p.reliable_sequence, text, "queued server command");
        Ok(p.reliable_sequence)
    }

    /// Changes a configstring and tells an active client about it.
    pub fn set_configstring(&mut self, index: usize, value: &str) -> NetResult<()> {
        if index >= MAX_CONFIGSTRINGS {
            return Err(NetError::ConfigStringIndex(index));
        }
        self.config_strings[index] = value.to_string();
        if self.peer.phase >= PeerPhase::Primed {
            self.queue_server_command(&format!("cs {index} \"{value}\""))?;
        }
        Ok(())
    }

    pub fn centerprint(&mut self, text: &str) {
        self.peer.unreliable.push(Unreliable::Centerprint(text.to_string()));
    }

    pub fn locprint(&mut self, x: i16, y: i16, text: &str) {
        self.peer.unreliable.push(Unreliable::Locprint {
            x,
            y,
            text: text.to_string(),
        });
    }

    pub fn cgame_message(&mut self, data: &[u8]) {
        self.peer.unreliable.push(Unreliable::CgameMessage(data.to_vec()));
    }

    pub fn download_block(&mut self, block: u16, data: &[u8]) {
        self.peer.unreliable.push(Unreliable::Download {
            block,
            data: data.to_vec(),
        });
    }

    /// Sound carried by the next snapshot.
    pub fn start_sound(&mut self, sound: ServerSound) {
        self.sounds.push(sound);
    }

    /// Restarts the level: new server id, fresh gamestate for the client.
    pub fn restart_map(&mut self) {
        self.new_server_id();
        self.snap_flags.toggle(SnapFlags::SERVERCOUNT);
        if self.peer.phase >= PeerPhase::Connected {
            self.peer.phase = PeerPhase::Connected;
        }
        info!(server_id = self.server_id, "map restarted");
    }

    /// Sends `disconnect` and forgets the client.
    pub fn kick(&mut self, reason: &str) -> NetResult<()> {
        if self.peer.phase < PeerPhase::Connected {
            return Ok(());
        }
        self.queue_server_command(&format!("disconnect \"{reason}\""))?;
        self.send_message()?;
        info!(reason, "client kicked");
        self.peer = Peer::new();
        Ok(())
    }

    /// One server frame: read everything pending, advance time, send.
    pub fn frame(&mut self) -> NetResult<()> {
        self.time += self.cfg.frame_msec() as i32;
        self.frame_count += 1;

        while let Some(packet) = self.socket.receive()? {
            self.packet_event(&packet);
        }

        if self.peer.phase >= PeerPhase::Connected {
            self.send_message()?;
        }
        Ok(())
    }

    /// Runs `ticks` frames in real time.
    pub async fn run_for_ticks(&mut self, ticks: u32) -> NetResult<()> {
        let interval = Duration::from_millis(u64::from(self.cfg.frame_msec()));
        let mut next_tick = tokio::time::Instant::now();
        for _ in 0..ticks {
            self.frame()?;
            next_tick += interval;
            tokio::time::sleep_until(next_tick).await;
        }
        Ok(())
    }

    fn packet_event(&mut self, packet: &[u8]) {
        let result = match oob_payload(packet) {
            Some(payload) => self.connectionless_packet(payload),
            None if self.peer.phase >= PeerPhase::Connected => self.client_message(packet),
            None => {
                debug!("sequenced packet from unknown client");
                Ok(())
            }
        };
        if let Err(err) = result {
            warn!(%err, "dropped client packet");
        }
    }

    fn connectionless_packet(&mut self, payload: &[u8]) -> NetResult<()> {
        let (command, rest) = match payload.iter().position(|&b| b == b' ') {
            Some(i) => (&payload[..i], &payload[i + 1..]),
            None => (payload, &payload[payload.len()..]),
        };
        match command {
            b"getchallenge" => {
                if self.peer.phase < PeerPhase::Connected {
                    self.peer = Peer::new();
                    self.peer.challenge = rand::random::<i32>() & 0x7FFF_FFFF;
                    self.peer.phase = PeerPhase::Challenged;
                }
                debug!(challenge = self.peer.challenge, "challenge");
                let reply = format!("challengeResponse {}", self.peer.challenge);
                self.socket.send(&oob_packet(reply.as_bytes()))?;
                Ok(())
            }
            b"connect" => self.direct_connect(rest),
            other => Err(NetError::BadHandshake(format!(
                "unknown command {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    fn direct_connect(&mut self, packed: &[u8]) -> NetResult<()> {
        let raw = self.compressor.decompress(packed)?;
        let userinfo = String::from_utf8_lossy(&raw).into_owned();

        let protocol: u32 = info_value_for_key(&userinfo, "protocol")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if protocol != self.cfg.protocol {
            let reply = format!("print Server uses protocol version {}.", self.cfg.protocol);
            self.socket.send(&oob_packet(reply.as_bytes()))?;
            return Err(NetError::UnsupportedProtocol(protocol));
        }
        let challenge: i32 = info_value_for_key(&userinfo, "challenge")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        if self.peer.phase < PeerPhase::Challenged || challenge != self.peer.challenge {
            return Err(NetError::BadHandshake("challenge mismatch".into()));
        }

        if self.peer.phase == PeerPhase::Challenged {
            self.peer.qport = info_value_for_key(&userinfo, "qport")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            self.peer.name = info_value_for_key(&userinfo, "name")
                .unwrap_or("unnamed")
                .to_string();
            self.peer.phase = PeerPhase::Connected;
            info!(name = %self.peer.name, qport = self.peer.qport, "client connected");
        }
        self.socket.send(&oob_packet(b"connectResponse"))?;
        Ok(())
    }

    fn client_message(&mut self, data: &[u8]) -> NetResult<()> {
        let mut r = BitReader::new(data);
        r.set_string_mode(self.strategy.string_mode());

        let sequence = r.read_long()?;
        let qport = r.read_short()? as u16;
        if qport != self.peer.qport {
            debug!(qport, "packet for another qport");
            return Ok(());
        }
        if sequence <= self.peer.incoming_sequence {
            debug!(sequence, "out of order client packet");
            return Ok(());
        }
        self.peer.incoming_sequence = sequence;

        let server_id = r.read_long()?;
        let message_ack = r.read_long()?;
        let reliable_ack = r.read_long()?;

        let p = &mut self.peer;
        p.message_acknowledge = message_ack;
        p.reliable_acknowledge = reliable_ack.clamp(
            p.reliable_sequence - MAX_RELIABLE_COMMANDS as i32,
            p.reliable_sequence,
        );

        // A client on an old level only gets its commands executed; moves
        // wait until it has the new gamestate.
        let stale = server_id != self.server_id;
        if stale && p.phase >= PeerPhase::Primed && message_ack > p.gamestate_message_num {
            debug!(server_id, "stale server id, resending gamestate");
            p.phase = PeerPhase::Connected;
        }

        loop {
            let op = ClientOp::try_from(r.read_byte()?)?;
            match op {
                ClientOp::Eof => break,
                ClientOp::Nop => {}
                ClientOp::ClientCommand => {
                    let seq = r.read_long()?;
                    let text = r.read_string()?;
                    self.client_command(seq, text);
                    if self.peer.phase == PeerPhase::Free {
                        return Ok(());
                    }
                }
                ClientOp::Move | ClientOp::MoveNoDelta => {
                    if stale {
                        break;
                    }
                    self.user_move(&mut r, op == ClientOp::Move)?;
                }
                ClientOp::Bad => return Err(NetError::BadOpcode(op as u8)),
            }
        }
        Ok(())
    }

    fn client_command(&mut self, seq: i32, text: String) {
        let p = &mut self.peer;
        if seq <= p.last_client_command {
            return;
        }
        if seq > p.last_client_command + 1 {
            warn!(seq, last = p.last_client_command, "lost client commands");
        }
        p.last_client_command = seq;
        debug!(seq, %text, "client command");

        if text == "disconnect" {
            info!(name = %p.name, "client disconnected");
            self.peer = Peer::new();
            return;
        }
        self.client_commands.push((seq, text));
    }

    fn user_move(&mut self, r: &mut BitReader<'_>, delta: bool) -> NetResult<()> {
        let count = r.read_byte()? as usize;
        self.peer.eyes = read_eyes(r, &UserEyes::default())?;

        let key = self.peer.integrity_key(self.strategy);
        let mut cmds = Vec::with_capacity(count);
        let mut old = UserCommand::default();
        for _ in 0..count {
            let cmd = read_usercmd(r, key, &old)?;
            cmds.push(cmd);
            old = cmd;
        }

        self.peer.delta_message = delta.then_some(self.peer.message_acknowledge);
        if self.peer.phase == PeerPhase::Primed {
            info!(name = %self.peer.name, "client entered the game");
            self.peer.phase = PeerPhase::Active;
        }

        for cmd in &cmds {
            if cmd.server_time <= self.peer.ps.command_time {
                continue;
            }
            self.movement.simulate(&mut self.peer.ps, cmd);
        }
        Ok(())
    }

    fn send_message(&mut self) -> NetResult<()> {
        let mut w = BitWriter::with_capacity(MAX_MSGLEN);
        w.set_string_mode(self.strategy.string_mode());

        let p = &self.peer;
        let sequence = p.outgoing_sequence;
        w.write_long(sequence)?;
        w.write_long(p.last_client_command)?;

        for seq in p.reliable_acknowledge + 1..=p.reliable_sequence {
            let Some(text) = p.reliable.get(seq) else {
                continue;
            };
            if w.len() + 6 + text.len() + FRAME_RESERVE > MAX_MSGLEN {
                debug!(seq, "message full, deferring server commands");
                break;
            }
            w.write_byte(ServerOp::ServerCommand as u8)?;
            w.write_long(seq)?;
            w.write_string(text)?;
        }

        if self.peer.phase == PeerPhase::Connected {
            self.write_gamestate(&mut w)?;
            self.peer.gamestate_message_num = sequence;
            self.peer.gamestate_command_seq = self.peer.reliable_sequence;
            self.peer.phase = PeerPhase::Primed;
            self.peer.frames.clear();
            self.peer.delta_message = None;
            self.peer.ps.client_num = 0;
        } else if self.peer.message_acknowledge >= self.peer.gamestate_message_num {
            self.write_snapshot(&mut w, sequence)?;
        }

        for rec in self.peer.unreliable.drain(..) {
            match rec {
                Unreliable::Centerprint(text) => {
                    w.write_byte(ServerOp::Centerprint as u8)?;
                    w.write_string(&text)?;
                }
                Unreliable::Locprint { x, y, text } => {
                    w.write_byte(ServerOp::Locprint as u8)?;
                    w.write_short(x)?;
                    w.write_short(y)?;
                    w.write_string(&text)?;
                }
                Unreliable::CgameMessage(data) => {
                    w.write_byte(ServerOp::CgameMessage as u8)?;
                    w.write_short(data.len() as i16)?;
                    w.write_data(&data)?;
                }
                Unreliable::Download { block, data } => {
                    w.write_byte(ServerOp::Download as u8)?;
                    w.write_short(block as i16)?;
                    w.write_short(data.len() as i16)?;
                    w.write_data(&data)?;
                }
            }
        }

        w.write_byte(ServerOp::Eof as u8)?;
        self.peer.outgoing_sequence += 1;
        self.socket.send(w.as_slice())?;
        Ok(())
    }

    fn write_gamestate(&mut self, w: &mut BitWriter) -> NetResult<()> {
        // baselines are read before the trailer's time delta is known
        let baseline_codec = self.strategy.delta_codec(0.0);
        w.write_byte(ServerOp::Gamestate as u8)?;
        w.write_long(self.peer.reliable_sequence)?;

        for (index, value) in self.config_strings.iter().enumerate() {
            if value.is_empty() {
                continue;
            }
            w.write_byte(ServerOp::Configstring as u8)?;
            w.write_short(index as i16)?;
            w.write_big_string(value)?;
        }

        self.baselines = self.entities.clone();
        for es in self.baselines.values() {
            w.write_byte(ServerOp::Baseline as u8)?;
            baseline_codec.write_entity(w, &EntityState::with_number(es.number), es, true)?;
        }
        w.write_byte(ServerOp::Eof as u8)?;

        self.strategy.write_gamestate_trailer(
            w,
            &GamestateTrailer {
                client_num: 0,
                checksum_feed: self.checksum_feed,
                server_delta_time: self.cfg.server_delta_time,
            },
        )?;
        info!(
            server_id = self.server_id,
            baselines = self.baselines.len(),
            "sent gamestate"
        );
        Ok(())
    }

    fn write_snapshot(&mut self, w: &mut BitWriter, sequence: i32) -> NetResult<()> {
        let frame = ClientFrame {
            ps: self.peer.ps.clone(),
            entities: self.entities.values().cloned().collect(),
        };

        let old = self.peer.delta_message.and_then(|m| {
            let age = sequence - m;
            if age <= 0 || age >= PACKET_BACKUP as i32 - 3 {
                return None;
            }
            self.peer.frames.get(m).map(|f| (age, f))
        });
        let empty = ClientFrame {
            ps: PlayerState::default(),
            entities: Vec::new(),
        };
        let (delta, old) = match old {
            Some((age, f)) => (age as u8, f),
            None => (0, &empty),
        };

        w.write_byte(ServerOp::Snapshot as u8)?;
        w.write_long(self.time)?;
        w.write_byte(0)?;
        w.write_byte(delta)?;
        w.write_byte(self.snap_flags.bits())?;
        w.write_byte(0)?;
        self.codec.write_player(w, &old.ps, &frame.ps)?;
        emit_packet_entities(&self.codec, w, &self.baselines, &old.entities, &frame.entities)?;
        self.codec.write_sounds(w, &self.sounds)?;
        self.sounds.clear();

        self.peer.frames.insert(sequence, frame);
        Ok(())
    }
}

impl GameServer<UdpTransport> {
    /// UDP server on an ephemeral loopback port.
    pub fn bind_ephemeral(protocol: u32) -> NetResult<Self> {
        let addr: SocketAddr = ([127, 0, 0, 1], 0).into();
        let socket = UdpTransport::listen(addr)?;
        let cfg = ServerConfig {
            addr: socket.local_addr()?.to_string(),
            protocol,
            ..ServerConfig::default()
        };
        Self::new(cfg, socket, Box::new(DeflateCompressor))
    }

    pub fn local_addr(&self) -> NetResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

/// Writes the entity list of `new` as a merge against `old`, both sorted by
/// number: changes and additions as deltas, departures as removals.
fn emit_packet_entities(
    codec: &DeltaCodec,
    w: &mut BitWriter,
    baselines: &BTreeMap<u16, EntityState>,
    old: &[EntityState],
    new: &[EntityState],
) -> NetResult<()> {
    let (mut oi, mut ni) = (0, 0);
    while oi < old.len() || ni < new.len() {
        let old_num = old.get(oi).map_or(u32::MAX, |e| e.number as u32);
        let new_num = new.get(ni).map_or(u32::MAX, |e| e.number as u32);

        if new_num == old_num {
            codec.write_entity(w, &old[oi], &new[ni], false)?;
            oi += 1;
            ni += 1;
        } else if new_num < old_num {
            let es = &new[ni];
            let fresh;
            let base = match baselines.get(&es.number) {
                Some(b) => b,
                None => {
                    fresh = EntityState::with_number(es.number);
                    &fresh
                }
            };
            codec.write_entity(w, base, es, true)?;
            ni += 1;
        } else {
            codec.write_entity_removal(w, old[oi].number)?;
            oi += 1;
        }
    }
    codec.write_entity_end(w)
}
