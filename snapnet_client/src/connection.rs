//! Client connection.
//!
//! [`ClientConnection`] owns every piece of client network state: the
//! handshake, the snapshot history, the reliable channel, the command ring
//! and the predictor. It is driven by [`ClientConnection::tick`], which
//! never blocks:
//!
//! 1. receive at most one datagram and dispatch it
//! 2. report a timeout once per silent period
//! 3. retransmit the handshake if needed
//! 4. advance the client's estimate of server time
//! 5. sample input into a user command and predict
//! 6. send the outgoing packet
//!
//! Message parsing lives in `parse.rs`.

use std::fmt;

use snapnet_shared::config::ClientConfig;
use snapnet_shared::delta::{write_eyes, write_usercmd, DeltaCodec};
use snapnet_shared::error::{NetError, NetResult};
use snapnet_shared::msg::{BitWriter, MAX_MSGLEN};
use snapnet_shared::net::{oob_packet, oob_payload, Clock, Compressor, Socket};
use snapnet_shared::pmove::GroundMovement;
use snapnet_shared::protocol::{
    info_set_value, strategy_for, ClientOp, ProtocolStrategy, MAX_CONFIGSTRINGS, PACKET_BACKUP,
    RESET_TIME, RETRANSMIT_MS,
};
use snapnet_shared::state::{EntityState, PlayerState, UserCommand, UserEyes};
use tracing::{debug, info, warn};

use crate::events::{ConnectionEvent, EventQueue};
use crate::input::{build_command, CommandBuffer, InputState};
use crate::predict::{PredictionInput, Predictor, SnapshotView};
use crate::reliable::ReliableChannel;
use crate::snapshot::{Snapshot, SnapshotHistory};

/// Drift beyond which the time delta is averaged instead of nudged.
const FAST_ADJUST_MS: i32 = 100;
/// Opcode, sequence and terminator around a client command's text.
const COMMAND_RECORD_BYTES: usize = 6;
/// Room kept for the move block and the trailing `Eof`s.
const MOVE_BLOCK_RESERVE: usize = 1024;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnState {
    Disconnected,
    /// Waiting for `challengeResponse`.
    Challenging,
    /// Waiting for `connectResponse`.
    Connecting,
    /// Sequenced traffic flows, no gamestate yet.
    Connected,
    /// Gamestate loaded, waiting for the first valid snapshot.
    Primed,
    Active,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnState::Disconnected => "disconnected",
            ConnState::Challenging => "challenging",
            ConnState::Connecting => "connecting",
            ConnState::Connected => "connected",
            ConnState::Primed => "primed",
            ConnState::Active => "active",
        };
        f.write_str(s)
    }
}

/// What was sent in one outgoing packet.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct OutPacket {
    pub(crate) cmd_number: i32,
    pub(crate) server_time: i32,
    pub(crate) realtime: u64,
}

pub struct ClientConnection<S: Socket, K: Clock> {
    pub(crate) config: ClientConfig,
    socket: S,
    pub(crate) clock: K,
    compressor: Box<dyn Compressor>,
    pub(crate) strategy: &'static dyn ProtocolStrategy,
    pub(crate) codec: DeltaCodec,

    pub(crate) state: ConnState,
    qport: u16,
    pub(crate) challenge: i32,
    last_handshake_ms: Option<u64>,
    pub(crate) last_received_ms: u64,
    timeout_reported: bool,

    outgoing_sequence: i32,
    /// Sequence of the newest server packet, echoed back as
    /// `serverMessageSequence`.
    pub(crate) incoming_sequence: i32,
    pub(crate) server_id: i32,
    pub(crate) client_num: i32,
    pub(crate) checksum_feed: i32,
    pub(crate) config_strings: Vec<String>,

    pub(crate) history: SnapshotHistory,
    pub(crate) reliable: ReliableChannel,
    commands: CommandBuffer,
    eyes: UserEyes,
    pub(crate) out_packets: [OutPacket; PACKET_BACKUP],
    last_packet_ms: Option<u64>,
    /// Commands up to this number were sent at least once.
    last_sent_cmd: i32,

    server_time: i32,
    server_time_delta: i64,
    pub(crate) new_snapshot: Option<i32>,
    first_snapshot: bool,

    predictor: Predictor,
    pub(crate) events: EventQueue,
}

impl<S: Socket, K: Clock> ClientConnection<S, K> {
    pub fn new(
        config: ClientConfig,
        socket: S,
        clock: K,
        compressor: Box<dyn Compressor>,
    ) -> NetResult<Self> {
        let strategy = strategy_for(config.protocol)?;
        let qport = config.qport.unwrap_or_else(rand::random);
        let predictor = Predictor::new(
            Box::new(GroundMovement::default()),
            config.predict,
            config.error_decay_ms,
        );
        let now = clock.now_ms();
        Ok(Self {
            codec: strategy.delta_codec(0.0),
            strategy,
            config,
            socket,
            clock,
            compressor,
            state: ConnState::Disconnected,
            qport,
            challenge: 0,
            last_handshake_ms: None,
            last_received_ms: now,
            timeout_reported: false,
            outgoing_sequence: 1,
            incoming_sequence: 0,
            server_id: 0,
            client_num: -1,
            checksum_feed: 0,
            config_strings: vec![String::new(); MAX_CONFIGSTRINGS],
            history: SnapshotHistory::new(),
            reliable: ReliableChannel::new(),
            commands: CommandBuffer::new(),
            eyes: UserEyes::default(),
            out_packets: [OutPacket::default(); PACKET_BACKUP],
            last_packet_ms: None,
            last_sent_cmd: 0,
            server_time: 0,
            server_time_delta: 0,
            new_snapshot: None,
            first_snapshot: true,
            predictor,
            events: EventQueue::default(),
        })
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn strategy(&self) -> &'static dyn ProtocolStrategy {
        self.strategy
    }

    pub fn qport(&self) -> u16 {
        self.qport
    }

    pub fn challenge(&self) -> i32 {
        self.challenge
    }

    pub fn client_num(&self) -> i32 {
        self.client_num
    }

    pub fn server_id(&self) -> i32 {
        self.server_id
    }

    pub fn checksum_feed(&self) -> i32 {
        self.checksum_feed
    }

    /// Client's estimate of the server clock.
    pub fn server_time(&self) -> i32 {
        self.server_time
    }

    pub fn config_string(&self, index: usize) -> Option<&str> {
        self.config_strings.get(index).map(String::as_str)
    }

    pub fn history(&self) -> &SnapshotHistory {
        &self.history
    }

    /// Newest valid snapshot.
    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.history.current()
    }

    /// Entities of the newest valid snapshot.
    pub fn entities(&self) -> Vec<EntityState> {
        match self.history.current() {
            Some(snap) => self.history.entities(snap).cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn reliable(&self) -> &ReliableChannel {
        &self.reliable
    }

    pub fn commands(&self) -> &CommandBuffer {
        &self.commands
    }

    pub fn predictor(&self) -> &Predictor {
        &self.predictor
    }

    /// Player state to render this frame.
    pub fn predicted_state(&self) -> &PlayerState {
        self.predictor.predicted()
    }

    pub fn set_eyes(&mut self, eyes: UserEyes) {
        self.eyes = eyes;
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ConnectionEvent> + '_ {
        self.events.drain()
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    /// Starts the handshake.
    pub fn connect(&mut self) -> NetResult<()> {
        info!(protocol = self.config.protocol, strategy = self.strategy.name(), "connecting");
        self.state = ConnState::Challenging;
        self.last_received_ms = self.clock.now_ms();
        self.timeout_reported = false;
        self.send_handshake()
    }

    /// Tells the server we are leaving and drops to `Disconnected`.
    pub fn disconnect(&mut self) -> NetResult<()> {
        if self.state >= ConnState::Connected {
            // the server may not hear the first one
            if self.reliable.add_command("disconnect").is_ok() {
                for _ in 0..3 {
                    self.write_packet()?;
                }
            }
        }
        self.drop_connection("client disconnected");
        Ok(())
    }

    pub(crate) fn drop_connection(&mut self, reason: &str) {
        if self.state == ConnState::Disconnected {
            return;
        }
        info!(reason, "disconnected");
        self.state = ConnState::Disconnected;
        self.predictor.reset();
        self.events.push(ConnectionEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Queues a reliable client command.
    pub fn add_reliable_command(&mut self, text: &str) -> NetResult<i32> {
        match self.reliable.add_command(text) {
            Ok(seq) => Ok(seq),
            Err(err) => {
                if let NetError::ReliableOverflow { pending } = err {
                    self.events
                        .push(ConnectionEvent::ProtocolError(NetError::ReliableOverflow {
                            pending,
                        }));
                }
                Err(err)
            }
        }
    }

    /// One frame of network work.
    pub fn tick(&mut self, input: &InputState) -> NetResult<()> {
        let now = self.clock.now_ms();

        if let Some(packet) = self.socket.receive()? {
            self.last_received_ms = now;
            self.timeout_reported = false;
            self.packet_event(&packet);
        }

        if self.state == ConnState::Disconnected {
            return Ok(());
        }

        if !self.timeout_reported
            && now.saturating_sub(self.last_received_ms) > self.config.timeout_ms
        {
            warn!(silent_ms = now - self.last_received_ms, "server timed out");
            self.timeout_reported = true;
            self.events.push(ConnectionEvent::TimedOut);
        }

        if matches!(self.state, ConnState::Challenging | ConnState::Connecting) {
            let due = self
                .last_handshake_ms
                .map_or(true, |t| now.saturating_sub(t) >= RETRANSMIT_MS);
            if due {
                self.send_handshake()?;
            }
            return Ok(());
        }

        if let Some(server_time) = self.new_snapshot.take() {
            self.adjust_time_delta(server_time, now);
        }

        if self.state == ConnState::Active {
            self.server_time = (now as i64 + self.server_time_delta) as i32;
            let cmd = build_command(self.server_time, input);
            self.create_command(cmd);
            self.predict();
        }

        if self.ready_to_send(now) {
            self.write_packet()?;
        }
        Ok(())
    }

    fn packet_event(&mut self, packet: &[u8]) {
        if let Some(payload) = oob_payload(packet) {
            let text = String::from_utf8_lossy(payload).into_owned();
            if let Err(err) = self.connectionless_packet(&text) {
                warn!(%err, "bad connectionless packet");
                self.events.push(ConnectionEvent::ProtocolError(err));
            }
            return;
        }
        if self.state < ConnState::Connected {
            debug!(state = %self.state, "sequenced packet before connect");
            return;
        }
        if let Err(err) = self.parse_server_message(packet) {
            warn!(%err, "dropped server message");
            self.events.push(ConnectionEvent::ProtocolError(err));
        }
    }

    fn connectionless_packet(&mut self, text: &str) -> NetResult<()> {
        let mut words = text.split_whitespace();
        let command = words.next().unwrap_or_default();
        debug!(command, "connectionless packet");
        match command {
            "challengeResponse" => {
                if self.state != ConnState::Challenging {
                    debug!("unwanted challenge response");
                    return Ok(());
                }
                self.challenge = words
                    .next()
                    .and_then(|w| w.parse().ok())
                    .ok_or_else(|| NetError::BadHandshake(format!("bad challenge in {text:?}")))?;
                self.state = ConnState::Connecting;
                self.last_handshake_ms = None;
                self.send_handshake()
            }
            "connectResponse" => {
                if self.state != ConnState::Connecting {
                    debug!("duplicate connect response");
                    return Ok(());
                }
                info!(challenge = self.challenge, "connected");
                self.state = ConnState::Connected;
                self.last_packet_ms = None;
                Ok(())
            }
            "disconnect" => {
                self.drop_connection("server disconnected");
                Ok(())
            }
            "print" => {
                let msg = text.strip_prefix("print").unwrap_or_default().trim();
                info!(msg, "server print");
                Ok(())
            }
            other => Err(NetError::BadHandshake(format!("unknown command {other:?}"))),
        }
    }

    fn send_handshake(&mut self) -> NetResult<()> {
        self.last_handshake_ms = Some(self.clock.now_ms());
        match self.state {
            ConnState::Challenging => {
                debug!("sending getchallenge");
                self.socket.send(&oob_packet(b"getchallenge"))?;
            }
            ConnState::Connecting => {
                let mut info = String::new();
                info_set_value(&mut info, "protocol", &self.config.protocol.to_string());
                info_set_value(&mut info, "qport", &self.qport.to_string());
                info_set_value(&mut info, "challenge", &self.challenge.to_string());
                info_set_value(&mut info, "name", &self.config.player_name);
                let packed = self.compressor.compress(info.as_bytes())?;

                let mut payload = b"connect ".to_vec();
                payload.extend_from_slice(&packed);
                debug!(bytes = payload.len(), "sending connect");
                self.socket.send(&oob_packet(&payload))?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Moves the server time estimate toward what the newest snapshot says.
    fn adjust_time_delta(&mut self, snap_time: i32, now: u64) {
        let new_delta = snap_time as i64 - now as i64;
        if self.first_snapshot {
            self.first_snapshot = false;
            self.server_time_delta = new_delta;
            debug!(delta = new_delta, "time delta set");
            return;
        }
        let drift = (new_delta - self.server_time_delta).abs();
        if drift > RESET_TIME as i64 {
            debug!(drift, "time delta reset");
            self.server_time_delta = new_delta;
        } else if drift > FAST_ADJUST_MS as i64 {
            self.server_time_delta = (self.server_time_delta + new_delta) >> 1;
        } else if new_delta > self.server_time_delta {
            self.server_time_delta += 1;
        } else if new_delta < self.server_time_delta {
            self.server_time_delta -= 1;
        }
    }

    fn create_command(&mut self, cmd: UserCommand) {
        // the server drops commands that do not move time forward
        let last = self
            .commands
            .get(self.commands.cmd_number())
            .map(|c| c.server_time);
        if last.is_some_and(|t| cmd.server_time <= t) {
            return;
        }
        self.commands.push(cmd);
    }

    fn predict(&mut self) {
        let (cur, next) = {
            let (cur, next) = self.history.interpolation_pair(self.server_time);
            let Some(cur) = cur.or_else(|| self.history.current()) else {
                return;
            };
            (cur.clone(), next.cloned())
        };
        let cur_ents: Vec<EntityState> = self.history.entities(&cur).cloned().collect();
        let next_ents: Vec<EntityState> = next
            .as_ref()
            .map(|n| self.history.entities(n).cloned().collect())
            .unwrap_or_default();

        let input = PredictionInput {
            current: SnapshotView {
                message_num: cur.message_num,
                server_time: cur.server_time,
                ps: &cur.ps,
                entities: &cur_ents,
            },
            next: next.as_ref().map(|n| SnapshotView {
                message_num: n.message_num,
                server_time: n.server_time,
                ps: &n.ps,
                entities: &next_ents,
            }),
            commands: &self.commands,
            time: self.server_time,
        };
        self.predictor.update(&input);
    }

    fn ready_to_send(&self, now: u64) -> bool {
        if self.state < ConnState::Connected {
            return false;
        }
        let Some(last) = self.last_packet_ms else {
            return true;
        };
        let interval = 1000 / u64::from(self.config.packets_per_second.clamp(1, 1000));
        now.saturating_sub(last) >= interval
    }

    /// Whether the server may delta compress the next snapshot.
    fn delta_allowed(&self) -> bool {
        if self.config.no_delta {
            return false;
        }
        self.history
            .current()
            .is_some_and(|s| s.message_num == self.incoming_sequence)
    }

    /// Builds and sends one sequenced packet.
    pub(crate) fn write_packet(&mut self) -> NetResult<()> {
        let now = self.clock.now_ms();
        let mut w = BitWriter::with_capacity(MAX_MSGLEN);
        w.set_string_mode(self.strategy.string_mode());

        w.write_long(self.outgoing_sequence)?;
        w.write_short(self.qport as i16)?;
        w.write_long(self.server_id)?;
        w.write_long(self.incoming_sequence)?;
        w.write_long(self.reliable.server_command_sequence())?;

        // Commands that do not fit stay pending for the next packet; they
        // are sent oldest first so the server never sees a gap.
        for (seq, text) in self.reliable.pending() {
            if w.len() + COMMAND_RECORD_BYTES + text.len() + MOVE_BLOCK_RESERVE > MAX_MSGLEN {
                debug!(seq, "packet full, deferring client commands");
                break;
            }
            w.write_byte(ClientOp::ClientCommand as u8)?;
            w.write_long(seq)?;
            w.write_string(text)?;
        }

        let cmd_number = self.commands.cmd_number();
        if self.state == ConnState::Active && cmd_number > 0 {
            // resend the tail of the previous packet for loss cover
            let first = (self.last_sent_cmd - 2)
                .max(cmd_number - self.config.packet_cmds() as i32 + 1)
                .max(self.commands.oldest());
            let count = cmd_number - first + 1;
            if count > 0 {
                let op = if self.delta_allowed() {
                    ClientOp::Move
                } else {
                    ClientOp::MoveNoDelta
                };
                w.write_byte(op as u8)?;
                let count = u8::try_from(count)
                    .map_err(|_| NetError::malformed("usercmd", format!("{count} commands")))?;
                w.write_byte(count)?;
                write_eyes(&mut w, &UserEyes::default(), &self.eyes)?;

                let key = self.reliable.integrity_key(
                    self.challenge,
                    self.incoming_sequence,
                    self.strategy,
                );
                let mut old = UserCommand::default();
                for n in first..=cmd_number {
                    let Some(cmd) = self.commands.get(n).copied() else {
                        continue;
                    };
                    write_usercmd(&mut w, key, &old, &cmd)?;
                    old = cmd;
                }
                self.last_sent_cmd = cmd_number;
            }
        }

        w.write_byte(ClientOp::Eof as u8)?;
        w.write_byte(ClientOp::Eof as u8)?;

        let slot = self.outgoing_sequence as usize % PACKET_BACKUP;
        self.out_packets[slot] = OutPacket {
            cmd_number,
            server_time: self.server_time,
            realtime: now,
        };
        self.outgoing_sequence += 1;
        self.last_packet_ms = Some(now);
        self.socket.send(w.as_slice())?;
        Ok(())
    }

    /// Round trip of the newest packet whose commands the server has run.
    pub(crate) fn ping_for(&self, command_time: i32) -> Option<i32> {
        let now = self.clock.now_ms();
        (0..PACKET_BACKUP as i32)
            .map(|back| self.outgoing_sequence - 1 - back)
            .filter(|&seq| seq > 0)
            .map(|seq| self.out_packets[seq as usize % PACKET_BACKUP])
            .find(|p| p.realtime > 0 && p.server_time <= command_time && p.cmd_number > 0)
            .map(|p| now.saturating_sub(p.realtime) as i32)
    }

    /// Forgets the predictor's state; used after a new gamestate.
    pub(crate) fn reset_prediction(&mut self) {
        self.predictor.reset();
        self.first_snapshot = true;
        self.new_snapshot = None;
    }

    pub(crate) fn set_codec(&mut self, codec: DeltaCodec) {
        self.codec = codec;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapnet_shared::msg::BitReader;
    use snapnet_shared::net::{ManualClock, MemorySocket, PassthroughCompressor};

    fn client(cfg: ClientConfig) -> (ClientConnection<MemorySocket, ManualClock>, MemorySocket, ManualClock) {
        let (a, b) = MemorySocket::pair();
        let clock = ManualClock::new(1000);
        let conn =
            ClientConnection::new(cfg, a, clock.clone(), Box::new(PassthroughCompressor)).unwrap();
        (conn, b, clock)
    }

    fn recv_oob(peer: &mut MemorySocket) -> Vec<u8> {
        let packet = peer.receive().unwrap().expect("packet");
        oob_payload(&packet).expect("oob").to_vec()
    }

    #[test]
    fn unsupported_protocol_is_rejected() {
        let (a, _) = MemorySocket::pair();
        let cfg = ClientConfig {
            protocol: 11,
            ..ClientConfig::default()
        };
        let res = ClientConnection::new(cfg, a, ManualClock::new(0), Box::new(PassthroughCompressor));
        assert!(matches!(res, Err(NetError::UnsupportedProtocol(11))));
    }

    #[test]
    fn handshake_retransmits_and_sends_userinfo() {
        let cfg = ClientConfig {
            qport: Some(777),
            player_name: "tester".into(),
            ..ClientConfig::default()
        };
        let (mut conn, mut server, clock) = client(cfg);
        conn.connect().unwrap();
        assert_eq!(recv_oob(&mut server), b"getchallenge");

        clock.advance(1000);
        conn.tick(&InputState::default()).unwrap();
        assert_eq!(server.pending(), 0);
        clock.advance(RETRANSMIT_MS);
        conn.tick(&InputState::default()).unwrap();
        assert_eq!(recv_oob(&mut server), b"getchallenge");

        server.send(&oob_packet(b"challengeResponse 4242")).unwrap();
        conn.tick(&InputState::default()).unwrap();
        assert_eq!(conn.state(), ConnState::Connecting);
        assert_eq!(conn.challenge(), 4242);

        let connect = recv_oob(&mut server);
        let info = String::from_utf8(connect[b"connect ".len()..].to_vec()).unwrap();
        assert_eq!(
            snapnet_shared::protocol::info_value_for_key(&info, "challenge"),
            Some("4242")
        );
        assert_eq!(
            snapnet_shared::protocol::info_value_for_key(&info, "qport"),
            Some("777")
        );

        server.send(&oob_packet(b"connectResponse")).unwrap();
        conn.tick(&InputState::default()).unwrap();
        assert_eq!(conn.state(), ConnState::Connected);

        // first sequenced packet: header only
        let packet = server.receive().unwrap().expect("packet");
        let mut r = BitReader::new(&packet);
        assert_eq!(r.read_long().unwrap(), 1);
        assert_eq!(r.read_short().unwrap(), 777);
    }

    #[test]
    fn timeout_is_reported_once() {
        let cfg = ClientConfig {
            timeout_ms: 500,
            ..ClientConfig::default()
        };
        let (mut conn, _server, clock) = client(cfg);
        conn.connect().unwrap();
        clock.advance(600);
        conn.tick(&InputState::default()).unwrap();
        clock.advance(600);
        conn.tick(&InputState::default()).unwrap();
        let timeouts = conn
            .drain_events()
            .filter(|e| matches!(e, ConnectionEvent::TimedOut))
            .count();
        assert_eq!(timeouts, 1);
    }

    #[test]
    fn reliable_overflow_is_reported() {
        let (mut conn, _server, _clock) = client(ClientConfig::default());
        for _ in 0..64 {
            conn.add_reliable_command("say hi").unwrap();
        }
        assert!(conn.add_reliable_command("say hi").is_err());
        assert!(conn.drain_events().any(|e| matches!(
            e,
            ConnectionEvent::ProtocolError(NetError::ReliableOverflow { .. })
        )));
    }

    #[test]
    fn server_disconnect_drops_connection() {
        let (mut conn, mut server, _clock) = client(ClientConfig::default());
        conn.connect().unwrap();
        server.send(&oob_packet(b"disconnect")).unwrap();
        conn.tick(&InputState::default()).unwrap();
        assert_eq!(conn.state(), ConnState::Disconnected);
        assert!(conn
            .drain_events()
            .any(|e| matches!(e, ConnectionEvent::Disconnected { .. })));
    }
}
