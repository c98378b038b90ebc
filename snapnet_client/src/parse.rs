//! Server message parsing.
//!
//! A sequenced server message is `sequence:long reliable_ack:long` followed by
//! opcode records until `Eof`. Any decode error aborts the rest of the
//! message; whatever was applied before the error stays applied.

use snapnet_shared::error::{NetError, NetResult};
use snapnet_shared::msg::BitReader;
use snapnet_shared::net::{Clock, Socket};
use snapnet_shared::protocol::{
    cs, info_value_for_key, ServerOp, MAX_CONFIGSTRINGS, MAX_GAMESTATE_CHARS,
};
use snapnet_shared::state::{EntityState, PlayerState, SnapFlags, MAX_MAP_AREA_BYTES};
use tracing::{debug, info, trace, warn};

use crate::connection::{ClientConnection, ConnState};
use crate::events::ConnectionEvent;
use crate::snapshot::Snapshot;

impl<S: Socket, K: Clock> ClientConnection<S, K> {
    pub(crate) fn parse_server_message(&mut self, data: &[u8]) -> NetResult<()> {
        let mut r = BitReader::new(data);
        r.set_string_mode(self.strategy.string_mode());

        let sequence = r.read_long()?;
        if sequence <= self.incoming_sequence {
            debug!(sequence, last = self.incoming_sequence, "out of order packet");
            return Ok(());
        }
        let dropped = sequence - self.incoming_sequence - 1;
        if dropped > 0 && self.incoming_sequence > 0 {
            debug!(dropped, sequence, "dropped packets");
        }
        self.incoming_sequence = sequence;

        let ack = r.read_long()?;
        self.reliable.acknowledge(ack);

        loop {
            let op = ServerOp::try_from(r.read_byte()?)?;
            trace!(?op, "server op");
            match op {
                ServerOp::Eof => break,
                ServerOp::Nop => {}
                ServerOp::ServerCommand => {
                    let seq = r.read_long()?;
                    let text = r.read_string()?;
                    self.server_command(seq, text);
                }
                ServerOp::Gamestate => self.parse_gamestate(&mut r)?,
                ServerOp::Snapshot => self.parse_snapshot(&mut r, sequence)?,
                ServerOp::Download => {
                    let block = r.read_short()? as u16;
                    let size = r.read_short()? as u16 as usize;
                    let data = r.read_data(size)?;
                    self.events.push(ConnectionEvent::DownloadBlock { block, data });
                }
                ServerOp::Centerprint => {
                    let text = r.read_string()?;
                    self.events.push(ConnectionEvent::Centerprint(text));
                }
                ServerOp::Locprint => {
                    let x = r.read_short()?;
                    let y = r.read_short()?;
                    let text = r.read_string()?;
                    self.events.push(ConnectionEvent::Locprint { x, y, text });
                }
                ServerOp::CgameMessage => {
                    let len = r.read_short()? as u16 as usize;
                    let data = r.read_data(len)?;
                    self.events.push(ConnectionEvent::CgameMessage(data));
                }
                ServerOp::Bad | ServerOp::Configstring | ServerOp::Baseline => {
                    return Err(NetError::BadOpcode(op as u8));
                }
            }
            if r.is_exhausted() {
                break;
            }
        }
        Ok(())
    }

    fn server_command(&mut self, sequence: i32, text: String) {
        if !self.reliable.receive_server_command(sequence, text) {
            return;
        }
        while let Some((sequence, text)) = self.reliable.next_server_command() {
            debug!(sequence, %text, "server command");
            self.execute_server_command(&text);
            self.events
                .push(ConnectionEvent::ServerCommand { sequence, text });
            if self.state == ConnState::Disconnected {
                break;
            }
        }
    }

    fn execute_server_command(&mut self, text: &str) {
        let (cmd, rest) = text.split_once(' ').unwrap_or((text, ""));
        match cmd {
            "disconnect" => {
                let reason = rest.trim().trim_matches('"');
                let reason = if reason.is_empty() {
                    "server disconnected"
                } else {
                    reason
                };
                self.drop_connection(reason);
            }
            "cs" => {
                let Some((index, value)) = rest.split_once(' ') else {
                    warn!(text, "malformed configstring command");
                    return;
                };
                match index.parse::<usize>() {
                    Ok(i) if i < MAX_CONFIGSTRINGS => {
                        self.config_strings[i] = value.trim_matches('"').to_string();
                        if i == cs::SYSTEMINFO {
                            self.update_server_id();
                        }
                    }
                    _ => warn!(text, "configstring index out of range"),
                }
            }
            _ => {}
        }
    }

    fn update_server_id(&mut self) {
        if let Some(id) = info_value_for_key(&self.config_strings[cs::SYSTEMINFO], "sv_serverid")
            .and_then(|v| v.parse().ok())
        {
            self.server_id = id;
        }
    }

    fn parse_gamestate(&mut self, r: &mut BitReader<'_>) -> NetResult<()> {
        self.history.reset();
        self.config_strings.iter_mut().for_each(String::clear);
        self.reset_prediction();
        // baselines precede the trailer that carries the time delta
        self.set_codec(self.strategy.delta_codec(0.0));

        let command_sequence = r.read_long()?;
        self.reliable.reset_server_commands(command_sequence);

        let mut total_chars = 0usize;
        loop {
            let op = ServerOp::try_from(r.read_byte()?)?;
            match op {
                ServerOp::Eof => break,
                ServerOp::Configstring => {
                    let index = r.read_short()? as u16 as usize;
                    if index >= MAX_CONFIGSTRINGS {
                        return Err(NetError::ConfigStringIndex(index));
                    }
                    let value = r.read_big_string()?;
                    total_chars += value.len() + 1;
                    if total_chars > MAX_GAMESTATE_CHARS {
                        return Err(NetError::GamestateOverflow(MAX_GAMESTATE_CHARS));
                    }
                    self.config_strings[index] = value;
                }
                ServerOp::Baseline => {
                    let number = self.codec.read_entity_number(r)?;
                    let es = self
                        .codec
                        .read_entity(r, &EntityState::with_number(number), number)?
                        .ok_or_else(|| NetError::malformed("entityState", "baseline removal"))?;
                    self.history.set_baseline(es);
                }
                other => return Err(NetError::BadOpcode(other as u8)),
            }
        }

        let trailer = self.strategy.read_gamestate_trailer(r)?;
        self.client_num = trailer.client_num;
        self.checksum_feed = trailer.checksum_feed;
        self.set_codec(self.strategy.delta_codec(trailer.server_delta_time));
        self.update_server_id();

        info!(
            server_id = self.server_id,
            client_num = self.client_num,
            command_sequence,
            "gamestate loaded"
        );
        self.state = ConnState::Primed;
        self.events.push(ConnectionEvent::GamestateLoaded {
            server_id: self.server_id,
            client_num: self.client_num,
        });
        Ok(())
    }

    fn parse_snapshot(&mut self, r: &mut BitReader<'_>, message_num: i32) -> NetResult<()> {
        let server_time = r.read_long()?;
        let server_time_residual = r.read_byte()?;
        let delta = r.read_byte()?;
        let snap_flags = SnapFlags::from_bits_retain(r.read_byte()?);
        let delta_num = (delta != 0).then(|| message_num - delta as i32);

        let mut frame = Snapshot {
            snap_flags,
            server_time,
            server_time_residual,
            message_num,
            delta_num,
            server_command_num: self.reliable.server_command_sequence(),
            ..Snapshot::default()
        };

        // Even with an unusable base the message is read to the end so the
        // records after it stay aligned.
        let (old_ps, old_entities, valid) = match delta_num {
            None => (PlayerState::default(), None, true),
            Some(d) => match self.history.check_delta(d) {
                Ok(old) => (
                    old.ps.clone(),
                    Some((old.first_entity, old.num_entities)),
                    true,
                ),
                Err(why) => {
                    debug!(%why, delta_num = d, message_num, "snapshot not usable");
                    (PlayerState::default(), None, false)
                }
            },
        };

        let area_len = r.read_byte()? as usize;
        if area_len > MAX_MAP_AREA_BYTES {
            return Err(NetError::AreaMaskSize(area_len));
        }
        frame.area_mask = r.read_data(area_len)?;

        let codec = self.codec;
        frame.ps = codec.read_player(r, &old_ps)?;
        self.history
            .read_entities(r, &codec, old_entities, &mut frame)?;
        frame.sounds = codec.read_sounds(r)?;

        if !valid {
            return Ok(());
        }
        frame.valid = true;
        frame.ping = self.ping_for(frame.ps.command_time);

        let entities = frame.num_entities;
        self.history.store(frame);
        self.new_snapshot = Some(server_time);
        self.events.push(ConnectionEvent::SnapshotReceived {
            message_num,
            server_time,
        });
        if self.state == ConnState::Primed {
            info!(message_num, server_time, entities, "first snapshot, active");
            self.state = ConnState::Active;
        }
        Ok(())
    }
}
