//! Protocol constants, opcodes and per-version strategies.
//!
//! Two protocol families exist. Everything that differs between them is
//! behind [`ProtocolStrategy`]; a connection picks one with [`strategy_for`]
//! during the handshake and keeps it for its lifetime.

use crate::delta::{CodecRules, DeltaCodec};
use crate::error::{NetError, NetResult};
use crate::msg::{BitReader, BitWriter, StringMode};
use crate::netfield::{
    legacy_entity_fields, legacy_player_fields, modern_entity_fields, modern_player_fields,
    EntityField, NetField, PlayerField,
};

/// Snapshot and outgoing packet history depth.
pub const PACKET_BACKUP: usize = 32;
pub const PACKET_MASK: usize = PACKET_BACKUP - 1;
/// Parse entity ring size.
pub const MAX_PARSE_ENTITIES: usize = 2048;
/// Headroom kept in the parse entity ring for the frame being written.
pub const PARSE_ENTITIES_MARGIN: usize = 128;
pub const MAX_RELIABLE_COMMANDS: usize = 64;
pub const MAX_CONFIGSTRINGS: usize = 2736;
pub const MAX_GAMESTATE_CHARS: usize = 40000;
/// User command ring size.
pub const CMD_BACKUP: usize = 128;
pub const MAX_PACKET_USERCMDS: usize = 32;
/// Handshake retransmit interval.
pub const RETRANSMIT_MS: u64 = 3000;
/// Server time drift beyond which the client snaps instead of easing.
pub const RESET_TIME: i32 = 500;
/// Bytes of the last acknowledged server command mixed into the key.
pub const KEY_HASH_CHARS: usize = 32;

/// Configstring indices with engine meaning.
pub mod cs {
    pub const SERVERINFO: usize = 0;
    pub const SYSTEMINFO: usize = 1;
}

/// Server to client opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerOp {
    Bad = 0,
    Nop = 1,
    Gamestate = 2,
    Configstring = 3,
    Baseline = 4,
    ServerCommand = 5,
    Download = 6,
    Snapshot = 7,
    Eof = 8,
    Centerprint = 9,
    Locprint = 10,
    CgameMessage = 11,
}

impl TryFrom<u8> for ServerOp {
    type Error = NetError;

    fn try_from(b: u8) -> NetResult<Self> {
        Ok(match b {
            1 => ServerOp::Nop,
            2 => ServerOp::Gamestate,
            3 => ServerOp::Configstring,
            4 => ServerOp::Baseline,
            5 => ServerOp::ServerCommand,
            6 => ServerOp::Download,
            7 => ServerOp::Snapshot,
            8 => ServerOp::Eof,
            9 => ServerOp::Centerprint,
            10 => ServerOp::Locprint,
            11 => ServerOp::CgameMessage,
            other => return Err(NetError::BadOpcode(other)),
        })
    }
}

/// Client to server opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientOp {
    Bad = 0,
    Nop = 1,
    Move = 2,
    MoveNoDelta = 3,
    ClientCommand = 4,
    Eof = 5,
}

impl TryFrom<u8> for ClientOp {
    type Error = NetError;

    fn try_from(b: u8) -> NetResult<Self> {
        Ok(match b {
            1 => ClientOp::Nop,
            2 => ClientOp::Move,
            3 => ClientOp::MoveNoDelta,
            4 => ClientOp::ClientCommand,
            5 => ClientOp::Eof,
            other => return Err(NetError::BadOpcode(other)),
        })
    }
}

/// Values following the gamestate's record list.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GamestateTrailer {
    pub client_num: i32,
    pub checksum_feed: i32,
    /// Interpolation delta in seconds; always 0 for the legacy family.
    pub server_delta_time: f32,
}

/// Per-version protocol behaviour.
pub trait ProtocolStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Width of entity numbers on the wire.
    fn entity_num_bits(&self) -> u32;

    fn string_mode(&self) -> StringMode;

    /// Hash of a command string used in the integrity key.
    fn hash_key(&self, text: &str, max_len: usize) -> u32;

    fn entity_fields(&self) -> &'static [NetField<EntityField>];
    fn player_fields(&self) -> &'static [NetField<PlayerField>];
    fn codec_rules(&self) -> CodecRules;

    fn write_gamestate_trailer(&self, w: &mut BitWriter, t: &GamestateTrailer) -> NetResult<()> {
        w.write_long(t.client_num)?;
        w.write_long(t.checksum_feed)
    }

    fn read_gamestate_trailer(&self, r: &mut BitReader<'_>) -> NetResult<GamestateTrailer> {
        Ok(GamestateTrailer {
            client_num: r.read_long()?,
            checksum_feed: r.read_long()?,
            server_delta_time: 0.0,
        })
    }

    /// Delta codec for this family, bound to the gamestate's time delta.
    fn delta_codec(&self, time_delta: f32) -> DeltaCodec {
        DeltaCodec::new(
            self.entity_fields(),
            self.player_fields(),
            self.entity_num_bits(),
            self.codec_rules(),
        )
        .with_time_delta(time_delta)
    }
}

/// Protocol versions 6 and 8.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyProtocol;

/// Protocol versions 15 to 17.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModernProtocol;

impl ProtocolStrategy for LegacyProtocol {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn entity_num_bits(&self) -> u32 {
        10
    }

    fn string_mode(&self) -> StringMode {
        StringMode::Normal
    }

    fn hash_key(&self, text: &str, max_len: usize) -> u32 {
        let mut hash: u32 = 0;
        for (i, &b) in text.as_bytes().iter().take(max_len).enumerate() {
            if b == 0 {
                break;
            }
            hash = hash.wrapping_add((b as u32).wrapping_mul(119 + i as u32));
        }
        hash ^ (hash >> 10) ^ (hash >> 20)
    }

    fn entity_fields(&self) -> &'static [NetField<EntityField>] {
        legacy_entity_fields()
    }

    fn player_fields(&self) -> &'static [NetField<PlayerField>] {
        legacy_player_fields()
    }

    fn codec_rules(&self) -> CodecRules {
        CodecRules {
            anim_time_scale: 100.0,
            anim_time_reuse: false,
            delta_coords: false,
        }
    }
}

impl ProtocolStrategy for ModernProtocol {
    fn name(&self) -> &'static str {
        "modern"
    }

    fn entity_num_bits(&self) -> u32 {
        11
    }

    fn string_mode(&self) -> StringMode {
        StringMode::Scrambled
    }

    fn hash_key(&self, text: &str, max_len: usize) -> u32 {
        let mut hash: u32 = 0;
        for (i, &b) in text.as_bytes().iter().take(max_len).enumerate() {
            if b == 0 {
                break;
            }
            let c = b.to_ascii_lowercase();
            hash = hash.wrapping_add((c as u32).wrapping_mul(131 + i as u32));
        }
        hash ^ (hash >> 12) ^ (hash >> 24)
    }

    fn entity_fields(&self) -> &'static [NetField<EntityField>] {
        modern_entity_fields()
    }

    fn player_fields(&self) -> &'static [NetField<PlayerField>] {
        modern_player_fields()
    }

    fn codec_rules(&self) -> CodecRules {
        CodecRules {
            anim_time_scale: 64.0,
            anim_time_reuse: true,
            delta_coords: true,
        }
    }

    fn write_gamestate_trailer(&self, w: &mut BitWriter, t: &GamestateTrailer) -> NetResult<()> {
        w.write_long(t.client_num)?;
        w.write_long(t.checksum_feed)?;
        w.write_float(t.server_delta_time)
    }

    fn read_gamestate_trailer(&self, r: &mut BitReader<'_>) -> NetResult<GamestateTrailer> {
        Ok(GamestateTrailer {
            client_num: r.read_long()?,
            checksum_feed: r.read_long()?,
            server_delta_time: r.read_float()?,
        })
    }
}

static LEGACY: LegacyProtocol = LegacyProtocol;
static MODERN: ModernProtocol = ModernProtocol;

/// Strategy for a negotiated protocol version.
pub fn strategy_for(version: u32) -> NetResult<&'static dyn ProtocolStrategy> {
    match version {
        6 | 8 => Ok(&LEGACY),
        15..=17 => Ok(&MODERN),
        other => Err(NetError::UnsupportedProtocol(other)),
    }
}

/// Looks up `key` in a `\key\value\key\value` info string.
pub fn info_value_for_key<'a>(info: &'a str, key: &str) -> Option<&'a str> {
    let mut parts = info.strip_prefix('\\').unwrap_or(info).split('\\');
    while let Some(k) = parts.next() {
        let v = parts.next()?;
        if k.eq_ignore_ascii_case(key) {
            return Some(v);
        }
    }
    None
}

/// Appends `\key\value` to an info string.
pub fn info_set_value(info: &mut String, key: &str, value: &str) {
    info.push('\\');
    info.push_str(key);
    info.push('\\');
    info.push_str(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_pick_families() {
        assert_eq!(strategy_for(8).unwrap().name(), "legacy");
        assert_eq!(strategy_for(6).unwrap().name(), "legacy");
        assert_eq!(strategy_for(17).unwrap().name(), "modern");
        assert!(matches!(
            strategy_for(9),
            Err(NetError::UnsupportedProtocol(9))
        ));
    }

    #[test]
    fn families_differ_where_expected() {
        let legacy = strategy_for(8).unwrap();
        let modern = strategy_for(17).unwrap();
        assert_eq!(legacy.entity_num_bits(), 10);
        assert_eq!(modern.entity_num_bits(), 11);
        assert_eq!(legacy.string_mode(), StringMode::Normal);
        assert_eq!(modern.string_mode(), StringMode::Scrambled);
        assert_ne!(
            legacy.hash_key("cs 3 \"hello\"", KEY_HASH_CHARS),
            modern.hash_key("cs 3 \"hello\"", KEY_HASH_CHARS)
        );
    }

    #[test]
    fn hash_respects_max_len() {
        let s = strategy_for(8).unwrap();
        let long = "x".repeat(64);
        assert_eq!(
            s.hash_key(&long, KEY_HASH_CHARS),
            s.hash_key(&long[..KEY_HASH_CHARS], KEY_HASH_CHARS)
        );
        assert_eq!(s.hash_key("", KEY_HASH_CHARS), 0);
    }

    #[test]
    fn modern_hash_ignores_case() {
        let s = strategy_for(17).unwrap();
        assert_eq!(s.hash_key("Print Hi", 32), s.hash_key("print hi", 32));
    }

    #[test]
    fn modern_trailer_carries_time_delta() {
        let t = GamestateTrailer {
            client_num: 2,
            checksum_feed: -77,
            server_delta_time: 0.05,
        };
        for version in [8, 17] {
            let s = strategy_for(version).unwrap();
            let mut w = BitWriter::new();
            s.write_gamestate_trailer(&mut w, &t).unwrap();
            let bytes = w.finish();
            let got = s.read_gamestate_trailer(&mut BitReader::new(&bytes)).unwrap();
            assert_eq!(got.client_num, 2);
            assert_eq!(got.checksum_feed, -77);
            let expected = if version == 17 { 0.05 } else { 0.0 };
            assert_eq!(got.server_delta_time, expected);
        }
    }

    #[test]
    fn opcodes_reject_unknown_bytes() {
        assert_eq!(ServerOp::try_from(7).unwrap(), ServerOp::Snapshot);
        assert!(matches!(ServerOp::try_from(0), Err(NetError::BadOpcode(0))));
        assert!(matches!(ServerOp::try_from(200), Err(NetError::BadOpcode(200))));
        assert_eq!(ClientOp::try_from(3).unwrap(), ClientOp::MoveNoDelta);
    }

    #[test]
    fn info_strings() {
        let mut info = String::new();
        info_set_value(&mut info, "sv_serverid", "1234");
        info_set_value(&mut info, "name", "Player");
        assert_eq!(info_value_for_key(&info, "sv_serverid"), Some("1234"));
        assert_eq!(info_value_for_key(&info, "NAME"), Some("Player"));
        assert_eq!(info_value_for_key(&info, "missing"), None);
    }
}
