//! Configuration.
//!
//! Loads client and server configuration from JSON strings (file IO left to
//! the app). Every field has a default so a partial document is enough.

use serde::{Deserialize, Serialize};

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address, e.g. `127.0.0.1:12203`.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,
    /// Protocol version to negotiate.
    #[serde(default = "default_protocol")]
    pub protocol: u32,
    #[serde(default = "default_player_name")]
    pub player_name: String,
    /// Port tag sent with every packet; random when absent.
    #[serde(default)]
    pub qport: Option<u16>,
    /// Replay user commands locally instead of interpolating snapshots.
    #[serde(default = "default_true")]
    pub predict: bool,
    /// Always request uncompressed snapshots.
    #[serde(default)]
    pub no_delta: bool,
    /// Silence after which the connection reports a timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Time over which a prediction error is smoothed out.
    #[serde(default = "default_error_decay_ms")]
    pub error_decay_ms: u32,
    /// Upper bound on outgoing packets per second.
    #[serde(default = "default_packets_per_second")]
    pub packets_per_second: u32,
    /// User commands packed into one packet.
    #[serde(default = "default_max_packet_cmds")]
    pub max_packet_cmds: usize,
}

fn default_server_addr() -> String {
    "127.0.0.1:12203".to_string()
}

fn default_protocol() -> u32 {
    8
}

fn default_player_name() -> String {
    "Player".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_error_decay_ms() -> u32 {
    100
}

fn default_packets_per_second() -> u32 {
    30
}

fn default_max_packet_cmds() -> usize {
    crate::protocol::MAX_PACKET_USERCMDS
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            protocol: default_protocol(),
            player_name: default_player_name(),
            qport: None,
            predict: true,
            no_delta: false,
            timeout_ms: default_timeout_ms(),
            error_decay_ms: default_error_decay_ms(),
            packets_per_second: default_packets_per_second(),
            max_packet_cmds: default_max_packet_cmds(),
        }
    }
}

impl ClientConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// User commands per packet, kept within `1..=MAX_PACKET_USERCMDS` so the
    /// count always fits its byte on the wire.
    pub fn packet_cmds(&self) -> usize {
        self.max_packet_cmds
            .clamp(1, crate::protocol::MAX_PACKET_USERCMDS)
    }
}

/// Reference server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address.
    #[serde(default = "default_server_addr")]
    pub addr: String,
    /// Protocol version spoken by this server.
    #[serde(default = "default_protocol")]
    pub protocol: u32,
    /// Snapshot rate.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    /// Map name announced in the serverinfo configstring.
    #[serde(default = "default_map")]
    pub map: String,
    /// Interpolation delta announced to modern clients, in seconds.
    #[serde(default = "default_delta_time")]
    pub server_delta_time: f32,
    /// Fixed checksum feed; random when absent.
    #[serde(default)]
    pub checksum_feed: Option<i32>,
}

fn default_tick_hz() -> u32 {
    20
}

fn default_map() -> String {
    "dm/flat".to_string()
}

fn default_delta_time() -> f32 {
    0.05
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
            protocol: default_protocol(),
            tick_hz: default_tick_hz(),
            map: default_map(),
            server_delta_time: default_delta_time(),
            checksum_feed: None,
        }
    }
}

impl ServerConfig {
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Milliseconds per server frame.
    pub fn frame_msec(&self) -> u32 {
        1000 / self.tick_hz.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_client_config_uses_defaults() {
        let cfg = ClientConfig::from_json_str(r#"{"protocol": 17, "no_delta": true}"#).unwrap();
        assert_eq!(cfg.protocol, 17);
        assert!(cfg.no_delta);
        assert!(cfg.predict);
        assert_eq!(cfg.player_name, "Player");
        assert_eq!(cfg.max_packet_cmds, 32);
        assert_eq!(cfg.qport, None);
    }

    #[test]
    fn packet_command_count_is_clamped() {
        let cfg = ClientConfig::from_json_str(r#"{"max_packet_cmds": 300}"#).unwrap();
        assert_eq!(cfg.packet_cmds(), 32);
        let cfg = ClientConfig::from_json_str(r#"{"max_packet_cmds": 0}"#).unwrap();
        assert_eq!(cfg.packet_cmds(), 1);
        assert_eq!(ClientConfig::default().packet_cmds(), 32);
    }

    #[test]
    fn server_config_frame_time() {
        let cfg = ServerConfig::from_json_str(r#"{"tick_hz": 40}"#).unwrap();
        assert_eq!(cfg.frame_msec(), 25);
        assert_eq!(cfg.map, "dm/flat");
        assert_eq!(ServerConfig::default().frame_msec(), 50);
    }
}
