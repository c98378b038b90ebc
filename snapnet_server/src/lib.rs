//! `snapnet_server`
//!
//! Reference server for the snapnet client:
//! - Challenge/connect handshake over connectionless packets
//! - Gamestate with configstrings and entity baselines
//! - Delta snapshots against the client's acknowledged frame
//! - Reliable server commands and keyed user commands
//!
//! Networking model:
//! - One UDP peer, sequenced messages, no fragmentation

pub mod server;

pub use server::{GameServer, PeerPhase};
