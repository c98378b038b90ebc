//! Connection events.
//!
//! The connection never calls back into the application. Everything worth
//! reporting is queued here and drained by the caller after `tick()`.

use std::collections::VecDeque;

use snapnet_shared::error::NetError;

/// Something the application should know about.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A new reliable server command, delivered once and in order.
    ServerCommand { sequence: i32, text: String },
    /// A gamestate was parsed; configstrings and baselines are available.
    GamestateLoaded { server_id: i32, client_num: i32 },
    /// A valid snapshot was stored.
    SnapshotReceived { message_num: i32, server_time: i32 },
    Centerprint(String),
    Locprint { x: i16, y: i16, text: String },
    CgameMessage(Vec<u8>),
    /// One block of a download; storage is the caller's concern.
    DownloadBlock { block: u16, data: Vec<u8> },
    /// A message was rejected. The connection stays up; disconnecting is the
    /// caller's call.
    ProtocolError(NetError),
    /// Nothing was heard from the server for the configured timeout.
    TimedOut,
    Disconnected { reason: String },
}

#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<ConnectionEvent>,
}

impl EventQueue {
    pub fn push(&mut self, event: ConnectionEvent) {
        self.events.push_back(event);
    }

    pub fn drain(&mut self) -> impl Iterator<Item = ConnectionEvent> + '_ {
        self.events.drain(..)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
