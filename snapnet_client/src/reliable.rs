//! Reliable command channel.
//!
//! Client commands are numbered and resent in every packet until the server
//! acknowledges them. Server commands arrive numbered as well and are
//! delivered exactly once, in order, however often the server repeats them.

use snapnet_shared::error::{NetError, NetResult};
use snapnet_shared::msg::MAX_STRING_CHARS;
use snapnet_shared::protocol::{ProtocolStrategy, KEY_HASH_CHARS, MAX_RELIABLE_COMMANDS};
use snapnet_shared::ring::SequenceRing;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct ReliableChannel {
    /// Outgoing commands, keyed by sequence.
    outgoing: SequenceRing<String>,
    reliable_sequence: i32,
    reliable_acknowledge: i32,

    /// Incoming server commands, keyed by sequence.
    incoming: SequenceRing<String>,
    /// Highest server command received.
    server_command_sequence: i32,
    /// Highest server command handed to the application.
    last_executed: i32,
}

impl Default for ReliableChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ReliableChannel {
    pub fn new() -> Self {
        Self {
            outgoing: SequenceRing::new(MAX_RELIABLE_COMMANDS),
            reliable_sequence: 0,
            reliable_acknowledge: 0,
            incoming: SequenceRing::new(MAX_RELIABLE_COMMANDS),
            server_command_sequence: 0,
            last_executed: 0,
        }
    }

    pub fn reliable_sequence(&self) -> i32 {
        self.reliable_sequence
    }

    pub fn reliable_acknowledge(&self) -> i32 {
        self.reliable_acknowledge
    }

    pub fn server_command_sequence(&self) -> i32 {
        self.server_command_sequence
    }

    /// Queues a client command. Fails once the unacknowledged window is full
    /// or when the text cannot go on the wire.
    pub fn add_command(&mut self, text: impl Into<String>) -> NetResult<i32> {
        let text = text.into();
        if text.len() >= MAX_STRING_CHARS {
            warn!(len = text.len(), "client command too long");
            return Err(NetError::StringTooLong(MAX_STRING_CHARS));
        }
        let pending = self.reliable_sequence - self.reliable_acknowledge;
        if pending >= MAX_RELIABLE_COMMANDS as i32 {
            warn!(pending, "client command overflow");
            return Err(NetError::ReliableOverflow {
                pending: pending as u32,
            });
        }
        self.reliable_sequence += 1;
        self.outgoing.insert(self.reliable_sequence, text);
        Ok(self.reliable_sequence)
    }

    /// Applies the server's acknowledgement. Values outside the sent window
    /// are clamped instead of trusted.
    pub fn acknowledge(&mut self, ack: i32) {
        let ack = ack.clamp(
            self.reliable_sequence - MAX_RELIABLE_COMMANDS as i32,
            self.reliable_sequence,
        );
        if ack > self.reliable_acknowledge {
            self.reliable_acknowledge = ack;
        }
    }

    /// Commands in `(ack, seq]`, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = (i32, &str)> + '_ {
        (self.reliable_acknowledge + 1..=self.reliable_sequence)
            .filter_map(|seq| self.outgoing.get(seq).map(|t| (seq, t.as_str())))
    }

    /// Stores a server command. Returns `false` for one already seen.
    pub fn receive_server_command(&mut self, sequence: i32, text: String) -> bool {
        if sequence <= self.server_command_sequence {
            debug!(sequence, "duplicate server command");
            return false;
        }
        self.server_command_sequence = sequence;
        self.incoming.insert(sequence, text);
        true
    }

    /// Next server command not yet handed out.
    pub fn next_server_command(&mut self) -> Option<(i32, String)> {
        while self.last_executed < self.server_command_sequence {
            self.last_executed += 1;
            if let Some(text) = self.incoming.get(self.last_executed) {
                return Some((self.last_executed, text.clone()));
            }
            warn!(sequence = self.last_executed, "server command lost from window");
        }
        None
    }

    /// Server commands from a fresh gamestate start counting at `sequence`.
    /// Nothing received before the gamestate is kept.
    pub fn reset_server_commands(&mut self, sequence: i32) {
        self.incoming.clear();
        self.server_command_sequence = sequence;
        self.last_executed = sequence;
    }

    /// Key binding the user command encoding to connection state.
    pub fn integrity_key(
        &self,
        challenge: i32,
        server_message_sequence: i32,
        strategy: &dyn ProtocolStrategy,
    ) -> u32 {
        let last = self
            .incoming
            .get(self.server_command_sequence)
            .map_or("", String::as_str);
        challenge as u32
            ^ server_message_sequence as u32
            ^ strategy.hash_key(last, KEY_HASH_CHARS)
    }
}
