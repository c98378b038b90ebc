//! `snapnet_client`
//!
//! Client half of the snapshot protocol:
//! - Connection lifecycle and server message parsing
//! - Snapshot history, parse entity arena and entity baselines
//! - Reliable command channel with the user command integrity key
//! - User command generation
//! - Prediction and reconciliation of the local player
//!
//! Everything is driven from [`ClientConnection::tick`]; results come back as
//! [`ConnectionEvent`]s.

pub mod connection;
pub mod events;
pub mod input;
mod parse;
pub mod predict;
pub mod reliable;
pub mod snapshot;

pub use connection::{ClientConnection, ConnState};
pub use events::ConnectionEvent;
pub use input::InputState;
