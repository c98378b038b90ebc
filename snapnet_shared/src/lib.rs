//! `snapnet_shared`
//!
//! Wire-level building blocks used by both client and server.
//!
//! Design goals:
//! - Deterministic encoding and simulation on both ends.
//! - Per-version behaviour behind one strategy trait, picked once per connection.
//! - Collaborators (socket, clock, compressor) as traits for dependency injection.
//! - No `unsafe`.

pub mod config;
pub mod delta;
pub mod error;
pub mod math;
pub mod msg;
pub mod net;
pub mod netfield;
pub mod pmove;
pub mod protocol;
pub mod ring;
pub mod state;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::error::*;
    pub use crate::math::*;
    pub use crate::msg::{BitReader, BitWriter, StringMode};
    pub use crate::net::*;
    pub use crate::protocol::{strategy_for, ProtocolStrategy};
    pub use crate::state::*;
}
