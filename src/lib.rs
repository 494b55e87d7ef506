//! Ranging core for multi-node UWB networks
//!
//! This crate implements the media-access and measurement layer of an
//! ultra-wideband distance-measurement network on top of an external
//! transceiver driver:
//!
//! - [`tdma`]: a slot scheduler dividing a fixed superframe among the nodes
//! - [`sync`]: beacon-driven clock synchronization with watchdog
//!   extrapolation across missed beacons
//! - [`nrng`]: an N-node double-sided two-way ranging engine measuring one
//!   initiator against many responders in a single 4-stage exchange
//! - [`frame`]: the wire codec shared by all exchange stages
//!
//! The transceiver and the host's timers are reached through the traits in
//! [`radio`] and [`host`]; the crate itself contains no hardware access.
//!
//! # Usage
//!
//! An initiator opens a round and blocks until it terminates:
//!
//! ```no_run
//! # use std::sync::{Arc, Mutex};
//! # use uwb_nrng::{Nrng, NrngConfig, Role, frame::Opcode};
//! # fn demo<R: uwb_nrng::radio::Radio>(radio: Arc<Mutex<R>>) -> uwb_nrng::Result<()> {
//! let nrng = Nrng::new(radio, NrngConfig::default(), Role::Initiator, 0x1001, 0, 4, 8)?;
//! let outcome = nrng.request(0xFFFF, Opcode::Request, 1, 4)?;
//! println!("{} of 4 responders answered", outcome.resp_count);
//! # Ok(())
//! # }
//! ```
//!
//! while the host's event loop feeds transceiver completions into the same
//! engine through [`radio::Dispatcher`].

#![warn(missing_docs)]

pub mod frame;
pub mod host;
pub mod nrng;
pub mod radio;
pub mod sync;
pub mod tdma;
pub mod time;

pub use crate::nrng::{Nrng, NrngConfig, Role, RoundOutcome};
pub use crate::radio::{Dispatcher, Protocol, ProtocolId, Radio, RadioEvent};
pub use crate::sync::{BeaconFrame, ClockSync, SyncConfig, SyncState};
pub use crate::tdma::Tdma;
pub use crate::time::{Duration, Instant};

use thiserror::Error as ThisError;

/// An error that can occur in this crate
#[derive(Debug, ThisError)]
pub enum Error {
    /// A slot index beyond the configured superframe was used.
    #[error("slot {slot} is out of range for a superframe of {nslots} slots")]
    SlotOutOfRange {
        /// The offending slot index.
        slot: u16,
        /// The configured number of slots.
        nslots: u16,
    },

    /// A delayed transmission could not be started, typically because its
    /// programmed start time had already passed.
    #[error("transmission failed to start")]
    TxStart,

    /// The provided buffer is too small
    #[error("buffer too small, {required_len} bytes required")]
    BufferTooSmall {
        /// Indicates how large a buffer would have been required.
        required_len: usize,
    },

    /// A frame could not be serialized or deserialized.
    #[error("frame codec error: {0}")]
    Codec(#[from] ssmarshal::Error),

    /// The engine or scheduler was constructed with inconsistent parameters.
    #[error("invalid configuration")]
    InvalidConfiguration,
}

/// Specialized `Result` type for this crate's operations.
pub type Result<T> = core::result::Result<T, Error>;
