//! Wire formats for probing and penalty feedback.
//!
//! Control messages share the datagram stream with application data and are
//! told apart by a short ASCII marker at the start of the payload:
//!
//! ```text
//! Probe request:   "0x69"  │ probe id (u64, little endian)
//! Probe response:  "0x420" │ probe id (u64, little endian)
//! Penalty batch:   "69"    │ bincode { seq_id: u32, penalties: [..] }
//! ```
//!
//! Everything else is application data. An encoded penalty batch never
//! exceeds [`crate::MAX_PENALTY_PAYLOAD`] bytes.

mod codec;
mod extension;
mod penalty;
mod probe;

pub use codec::{ControlCodec, ControlMessage};
pub use extension::{LatencyProbeResponder, ReceiveChain, ReceiveExtension};
pub use penalty::{
    PenaltyBatch, PenaltyNotification, PenaltySequence, BROADCAST_FINGERPRINT, PENALTY_HEADER,
};
pub use probe::{ProbeMessage, PROBE_REQUEST, PROBE_RESPONSE};
