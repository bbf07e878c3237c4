//! Penalty notifications.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::path::Path;
use crate::types::ChannelType;
use crate::MAX_PENALTY_PAYLOAD;

/// Marker of a penalty batch.
pub const PENALTY_HEADER: &[u8] = b"69";

/// Path identifier meaning "whatever paths you currently use".
pub const BROADCAST_FINGERPRINT: &str = "--";

/// One penalty (positive) or reward (negative) for a path and channel type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PenaltyNotification {
    pub weight: f64,
    pub channel_type: ChannelType,
    /// Short canonical fingerprint, or [`BROADCAST_FINGERPRINT`].
    pub path_fingerprint: String,
}

impl PenaltyNotification {
    pub fn for_path(weight: f64, channel_type: ChannelType, path: &Path) -> Self {
        Self {
            weight,
            channel_type,
            path_fingerprint: path.canonical_fingerprint_short().to_string(),
        }
    }

    pub fn broadcast(weight: f64, channel_type: ChannelType) -> Self {
        Self {
            weight,
            channel_type,
            path_fingerprint: BROADCAST_FINGERPRINT.to_string(),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.path_fingerprint == BROADCAST_FINGERPRINT
    }
}

/// A sequenced set of notifications sent as one datagram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PenaltyBatch {
    pub seq_id: u32,
    pub penalties: Vec<PenaltyNotification>,
}

impl PenaltyBatch {
    pub fn new(seq_id: u32, penalties: Vec<PenaltyNotification>) -> Self {
        Self { seq_id, penalties }
    }

    /// Header plus bincode body.
    ///
    /// # Panics
    ///
    /// If the encoded batch exceeds [`MAX_PENALTY_PAYLOAD`] bytes. Batches are
    /// built from a handful of entries; exceeding one segment is a bug in the
    /// caller.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let body = bincode::serialize(self).map_err(|e| ProtocolError::Serialization(e.to_string()))?;

        let size = PENALTY_HEADER.len() + body.len();
        assert!(
            size <= MAX_PENALTY_PAYLOAD,
            "penalty batch of {size} bytes exceeds {MAX_PENALTY_PAYLOAD}"
        );

        let mut buf = BytesMut::with_capacity(size);
        buf.put_slice(PENALTY_HEADER);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    /// `Ok(None)` if `data` is not a penalty batch.
    pub fn decode(data: &[u8]) -> Result<Option<Self>, ProtocolError> {
        let Some(body) = data.strip_prefix(PENALTY_HEADER) else {
            return Ok(None);
        };
        if body.len() > MAX_PENALTY_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge {
                size: body.len(),
                max: MAX_PENALTY_PAYLOAD,
            });
        }
        bincode::deserialize(body)
            .map(Some)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Monotonic sequence ids for one sender, starting at 1. Clones share the
/// counter.
#[derive(Debug, Clone)]
pub struct PenaltySequence(Arc<AtomicU32>);

impl PenaltySequence {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU32::new(1)))
    }

    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for PenaltySequence {
    fn default() -> Self {
        Self::new()
    }
}
