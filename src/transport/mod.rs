//! Path-aware transport seam.
//!
//! The underlying network (path discovery, datagram framing) is out of scope.
//! A [`PathTransport`] exposes the candidate paths it currently knows, takes
//! the ranked order the pipeline produced and sends datagrams, optionally
//! pinned to one path.

mod loopback;

pub use loopback::{EchoProfile, LoopbackTransport, SentDatagram};

use bytes::Bytes;

use crate::error::Result;
use crate::path::{Path, PathSet};
use crate::types::Endpoint;

/// An incoming datagram.
#[derive(Debug, Clone)]
pub struct Message {
    pub payload: Bytes,
    /// Sender address, if known.
    pub source: Option<Endpoint>,
    /// Path to answer on (the path the datagram arrived over).
    pub reply_path: Option<Path>,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            source: None,
            reply_path: None,
        }
    }

    pub fn with_source(mut self, source: Endpoint) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_reply_path(mut self, path: Path) -> Self {
        self.reply_path = Some(path);
        self
    }
}

/// Result of a send.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    /// Path the datagram actually left on, if the transport knows it.
    pub used_path: Option<Path>,
    pub bytes: usize,
}

/// The path-aware datagram transport a connection runs on.
pub trait PathTransport: Send + Sync {
    fn local_endpoint(&self) -> Endpoint;

    fn remote_endpoint(&self) -> Endpoint;

    /// Candidate paths currently known, unranked.
    fn current_paths(&self) -> PathSet;

    /// Path the transport sends unpinned datagrams on.
    fn chosen_path(&self) -> Option<Path>;

    /// Install the ranked order produced by the pipeline.
    fn apply_ordering(&self, ranked: &[Path]);

    /// Send `payload`, over `path` if given.
    fn send(&self, payload: &[u8], path: Option<&Path>) -> Result<SendOutcome>;

    fn close(&self) {}
}
