//! Path model.
//!
//! A [`Path`] is a cheap, clonable handle to one candidate network path. Its
//! identity is the hop fingerprint; the canonical fingerprint is the lesser of
//! the forward and reversed hop string, so both traversal directions of the
//! same route share it.
//!
//! Metadata may arrive after the path was first seen (it is filled lazily by
//! the transport). It is stored behind a lock inside the shared handle and never
//! takes part in equality or hashing.

mod metadata;

pub use metadata::{LinkMetadata, PathMetadata};

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of short (wire) fingerprints in hex characters.
pub const SHORT_FINGERPRINT_LEN: usize = 5;

/// An ordered sequence of candidate paths; order encodes preference.
pub type PathSet = Vec<Path>;

/// One network path.
#[derive(Clone)]
pub struct Path {
    inner: Arc<PathInner>,
}

struct PathInner {
    fingerprint: String,
    fingerprint_short: String,
    canonical: String,
    canonical_short: String,
    hops: usize,
    expiry: Option<SystemTime>,
    metadata: RwLock<Option<Arc<PathMetadata>>>,
}

fn short_fingerprint(fingerprint: &str) -> String {
    let digest = Sha256::digest(fingerprint.as_bytes());
    let mut hex = hex::encode(&digest[..3]);
    hex.truncate(SHORT_FINGERPRINT_LEN);
    hex
}

fn reverse_hops(fingerprint: &str) -> String {
    fingerprint.split(' ').rev().collect::<Vec<_>>().join(" ")
}

impl Path {
    /// Create a path from its space separated hop fingerprint.
    pub fn new(fingerprint: impl Into<String>, hops: usize) -> Self {
        Self::build(fingerprint.into(), hops, None, None)
    }

    fn build(
        fingerprint: String,
        hops: usize,
        expiry: Option<SystemTime>,
        metadata: Option<PathMetadata>,
    ) -> Self {
        let reversed = reverse_hops(&fingerprint);
        let canonical = if reversed < fingerprint {
            reversed
        } else {
            fingerprint.clone()
        };

        Self {
            inner: Arc::new(PathInner {
                fingerprint_short: short_fingerprint(&fingerprint),
                canonical_short: short_fingerprint(&canonical),
                fingerprint,
                canonical,
                hops,
                expiry,
                metadata: RwLock::new(metadata.map(Arc::new)),
            }),
        }
    }

    /// Set the expiration time.
    pub fn with_expiry(self, expiry: SystemTime) -> Self {
        let metadata = self.metadata().map(|m| (*m).clone());
        Self::build(self.inner.fingerprint.clone(), self.inner.hops, Some(expiry), metadata)
    }

    /// Attach metadata.
    pub fn with_metadata(self, metadata: PathMetadata) -> Self {
        self.set_metadata(metadata);
        self
    }

    /// Fill in metadata that arrived after the path was created. Visible to all
    /// clones of this handle.
    pub fn set_metadata(&self, metadata: PathMetadata) {
        *self.inner.metadata.write() = Some(Arc::new(metadata));
    }

    /// The reversed traversal of this path. Metadata is not carried over.
    pub fn reversed(&self) -> Self {
        Self::build(reverse_hops(&self.inner.fingerprint), self.inner.hops, self.inner.expiry, None)
    }

    pub fn fingerprint(&self) -> &str {
        &self.inner.fingerprint
    }

    pub fn fingerprint_short(&self) -> &str {
        &self.inner.fingerprint_short
    }

    pub fn reverse_fingerprint(&self) -> String {
        reverse_hops(&self.inner.fingerprint)
    }

    pub fn canonical_fingerprint(&self) -> &str {
        &self.inner.canonical
    }

    /// First 5 hex characters of SHA-256 over the canonical fingerprint. This
    /// is the identifier carried in penalty notifications.
    pub fn canonical_fingerprint_short(&self) -> &str {
        &self.inner.canonical_short
    }

    pub fn hops(&self) -> usize {
        self.inner.hops
    }

    pub fn expiry(&self) -> Option<SystemTime> {
        self.inner.expiry
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.inner.expiry.is_some_and(|e| e <= now)
    }

    pub fn metadata(&self) -> Option<Arc<PathMetadata>> {
        self.inner.metadata.read().clone()
    }

    pub fn has_metadata(&self) -> bool {
        self.inner.metadata.read().is_some()
    }

    /// Link overlap with `other`, zero if either side lacks metadata.
    pub fn link_overlap(&self, other: &Path) -> f64 {
        match (self.metadata(), other.metadata()) {
            (Some(a), Some(b)) => a.link_overlap(&b),
            _ => 0.0,
        }
    }

    /// Short canonical fingerprint with the traffic control label, if any.
    pub fn display_id(&self) -> String {
        match self.metadata().as_deref().and_then(PathMetadata::label) {
            Some(label) => format!("{} ({label})", self.canonical_fingerprint_short()),
            None => self.canonical_fingerprint_short().to_string(),
        }
    }

    /// Serializable description of this path.
    pub fn describe(&self) -> PathDescription {
        PathDescription {
            fingerprint: self.inner.fingerprint.clone(),
            hops: self.inner.hops,
            expiry: self.inner.expiry,
            metadata: self.metadata().map(|m| (*m).clone()),
        }
    }
}

// Equality and hashing use the canonical fingerprint only: metadata may be
// filled in later, and both traversal directions name the same route.
impl PartialEq for Path {
    fn eq(&self, other: &Self) -> bool {
        self.inner.canonical == other.inner.canonical
    }
}

impl Eq for Path {}

impl Hash for Path {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.canonical.hash(state);
    }
}

// Intentionally abbreviated Debug output - full fingerprints are long
#[allow(clippy::missing_fields_in_debug)]
impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Path")
            .field("id", &self.inner.canonical_short)
            .field("hops", &self.inner.hops)
            .field("metadata", &self.has_metadata())
            .finish()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ID {}", self.canonical_fingerprint_short())?;
        if let Some(meta) = self.metadata() {
            write!(f, " {meta}")?;
        }
        Ok(())
    }
}

/// Serializable form of a [`Path`], used for path set files and diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathDescription {
    pub fingerprint: String,
    pub hops: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<SystemTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PathMetadata>,
}

impl From<PathDescription> for Path {
    fn from(desc: PathDescription) -> Self {
        Path::build(desc.fingerprint, desc.hops, desc.expiry, desc.metadata)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use super::*;
    use crate::types::IsdAs;

    fn ia(s: &str) -> IsdAs {
        s.parse().unwrap()
    }

    #[test]
    fn test_canonical_fingerprint_is_direction_independent() {
        let forward = Path::new("1-ff00:0:110 1>2 1-ff00:0:111 3>4 1-ff00:0:112", 3);
        let backward = forward.reversed();

        assert_ne!(forward.fingerprint(), backward.fingerprint());
        assert_eq!(forward.canonical_fingerprint(), backward.canonical_fingerprint());
        assert_eq!(
            forward.canonical_fingerprint_short(),
            backward.canonical_fingerprint_short()
        );
        assert_eq!(forward, backward);

        let set: HashSet<Path> = [forward.clone(), backward].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_short_fingerprint() {
        let path = Path::new("aaa", 2);
        assert_eq!(path.fingerprint_short().len(), SHORT_FINGERPRINT_LEN);
        // sha256("aaa") = 9834876dcfb0...
        assert_eq!(path.fingerprint_short(), "98348");
        assert_eq!(path.canonical_fingerprint_short(), "98348");
    }

    #[test]
    fn test_metadata_does_not_affect_identity() {
        let bare = Path::new("a b c", 2);
        let rich = Path::new("a b c", 2).with_metadata(PathMetadata::new(
            vec![LinkMetadata::new(ia("1-ff00:0:110"), 1, ia("1-ff00:0:111"), 2)],
            1400,
        ));
        assert_eq!(bare, rich);
        assert!(!bare.has_metadata());
        assert!(rich.has_metadata());
    }

    #[test]
    fn test_lazy_metadata_visible_to_clones() {
        let path = Path::new("x y", 1);
        let clone = path.clone();
        path.set_metadata(PathMetadata::new(vec![], 1280));
        assert_eq!(clone.metadata().unwrap().mtu, 1280);
    }

    #[test]
    fn test_expiry() {
        let now = SystemTime::now();
        let path = Path::new("a", 1).with_expiry(now + Duration::from_secs(60));
        assert!(!path.is_expired(now));
        assert!(path.is_expired(now + Duration::from_secs(61)));
        assert!(!Path::new("b", 1).is_expired(now));
    }

    #[test]
    fn test_description_roundtrip() {
        let path = Path::new("a b", 1).with_metadata(PathMetadata::new(
            vec![LinkMetadata::new(ia("1-ff00:0:110"), 1, ia("1-ff00:0:111"), 2)
                .with_latency(Duration::from_millis(3))],
            1400,
        ));
        let json = serde_json::to_string(&path.describe()).unwrap();
        let back: Path = serde_json::from_str::<PathDescription>(&json).unwrap().into();
        assert_eq!(back, path);
        assert_eq!(back.metadata().unwrap().path_latency(), Duration::from_millis(3));
    }
}
