//! Per-link path metadata.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::IsdAs;

/// Metadata of a single inter-AS link on a path.
///
/// Zero latency or bandwidth means "unknown".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkMetadata {
    /// One-way latency in microseconds.
    #[serde(default)]
    pub latency_us: u32,
    /// Bandwidth in kbit/s.
    #[serde(default)]
    pub bandwidth_kbps: u32,
    pub from_interface: u64,
    pub from_ia: IsdAs,
    pub to_interface: u64,
    pub to_ia: IsdAs,
    /// Free-form label for links under traffic control in test setups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl LinkMetadata {
    pub fn new(from_ia: IsdAs, from_interface: u64, to_ia: IsdAs, to_interface: u64) -> Self {
        Self {
            latency_us: 0,
            bandwidth_kbps: 0,
            from_interface,
            from_ia,
            to_interface,
            to_ia,
            label: None,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_us = u32::try_from(latency.as_micros()).unwrap_or(u32::MAX);
        self
    }

    pub fn with_bandwidth(mut self, kbps: u32) -> Self {
        self.bandwidth_kbps = kbps;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Direction independent identifier of the link:
    /// both `IA;ifid` endpoints, sorted and comma joined.
    pub fn canonical_description(&self) -> String {
        let a = format!("{};{}", self.from_ia, self.from_interface);
        let b = format!("{};{}", self.to_ia, self.to_interface);
        if a <= b {
            format!("{a},{b}")
        } else {
            format!("{b},{a}")
        }
    }

    pub fn latency(&self) -> Option<Duration> {
        (self.latency_us != 0).then(|| Duration::from_micros(u64::from(self.latency_us)))
    }
}

impl fmt::Display for LinkMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}#{}", self.from_ia, self.from_interface)?;

        let mut qos = Vec::new();
        if self.bandwidth_kbps != 0 {
            qos.push(format!("{}kbit/s", self.bandwidth_kbps));
        }
        if self.latency_us > 1000 {
            qos.push(format!("{}ms", self.latency_us / 1000));
        } else if self.latency_us != 0 {
            qos.push(format!("{}us", self.latency_us));
        }
        if !qos.is_empty() {
            write!(f, "({})", qos.join(", "))?;
        }

        write!(f, " > {}#{}]", self.to_ia, self.to_interface)
    }
}

/// Metadata of a whole path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathMetadata {
    pub links: Vec<LinkMetadata>,
    #[serde(default)]
    pub mtu: u16,
}

impl PathMetadata {
    pub fn new(links: Vec<LinkMetadata>, mtu: u16) -> Self {
        Self { links, mtu }
    }

    /// Sum of all link latencies, `None` if any link latency is unknown.
    pub fn full_path_latency(&self) -> Option<Duration> {
        if self.links.iter().any(|l| l.latency_us == 0) {
            return None;
        }
        Some(self.path_latency())
    }

    /// Minimum link bandwidth, `None` if any link bandwidth is unknown.
    pub fn full_path_bandwidth(&self) -> Option<u32> {
        if self.links.iter().any(|l| l.bandwidth_kbps == 0) {
            return None;
        }
        self.links.iter().map(|l| l.bandwidth_kbps).min()
    }

    /// Sum of the known link latencies.
    pub fn path_latency(&self) -> Duration {
        let micros: u64 = self.links.iter().map(|l| u64::from(l.latency_us)).sum();
        Duration::from_micros(micros)
    }

    /// Minimum of the known link bandwidths.
    pub fn path_bandwidth(&self) -> Option<u32> {
        self.links
            .iter()
            .map(|l| l.bandwidth_kbps)
            .filter(|&b| b != 0)
            .min()
    }

    /// Links of `self` that also appear (in any direction) on `other`.
    pub fn shared_links<'a>(&'a self, other: &PathMetadata) -> Vec<&'a LinkMetadata> {
        let ids: HashSet<String> = other.links.iter().map(LinkMetadata::canonical_description).collect();
        self.links
            .iter()
            .filter(|l| ids.contains(&l.canonical_description()))
            .collect()
    }

    /// Fraction of links shared with `other`, relative to the shorter path.
    pub fn link_overlap(&self, other: &PathMetadata) -> f64 {
        let shortest = self.links.len().min(other.links.len());
        if shortest == 0 {
            return 0.0;
        }
        self.shared_links(other).len() as f64 / shortest as f64
    }

    /// ASes traversed by both paths.
    pub fn shared_ases(&self, other: &PathMetadata) -> HashSet<IsdAs> {
        let theirs: HashSet<IsdAs> = other.links.iter().flat_map(|l| [l.from_ia, l.to_ia]).collect();
        self.links
            .iter()
            .flat_map(|l| [l.from_ia, l.to_ia])
            .filter(|ia| theirs.contains(ia))
            .collect()
    }

    /// Number of links carrying a label.
    pub fn labeled_links(&self) -> usize {
        self.links.iter().filter(|l| l.label.is_some()).count()
    }

    /// First label found on the path.
    pub fn label(&self) -> Option<&str> {
        self.links.iter().find_map(|l| l.label.as_deref())
    }
}

impl fmt::Display for PathMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MTU {}, hops {}", self.mtu, self.links.len())?;
        if let Some(latency) = self.full_path_latency() {
            write!(f, ", latency (full): {}ms", latency.as_millis())?;
        } else if self.path_latency() > Duration::ZERO {
            write!(f, ", latency (partial): >{}ms", self.path_latency().as_millis())?;
        }
        if let Some(bandwidth) = self.full_path_bandwidth() {
            write!(f, ", bandwidth (full): {bandwidth}kbit/s")?;
        } else if let Some(bandwidth) = self.path_bandwidth() {
            write!(f, ", bandwidth (partial): >{bandwidth}kbit/s")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ia(s: &str) -> IsdAs {
        s.parse().unwrap()
    }

    fn link(from: &str, fi: u64, to: &str, ti: u64) -> LinkMetadata {
        LinkMetadata::new(ia(from), fi, ia(to), ti)
    }

    #[test]
    fn test_canonical_description_direction_independent() {
        let forward = link("1-ff00:0:110", 1, "1-ff00:0:111", 2);
        let backward = link("1-ff00:0:111", 2, "1-ff00:0:110", 1);
        assert_eq!(forward.canonical_description(), backward.canonical_description());
        assert_eq!(forward.canonical_description(), "1-ff00:0:110;1,1-ff00:0:111;2");
    }

    #[test]
    fn test_latency_aggregates() {
        let meta = PathMetadata::new(
            vec![
                link("1-ff00:0:110", 1, "1-ff00:0:111", 2).with_latency(Duration::from_millis(5)),
                link("1-ff00:0:111", 3, "1-ff00:0:112", 4),
            ],
            1400,
        );
        assert_eq!(meta.full_path_latency(), None);
        assert_eq!(meta.path_latency(), Duration::from_millis(5));
    }

    #[test]
    fn test_bandwidth_aggregates() {
        let meta = PathMetadata::new(
            vec![
                link("1-ff00:0:110", 1, "1-ff00:0:111", 2).with_bandwidth(1000),
                link("1-ff00:0:111", 3, "1-ff00:0:112", 4).with_bandwidth(200),
            ],
            1400,
        );
        assert_eq!(meta.full_path_bandwidth(), Some(200));
        assert_eq!(meta.path_bandwidth(), Some(200));

        let partial = PathMetadata::new(
            vec![
                link("1-ff00:0:110", 1, "1-ff00:0:111", 2),
                link("1-ff00:0:111", 3, "1-ff00:0:112", 4).with_bandwidth(300),
            ],
            1400,
        );
        assert_eq!(partial.full_path_bandwidth(), None);
        assert_eq!(partial.path_bandwidth(), Some(300));
    }

    #[test]
    fn test_link_overlap() {
        let a = PathMetadata::new(
            vec![
                link("1-ff00:0:110", 1, "1-ff00:0:111", 2),
                link("1-ff00:0:111", 3, "1-ff00:0:112", 4),
            ],
            1400,
        );
        let b = PathMetadata::new(
            vec![
                link("1-ff00:0:110", 1, "1-ff00:0:111", 2),
                link("1-ff00:0:111", 5, "1-ff00:0:113", 6),
                link("1-ff00:0:113", 7, "1-ff00:0:112", 8),
            ],
            1400,
        );
        assert!((a.link_overlap(&b) - 0.5).abs() < f64::EPSILON);
        assert!((a.link_overlap(&a) - 1.0).abs() < f64::EPSILON);
        assert_eq!(a.shared_ases(&b).len(), 3);

        let empty = PathMetadata::new(vec![], 0);
        assert_eq!(a.link_overlap(&empty), 0.0);
    }

    #[test]
    fn test_labels() {
        let meta = PathMetadata::new(
            vec![
                link("16-ffaa:1:ede", 6, "16-ffaa:1:f04", 1).with_label("group 0"),
                link("16-ffaa:1:f04", 2, "16-ffaa:0:1001", 3),
            ],
            1400,
        );
        assert_eq!(meta.labeled_links(), 1);
        assert_eq!(meta.label(), Some("group 0"));
    }
}
