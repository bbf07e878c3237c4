//! Core types used throughout pathsteer.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Identity of the set of paths a quality monitor currently attributes its
/// samples to. A new token is minted on every genuine path switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PathSetToken(Uuid);

impl PathSetToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for PathSetToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Media channel a connection carries. Penalties are tracked per channel type
/// because a path may be fine for audio while breaking down under video load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Audio,
    Video,
    Data,
}

impl ChannelType {
    pub const ALL: [ChannelType; 3] = [ChannelType::Audio, ChannelType::Video, ChannelType::Data];

    /// Whether call quality monitoring applies to this channel.
    pub fn is_media(self) -> bool {
        matches!(self, ChannelType::Audio | ChannelType::Video)
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelType::Audio => write!(f, "audio"),
            ChannelType::Video => write!(f, "video"),
            ChannelType::Data => write!(f, "data"),
        }
    }
}

impl FromStr for ChannelType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "audio" => Ok(ChannelType::Audio),
            "video" => Ok(ChannelType::Video),
            "data" => Ok(ChannelType::Data),
            other => Err(Error::InvalidConfig(format!("unknown channel type: {other}"))),
        }
    }
}

/// Opaque signal carried through a pipeline run.
///
/// By convention [`ProcessContext::FAILOVER`] marks a run triggered by a
/// failover-worthy change and [`ProcessContext::ROUTINE`] a plain
/// re-evaluation. Other values pass through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ProcessContext(pub i64);

impl ProcessContext {
    pub const ROUTINE: Self = Self(0);
    pub const FAILOVER: Self = Self(1);

    pub fn is_failover(self) -> bool {
        self == Self::FAILOVER
    }
}

impl From<i64> for ProcessContext {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ProcessContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ROUTINE => write!(f, "routine"),
            Self::FAILOVER => write!(f, "failover"),
            Self(other) => write!(f, "ctx({other})"),
        }
    }
}

/// ISD-AS identifier of a path-aware network address.
///
/// Displayed as `ISD-AS`, with AS numbers in the BGP range printed in decimal
/// and larger ones as three colon separated hex groups (`1-ff00:0:110`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IsdAs {
    pub isd: u16,
    pub asn: u64,
}

const BGP_AS_MAX: u64 = u32::MAX as u64;
const AS_MAX: u64 = (1 << 48) - 1;

impl IsdAs {
    pub fn new(isd: u16, asn: u64) -> Self {
        Self { isd, asn }
    }
}

impl fmt::Display for IsdAs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.asn <= BGP_AS_MAX {
            write!(f, "{}-{}", self.isd, self.asn)
        } else {
            write!(
                f,
                "{}-{:x}:{:x}:{:x}",
                self.isd,
                (self.asn >> 32) & 0xffff,
                (self.asn >> 16) & 0xffff,
                self.asn & 0xffff
            )
        }
    }
}

impl FromStr for IsdAs {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidConfig(format!("invalid ISD-AS: {s}"));

        let (isd, asn) = s.split_once('-').ok_or_else(invalid)?;
        let isd: u16 = isd.parse().map_err(|_| invalid())?;

        let asn = if asn.contains(':') {
            let groups: Vec<&str> = asn.split(':').collect();
            if groups.len() != 3 {
                return Err(invalid());
            }
            groups.iter().try_fold(0u64, |acc, group| {
                u16::from_str_radix(group, 16)
                    .map(|g| (acc << 16) | u64::from(g))
                    .map_err(|_| invalid())
            })?
        } else {
            let value: u64 = asn.parse().map_err(|_| invalid())?;
            if value > BGP_AS_MAX {
                return Err(invalid());
            }
            value
        };

        if asn > AS_MAX {
            return Err(invalid());
        }

        Ok(Self { isd, asn })
    }
}

impl TryFrom<String> for IsdAs {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IsdAs> for String {
    fn from(value: IsdAs) -> Self {
        value.to_string()
    }
}

/// Address of one end of a path-aware connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub ia: IsdAs,
    pub host: SocketAddr,
}

impl Endpoint {
    pub fn new(ia: IsdAs, host: SocketAddr) -> Self {
        Self { ia, host }
    }

    /// Whether `other` lives in a different AS.
    pub fn is_foreign_to(&self, other: &Endpoint) -> bool {
        self.ia != other.ia
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.ia, self.host)
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ia, host) = s
            .split_once(',')
            .ok_or_else(|| Error::InvalidConfig(format!("invalid endpoint: {s}")))?;
        let host = host
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("invalid endpoint host {host}: {e}")))?;
        Ok(Self { ia: ia.parse()?, host })
    }
}

/// Shared on/off switch.
///
/// Components own a private `Toggle` by default. The process-wide "latency
/// probing paused" and "penalty sending enabled" switches are opt-in for
/// callers that want one flag to govern every instance.
#[derive(Debug, Clone)]
pub struct Toggle(Arc<AtomicBool>);

impl Toggle {
    pub fn new(value: bool) -> Self {
        Self(Arc::new(AtomicBool::new(value)))
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, value: bool) {
        self.0.store(value, Ordering::Relaxed);
    }

    /// Whether both handles flip the same switch.
    pub fn is_same(&self, other: &Toggle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Process-wide "latency probing paused" flag. Off by default.
    pub fn probing_paused() -> Self {
        static PAUSED: OnceLock<Toggle> = OnceLock::new();
        PAUSED.get_or_init(|| Toggle::new(false)).clone()
    }

    /// Process-wide "penalty sending enabled" flag. On by default.
    pub fn penalty_sending() -> Self {
        static SENDING: OnceLock<Toggle> = OnceLock::new();
        SENDING.get_or_init(|| Toggle::new(true)).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isd_as_roundtrip() {
        let ia: IsdAs = "16-ffaa:1:ede".parse().unwrap();
        assert_eq!(ia.isd, 16);
        assert_eq!(ia.asn, 0xffaa_0001_0ede);
        assert_eq!(ia.to_string(), "16-ffaa:1:ede");

        let bgp: IsdAs = "1-64512".parse().unwrap();
        assert_eq!(bgp.to_string(), "1-64512");
    }

    #[test]
    fn test_isd_as_rejects_garbage() {
        assert!("ffaa:1:ede".parse::<IsdAs>().is_err());
        assert!("1-ffaa:1".parse::<IsdAs>().is_err());
        assert!("1-99999999999".parse::<IsdAs>().is_err());
        assert!("x-1".parse::<IsdAs>().is_err());
    }

    #[test]
    fn test_endpoint_foreign() {
        let a: Endpoint = "1-ff00:0:110,127.0.0.1:4000".parse().unwrap();
        let b: Endpoint = "1-ff00:0:110,127.0.0.2:4000".parse().unwrap();
        let c: Endpoint = "2-ff00:0:210,127.0.0.1:4000".parse().unwrap();

        assert!(!a.is_foreign_to(&b));
        assert!(a.is_foreign_to(&c));
    }

    #[test]
    fn test_process_context() {
        assert!(ProcessContext::FAILOVER.is_failover());
        assert!(!ProcessContext::ROUTINE.is_failover());
        assert_eq!(ProcessContext::from(1), ProcessContext::FAILOVER);
        assert_eq!(ProcessContext(7).to_string(), "ctx(7)");
    }

    #[test]
    fn test_channel_type_parse() {
        assert_eq!("Video".parse::<ChannelType>().unwrap(), ChannelType::Video);
        assert!("smell".parse::<ChannelType>().is_err());
        assert!(ChannelType::Audio.is_media());
        assert!(!ChannelType::Data.is_media());
    }

    #[test]
    fn test_toggle_shared() {
        let toggle = Toggle::new(false);
        let clone = toggle.clone();
        clone.set(true);
        assert!(toggle.get());
    }
}
