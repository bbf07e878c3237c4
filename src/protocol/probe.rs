//! Latency probe messages.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Marker of a probe request.
pub const PROBE_REQUEST: &[u8] = b"0x69";

/// Marker of a probe response.
pub const PROBE_RESPONSE: &[u8] = b"0x420";

const ID_LEN: usize = std::mem::size_of::<u64>();

/// A probe request or the echo answering it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMessage {
    Request(u64),
    Response(u64),
}

impl ProbeMessage {
    pub fn id(&self) -> u64 {
        match *self {
            ProbeMessage::Request(id) | ProbeMessage::Response(id) => id,
        }
    }

    /// The response answering this message.
    pub fn response(&self) -> Self {
        ProbeMessage::Response(self.id())
    }

    pub fn encode(&self) -> Bytes {
        let marker = match self {
            ProbeMessage::Request(_) => PROBE_REQUEST,
            ProbeMessage::Response(_) => PROBE_RESPONSE,
        };
        let mut buf = BytesMut::with_capacity(marker.len() + ID_LEN);
        buf.put_slice(marker);
        buf.put_u64_le(self.id());
        buf.freeze()
    }

    /// Decode a probe message. `Ok(None)` if `data` carries no probe marker;
    /// an error if it does but the id is malformed.
    pub fn decode(data: &[u8]) -> Result<Option<Self>, ProtocolError> {
        // Check the longer marker first
        let (rest, make): (&[u8], fn(u64) -> Self) = if let Some(rest) = data.strip_prefix(PROBE_RESPONSE) {
            (rest, ProbeMessage::Response)
        } else if let Some(rest) = data.strip_prefix(PROBE_REQUEST) {
            (rest, ProbeMessage::Request)
        } else {
            return Ok(None);
        };

        let id: [u8; ID_LEN] = rest.try_into().map_err(|_| ProtocolError::MalformedProbe {
            expected: ID_LEN,
            got: rest.len(),
        })?;
        Ok(Some(make(u64::from_le_bytes(id))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_layout() {
        let request = ProbeMessage::Request(1).encode();
        assert_eq!(&request[..], b"0x69\x01\x00\x00\x00\x00\x00\x00\x00");

        let response = ProbeMessage::Response(0x0102).encode();
        assert_eq!(&response[..5], b"0x420");
        assert_eq!(&response[5..], &[0x02, 0x01, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_decode() {
        let request = ProbeMessage::Request(42);
        assert_eq!(ProbeMessage::decode(&request.encode()).unwrap(), Some(request));
        assert_eq!(
            ProbeMessage::decode(&request.response().encode()).unwrap(),
            Some(ProbeMessage::Response(42))
        );
    }

    #[test]
    fn test_decode_ignores_other_payloads() {
        assert_eq!(ProbeMessage::decode(b"hello").unwrap(), None);
        assert_eq!(ProbeMessage::decode(b"69abc").unwrap(), None);
        assert_eq!(ProbeMessage::decode(b"").unwrap(), None);
    }

    #[test]
    fn test_decode_rejects_truncated_id() {
        let err = ProbeMessage::decode(b"0x420\x01\x02").unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedProbe { expected: 8, got: 2 }));
    }
}
