//! Datagram classification.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{PenaltyBatch, ProbeMessage};
use crate::error::ProtocolError;

/// A datagram, classified by its marker.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Probe(ProbeMessage),
    Penalties(PenaltyBatch),
    /// Anything without a control marker.
    Data(Bytes),
}

impl ControlMessage {
    pub fn classify(payload: &[u8]) -> Result<Self, ProtocolError> {
        if let Some(probe) = ProbeMessage::decode(payload)? {
            return Ok(ControlMessage::Probe(probe));
        }
        if let Some(batch) = PenaltyBatch::decode(payload)? {
            return Ok(ControlMessage::Penalties(batch));
        }
        Ok(ControlMessage::Data(Bytes::copy_from_slice(payload)))
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        match self {
            ControlMessage::Probe(probe) => Ok(probe.encode()),
            ControlMessage::Penalties(batch) => batch.encode(),
            ControlMessage::Data(data) => Ok(data.clone()),
        }
    }

    pub fn is_control(&self) -> bool {
        !matches!(self, ControlMessage::Data(_))
    }
}

/// Tokio codec over whole datagrams, for use with framed datagram sockets.
/// Each call to `decode` consumes the complete buffer as one message.
pub struct ControlCodec {
    max_datagram_size: usize,
}

impl ControlCodec {
    pub fn new() -> Self {
        Self {
            max_datagram_size: crate::MAX_DATAGRAM_SIZE,
        }
    }

    pub fn with_max_datagram(max_datagram_size: usize) -> Self {
        Self { max_datagram_size }
    }
}

impl Default for ControlCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ControlCodec {
    type Item = ControlMessage;
    type Error = crate::Error;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let datagram = src.split();
        if datagram.len() > self.max_datagram_size {
            return Err(ProtocolError::PayloadTooLarge {
                size: datagram.len(),
                max: self.max_datagram_size,
            }
            .into());
        }

        Ok(Some(ControlMessage::classify(&datagram)?))
    }
}

impl Encoder<ControlMessage> for ControlCodec {
    type Error = crate::Error;

    fn encode(
        &mut self,
        item: ControlMessage,
        dst: &mut BytesMut,
    ) -> std::result::Result<(), Self::Error> {
        let encoded = item.encode()?;
        if encoded.len() > self.max_datagram_size {
            return Err(ProtocolError::PayloadTooLarge {
                size: encoded.len(),
                max: self.max_datagram_size,
            }
            .into());
        }

        dst.reserve(encoded.len());
        dst.put_slice(&encoded);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PenaltyNotification;
    use crate::types::ChannelType;

    #[test]
    fn test_classify() {
        let probe = ProbeMessage::Request(3);
        assert_eq!(
            ControlMessage::classify(&probe.encode()).unwrap(),
            ControlMessage::Probe(probe)
        );

        let batch = PenaltyBatch::new(1, vec![PenaltyNotification::broadcast(0.4, ChannelType::Video)]);
        assert_eq!(
            ControlMessage::classify(&batch.encode().unwrap()).unwrap(),
            ControlMessage::Penalties(batch)
        );

        let data = ControlMessage::classify(b"frame").unwrap();
        assert!(!data.is_control());
    }

    #[test]
    fn test_codec_consumes_whole_datagram() {
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(ControlMessage::Probe(ProbeMessage::Response(9)), &mut buf)
            .unwrap();

        let decoded = codec.decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(ControlMessage::Probe(ProbeMessage::Response(9))));
        assert!(buf.is_empty());
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_codec_rejects_oversize() {
        let mut codec = ControlCodec::with_max_datagram(4);
        let mut buf = BytesMut::new();
        let err = codec
            .encode(ControlMessage::Data(Bytes::from_static(b"too long")), &mut buf)
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Protocol(ProtocolError::PayloadTooLarge { size: 8, max: 4 })
        ));
    }

    #[test]
    fn test_malformed_probe_is_an_error() {
        let mut codec = ControlCodec::new();
        let mut buf = BytesMut::from(&b"0x69\x01"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
