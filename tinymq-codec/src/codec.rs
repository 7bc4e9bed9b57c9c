use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::decode::decode_packet;
use crate::encode::{encode, encoded_size};
use crate::error::{DecodeError, EncodeError};
use crate::packet::Packet;
use crate::utils::decode_variable_length;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct FixedHeader {
    first_byte: u8,
    remaining_length: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum DecodeState {
    FrameHeader,
    Frame(FixedHeader),
}

/// MQTT v3.1.1 framing for `tokio_util::codec::Framed*`.
#[derive(Debug, Clone)]
pub struct MqttCodec {
    state: DecodeState,
    max_size: u32,
}

impl MqttCodec {
    /// `max_packet_size` of `0` means unlimited.
    pub fn new(max_packet_size: u32) -> Self {
        MqttCodec { state: DecodeState::FrameHeader, max_size: max_packet_size }
    }

    pub fn set_max_size(&mut self, size: u32) {
        self.max_size = size;
    }
}

impl Default for MqttCodec {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Decoder for MqttCodec {
    type Item = Packet;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, DecodeError> {
        loop {
            match self.state {
                DecodeState::FrameHeader => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    let first_byte = src[0];
                    let Some((remaining_length, consumed)) = decode_variable_length(&src[1..])? else {
                        return Ok(None);
                    };
                    if self.max_size != 0 && self.max_size < remaining_length {
                        return Err(DecodeError::MaxSizeExceeded);
                    }
                    src.advance(consumed + 1);
                    self.state = DecodeState::Frame(FixedHeader { first_byte, remaining_length });
                    let remaining_length = remaining_length as usize;
                    if src.len() < remaining_length {
                        src.reserve(remaining_length - src.len());
                        return Ok(None);
                    }
                }
                DecodeState::Frame(fixed) => {
                    if src.len() < fixed.remaining_length as usize {
                        return Ok(None);
                    }
                    let packet_buf = src.split_to(fixed.remaining_length as usize);
                    self.state = DecodeState::FrameHeader;
                    let packet = decode_packet(packet_buf.freeze(), fixed.first_byte)?;
                    src.reserve(2);
                    return Ok(Some(packet));
                }
            }
        }
    }
}

impl Encoder<Packet> for MqttCodec {
    type Error = EncodeError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), EncodeError> {
        let content_size = encoded_size(&item);
        let content_size = u32::try_from(content_size).map_err(|_| EncodeError::OverMaxPacketSize)?;
        dst.reserve(content_size as usize + 5);
        encode(&item, dst, content_size)
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU16;

    use bytes::Bytes;
    use bytestring::ByteString;

    use super::*;
    use crate::packet::Publish;
    use crate::types::QoS;

    #[test]
    fn test_max_size() {
        let mut codec = MqttCodec::default();
        codec.set_max_size(5);

        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\0\x09");
        assert!(matches!(codec.decode(&mut buf), Err(DecodeError::MaxSizeExceeded)));
    }

    #[test]
    fn test_partial_frames() {
        let mut codec = MqttCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"\x40\x02\x43");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\x21\xc0\x00");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Packet::PublishAck { packet_id: NonZeroU16::new(0x4321).unwrap() })
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Packet::PingRequest));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_large_publish() {
        let mut codec = MqttCodec::default();
        let mut buf = BytesMut::new();

        let pkt = Publish {
            dup: false,
            retain: false,
            qos: QoS::AtLeastOnce,
            topic: ByteString::from_static("/test"),
            packet_id: NonZeroU16::new(7),
            payload: Bytes::from("a".repeat(260 * 1024)),
        };
        codec.encode(Packet::Publish(pkt.clone()), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(Packet::Publish(pkt)));
    }
}
