use bytes::{BufMut, BytesMut};

use crate::error::EncodeError;
use crate::packet::{Connect, LastWill, Packet, Publish, SubscribeReturnCode};
use crate::types::{packet_type, ConnectFlags, QoS, WILL_QOS_SHIFT};
use crate::utils::{write_variable_length, Encode};

fn publish_size(p: &Publish) -> usize {
    let packet_id = if p.qos == QoS::AtMostOnce { 0 } else { 2 };
    p.topic.encoded_size() + packet_id + p.payload.len()
}

fn connect_size(connect: &Connect) -> usize {
    // protocol level + connect flags + keep alive
    let mut n = 1 + 1 + 2;
    n += connect.protocol.name().as_bytes().encoded_size();
    n += connect.client_id.encoded_size();
    if let Some(LastWill { ref topic, ref message, .. }) = connect.last_will {
        n += topic.encoded_size() + message.encoded_size();
    }
    n += connect.username.as_ref().map(|s| s.encoded_size()).unwrap_or_default();
    n += connect.password.as_ref().map(|s| s.encoded_size()).unwrap_or_default();
    n
}

pub(crate) fn encoded_size(packet: &Packet) -> usize {
    match packet {
        Packet::Connect(connect) => connect_size(connect),
        Packet::Publish(publish) => publish_size(publish),
        Packet::ConnectAck(_)
        | Packet::PublishAck { .. }
        | Packet::PublishReceived { .. }
        | Packet::PublishRelease { .. }
        | Packet::PublishComplete { .. }
        | Packet::UnsubscribeAck { .. } => 2,
        Packet::Subscribe { topic_filters, .. } => {
            2 + topic_filters.iter().map(|(filter, _)| filter.encoded_size() + 1).sum::<usize>()
        }
        Packet::SubscribeAck { status, .. } => 2 + status.len(),
        Packet::Unsubscribe { topic_filters, .. } => {
            2 + topic_filters.iter().map(|filter| filter.encoded_size()).sum::<usize>()
        }
        Packet::PingRequest | Packet::PingResponse | Packet::Disconnect => 0,
    }
}

pub(crate) fn encode(packet: &Packet, dst: &mut BytesMut, content_size: u32) -> Result<(), EncodeError> {
    let header = |dst: &mut BytesMut, first_byte: u8| {
        dst.put_u8(first_byte);
        write_variable_length(content_size, dst)
    };

    match packet {
        Packet::Connect(connect) => {
            header(dst, packet_type::CONNECT)?;
            encode_connect(connect, dst)?;
        }
        Packet::ConnectAck(ack) => {
            header(dst, packet_type::CONNACK)?;
            dst.put_slice(&[u8::from(ack.session_present), ack.return_code as u8]);
        }
        Packet::Publish(publish) => {
            header(
                dst,
                packet_type::PUBLISH_START
                    | (u8::from(publish.qos) << 1)
                    | ((publish.dup as u8) << 3)
                    | (publish.retain as u8),
            )?;
            publish.topic.encode(dst)?;
            match (publish.qos, publish.packet_id) {
                (QoS::AtMostOnce, None) => {}
                (QoS::AtMostOnce, Some(_)) => return Err(EncodeError::MalformedPacket),
                (_, Some(packet_id)) => packet_id.encode(dst)?,
                (_, None) => return Err(EncodeError::PacketIdRequired),
            }
            dst.put(publish.payload.as_ref());
        }
        Packet::PublishAck { packet_id } => {
            header(dst, packet_type::PUBACK)?;
            packet_id.encode(dst)?;
        }
        Packet::PublishReceived { packet_id } => {
            header(dst, packet_type::PUBREC)?;
            packet_id.encode(dst)?;
        }
        Packet::PublishRelease { packet_id } => {
            header(dst, packet_type::PUBREL)?;
            packet_id.encode(dst)?;
        }
        Packet::PublishComplete { packet_id } => {
            header(dst, packet_type::PUBCOMP)?;
            packet_id.encode(dst)?;
        }
        Packet::Subscribe { packet_id, topic_filters } => {
            header(dst, packet_type::SUBSCRIBE)?;
            packet_id.encode(dst)?;
            for (filter, qos) in topic_filters {
                filter.encode(dst)?;
                dst.put_u8(*qos);
            }
        }
        Packet::SubscribeAck { packet_id, status } => {
            header(dst, packet_type::SUBACK)?;
            packet_id.encode(dst)?;
            for s in status {
                dst.put_u8(match s {
                    SubscribeReturnCode::Success(qos) => u8::from(*qos),
                    SubscribeReturnCode::Failure => 0x80,
                });
            }
        }
        Packet::Unsubscribe { packet_id, topic_filters } => {
            header(dst, packet_type::UNSUBSCRIBE)?;
            packet_id.encode(dst)?;
            for filter in topic_filters {
                filter.encode(dst)?;
            }
        }
        Packet::UnsubscribeAck { packet_id } => {
            header(dst, packet_type::UNSUBACK)?;
            packet_id.encode(dst)?;
        }
        Packet::PingRequest => dst.put_slice(&[packet_type::PINGREQ, 0]),
        Packet::PingResponse => dst.put_slice(&[packet_type::PINGRESP, 0]),
        Packet::Disconnect => dst.put_slice(&[packet_type::DISCONNECT, 0]),
    }

    Ok(())
}

fn encode_connect(connect: &Connect, dst: &mut BytesMut) -> Result<(), EncodeError> {
    let Connect { protocol, clean_session, keep_alive, ref last_will, ref client_id, ref username, ref password } =
        *connect;

    protocol.name().as_bytes().encode(dst)?;

    let mut flags = ConnectFlags::empty();
    if username.is_some() {
        flags |= ConnectFlags::USERNAME;
    }
    if password.is_some() {
        flags |= ConnectFlags::PASSWORD;
    }
    if let Some(LastWill { qos, retain, .. }) = *last_will {
        flags |= ConnectFlags::WILL;
        if retain {
            flags |= ConnectFlags::WILL_RETAIN;
        }
        flags |= ConnectFlags::from_bits_truncate(u8::from(qos) << WILL_QOS_SHIFT);
    }
    if clean_session {
        flags |= ConnectFlags::CLEAN_SESSION;
    }

    dst.put_slice(&[protocol.level(), flags.bits()]);
    dst.put_u16(keep_alive);
    client_id.encode(dst)?;

    if let Some(LastWill { ref topic, ref message, .. }) = *last_will {
        topic.encode(dst)?;
        message.encode(dst)?;
    }
    if let Some(s) = username {
        s.encode(dst)?;
    }
    if let Some(s) = password {
        s.encode(dst)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU16;

    use bytes::Bytes;
    use bytestring::ByteString;

    use super::*;
    use crate::packet::{ConnectAck, ConnectAckReason};
    use crate::types::{Protocol, MQTT_LEVEL_311};

    fn packet_id(v: u16) -> NonZeroU16 {
        NonZeroU16::new(v).unwrap()
    }

    fn assert_encode_packet(packet: &Packet, expected: &[u8]) {
        let mut v = BytesMut::with_capacity(1024);
        encode(packet, &mut v, encoded_size(packet) as u32).unwrap();
        assert_eq!(expected.len(), v.len());
        assert_eq!(expected, &v[..]);
    }

    #[test]
    fn test_encode_fixed_header() {
        let mut v = BytesMut::with_capacity(271);
        let p = Packet::PingRequest;

        assert_eq!(encoded_size(&p), 0);
        encode(&p, &mut v, 0).unwrap();
        assert_eq!(&v[..2], b"\xc0\x00".as_ref());

        v.clear();

        let p = Packet::Publish(Publish {
            dup: true,
            retain: true,
            qos: QoS::ExactlyOnce,
            topic: ByteString::from_static("topic"),
            packet_id: Some(packet_id(0x4321)),
            payload: (0..255).collect::<Vec<u8>>().into(),
        });

        assert_eq!(encoded_size(&p), 264);
        encode(&p, &mut v, 264).unwrap();
        assert_eq!(&v[..3], b"\x3d\x88\x02".as_ref());
    }

    #[test]
    fn test_encode_connect_packets() {
        assert_encode_packet(
            &Packet::Connect(Box::new(Connect {
                protocol: Protocol(MQTT_LEVEL_311),
                clean_session: false,
                keep_alive: 60,
                client_id: ByteString::from_static("12345"),
                last_will: None,
                username: Some(ByteString::from_static("user")),
                password: Some(Bytes::from_static(b"pass")),
            })),
            &b"\x10\x1D\x00\x04MQTT\x04\xC0\x00\x3C\x00\x0512345\x00\x04user\x00\x04pass"[..],
        );

        assert_encode_packet(
            &Packet::Connect(Box::new(Connect {
                protocol: Protocol(MQTT_LEVEL_311),
                clean_session: false,
                keep_alive: 60,
                client_id: ByteString::from_static("12345"),
                last_will: Some(LastWill {
                    qos: QoS::ExactlyOnce,
                    retain: false,
                    topic: ByteString::from_static("topic"),
                    message: Bytes::from_static(b"message"),
                }),
                username: None,
                password: None,
            })),
            &b"\x10\x21\x00\x04MQTT\x04\x14\x00\x3C\x00\x0512345\x00\x05topic\x00\x07message"[..],
        );

        assert_encode_packet(
            &Packet::ConnectAck(ConnectAck {
                session_present: true,
                return_code: ConnectAckReason::ConnectionAccepted,
            }),
            b"\x20\x02\x01\x00",
        );
        assert_encode_packet(&Packet::Disconnect, b"\xe0\x00");
    }

    #[test]
    fn test_encode_publish_packets() {
        assert_encode_packet(
            &Packet::Publish(Publish {
                dup: true,
                retain: true,
                qos: QoS::ExactlyOnce,
                topic: ByteString::from_static("topic"),
                packet_id: Some(packet_id(0x4321)),
                payload: Bytes::from_static(b"data"),
            }),
            b"\x3d\x0D\x00\x05topic\x43\x21data",
        );

        let mut v = BytesMut::new();
        let missing_id = Packet::Publish(Publish {
            dup: false,
            retain: false,
            qos: QoS::AtLeastOnce,
            topic: ByteString::from_static("topic"),
            packet_id: None,
            payload: Bytes::new(),
        });
        assert!(matches!(encode(&missing_id, &mut v, 7), Err(EncodeError::PacketIdRequired)));
    }

    #[test]
    fn test_encode_subscribe_packets() {
        assert_encode_packet(
            &Packet::Subscribe {
                packet_id: packet_id(0x1234),
                topic_filters: vec![(ByteString::from_static("test"), 1), (ByteString::from_static("filter"), 2)],
            },
            b"\x82\x12\x12\x34\x00\x04test\x01\x00\x06filter\x02",
        );

        assert_encode_packet(
            &Packet::SubscribeAck {
                packet_id: packet_id(0x1234),
                status: vec![
                    SubscribeReturnCode::Success(QoS::AtLeastOnce),
                    SubscribeReturnCode::Failure,
                    SubscribeReturnCode::Success(QoS::ExactlyOnce),
                ],
            },
            b"\x90\x05\x12\x34\x01\x80\x02",
        );

        assert_encode_packet(
            &Packet::Unsubscribe {
                packet_id: packet_id(0x1234),
                topic_filters: vec![ByteString::from_static("test"), ByteString::from_static("filter")],
            },
            b"\xa2\x10\x12\x34\x00\x04test\x00\x06filter",
        );

        assert_encode_packet(&Packet::UnsubscribeAck { packet_id: packet_id(0x4321) }, b"\xb0\x02\x43\x21");
    }
}
