//! MQTT v3.1.1 codec tests

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;

use crate::codec::{Decoder, Encoder};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, PubAck, Publish, QoS, SubAck,
    Subscribe, SubscribeReturnCode, Subscription,
};

fn encode_packet(packet: &Packet) -> BytesMut {
    let mut buf = BytesMut::new();
    Encoder::new().encode(packet, &mut buf).unwrap();
    buf
}

fn decode_packet(buf: &[u8]) -> Result<Packet, DecodeError> {
    match Decoder::new().decode(buf)? {
        Some((packet, consumed)) => {
            assert_eq!(consumed, buf.len());
            Ok(packet)
        }
        None => Err(DecodeError::Incomplete),
    }
}

// ============================================================================
// CONNECT / CONNACK
// ============================================================================

#[test]
fn test_connect_wire_format() {
    let packet = Packet::Connect(Box::new(Connect {
        client_id: "fwd".to_string(),
        clean_session: true,
        keep_alive: 60,
        username: None,
        password: None,
    }));

    let encoded = encode_packet(&packet);
    assert_eq!(
        &encoded[..],
        &[
            0x10, 15, // fixed header
            0x00, 0x04, b'M', b'Q', b'T', b'T', // protocol name
            0x04, // level
            0x02, // clean session
            0x00, 0x3C, // keep alive
            0x00, 0x03, b'f', b'w', b'd', // client id
        ]
    );
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_connect_with_credentials() {
    let packet = Packet::Connect(Box::new(Connect {
        client_id: "site-a".to_string(),
        clean_session: true,
        keep_alive: 30,
        username: Some("bridge".to_string()),
        password: Some(Bytes::from_static(b"s3cret")),
    }));

    let encoded = encode_packet(&packet);
    // username + password flags + clean session
    assert_eq!(encoded[9], 0xC2);
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_connect_password_without_username_rejected() {
    let mut encoded = encode_packet(&Packet::Connect(Box::new(Connect {
        client_id: "x".to_string(),
        password: Some(Bytes::from_static(b"pw")),
        ..Default::default()
    })));
    assert_eq!(encoded[9], 0x42);
    assert_eq!(decode_packet(&encoded), Err(DecodeError::ReservedFlags));

    // Same packet but with the reserved bit set is also invalid
    encoded[9] = 0x03;
    assert_eq!(decode_packet(&encoded), Err(DecodeError::ReservedFlags));
}

#[test]
fn test_connect_wrong_protocol_level() {
    let mut encoded = encode_packet(&Packet::Connect(Box::default()));
    encoded[8] = 5;
    assert_eq!(
        decode_packet(&encoded),
        Err(DecodeError::UnsupportedProtocolLevel(5))
    );
}

#[test]
fn test_connack_return_codes() {
    for code in [
        ConnectReturnCode::Accepted,
        ConnectReturnCode::BadUsernameOrPassword,
        ConnectReturnCode::NotAuthorized,
    ] {
        let packet = Packet::ConnAck(ConnAck {
            session_present: false,
            return_code: code,
        });
        let encoded = encode_packet(&packet);
        assert_eq!(&encoded[..2], &[0x20, 0x02]);
        assert_eq!(decode_packet(&encoded).unwrap(), packet);
    }

    assert_eq!(
        decode_packet(&[0x20, 0x02, 0x00, 0x09]),
        Err(DecodeError::OutOfRange {
            field: "return code",
            value: 0x09
        })
    );
    assert_eq!(
        decode_packet(&[0x20, 0x02, 0x02, 0x00]),
        Err(DecodeError::ReservedFlags)
    );
}

// ============================================================================
// PUBLISH / PUBACK
// ============================================================================

#[test]
fn test_publish_qos0_preserves_payload() {
    let payload = Bytes::from_static(b"{\"x\":1}");
    let packet = Packet::Publish(Publish::at_most_once(
        "eu868/gateway/abc/event/up",
        payload.clone(),
    ));

    let encoded = encode_packet(&packet);
    assert_eq!(encoded[0], 0x30);
    match decode_packet(&encoded).unwrap() {
        Packet::Publish(p) => {
            assert_eq!(p.topic, "eu868/gateway/abc/event/up");
            assert_eq!(p.payload, payload);
            assert_eq!(p.packet_id, None);
        }
        other => panic!("Expected PUBLISH, got {:?}", other),
    }
}

#[test]
fn test_publish_qos1_requires_packet_id() {
    let mut publish = Publish::at_most_once("a/b", Bytes::from_static(b"1"));
    publish.qos = QoS::AtLeastOnce;

    let mut buf = BytesMut::new();
    assert!(Encoder::new()
        .encode(&Packet::Publish(publish.clone()), &mut buf)
        .is_err());

    publish.packet_id = Some(7);
    let packet = Packet::Publish(publish);
    let encoded = encode_packet(&packet);
    assert_eq!(encoded[0], 0x32);
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_publish_wildcard_topic_rejected() {
    let encoded = encode_packet(&Packet::Publish(Publish::at_most_once(
        "a/+/b",
        Bytes::new(),
    )));
    assert!(matches!(
        decode_packet(&encoded),
        Err(DecodeError::Malformed(_))
    ));
}

#[test]
fn test_publish_large_payload_uses_multibyte_length() {
    let payload = Bytes::from(vec![0xAB; 20_000]);
    let packet = Packet::Publish(Publish::at_most_once("bulk", payload));
    let encoded = encode_packet(&packet);
    // 2 + 4 + 20000 = 20006 needs three length bytes
    assert_eq!(encoded.len(), 1 + 3 + 20_006);
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_puback() {
    let packet = Packet::PubAck(PubAck { packet_id: 0x1234 });
    let encoded = encode_packet(&packet);
    assert_eq!(&encoded[..], &[0x40, 0x02, 0x12, 0x34]);
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

// ============================================================================
// SUBSCRIBE / SUBACK
// ============================================================================

#[test]
fn test_subscribe_roundtrip() {
    let packet = Packet::Subscribe(Subscribe {
        packet_id: 1,
        subscriptions: vec![Subscription {
            filter: "eu868/gateway/+/event/up".to_string(),
            qos: QoS::AtMostOnce,
        }],
    });
    let encoded = encode_packet(&packet);
    assert_eq!(encoded[0], 0x82);
    assert_eq!(decode_packet(&encoded).unwrap(), packet);
}

#[test]
fn test_subscribe_bad_flags() {
    let mut encoded = encode_packet(&Packet::Subscribe(Subscribe {
        packet_id: 1,
        subscriptions: vec![Subscription {
            filter: "a/#".to_string(),
            qos: QoS::AtMostOnce,
        }],
    }));
    encoded[0] = 0x80;
    assert_eq!(decode_packet(&encoded), Err(DecodeError::ReservedFlags));
}

#[test]
fn test_suback_failure_code() {
    let packet = Packet::SubAck(SubAck {
        packet_id: 3,
        return_codes: vec![SubscribeReturnCode::Failure],
    });
    let encoded = encode_packet(&packet);
    assert_eq!(&encoded[..], &[0x90, 0x03, 0x00, 0x03, 0x80]);

    match decode_packet(&encoded).unwrap() {
        Packet::SubAck(ack) => assert!(ack.has_failure()),
        other => panic!("Expected SUBACK, got {:?}", other),
    }
}

// ============================================================================
// Control packets and framing
// ============================================================================

#[test]
fn test_control_packets() {
    assert_eq!(&encode_packet(&Packet::PingReq)[..], &[0xC0, 0x00]);
    assert_eq!(&encode_packet(&Packet::PingResp)[..], &[0xD0, 0x00]);
    assert_eq!(&encode_packet(&Packet::Disconnect)[..], &[0xE0, 0x00]);

    assert_eq!(decode_packet(&[0xD0, 0x00]).unwrap(), Packet::PingResp);
    assert_eq!(
        decode_packet(&[0xD1, 0x00]),
        Err(DecodeError::ReservedFlags)
    );
}

#[test]
fn test_partial_packet_returns_none() {
    let encoded = encode_packet(&Packet::Publish(Publish::at_most_once(
        "a/b",
        Bytes::from_static(b"hello"),
    )));
    let decoder = Decoder::new();
    for cut in 0..encoded.len() {
        assert_eq!(decoder.decode(&encoded[..cut]).unwrap(), None);
    }
}

#[test]
fn test_two_packets_in_one_buffer() {
    let mut buf = encode_packet(&Packet::PingResp);
    buf.extend_from_slice(&encode_packet(&Packet::PubAck(PubAck { packet_id: 9 })));

    let decoder = Decoder::new();
    let (first, used) = decoder.decode(&buf).unwrap().unwrap();
    assert_eq!(first, Packet::PingResp);
    let (second, _) = decoder.decode(&buf[used..]).unwrap().unwrap();
    assert_eq!(second, Packet::PubAck(PubAck { packet_id: 9 }));
}

#[test]
fn test_packet_size_limit() {
    let encoded = encode_packet(&Packet::Publish(Publish::at_most_once(
        "a",
        Bytes::from(vec![0u8; 64]),
    )));
    let decoder = Decoder::new().with_max_packet_size(16);
    assert_eq!(
        decoder.decode(&encoded),
        Err(DecodeError::TooLarge {
            size: 67,
            limit: 16
        })
    );
}

#[test]
fn test_unsupported_packet_type() {
    // UNSUBSCRIBE is never used by the forwarder
    assert_eq!(
        decode_packet(&[0xA2, 0x02, 0x00, 0x01]),
        Err(DecodeError::UnsupportedPacketType(10))
    );
}

#[test]
fn test_remaining_length_overflow() {
    assert_eq!(
        decode_packet(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]),
        Err(DecodeError::BadRemainingLength)
    );
}
