//! MQTT Packet Decoder

use bytes::Bytes;

use super::{read_binary, read_string, read_u16, read_variable_int, DEFAULT_MAX_PACKET_SIZE};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, Packet, PubAck, Publish, QoS, SubAck,
    Subscribe, SubscribeReturnCode, Subscription, PROTOCOL_LEVEL, PROTOCOL_NAME,
};

/// MQTT v3.1.1 Packet Decoder
#[derive(Debug, Clone)]
pub struct Decoder {
    /// Maximum accepted remaining length
    max_packet_size: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(super::MAX_REMAINING_LENGTH);
        self
    }

    /// Decode a packet from the front of the buffer
    /// Returns (packet, bytes_consumed), or None when the packet is incomplete
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let first_byte = buf[0];
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0F;

        let (remaining_length, len_bytes) = match read_variable_int(&buf[1..]) {
            Ok(r) => r,
            Err(DecodeError::Incomplete) => return Ok(None),
            Err(e) => return Err(e),
        };

        if remaining_length as usize > self.max_packet_size {
            return Err(DecodeError::TooLarge {
                size: remaining_length as usize,
                limit: self.max_packet_size,
            });
        }

        let total_len = 1 + len_bytes + remaining_length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        let body = &buf[1 + len_bytes..total_len];

        let packet = match packet_type {
            1 => decode_connect(flags, body)?,
            2 => decode_connack(flags, body)?,
            3 => decode_publish(flags, body)?,
            4 => Packet::PubAck(PubAck {
                packet_id: decode_packet_id_only(flags, 0x00, body)?,
            }),
            8 => decode_subscribe(flags, body)?,
            9 => decode_suback(flags, body)?,
            12 => expect_empty(flags, body, Packet::PingReq)?,
            13 => expect_empty(flags, body, Packet::PingResp)?,
            14 => expect_empty(flags, body, Packet::Disconnect)?,
            _ => return Err(DecodeError::UnsupportedPacketType(packet_type)),
        };

        Ok(Some((packet, total_len)))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn expect_empty(flags: u8, body: &[u8], packet: Packet) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::ReservedFlags);
    }
    if !body.is_empty() {
        return Err(DecodeError::Malformed("unexpected payload"));
    }
    Ok(packet)
}

fn decode_packet_id_only(flags: u8, expected_flags: u8, body: &[u8]) -> Result<u16, DecodeError> {
    if flags != expected_flags {
        return Err(DecodeError::ReservedFlags);
    }
    if body.len() != 2 {
        return Err(DecodeError::Malformed("expected packet identifier only"));
    }
    read_u16(body)
}

fn decode_connect(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::ReservedFlags);
    }

    let mut pos = 0;

    let (protocol_name, len) = read_string(body)?;
    pos += len;
    if protocol_name != PROTOCOL_NAME {
        return Err(DecodeError::Malformed("protocol name is not MQTT"));
    }

    let level = *body.get(pos).ok_or(DecodeError::Incomplete)?;
    pos += 1;
    if level != PROTOCOL_LEVEL {
        return Err(DecodeError::UnsupportedProtocolLevel(level));
    }

    let connect_flags = *body.get(pos).ok_or(DecodeError::Incomplete)?;
    pos += 1;

    // Reserved bit must be 0
    if (connect_flags & 0x01) != 0 {
        return Err(DecodeError::ReservedFlags);
    }
    // Wills are never sent by the forwarder
    if (connect_flags & 0x04) != 0 {
        return Err(DecodeError::Malformed("will messages are not supported"));
    }

    let clean_session = (connect_flags & 0x02) != 0;
    let password_flag = (connect_flags & 0x40) != 0;
    let username_flag = (connect_flags & 0x80) != 0;

    if !username_flag && password_flag {
        return Err(DecodeError::ReservedFlags);
    }

    let keep_alive = read_u16(&body[pos..])?;
    pos += 2;

    let (client_id, len) = read_string(&body[pos..])?;
    pos += len;

    let username = if username_flag {
        let (username, len) = read_string(&body[pos..])?;
        pos += len;
        Some(username.to_string())
    } else {
        None
    };

    let password = if password_flag {
        let (password, len) = read_binary(&body[pos..])?;
        pos += len;
        Some(Bytes::copy_from_slice(password))
    } else {
        None
    };

    if pos != body.len() {
        return Err(DecodeError::Malformed("trailing bytes in CONNECT"));
    }

    Ok(Packet::Connect(Box::new(Connect {
        client_id: client_id.to_string(),
        clean_session,
        keep_alive,
        username,
        password,
    })))
}

fn decode_connack(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::ReservedFlags);
    }
    let [acknowledge_flags, code] = body else {
        return Err(DecodeError::Malformed("CONNACK must be 2 bytes"));
    };

    // Only bit 0 is valid (session present), rest must be 0
    if (acknowledge_flags & 0xFE) != 0 {
        return Err(DecodeError::ReservedFlags);
    }

    let return_code =
        ConnectReturnCode::from_u8(*code).ok_or_else(|| out_of_range("return code", *code))?;

    Ok(Packet::ConnAck(ConnAck {
        session_present: (acknowledge_flags & 0x01) != 0,
        return_code,
    }))
}

fn decode_publish(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    let dup = (flags & 0x08) != 0;
    let qos_bits = (flags >> 1) & 0x03;
    let retain = (flags & 0x01) != 0;

    let qos = QoS::from_u8(qos_bits).ok_or_else(|| out_of_range("QoS", qos_bits))?;

    if qos == QoS::AtMostOnce && dup {
        return Err(DecodeError::Malformed("DUP must be 0 for QoS 0"));
    }

    let (topic, mut pos) = read_string(body)?;

    if topic.contains('+') || topic.contains('#') {
        return Err(DecodeError::Malformed("topic contains wildcard"));
    }

    let packet_id = if qos != QoS::AtMostOnce {
        let id = read_u16(&body[pos..])?;
        if id == 0 {
            return Err(DecodeError::Malformed("packet id cannot be 0"));
        }
        pos += 2;
        Some(id)
    } else {
        None
    };

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain,
        topic: topic.to_string(),
        packet_id,
        payload: Bytes::copy_from_slice(&body[pos..]),
    }))
}

fn decode_subscribe(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    // SUBSCRIBE must have flags 0010
    if flags != 0x02 {
        return Err(DecodeError::ReservedFlags);
    }

    let packet_id = read_u16(body)?;
    let mut pos = 2;

    let mut subscriptions = Vec::new();
    while pos < body.len() {
        let (filter, len) = read_string(&body[pos..])?;
        pos += len;

        let options = *body.get(pos).ok_or(DecodeError::Incomplete)?;
        pos += 1;
        if (options & 0xFC) != 0 {
            return Err(DecodeError::Malformed("reserved subscription bits set"));
        }
        let qos = QoS::from_u8(options).ok_or_else(|| out_of_range("QoS", options))?;

        subscriptions.push(Subscription {
            filter: filter.to_string(),
            qos,
        });
    }

    if subscriptions.is_empty() {
        return Err(DecodeError::Malformed("SUBSCRIBE without filters"));
    }

    Ok(Packet::Subscribe(Subscribe {
        packet_id,
        subscriptions,
    }))
}

fn decode_suback(flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
    if flags != 0 {
        return Err(DecodeError::ReservedFlags);
    }
    if body.len() < 3 {
        return Err(DecodeError::Incomplete);
    }

    let packet_id = read_u16(body)?;
    let return_codes = body[2..]
        .iter()
        .map(|&code| {
            SubscribeReturnCode::from_u8(code).ok_or_else(|| out_of_range("return code", code))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Packet::SubAck(SubAck {
        packet_id,
        return_codes,
    }))
}

fn out_of_range(field: &'static str, value: u8) -> DecodeError {
    DecodeError::OutOfRange { field, value }
}
