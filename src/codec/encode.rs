//! MQTT Packet Encoder

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int};
use crate::protocol::{
    ConnAck, Connect, EncodeError, Packet, PubAck, Publish, QoS, SubAck, Subscribe,
    PROTOCOL_LEVEL, PROTOCOL_NAME,
};

/// MQTT v3.1.1 Packet Encoder
#[derive(Debug, Clone, Copy, Default)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a packet, appending it to the buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(p) => encode_connect(p, buf),
            Packet::ConnAck(p) => encode_connack(p, buf),
            Packet::Publish(p) => encode_publish(p, buf),
            Packet::PubAck(p) => encode_puback(p, buf),
            Packet::Subscribe(p) => encode_subscribe(p, buf),
            Packet::SubAck(p) => encode_suback(p, buf),
            Packet::PingReq => {
                buf.put_slice(&[0xC0, 0x00]);
                Ok(())
            }
            Packet::PingResp => {
                buf.put_slice(&[0xD0, 0x00]);
                Ok(())
            }
            Packet::Disconnect => {
                buf.put_slice(&[0xE0, 0x00]);
                Ok(())
            }
        }
    }
}

fn encode_connect(packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
    // Protocol name (2 + 4) + level (1) + flags (1) + keep alive (2)
    let mut remaining_length = 10;
    remaining_length += 2 + packet.client_id.len();
    if let Some(ref username) = packet.username {
        remaining_length += 2 + username.len();
    }
    if let Some(ref password) = packet.password {
        remaining_length += 2 + password.len();
    }

    buf.put_u8(0x10);
    write_variable_int(buf, remaining_length as u32)?;

    write_string(buf, PROTOCOL_NAME)?;
    buf.put_u8(PROTOCOL_LEVEL);

    let mut connect_flags: u8 = 0;
    if packet.clean_session {
        connect_flags |= 0x02;
    }
    if packet.password.is_some() {
        connect_flags |= 0x40;
    }
    if packet.username.is_some() {
        connect_flags |= 0x80;
    }
    buf.put_u8(connect_flags);
    buf.put_u16(packet.keep_alive);

    write_string(buf, &packet.client_id)?;
    if let Some(ref username) = packet.username {
        write_string(buf, username)?;
    }
    if let Some(ref password) = packet.password {
        write_binary(buf, password)?;
    }

    Ok(())
}

fn encode_connack(packet: &ConnAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u8(0x20);
    buf.put_u8(0x02);
    buf.put_u8(packet.session_present as u8);
    buf.put_u8(packet.return_code as u8);
    Ok(())
}

fn encode_publish(packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let mut remaining_length = 2 + packet.topic.len();
    if packet.qos != QoS::AtMostOnce {
        if packet.packet_id.is_none() {
            return Err(EncodeError::MissingPacketId);
        }
        remaining_length += 2;
    }
    remaining_length += packet.payload.len();

    let mut first_byte: u8 = 0x30;
    if packet.dup {
        first_byte |= 0x08;
    }
    first_byte |= (packet.qos as u8) << 1;
    if packet.retain {
        first_byte |= 0x01;
    }
    buf.put_u8(first_byte);
    write_variable_int(buf, remaining_length as u32)?;

    write_string(buf, &packet.topic)?;
    if packet.qos != QoS::AtMostOnce {
        if let Some(packet_id) = packet.packet_id {
            buf.put_u16(packet_id);
        }
    }
    buf.put_slice(&packet.payload);

    Ok(())
}

fn encode_puback(packet: &PubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u8(0x40);
    buf.put_u8(0x02);
    buf.put_u16(packet.packet_id);
    Ok(())
}

fn encode_subscribe(packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let remaining_length = 2 + packet
        .subscriptions
        .iter()
        .map(|sub| 2 + sub.filter.len() + 1)
        .sum::<usize>();

    // SUBSCRIBE type with flags 0010
    buf.put_u8(0x82);
    write_variable_int(buf, remaining_length as u32)?;
    buf.put_u16(packet.packet_id);

    for sub in &packet.subscriptions {
        write_string(buf, &sub.filter)?;
        buf.put_u8(sub.qos as u8);
    }

    Ok(())
}

fn encode_suback(packet: &SubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u8(0x90);
    write_variable_int(buf, (2 + packet.return_codes.len()) as u32)?;
    buf.put_u16(packet.packet_id);
    for code in &packet.return_codes {
        buf.put_u8(code.to_u8());
    }
    Ok(())
}
