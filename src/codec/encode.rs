//! Packet serialisation
//!
//! Each packet is written as fixed header, remaining length, then body. The
//! body length is computed up front so the frame can be written in one pass
//! without a scratch buffer.

use bytes::{BufMut, BytesMut};

use super::{variable_int_len, write_binary, write_string, write_variable_int};
use crate::protocol::{
    ConnAck, Connect, Disconnect, EncodeError, Packet, Properties, ProtocolVersion, Publish, QoS,
    ReasonCode,
};

const CONNECT: u8 = 0x10;
const CONNACK: u8 = 0x20;
const PUBLISH: u8 = 0x30;
const PUBACK: u8 = 0x40;
const PUBREC: u8 = 0x50;
const PUBREL: u8 = 0x62;
const PUBCOMP: u8 = 0x70;
const PINGREQ: u8 = 0xC0;
const PINGRESP: u8 = 0xD0;
const DISCONNECT: u8 = 0xE0;

/// Writes packets for one negotiated protocol version
pub struct Encoder {
    version: ProtocolVersion,
}

impl Encoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self { version }
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.version = version;
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.version
    }

    fn v5(&self) -> bool {
        matches!(self.version, ProtocolVersion::V5)
    }

    /// Append `packet` to `buf`
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(connect) => self.connect(connect, buf),
            Packet::ConnAck(connack) => self.connack(connack, buf),
            Packet::Publish(publish) => self.publish(publish, buf),
            Packet::PubAck(a) => self.ack(PUBACK, a.packet_id, a.reason_code, &a.properties, buf),
            Packet::PubRec(a) => self.ack(PUBREC, a.packet_id, a.reason_code, &a.properties, buf),
            Packet::PubRel(a) => self.ack(PUBREL, a.packet_id, a.reason_code, &a.properties, buf),
            Packet::PubComp(a) => self.ack(PUBCOMP, a.packet_id, a.reason_code, &a.properties, buf),
            Packet::PingReq => header(buf, PINGREQ, 0),
            Packet::PingResp => header(buf, PINGRESP, 0),
            Packet::Disconnect(disconnect) => self.disconnect(disconnect, buf),
        }
    }

    /// Bytes the PUBLISH occupies on the wire, fixed header included
    pub fn publish_size(&self, publish: &Publish) -> usize {
        let body = self.publish_body_len(publish);
        1 + variable_int_len(body as u32) + body
    }

    fn publish_body_len(&self, publish: &Publish) -> usize {
        let id = if publish.qos == QoS::AtMostOnce { 0 } else { 2 };
        let props = if self.v5() { publish.properties.wire_size() } else { 0 };
        2 + publish.topic.len() + id + props + publish.payload.len()
    }

    fn connect(&self, connect: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let v5 = connect.protocol_version == ProtocolVersion::V5;

        let mut flags = 0u8;
        let mut body = 10 + 2 + connect.client_id.len();
        if v5 {
            body += connect.properties.wire_size();
        }
        if connect.clean_start {
            flags |= 0x02;
        }
        if let Some(username) = &connect.username {
            flags |= 0x80;
            body += 2 + username.len();
        }
        if let Some(password) = &connect.password {
            flags |= 0x40;
            body += 2 + password.len();
        }

        header(buf, CONNECT, body)?;
        write_string(buf, "MQTT")?;
        buf.put_u8(connect.protocol_version as u8);
        buf.put_u8(flags);
        buf.put_u16(connect.keep_alive);
        if v5 {
            connect.properties.encode(buf)?;
        }
        write_string(buf, &connect.client_id)?;
        if let Some(username) = &connect.username {
            write_string(buf, username)?;
        }
        if let Some(password) = &connect.password {
            write_binary(buf, password)?;
        }
        Ok(())
    }

    fn connack(&self, connack: &ConnAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        if !self.v5() {
            header(buf, CONNACK, 2)?;
            buf.put_u8(u8::from(connack.session_present));
            buf.put_u8(connack.reason_code.to_v3_connack_code());
            return Ok(());
        }

        header(buf, CONNACK, 2 + connack.properties.wire_size())?;
        buf.put_u8(u8::from(connack.session_present));
        buf.put_u8(connack.reason_code as u8);
        connack.properties.encode(buf)
    }

    fn publish(&self, publish: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let topic = publish.topic.as_str();
        let too_long = topic.len() > usize::from(u16::MAX);
        if topic.is_empty() || too_long || topic.contains(['+', '#', '\0']) {
            return Err(EncodeError::InvalidTopicName);
        }
        let packet_id = match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => None,
            (_, Some(id)) => Some(id),
            (_, None) => return Err(EncodeError::MissingPacketId),
        };

        let dup = if publish.dup { 0x08 } else { 0 };
        let fixed = PUBLISH | dup | (publish.qos as u8) << 1 | u8::from(publish.retain);

        let body = self.publish_body_len(publish);
        buf.reserve(self.publish_size(publish));
        header(buf, fixed, body)?;
        write_string(buf, topic)?;
        if let Some(id) = packet_id {
            buf.put_u16(id);
        }
        if self.v5() {
            publish.properties.encode(buf)?;
        }
        buf.put_slice(&publish.payload);
        Ok(())
    }

    /// Shared layout of the four publish acknowledgements. A v5 ack with a
    /// success code and no properties is sent in the short 3.1.1 form.
    fn ack(
        &self,
        fixed: u8,
        packet_id: u16,
        reason: ReasonCode,
        properties: &Properties,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        let short = !self.v5() || (reason == ReasonCode::Success && properties.is_empty());
        if short {
            header(buf, fixed, 2)?;
            buf.put_u16(packet_id);
            return Ok(());
        }

        let props = if properties.is_empty() { 0 } else { properties.wire_size() };
        header(buf, fixed, 3 + props)?;
        buf.put_u16(packet_id);
        buf.put_u8(reason as u8);
        if props > 0 {
            properties.encode(buf)?;
        }
        Ok(())
    }

    fn disconnect(&self, disconnect: &Disconnect, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let reason = disconnect.reason_code;
        let properties = &disconnect.properties;
        if !self.v5() || (reason == ReasonCode::Success && properties.is_empty()) {
            return header(buf, DISCONNECT, 0);
        }

        let props = if properties.is_empty() { 0 } else { properties.wire_size() };
        header(buf, DISCONNECT, 1 + props)?;
        buf.put_u8(reason as u8);
        if props > 0 {
            properties.encode(buf)?;
        }
        Ok(())
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new(ProtocolVersion::V311)
    }
}

fn header(buf: &mut BytesMut, fixed: u8, body_len: usize) -> Result<(), EncodeError> {
    let len = u32::try_from(body_len).map_err(|_| EncodeError::PacketTooLarge)?;
    buf.put_u8(fixed);
    write_variable_int(buf, len)
}
