//! Packet parsing
//!
//! `Decoder::decode` frames one packet out of a byte buffer; the per-packet
//! parsers then walk the body with a [`Cursor`].

use bytes::Bytes;

use super::{read_binary, read_string, read_u16, read_variable_int, MAX_REMAINING_LENGTH};
use crate::protocol::{
    ConnAck, Connect, DecodeError, Disconnect, Packet, Properties, ProtocolVersion, PubAck,
    PubComp, PubRec, PubRel, Publish, QoS, ReasonCode,
};

/// Parses packets for one connection
pub struct Decoder {
    max_packet_size: usize,
    /// Set before CONNECT is written, or learned from a received CONNECT
    version: Option<ProtocolVersion>,
}

/// Read position inside a packet body
struct Cursor<'a> {
    body: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(body: &'a [u8]) -> Self {
        Self { body, pos: 0 }
    }

    fn remaining(&self) -> &'a [u8] {
        &self.body[self.pos..]
    }

    fn is_done(&self) -> bool {
        self.pos >= self.body.len()
    }

    fn byte(&mut self) -> Result<u8, DecodeError> {
        let b = *self.body.get(self.pos).ok_or(DecodeError::InsufficientData)?;
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let v = read_u16(self.remaining())?;
        self.pos += 2;
        Ok(v)
    }

    fn string(&mut self) -> Result<&'a str, DecodeError> {
        let (s, used) = read_string(self.remaining())?;
        self.pos += used;
        Ok(s)
    }

    fn binary(&mut self) -> Result<&'a [u8], DecodeError> {
        let (data, used) = read_binary(self.remaining())?;
        self.pos += used;
        Ok(data)
    }

    fn properties(&mut self) -> Result<Properties, DecodeError> {
        let (props, used) = Properties::decode(self.remaining())?;
        self.pos += used;
        Ok(props)
    }

    /// Properties that may be left out entirely when the body ends early
    fn optional_properties(&mut self) -> Result<Properties, DecodeError> {
        if self.is_done() {
            Ok(Properties::default())
        } else {
            self.properties()
        }
    }

    fn packet_id(&mut self) -> Result<u16, DecodeError> {
        match self.u16()? {
            0 => Err(DecodeError::MalformedPacket("packet id cannot be 0")),
            id => Ok(id),
        }
    }

    fn reason_code(&mut self) -> Result<ReasonCode, DecodeError> {
        let b = self.byte()?;
        ReasonCode::from_u8(b).ok_or(DecodeError::InvalidReasonCode(b))
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
            version: None,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.version = Some(version);
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        self.version
    }

    fn v5(&self) -> bool {
        self.version == Some(ProtocolVersion::V5)
    }

    /// Parse the packet at the start of `buf`, returning it with the number
    /// of bytes it occupied. `Ok(None)` means the packet is not complete yet.
    pub fn decode(&mut self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        let Some((&fixed, rest)) = buf.split_first() else {
            return Ok(None);
        };

        let (body_len, len_bytes) = match read_variable_int(rest) {
            Ok(parsed) => parsed,
            Err(DecodeError::InsufficientData) => return Ok(None),
            Err(e) => return Err(e),
        };
        let body_len = body_len as usize;
        if body_len > self.max_packet_size {
            return Err(DecodeError::PacketTooLarge);
        }

        let total = 1 + len_bytes + body_len;
        let Some(body) = buf.get(1 + len_bytes..total) else {
            return Ok(None);
        };

        let kind = fixed >> 4;
        let flags = fixed & 0x0F;
        let packet = match kind {
            1 => self.connect(flags, body)?,
            2 => self.connack(flags, body)?,
            3 => self.publish(flags, body)?,
            4 => {
                let (packet_id, reason_code, properties) = self.ack(flags, 0, body)?;
                Packet::PubAck(PubAck { packet_id, reason_code, properties })
            }
            5 => {
                let (packet_id, reason_code, properties) = self.ack(flags, 0, body)?;
                Packet::PubRec(PubRec { packet_id, reason_code, properties })
            }
            6 => {
                let (packet_id, reason_code, properties) = self.ack(flags, 0b0010, body)?;
                Packet::PubRel(PubRel { packet_id, reason_code, properties })
            }
            7 => {
                let (packet_id, reason_code, properties) = self.ack(flags, 0, body)?;
                Packet::PubComp(PubComp { packet_id, reason_code, properties })
            }
            12 | 13 if flags != 0 || !body.is_empty() => return Err(DecodeError::InvalidFlags),
            12 => Packet::PingReq,
            13 => Packet::PingResp,
            14 => self.disconnect(flags, body)?,
            other => return Err(DecodeError::InvalidPacketType(other)),
        };

        Ok(Some((packet, total)))
    }

    fn connect(&mut self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let mut cur = Cursor::new(body);

        if cur.string()? != "MQTT" {
            return Err(DecodeError::InvalidProtocolName);
        }
        let level = cur.byte()?;
        let version =
            ProtocolVersion::from_u8(level).ok_or(DecodeError::InvalidProtocolVersion(level))?;
        self.version = Some(version);
        let v5 = version == ProtocolVersion::V5;

        let connect_flags = cur.byte()?;
        if connect_flags & 0x01 != 0 {
            return Err(DecodeError::MalformedPacket("reserved connect flag set"));
        }
        let keep_alive = cur.u16()?;
        let properties = if v5 { cur.properties()? } else { Properties::default() };
        let client_id = cur.string()?.to_string();

        // A will is skipped over; a publisher never acts on one
        if connect_flags & 0x04 != 0 {
            if v5 {
                cur.properties()?;
            }
            cur.string()?;
            cur.binary()?;
        }

        let username = match connect_flags & 0x80 {
            0 => None,
            _ => Some(cur.string()?.to_string()),
        };
        let password = match connect_flags & 0x40 {
            0 => None,
            _ => Some(Bytes::copy_from_slice(cur.binary()?)),
        };

        if !cur.is_done() {
            return Err(DecodeError::MalformedPacket("trailing bytes in CONNECT"));
        }

        Ok(Packet::Connect(Box::new(Connect {
            protocol_version: version,
            client_id,
            clean_start: connect_flags & 0x02 != 0,
            keep_alive,
            username,
            password,
            properties,
        })))
    }

    fn connack(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        let mut cur = Cursor::new(body);

        let ack_flags = cur.byte()?;
        if ack_flags & !0x01 != 0 {
            return Err(DecodeError::InvalidFlags);
        }

        let (reason_code, properties) = if self.v5() {
            (cur.reason_code()?, cur.optional_properties()?)
        } else {
            let code = cur.byte()?;
            (ReasonCode::from_v3_connack_code(code), Properties::default())
        };

        Ok(Packet::ConnAck(ConnAck {
            session_present: ack_flags & 0x01 != 0,
            reason_code,
            properties,
        }))
    }

    fn publish(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        let qos_bits = (flags >> 1) & 0x03;
        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::InvalidQoS(qos_bits))?;
        let dup = flags & 0x08 != 0;
        if dup && qos == QoS::AtMostOnce {
            return Err(DecodeError::MalformedPacket("DUP must be 0 for QoS 0"));
        }

        let mut cur = Cursor::new(body);
        let topic = cur.string()?;
        if topic.contains(['+', '#']) {
            return Err(DecodeError::MalformedPacket("topic contains wildcard"));
        }
        let packet_id = match qos {
            QoS::AtMostOnce => None,
            _ => Some(cur.packet_id()?),
        };
        let properties = if self.v5() { cur.properties()? } else { Properties::default() };

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain: flags & 0x01 != 0,
            topic: topic.to_string(),
            packet_id,
            payload: Bytes::copy_from_slice(cur.remaining()),
            properties,
        }))
    }

    /// Body shared by PUBACK, PUBREC, PUBREL and PUBCOMP
    fn ack(
        &self,
        flags: u8,
        required_flags: u8,
        body: &[u8],
    ) -> Result<(u16, ReasonCode, Properties), DecodeError> {
        if flags != required_flags {
            return Err(DecodeError::InvalidFlags);
        }
        let mut cur = Cursor::new(body);
        let packet_id = cur.packet_id()?;

        if cur.is_done() {
            return Ok((packet_id, ReasonCode::Success, Properties::default()));
        }
        if !self.v5() {
            return Err(DecodeError::MalformedPacket(
                "v3.1.1 acknowledgement has trailing bytes",
            ));
        }
        let reason = cur.reason_code()?;
        Ok((packet_id, reason, cur.optional_properties()?))
    }

    fn disconnect(&self, flags: u8, body: &[u8]) -> Result<Packet, DecodeError> {
        if flags != 0 {
            return Err(DecodeError::InvalidFlags);
        }
        if body.is_empty() {
            return Ok(Packet::Disconnect(Disconnect::default()));
        }
        if !self.v5() {
            return Err(DecodeError::MalformedPacket(
                "v3.1.1 DISCONNECT has no payload",
            ));
        }

        let mut cur = Cursor::new(body);
        let reason_code = cur.reason_code()?;
        let properties = cur.optional_properties()?;
        Ok(Packet::Disconnect(Disconnect {
            reason_code,
            properties,
        }))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
