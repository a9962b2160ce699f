//! MQTT v5.0 Properties
//!
//! A publishing client only acts on a handful of properties: the session and
//! flow-control limits the server announces in CONNACK, and the reason string
//! attached to acknowledgements. Every other valid property is parsed for its
//! length and skipped.

use bytes::{BufMut, BytesMut};

use crate::codec::{
    read_binary, read_string, read_u16, read_u32, read_variable_int, variable_int_len,
    write_string, write_variable_int,
};
use crate::protocol::{DecodeError, EncodeError, QoS};

const SESSION_EXPIRY_INTERVAL: u8 = 0x11;
const ASSIGNED_CLIENT_IDENTIFIER: u8 = 0x12;
const SERVER_KEEP_ALIVE: u8 = 0x13;
const SERVER_REFERENCE: u8 = 0x1C;
const REASON_STRING: u8 = 0x1F;
const RECEIVE_MAXIMUM: u8 = 0x21;
const TOPIC_ALIAS_MAXIMUM: u8 = 0x22;
const MAXIMUM_QOS: u8 = 0x24;
const RETAIN_AVAILABLE: u8 = 0x25;
const USER_PROPERTY: u8 = 0x26;
const MAXIMUM_PACKET_SIZE: u8 = 0x27;

/// Wire representation of a property value, per MQTT 5.0 section 2.2.2.2
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Byte,
    TwoByte,
    FourByte,
    VarInt,
    Utf8,
    Binary,
    Utf8Pair,
}

fn value_kind(id: u8) -> Option<ValueKind> {
    let kind = match id {
        0x01 | 0x17 | 0x19 | 0x24 | 0x25 | 0x28 | 0x29 | 0x2A => ValueKind::Byte,
        0x13 | 0x21 | 0x22 | 0x23 => ValueKind::TwoByte,
        0x02 | 0x11 | 0x18 | 0x27 => ValueKind::FourByte,
        0x0B => ValueKind::VarInt,
        0x03 | 0x08 | 0x12 | 0x15 | 0x1A | 0x1C | 0x1F => ValueKind::Utf8,
        0x09 | 0x16 => ValueKind::Binary,
        0x26 => ValueKind::Utf8Pair,
        _ => return None,
    };
    Some(kind)
}

/// The v5.0 properties this client reads or writes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub session_expiry_interval: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub server_keep_alive: Option<u16>,
    pub server_reference: Option<String>,
    pub reason_string: Option<String>,
    pub receive_maximum: Option<u16>,
    pub topic_alias_maximum: Option<u16>,
    pub maximum_qos: Option<QoS>,
    pub retain_available: Option<bool>,
    pub user_properties: Vec<(String, String)>,
    pub maximum_packet_size: Option<u32>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.encoded_size() == 0
    }

    /// Bytes of the property block, length prefix excluded
    pub fn encoded_size(&self) -> usize {
        let numeric = [
            self.session_expiry_interval.map(|_| 5),
            self.server_keep_alive.map(|_| 3),
            self.receive_maximum.map(|_| 3),
            self.topic_alias_maximum.map(|_| 3),
            self.maximum_qos.map(|_| 2),
            self.retain_available.map(|_| 2),
            self.maximum_packet_size.map(|_| 5),
        ];
        let strings = [
            &self.assigned_client_identifier,
            &self.server_reference,
            &self.reason_string,
        ];

        numeric.into_iter().flatten().sum::<usize>()
            + strings.into_iter().flatten().map(|s| 3 + s.len()).sum::<usize>()
            + self
                .user_properties
                .iter()
                .map(|(k, v)| 5 + k.len() + v.len())
                .sum::<usize>()
    }

    /// Bytes on the wire, length prefix included
    pub fn wire_size(&self) -> usize {
        let size = self.encoded_size();
        variable_int_len(size as u32) + size
    }

    /// Parse a length-prefixed property block, returning it with the bytes
    /// consumed
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), DecodeError> {
        let (block_len, len_bytes) = read_variable_int(buf)?;
        let end = len_bytes + block_len as usize;
        let mut rest = buf.get(len_bytes..end).ok_or(DecodeError::InsufficientData)?;
        let mut props = Properties::new();

        while let Some((&id, value)) = rest.split_first() {
            let kind = value_kind(id).ok_or(DecodeError::InvalidPropertyId(id))?;
            let used = props.read_value(id, kind, value)?;
            rest = value.get(used..).ok_or(DecodeError::InsufficientData)?;
        }

        Ok((props, end))
    }

    /// Store one property value, returning its length
    fn read_value(&mut self, id: u8, kind: ValueKind, value: &[u8]) -> Result<usize, DecodeError> {
        let text = |value: &[u8]| read_string(value).map(|(s, used)| (s.to_string(), used));

        match id {
            SESSION_EXPIRY_INTERVAL => self.session_expiry_interval = Some(read_u32(value)?),
            MAXIMUM_PACKET_SIZE => match read_u32(value)? {
                0 => return Err(DecodeError::MalformedPacket("maximum packet size is 0")),
                size => self.maximum_packet_size = Some(size),
            },
            SERVER_KEEP_ALIVE => self.server_keep_alive = Some(read_u16(value)?),
            RECEIVE_MAXIMUM => match read_u16(value)? {
                0 => return Err(DecodeError::MalformedPacket("receive maximum is 0")),
                max => self.receive_maximum = Some(max),
            },
            TOPIC_ALIAS_MAXIMUM => self.topic_alias_maximum = Some(read_u16(value)?),
            MAXIMUM_QOS => {
                let level = *value.first().ok_or(DecodeError::InsufficientData)?;
                // Only 0 and 1 may be announced
                match QoS::from_u8(level) {
                    Some(qos) if qos != QoS::ExactlyOnce => self.maximum_qos = Some(qos),
                    _ => return Err(DecodeError::InvalidQoS(level)),
                }
            }
            RETAIN_AVAILABLE => {
                let flag = *value.first().ok_or(DecodeError::InsufficientData)?;
                self.retain_available = Some(flag != 0);
            }
            ASSIGNED_CLIENT_IDENTIFIER => {
                let (s, used) = text(value)?;
                self.assigned_client_identifier = Some(s);
                return Ok(used);
            }
            SERVER_REFERENCE => {
                let (s, used) = text(value)?;
                self.server_reference = Some(s);
                return Ok(used);
            }
            REASON_STRING => {
                let (s, used) = text(value)?;
                self.reason_string = Some(s);
                return Ok(used);
            }
            USER_PROPERTY => {
                let (key, key_len) = text(value)?;
                let (val, val_len) = text(&value[key_len..])?;
                self.user_properties.push((key, val));
                return Ok(key_len + val_len);
            }
            _ => {}
        }
        value_len(kind, value)
    }

    /// Write the property block, length prefix included
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        write_variable_int(buf, self.encoded_size() as u32)?;

        let tagged_str = |buf: &mut BytesMut, id: u8, value: &Option<String>| match value {
            Some(s) => {
                buf.put_u8(id);
                write_string(buf, s)
            }
            None => Ok(()),
        };

        if let Some(v) = self.session_expiry_interval {
            buf.put_u8(SESSION_EXPIRY_INTERVAL);
            buf.put_u32(v);
        }
        tagged_str(buf, ASSIGNED_CLIENT_IDENTIFIER, &self.assigned_client_identifier)?;
        if let Some(v) = self.server_keep_alive {
            buf.put_u8(SERVER_KEEP_ALIVE);
            buf.put_u16(v);
        }
        tagged_str(buf, SERVER_REFERENCE, &self.server_reference)?;
        tagged_str(buf, REASON_STRING, &self.reason_string)?;
        for (id, value) in [
            (RECEIVE_MAXIMUM, self.receive_maximum),
            (TOPIC_ALIAS_MAXIMUM, self.topic_alias_maximum),
        ] {
            if let Some(v) = value {
                buf.put_u8(id);
                buf.put_u16(v);
            }
        }
        for (id, value) in [
            (MAXIMUM_QOS, self.maximum_qos.map(|q| q as u8)),
            (RETAIN_AVAILABLE, self.retain_available.map(u8::from)),
        ] {
            if let Some(v) = value {
                buf.put_u8(id);
                buf.put_u8(v);
            }
        }
        for (key, value) in &self.user_properties {
            buf.put_u8(USER_PROPERTY);
            write_string(buf, key)?;
            write_string(buf, value)?;
        }
        if let Some(v) = self.maximum_packet_size {
            buf.put_u8(MAXIMUM_PACKET_SIZE);
            buf.put_u32(v);
        }

        Ok(())
    }
}

/// Length of a value of `kind` at the start of `buf`
fn value_len(kind: ValueKind, buf: &[u8]) -> Result<usize, DecodeError> {
    let len = match kind {
        ValueKind::Byte => 1,
        ValueKind::TwoByte => 2,
        ValueKind::FourByte => 4,
        ValueKind::VarInt => read_variable_int(buf)?.1,
        ValueKind::Utf8 => read_string(buf)?.1,
        ValueKind::Binary => read_binary(buf)?.1,
        ValueKind::Utf8Pair => {
            let key_len = read_string(buf)?.1;
            key_len + read_string(&buf[key_len..])?.1
        }
    };

    if buf.len() < len {
        return Err(DecodeError::InsufficientData);
    }
    Ok(len)
}
