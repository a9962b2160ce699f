//! Packets exchanged by a publishing client
//!
//! Only what a publisher sends or may receive is modelled: the connection
//! handshake, the QoS 1/2 publish flows, keep-alive and disconnect.

use bytes::Bytes;

use super::{Properties, ProtocolVersion, QoS, ReasonCode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Box<Connect>),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    PubRec(PubRec),
    PubRel(PubRel),
    PubComp(PubComp),
    PingReq,
    PingResp,
    Disconnect(Disconnect),
}

impl Packet {
    /// Lowercase packet name, used in logs and as a metrics label
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "connect",
            Packet::ConnAck(_) => "connack",
            Packet::Publish(_) => "publish",
            Packet::PubAck(_) => "puback",
            Packet::PubRec(_) => "pubrec",
            Packet::PubRel(_) => "pubrel",
            Packet::PubComp(_) => "pubcomp",
            Packet::PingReq => "pingreq",
            Packet::PingResp => "pingresp",
            Packet::Disconnect(_) => "disconnect",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol_version: ProtocolVersion,
    pub client_id: String,
    /// Clean Session in 3.1.1, Clean Start in 5.0
    pub clean_start: bool,
    /// Seconds; 0 disables keep-alive
    pub keep_alive: u16,
    pub username: Option<String>,
    /// Sent exactly as read, no text conversion
    pub password: Option<Bytes>,
    pub properties: Properties,
}

impl Default for Connect {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::default(),
            client_id: String::new(),
            clean_start: true,
            keep_alive: 30,
            username: None,
            password: None,
            properties: Properties::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnAck {
    pub session_present: bool,
    /// For 3.1.1 the return code is mapped onto the equivalent reason code
    pub reason_code: ReasonCode,
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Present exactly when `qos` is 1 or 2
    pub packet_id: Option<u16>,
    pub payload: Bytes,
    pub properties: Properties,
}

macro_rules! ack_packet {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            pub packet_id: u16,
            /// Always `Success` on 3.1.1
            pub reason_code: ReasonCode,
            pub properties: Properties,
        }

        impl $name {
            pub fn new(packet_id: u16) -> Self {
                Self {
                    packet_id,
                    reason_code: ReasonCode::Success,
                    properties: Properties::default(),
                }
            }
        }
    };
}

ack_packet!(
    /// Acknowledges a QoS 1 publish
    PubAck
);
ack_packet!(
    /// First answer in the QoS 2 flow
    PubRec
);
ack_packet!(
    /// Releases a QoS 2 publish after PUBREC
    PubRel
);
ack_packet!(
    /// Completes the QoS 2 flow
    PubComp
);

/// Client-initiated in 3.1.1; either side may send it in 5.0
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Disconnect {
    pub reason_code: ReasonCode,
    pub properties: Properties,
}
