//! MQTT v5.0 reason codes
//!
//! The codes a client can meet on CONNACK, the publish acknowledgements and
//! DISCONNECT. Subscription and AUTH specific codes are left out.

use std::fmt;

macro_rules! reason_codes {
    ($($name:ident = $value:literal => $text:literal,)+) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        #[repr(u8)]
        pub enum ReasonCode {
            #[default]
            $($name = $value,)+
        }

        impl ReasonCode {
            pub fn from_u8(value: u8) -> Option<Self> {
                match value {
                    $($value => Some(ReasonCode::$name),)+
                    _ => None,
                }
            }

            fn text(self) -> &'static str {
                match self {
                    $(ReasonCode::$name => $text,)+
                }
            }
        }
    };
}

reason_codes! {
    Success = 0x00 => "success",
    DisconnectWithWill = 0x04 => "disconnect with will message",
    NoMatchingSubscribers = 0x10 => "no matching subscribers",
    UnspecifiedError = 0x80 => "unspecified error",
    MalformedPacket = 0x81 => "malformed packet",
    ProtocolError = 0x82 => "protocol error",
    ImplementationError = 0x83 => "implementation specific error",
    UnsupportedProtocolVersion = 0x84 => "unsupported protocol version",
    ClientIdNotValid = 0x85 => "client identifier not valid",
    BadUserNameOrPassword = 0x86 => "bad user name or password",
    NotAuthorized = 0x87 => "not authorized",
    ServerUnavailable = 0x88 => "server unavailable",
    ServerBusy = 0x89 => "server busy",
    Banned = 0x8A => "banned",
    ServerShuttingDown = 0x8B => "server shutting down",
    BadAuthenticationMethod = 0x8C => "bad authentication method",
    KeepAliveTimeout = 0x8D => "keep alive timeout",
    SessionTakenOver = 0x8E => "session taken over",
    TopicFilterInvalid = 0x8F => "topic filter invalid",
    TopicNameInvalid = 0x90 => "topic name invalid",
    PacketIdInUse = 0x91 => "packet identifier in use",
    PacketIdNotFound = 0x92 => "packet identifier not found",
    ReceiveMaxExceeded = 0x93 => "receive maximum exceeded",
    TopicAliasInvalid = 0x94 => "topic alias invalid",
    PacketTooLarge = 0x95 => "packet too large",
    MessageRateTooHigh = 0x96 => "message rate too high",
    QuotaExceeded = 0x97 => "quota exceeded",
    AdministrativeAction = 0x98 => "administrative action",
    PayloadFormatInvalid = 0x99 => "payload format invalid",
    RetainNotSupported = 0x9A => "retain not supported",
    QoSNotSupported = 0x9B => "QoS not supported",
    UseAnotherServer = 0x9C => "use another server",
    ServerMoved = 0x9D => "server moved",
    SharedSubsNotSupported = 0x9E => "shared subscriptions not supported",
    ConnectionRateExceeded = 0x9F => "connection rate exceeded",
    MaximumConnectTime = 0xA0 => "maximum connect time",
    SubIdNotSupported = 0xA1 => "subscription identifiers not supported",
    WildcardSubsNotSupported = 0xA2 => "wildcard subscriptions not supported",
}

impl ReasonCode {
    pub fn is_success(self) -> bool {
        !self.is_error()
    }

    /// Codes 0x80 and above report a failure
    pub fn is_error(self) -> bool {
        self as u8 >= 0x80
    }

    /// 3.1.1 CONNACK return code; anything without an equivalent becomes
    /// "not authorized"
    pub fn to_v3_connack_code(self) -> u8 {
        match self {
            ReasonCode::Success => 0,
            ReasonCode::UnsupportedProtocolVersion => 1,
            ReasonCode::ClientIdNotValid => 2,
            ReasonCode::ServerUnavailable => 3,
            ReasonCode::BadUserNameOrPassword => 4,
            _ => 5,
        }
    }

    pub fn from_v3_connack_code(code: u8) -> Self {
        match code {
            0 => ReasonCode::Success,
            1 => ReasonCode::UnsupportedProtocolVersion,
            2 => ReasonCode::ClientIdNotValid,
            3 => ReasonCode::ServerUnavailable,
            4 => ReasonCode::BadUserNameOrPassword,
            5 => ReasonCode::NotAuthorized,
            _ => ReasonCode::UnspecifiedError,
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.text(), *self as u8)
    }
}
