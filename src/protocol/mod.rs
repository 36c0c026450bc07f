//! MQTT v3.1.1 protocol definitions and types

mod error;
mod message;
mod reply;


pub use error::DecodeError;
pub use message::{ConnectInfo, Message};
pub use reply::{encode_publish, Reply};

use serde::{Deserialize, Serialize};

/// MQTT control packet type (the fixed-header command nibble)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlPacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl ControlPacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(ControlPacketType::Connect),
            2 => Some(ControlPacketType::ConnAck),
            3 => Some(ControlPacketType::Publish),
            4 => Some(ControlPacketType::PubAck),
            5 => Some(ControlPacketType::PubRec),
            6 => Some(ControlPacketType::PubRel),
            7 => Some(ControlPacketType::PubComp),
            8 => Some(ControlPacketType::Subscribe),
            9 => Some(ControlPacketType::SubAck),
            10 => Some(ControlPacketType::Unsubscribe),
            11 => Some(ControlPacketType::UnsubAck),
            12 => Some(ControlPacketType::PingReq),
            13 => Some(ControlPacketType::PingResp),
            14 => Some(ControlPacketType::Disconnect),
            _ => None,
        }
    }
}

/// Quality of Service levels
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

/// CONNACK return code (the single-byte v3.1.1 table)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReturnCode {
    /// Connection accepted
    Accepted = 0x00,
    /// Unacceptable protocol name or level
    UnacceptableProtocol = 0x01,
    /// Client identifier rejected
    IdentifierRejected = 0x02,
    /// Server unavailable
    ServerUnavailable = 0x03,
    /// Bad username or password
    BadCredentials = 0x04,
    /// Not authorized
    NotAuthorized = 0x05,
}
