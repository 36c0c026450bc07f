//! Acknowledgment encoders
//!
//! Each reply serializes to the exact v3.1.1 wire layout. The declared
//! remaining-length byte always matches the serialized body length.

use bytes::{BufMut, Bytes, BytesMut};

use super::{QoS, ReturnCode};
use crate::codec::{write_string, write_var_int};

/// An acknowledgment owed to a client.
///
/// PubAck and PubRec carry the QoS of the PUBLISH that triggered them:
/// PUBACK is only valid for QoS 1 and PUBREC only for QoS 2. A guarded
/// variant whose precondition does not hold encodes to an empty buffer,
/// which callers must not send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    ConnAck { return_code: ReturnCode },
    PubAck { packet_id: u16, qos: QoS },
    PubRec { packet_id: u16, qos: QoS },
    PubRel { packet_id: u16 },
    PubComp { packet_id: u16 },
    SubAck { packet_id: u16, granted_qos: QoS },
    UnsubAck { packet_id: u16 },
    PingResp,
}

impl Reply {
    /// Serialize to wire bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5);
        match *self {
            Reply::ConnAck { return_code } => {
                buf.put_u8(0x20);
                buf.put_u8(0x02);
                buf.put_u8(0x00);
                buf.put_u8(return_code as u8);
            }
            Reply::PubAck { packet_id, qos } => {
                if qos == QoS::AtLeastOnce {
                    buf.put_u8(0x40);
                    buf.put_u8(0x02);
                    buf.put_u16(packet_id);
                }
            }
            Reply::PubRec { packet_id, qos } => {
                if qos == QoS::ExactlyOnce {
                    buf.put_u8(0x50);
                    buf.put_u8(0x02);
                    buf.put_u16(packet_id);
                }
            }
            Reply::PubRel { packet_id } => {
                // PUBREL carries the mandated 0b0010 flags nibble.
                buf.put_u8(0x62);
                buf.put_u8(0x02);
                buf.put_u16(packet_id);
            }
            Reply::PubComp { packet_id } => {
                buf.put_u8(0x70);
                buf.put_u8(0x02);
                buf.put_u16(packet_id);
            }
            Reply::SubAck {
                packet_id,
                granted_qos,
            } => {
                buf.put_u8(0x90);
                buf.put_u8(0x02 + 1);
                buf.put_u16(packet_id);
                buf.put_u8(granted_qos as u8);
            }
            Reply::UnsubAck { packet_id } => {
                buf.put_u8(0xB0);
                buf.put_u8(0x02);
                buf.put_u16(packet_id);
            }
            Reply::PingResp => {
                buf.put_u8(0xD0);
                buf.put_u8(0x00);
            }
        }
        buf.freeze()
    }
}

/// Build an outbound PUBLISH frame for delivery to a subscriber.
///
/// The packet id is written only for QoS > 0.
pub fn encode_publish(topic: &str, payload: &[u8], qos: QoS, packet_id: u16, retain: bool) -> Bytes {
    let mut remaining = 2 + topic.len() + payload.len();
    if qos > QoS::AtMostOnce {
        remaining += 2;
    }

    let mut buf = BytesMut::with_capacity(remaining + 5);
    let mut first = 0x30u8 | ((qos as u8) << 1);
    if retain {
        first |= 0x01;
    }
    buf.put_u8(first);
    write_var_int(&mut buf, remaining as u32);
    write_string(&mut buf, topic);
    if qos > QoS::AtMostOnce {
        buf.put_u16(packet_id);
    }
    buf.put_slice(payload);
    buf.freeze()
}
