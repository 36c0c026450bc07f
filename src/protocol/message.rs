//! Control packet decoding
//!
//! A [`Message`] is built once per received buffer and is immutable
//! afterwards. Decoding is single-pass: the fixed header selects a
//! per-command rule, and packets whose acknowledgment depends only on the
//! decoded fields get their reply bytes built immediately.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{ControlPacketType, DecodeError, QoS, Reply, ReturnCode};
use crate::codec::PacketReader;

/// Variable-header fields of a CONNECT packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectInfo {
    pub protocol_name: String,
    pub protocol_level: u8,
    /// Set only when both the username and password flags are set.
    ///
    /// The flags are AND'd together rather than checked independently, so a
    /// CONNECT carrying only a username is treated as carrying no
    /// credentials at all.
    pub has_auth: bool,
    pub will_retain: bool,
    pub will_qos: QoS,
    pub will_flag: bool,
    pub clean_session: bool,
    /// Reserved bit of the connect-flags byte; must be 0.
    pub reserved: u8,
    /// Keep-alive interval in seconds
    pub keep_alive: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// One decoded MQTT control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: ControlPacketType,
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    /// Declared body length from the fixed header
    pub remaining_length: u32,
    /// Topic name (PUBLISH/SUBSCRIBE/UNSUBSCRIBE only)
    pub topic: Option<String>,
    /// Application payload (PUBLISH only)
    pub payload: Bytes,
    pub packet_id: Option<u16>,
    /// Requested QoS from a SUBSCRIBE payload
    pub requested_qos: Option<QoS>,
    pub connect_info: Option<ConnectInfo>,
    /// Pre-built wire reply for packets whose acknowledgment is determined
    /// by the decoded fields alone. For CONNECT this holds the accept
    /// candidate, which the dispatcher overrides after cache validation.
    pub immediate_ack: Option<Bytes>,
}

impl Message {
    /// Decode one control packet from a raw buffer.
    pub fn decode(buf: &[u8]) -> Result<Message, DecodeError> {
        let mut reader = PacketReader::new(buf);

        let first = reader.pop_u8()?;
        let command = ControlPacketType::from_u8(first >> 4)
            .ok_or(DecodeError::InvalidPacketType(first >> 4))?;
        let dup = (first & 0x08) != 0;
        let qos = QoS::from_u8((first & 0x06) >> 1)
            .ok_or(DecodeError::Malformed("invalid QoS in fixed header"))?;
        let retain = (first & 0x01) != 0;

        let remaining_length = reader.pop_var_int()?;
        if reader.remaining_len() < remaining_length as usize {
            return Err(DecodeError::Truncated);
        }

        // Bound the body by the declared remaining length; anything past it
        // belongs to the next packet on the stream.
        let body = &reader.remaining()[..remaining_length as usize];
        let mut r = PacketReader::new(body);

        let mut message = Message {
            command,
            dup,
            qos,
            retain,
            remaining_length,
            topic: None,
            payload: Bytes::new(),
            packet_id: None,
            requested_qos: None,
            connect_info: None,
            immediate_ack: None,
        };

        match command {
            ControlPacketType::Connect => message.decode_connect(&mut r)?,
            ControlPacketType::Publish => message.decode_publish(&mut r)?,
            ControlPacketType::PubAck | ControlPacketType::PubComp => {
                message.packet_id = Some(r.pop_u16()?);
            }
            ControlPacketType::PubRec => {
                let packet_id = r.pop_u16()?;
                message.packet_id = Some(packet_id);
                message.immediate_ack = Some(Reply::PubRel { packet_id }.encode());
            }
            ControlPacketType::PubRel => {
                message.require_fixed_flags()?;
                let packet_id = r.pop_u16()?;
                message.packet_id = Some(packet_id);
                message.immediate_ack = Some(Reply::PubComp { packet_id }.encode());
            }
            ControlPacketType::Subscribe => message.decode_subscribe(&mut r)?,
            ControlPacketType::Unsubscribe => message.decode_unsubscribe(&mut r)?,
            ControlPacketType::SubAck | ControlPacketType::UnsubAck => {
                message.packet_id = Some(r.pop_u16()?);
            }
            ControlPacketType::PingReq => {
                message.immediate_ack = Some(Reply::PingResp.encode());
            }
            // No body, no acknowledgment.
            ControlPacketType::Disconnect => {}
            // Server-to-client packets arriving inbound are decoded only as
            // far as their command; the dispatcher ignores them.
            ControlPacketType::ConnAck | ControlPacketType::PingResp => {}
        }

        Ok(message)
    }

    fn decode_connect(&mut self, r: &mut PacketReader) -> Result<(), DecodeError> {
        let protocol_name = r.pop_string()?.to_string();
        let protocol_level = r.pop_u8()?;

        let flags = r.pop_u8()?;
        let has_auth = (flags & 0x80) != 0 && (flags & 0x40) != 0;
        let will_retain = (flags & 0x20) != 0;
        let will_qos = QoS::from_u8((flags & 0x18) >> 3)
            .ok_or(DecodeError::Malformed("invalid will QoS"))?;
        let will_flag = (flags & 0x04) != 0;
        let clean_session = (flags & 0x02) != 0;
        let reserved = flags & 0x01;

        let keep_alive = r.pop_u16()?;
        let client_id = r.pop_string()?.to_string();

        let (username, password) = if has_auth {
            (
                Some(r.pop_string()?.to_string()),
                Some(r.pop_string()?.to_string()),
            )
        } else {
            (None, None)
        };

        self.connect_info = Some(ConnectInfo {
            protocol_name,
            protocol_level,
            has_auth,
            will_retain,
            will_qos,
            will_flag,
            clean_session,
            reserved,
            keep_alive,
            client_id,
            username,
            password,
        });

        // Accept candidate; the dispatcher overrides the return code after
        // validating against the session cache.
        self.immediate_ack = Some(
            Reply::ConnAck {
                return_code: ReturnCode::Accepted,
            }
            .encode(),
        );
        Ok(())
    }

    fn decode_publish(&mut self, r: &mut PacketReader) -> Result<(), DecodeError> {
        self.topic = Some(r.pop_string()?.to_string());

        if self.qos > QoS::AtMostOnce {
            let packet_id = r.pop_u16()?;
            self.packet_id = Some(packet_id);
            self.immediate_ack = Some(match self.qos {
                QoS::AtLeastOnce => Reply::PubAck {
                    packet_id,
                    qos: self.qos,
                }
                .encode(),
                _ => Reply::PubRec {
                    packet_id,
                    qos: self.qos,
                }
                .encode(),
            });
        }

        self.payload = Bytes::copy_from_slice(r.remaining());
        Ok(())
    }

    fn decode_subscribe(&mut self, r: &mut PacketReader) -> Result<(), DecodeError> {
        self.require_fixed_flags()?;
        let packet_id = r.pop_u16()?;
        self.packet_id = Some(packet_id);
        self.topic = Some(r.pop_string()?.to_string());

        let requested = QoS::from_u8(r.pop_u8()?)
            .ok_or(DecodeError::Malformed("invalid requested QoS"))?;
        self.requested_qos = Some(requested);

        self.immediate_ack = Some(
            Reply::SubAck {
                packet_id,
                granted_qos: requested,
            }
            .encode(),
        );
        Ok(())
    }

    fn decode_unsubscribe(&mut self, r: &mut PacketReader) -> Result<(), DecodeError> {
        self.require_fixed_flags()?;
        let packet_id = r.pop_u16()?;
        self.packet_id = Some(packet_id);
        self.topic = Some(r.pop_string()?.to_string());
        self.immediate_ack = Some(Reply::UnsubAck { packet_id }.encode());
        Ok(())
    }

    /// SUBSCRIBE, UNSUBSCRIBE and PUBREL carry a mandated flags nibble of
    /// 0b0010, which reads back as QoS 1.
    fn require_fixed_flags(&self) -> Result<(), DecodeError> {
        if self.qos != QoS::AtLeastOnce {
            return Err(DecodeError::Malformed("reserved flag bits must be 0010"));
        }
        Ok(())
    }
}
