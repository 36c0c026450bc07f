//! Per-connection dispatch
//!
//! The dispatcher is the orchestration point between the transport runtime,
//! the wire codec and the task layer: it decodes one buffer into a
//! [`Message`], applies command-specific logic (consulting the session cache
//! for CONNECT), and emits at most one reply plus any number of tasks. It is
//! stateless across events; ordering within a connection is the runtime's
//! responsibility.

mod task;


pub use task::{Task, TaskVerb};

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::protocol::{ControlPacketType, Message, Reply, ReturnCode};
use crate::session::{SessionCache, SessionRecord};

/// Outbound half of the transport runtime.
///
/// Sends and closes are fire-and-forget: the dispatcher never waits for
/// completion.
pub trait Transport: Send + Sync {
    fn send(&self, connection_id: u64, bytes: Bytes);
    fn close(&self, connection_id: u64);
}

/// Sink for units of work produced during dispatch.
pub trait WorkSubmission: Send + Sync {
    fn submit(&self, task: Task);
}

/// Per-connection command dispatcher.
pub struct Dispatcher {
    cache: Arc<dyn SessionCache>,
    transport: Arc<dyn Transport>,
    work: Arc<dyn WorkSubmission>,
}

impl Dispatcher {
    pub fn new(
        cache: Arc<dyn SessionCache>,
        transport: Arc<dyn Transport>,
        work: Arc<dyn WorkSubmission>,
    ) -> Self {
        Self {
            cache,
            transport,
            work,
        }
    }

    /// Entry point: one received buffer from one connection.
    ///
    /// A decode failure is the only abort condition; it closes the
    /// connection rather than retrying.
    pub fn on_receive(&self, connection_id: u64, buffer: &[u8]) {
        match Message::decode(buffer) {
            Ok(message) => self.dispatch(connection_id, &message),
            Err(e) => {
                debug!(connection_id, error = %e, "closing connection on decode failure");
                self.transport.close(connection_id);
            }
        }
    }

    fn dispatch(&self, connection_id: u64, message: &Message) {
        trace!(connection_id, command = ?message.command, "dispatching packet");
        match message.command {
            ControlPacketType::Connect => self.handle_connect(connection_id, message),
            ControlPacketType::Publish => self.handle_publish(connection_id, message),
            ControlPacketType::Subscribe => self.handle_subscribe(connection_id, message),
            ControlPacketType::Unsubscribe => self.handle_unsubscribe(connection_id, message),
            ControlPacketType::PubRel => {
                if let Some(packet_id) = message.packet_id {
                    self.transport
                        .send(connection_id, Reply::PubComp { packet_id }.encode());
                }
            }
            ControlPacketType::PingReq => {
                if let Some(ack) = &message.immediate_ack {
                    self.transport.send(connection_id, ack.clone());
                }
            }
            ControlPacketType::Disconnect => {
                self.work.submit(Task::internal(
                    format!("common/close/{connection_id}"),
                    Bytes::new(),
                ));
            }
            // Replies arriving from a client carry no work in the broker
            // role.
            ControlPacketType::ConnAck
            | ControlPacketType::PubAck
            | ControlPacketType::PubRec
            | ControlPacketType::PubComp
            | ControlPacketType::SubAck
            | ControlPacketType::UnsubAck
            | ControlPacketType::PingResp => {}
        }
    }

    fn handle_connect(&self, connection_id: u64, message: &Message) {
        let info = match &message.connect_info {
            Some(info) => info,
            None => return,
        };

        // Notify the task layer before validation, refuse or not.
        let body = serde_json::to_vec(info).unwrap_or_default();
        self.work.submit(Task::internal(
            format!("common/connect/{connection_id}"),
            body.into(),
        ));

        // Validation is last-write-wins: every protocol violation maps to
        // the same refuse code and overrides the cache check.
        let mut return_code = ReturnCode::Accepted;
        if self.cache.get(&info.client_id).is_some() {
            return_code = ReturnCode::ServerUnavailable;
        }
        if info.protocol_name != "MQTT" {
            return_code = ReturnCode::UnacceptableProtocol;
        }
        if info.protocol_level != 4 {
            return_code = ReturnCode::UnacceptableProtocol;
        }
        if info.reserved != 0 {
            return_code = ReturnCode::UnacceptableProtocol;
        }

        if return_code == ReturnCode::Accepted {
            self.cache.set(&info.client_id, SessionRecord::default());
            debug!(connection_id, client_id = %info.client_id, "client connected");
        } else {
            debug!(
                connection_id,
                client_id = %info.client_id,
                code = return_code as u8,
                "connect refused"
            );
        }

        self.transport
            .send(connection_id, Reply::ConnAck { return_code }.encode());
    }

    fn handle_publish(&self, connection_id: u64, message: &Message) {
        let topic = match &message.topic {
            Some(topic) => topic.clone(),
            None => return,
        };
        // No direct client ack here; acknowledgment, if any, belongs to the
        // task layer.
        self.work
            .submit(Task::publish(connection_id, topic, message.payload.clone()));
    }

    fn handle_subscribe(&self, connection_id: u64, message: &Message) {
        let topic = match &message.topic {
            Some(topic) => topic.clone(),
            None => return,
        };

        // Secondary indexes: topic -> connections and connection -> topics.
        self.work.submit(Task::internal(
            format!("common/watchers/{topic}"),
            Bytes::from(connection_id.to_string()),
        ));
        self.work.submit(Task::internal(
            format!("common/watching/{connection_id}"),
            Bytes::from(topic.clone()),
        ));

        // The SubAck stays with the task layer; nothing is sent from here.
        let requested = message.requested_qos.unwrap_or_default() as u8;
        self.work
            .submit(Task::subscribe(connection_id, topic, requested));
    }

    fn handle_unsubscribe(&self, connection_id: u64, message: &Message) {
        let topic = match &message.topic {
            Some(topic) => topic.clone(),
            None => return,
        };
        self.work.submit(Task::internal(
            format!("common/unsub/{connection_id}"),
            Bytes::from(topic),
        ));
    }
}
