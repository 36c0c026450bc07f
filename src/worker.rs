//! Background task processing
//!
//! The dispatcher hands plain [`Task`] data to a queue and moves on; this
//! module drains that queue. The worker owns the secondary indexes fed by
//! internal tasks (topic -> connections, connection -> topics) and fans
//! inbound publishes out to subscribed connections as QoS 0 frames.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::broker::{Task, TaskVerb, Transport, WorkSubmission};
use crate::protocol::{encode_publish, ConnectInfo, QoS};
use crate::session::SessionCache;

/// Work-submission handle backed by an unbounded channel.
///
/// Submission is fire-and-forget; a task for a queue whose worker has gone
/// away is dropped.
#[derive(Clone)]
pub struct QueuedWork {
    tx: mpsc::UnboundedSender<Task>,
}

impl WorkSubmission for QueuedWork {
    fn submit(&self, task: Task) {
        if self.tx.send(task).is_err() {
            warn!("task worker gone, dropping task");
        }
    }
}

/// Drains the task queue and executes each unit of work.
pub struct TaskWorker {
    transport: Arc<dyn Transport>,
    cache: Arc<dyn SessionCache>,
    /// topic -> subscribed connection ids
    watchers: DashMap<String, HashSet<u64>>,
    /// connection id -> subscribed topics
    watching: DashMap<u64, HashSet<String>>,
    /// connection id -> client id, learned from connect notifications
    clients: DashMap<u64, String>,
}

impl TaskWorker {
    pub fn new(transport: Arc<dyn Transport>, cache: Arc<dyn SessionCache>) -> Self {
        Self {
            transport,
            cache,
            watchers: DashMap::new(),
            watching: DashMap::new(),
            clients: DashMap::new(),
        }
    }

    /// Spawn the drain loop and return the submission handle.
    pub fn spawn(self: Arc<Self>) -> QueuedWork {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                self.handle(task);
            }
        });
        QueuedWork { tx }
    }

    /// Execute one task.
    pub fn handle(&self, task: Task) {
        trace!(verb = ?task.verb, topic = %task.topic, "handling task");
        match task.verb {
            TaskVerb::Publish => self.fan_out(&task.topic, &task.body),
            // Bus messages behave like publishes on the resolved route.
            TaskVerb::Async => {
                let route = format!("{}/{}", task.controller, task.action);
                self.fan_out(&route, &task.body);
            }
            TaskVerb::Subscribe => {
                // The grant itself; the SubAck is intentionally not sent
                // from here (see the dispatcher).
                debug!(
                    connection_id = task.connection_id,
                    topic = %task.topic,
                    "subscription granted"
                );
            }
            TaskVerb::Internal => self.handle_internal(&task),
        }
    }

    fn handle_internal(&self, task: &Task) {
        match task.action.as_str() {
            "connect" => self.on_connect(task),
            "watchers" => {
                if let Some(id) = parse_id(&task.body) {
                    self.watchers
                        .entry(task.param.clone())
                        .or_default()
                        .insert(id);
                }
            }
            "watching" => {
                if let Ok(id) = task.param.parse::<u64>() {
                    let topic = String::from_utf8_lossy(&task.body).into_owned();
                    self.watching.entry(id).or_default().insert(topic);
                }
            }
            "unsub" => {
                if let Ok(id) = task.param.parse::<u64>() {
                    let topic = String::from_utf8_lossy(&task.body).into_owned();
                    self.remove_subscription(id, &topic);
                }
            }
            "close" => {
                if let Ok(id) = task.param.parse::<u64>() {
                    self.on_close(id);
                }
            }
            other => debug!(action = other, "unroutable internal task"),
        }
    }

    fn on_connect(&self, task: &Task) {
        let id = match task.param.parse::<u64>() {
            Ok(id) => id,
            Err(_) => return,
        };
        let info: ConnectInfo = match serde_json::from_slice(&task.body) {
            Ok(info) => info,
            Err(e) => {
                debug!(error = %e, "bad connect notification body");
                return;
            }
        };

        self.clients.insert(id, info.client_id.clone());

        // Bind the transport connection onto the session record, but only
        // for clients the dispatcher actually registered.
        if let Some(mut record) = self.cache.get(&info.client_id) {
            record.connection_id = Some(id);
            record.keep_alive = info.keep_alive;
            self.cache.set(&info.client_id, record);
        }
    }

    fn on_close(&self, id: u64) {
        if let Some((_, topics)) = self.watching.remove(&id) {
            for topic in topics {
                if let Some(mut subs) = self.watchers.get_mut(&topic) {
                    subs.remove(&id);
                }
            }
        }
        if let Some((_, client_id)) = self.clients.remove(&id) {
            self.cache.delete(&client_id);
            debug!(connection_id = id, client_id = %client_id, "session cleared");
        }
    }

    fn remove_subscription(&self, id: u64, topic: &str) {
        if let Some(mut subs) = self.watchers.get_mut(topic) {
            subs.remove(&id);
        }
        if let Some(mut topics) = self.watching.get_mut(&id) {
            topics.remove(topic);
        }
    }

    fn fan_out(&self, topic: &str, payload: &[u8]) {
        let subscribers = match self.watchers.get(topic) {
            Some(subs) if !subs.is_empty() => subs.iter().copied().collect::<Vec<_>>(),
            _ => return,
        };

        let frame = encode_publish(topic, payload, QoS::AtMostOnce, 0, false);
        trace!(topic, count = subscribers.len(), "fanning out publish");
        for connection_id in subscribers {
            self.transport.send(connection_id, frame.clone());
        }
    }
}

fn parse_id(body: &[u8]) -> Option<u64> {
    std::str::from_utf8(body).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    use crate::session::{MemorySessionCache, SessionRecord};

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(u64, Bytes)>>,
    }

    impl RecordingTransport {
        fn sent(&self) -> Vec<(u64, Bytes)> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Transport for RecordingTransport {
        fn send(&self, connection_id: u64, bytes: Bytes) {
            self.sent.lock().unwrap().push((connection_id, bytes));
        }

        fn close(&self, _connection_id: u64) {}
    }

    fn worker() -> (Arc<RecordingTransport>, Arc<MemorySessionCache>, TaskWorker) {
        let transport = Arc::new(RecordingTransport::default());
        let cache = Arc::new(MemorySessionCache::new());
        let worker = TaskWorker::new(transport.clone(), cache.clone());
        (transport, cache, worker)
    }

    fn subscribe(worker: &TaskWorker, id: u64, topic: &str) {
        worker.handle(Task::internal(
            format!("common/watchers/{topic}"),
            Bytes::from(id.to_string()),
        ));
        worker.handle(Task::internal(
            format!("common/watching/{id}"),
            Bytes::from(topic.to_string()),
        ));
    }

    #[test]
    fn publish_fans_out_to_watchers() {
        let (transport, _cache, worker) = worker();
        subscribe(&worker, 1, "chat/room1");
        subscribe(&worker, 2, "chat/room1");

        worker.handle(Task::publish(9, "chat/room1", Bytes::from_static(b"hey")));

        let mut sent = transport.sent();
        sent.sort_by_key(|(id, _)| *id);
        assert_eq!(sent.len(), 2);
        let expected = encode_publish("chat/room1", b"hey", QoS::AtMostOnce, 0, false);
        assert_eq!(sent[0], (1, expected.clone()));
        assert_eq!(sent[1], (2, expected));
    }

    #[test]
    fn publish_without_watchers_sends_nothing() {
        let (transport, _cache, worker) = worker();
        worker.handle(Task::publish(9, "chat/room1", Bytes::from_static(b"hey")));
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn unsub_removes_single_subscription() {
        let (transport, _cache, worker) = worker();
        subscribe(&worker, 1, "chat/room1");

        worker.handle(Task::internal(
            "common/unsub/1",
            Bytes::from_static(b"chat/room1"),
        ));
        worker.handle(Task::publish(9, "chat/room1", Bytes::from_static(b"hey")));

        assert!(transport.sent().is_empty());
    }

    #[test]
    fn close_clears_indexes_and_session() {
        let (transport, cache, worker) = worker();
        cache.set("client-1", SessionRecord::default());

        let info = ConnectInfo {
            protocol_name: "MQTT".to_string(),
            protocol_level: 4,
            has_auth: false,
            will_retain: false,
            will_qos: QoS::AtMostOnce,
            will_flag: false,
            clean_session: true,
            reserved: 0,
            keep_alive: 30,
            client_id: "client-1".to_string(),
            username: None,
            password: None,
        };
        worker.handle(Task::internal(
            "common/connect/1",
            serde_json::to_vec(&info).unwrap().into(),
        ));
        subscribe(&worker, 1, "chat/room1");

        // The connect notification bound the transport connection.
        let record = cache.get("client-1").unwrap();
        assert_eq!(record.connection_id, Some(1));
        assert_eq!(record.keep_alive, 30);

        worker.handle(Task::internal("common/close/1", Bytes::new()));
        worker.handle(Task::publish(9, "chat/room1", Bytes::from_static(b"hey")));

        assert!(transport.sent().is_empty());
        assert_eq!(cache.get("client-1"), None);
    }

    #[test]
    fn connect_notification_ignores_unregistered_clients() {
        let (_transport, cache, worker) = worker();
        let info = ConnectInfo {
            protocol_name: "HTTP".to_string(),
            protocol_level: 4,
            has_auth: false,
            will_retain: false,
            will_qos: QoS::AtMostOnce,
            will_flag: false,
            clean_session: true,
            reserved: 0,
            keep_alive: 30,
            client_id: "refused".to_string(),
            username: None,
            password: None,
        };
        worker.handle(Task::internal(
            "common/connect/1",
            serde_json::to_vec(&info).unwrap().into(),
        ));
        // The dispatcher refused this client; the worker must not create a
        // session for it.
        assert_eq!(cache.get("refused"), None);
    }

    #[test]
    fn async_bus_message_fans_out_on_resolved_route() {
        let (transport, _cache, worker) = worker();
        subscribe(&worker, 1, "channel/play");

        worker.handle(Task::async_bus("channel/play/door1"));

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 1);
    }

    #[tokio::test]
    async fn queued_work_drains_through_spawned_worker() {
        let (transport, cache, _unused) = worker();
        let worker = Arc::new(TaskWorker::new(transport.clone(), cache));
        let queue = worker.clone().spawn();

        subscribe(&worker, 1, "chat/room1");
        queue.submit(Task::publish(9, "chat/room1", Bytes::from_static(b"hey")));

        // Fire-and-forget: poll until the spawned drain loop catches up.
        for _ in 0..100 {
            if !transport.sent().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(transport.sent().len(), 1);
    }
}
