//! Outbound units of work
//!
//! A [`Task`] wraps one unit of work produced during dispatch: an inbound
//! publish to fan out, a subscription grant, or an internal bookkeeping job.
//! The topic doubles as a route: it resolves to a controller/action/param
//! triple that downstream workers match on.

use std::sync::OnceLock;

use bytes::Bytes;
use regex::Regex;

/// Kind of work carried by a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskVerb {
    /// Inbound PUBLISH to fan out to subscribers
    Publish,
    /// Subscription grant
    Subscribe,
    /// Internal bookkeeping (index maintenance, connect/close notifications)
    Internal,
    /// Message from the internal pub/sub bus
    Async,
}

/// One unit of outbound work, routed by topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Originating transport connection (0 for internal/async work)
    pub connection_id: u64,
    pub topic: String,
    pub verb: TaskVerb,
    pub controller: String,
    pub action: String,
    pub param: String,
    pub body: Bytes,
}

fn route_pattern() -> &'static Regex {
    static ROUTE: OnceLock<Regex> = OnceLock::new();
    ROUTE.get_or_init(|| Regex::new(r"(\w+)/?(\w*)/?(.*)").unwrap())
}

fn bus_pattern() -> &'static Regex {
    static BUS: OnceLock<Regex> = OnceLock::new();
    BUS.get_or_init(|| Regex::new(r"(?s)(\w+)/(.*)").unwrap())
}

impl Task {
    fn new(connection_id: u64, topic: impl Into<String>, body: Bytes, verb: TaskVerb) -> Self {
        let mut task = Task {
            connection_id,
            topic: topic.into(),
            verb,
            controller: "common".to_string(),
            action: "default".to_string(),
            param: String::new(),
            body,
        };
        task.resolve();
        task
    }

    /// Fan-out work for an inbound PUBLISH.
    pub fn publish(connection_id: u64, topic: impl Into<String>, payload: Bytes) -> Self {
        Task::new(connection_id, topic, payload, TaskVerb::Publish)
    }

    /// Subscription grant; the body carries the requested QoS byte.
    pub fn subscribe(connection_id: u64, topic: impl Into<String>, requested_qos: u8) -> Self {
        Task::new(
            connection_id,
            topic,
            Bytes::copy_from_slice(&[requested_qos]),
            TaskVerb::Subscribe,
        )
    }

    /// Work item from the internal pub/sub bus.
    ///
    /// The bus message is itself a route (`controller/action/param/payload`);
    /// after the usual resolution the param is split once more into the
    /// final param and the payload.
    pub fn async_bus(message: impl Into<String>) -> Self {
        Task::new(0, message, Bytes::new(), TaskVerb::Async)
    }

    /// Internal bookkeeping job addressed by route.
    pub fn internal(route: impl Into<String>, body: Bytes) -> Self {
        Task::new(0, route, body, TaskVerb::Internal)
    }

    /// Resolve the topic against `word/word/rest`; empty captures fall back
    /// to `default` and `""`.
    fn resolve(&mut self) {
        if let Some(caps) = route_pattern().captures(&self.topic) {
            self.controller = caps[1].to_string();
            self.action = match &caps[2] {
                "" => "default".to_string(),
                action => action.to_string(),
            };
            self.param = caps[3].to_string();
        }

        // Bus messages carry their payload inside the route: split the
        // resolved param on the first slash.
        if self.verb == TaskVerb::Async {
            if let Some(caps) = bus_pattern().captures(&self.param.clone()) {
                self.param = caps[1].to_string();
                self.body = Bytes::copy_from_slice(caps[2].as_bytes());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("chat/room1/extra", "chat", "room1", "extra"; "three segments")]
    #[test_case("chat/room1", "chat", "room1", ""; "two segments")]
    #[test_case("ping", "ping", "default", ""; "one segment")]
    #[test_case("a/b/c/d", "a", "b", "c/d"; "deep topic keeps rest in param")]
    fn routes_resolve(topic: &str, controller: &str, action: &str, param: &str) {
        let task = Task::publish(1, topic, Bytes::new());
        assert_eq!(task.controller, controller);
        assert_eq!(task.action, action);
        assert_eq!(task.param, param);
    }

    #[test]
    fn unroutable_topic_keeps_defaults() {
        let task = Task::publish(1, "/", Bytes::new());
        assert_eq!(task.controller, "common");
        assert_eq!(task.action, "default");
        assert_eq!(task.param, "");
    }

    #[test]
    fn publish_keeps_payload() {
        let task = Task::publish(3, "chat/room1", Bytes::from_static(b"hello"));
        assert_eq!(task.verb, TaskVerb::Publish);
        assert_eq!(task.connection_id, 3);
        assert_eq!(task.body.as_ref(), b"hello");
    }

    #[test]
    fn subscribe_carries_requested_qos() {
        let task = Task::subscribe(3, "chat/room1", 1);
        assert_eq!(task.verb, TaskVerb::Subscribe);
        assert_eq!(task.body.as_ref(), &[1]);
    }

    #[test]
    fn async_bus_splits_param_into_param_and_body() {
        let task = Task::async_bus("channel/play/door1/open now");
        assert_eq!(task.verb, TaskVerb::Async);
        assert_eq!(task.controller, "channel");
        assert_eq!(task.action, "play");
        assert_eq!(task.param, "door1");
        assert_eq!(task.body.as_ref(), b"open now");
    }

    #[test]
    fn async_bus_without_payload_keeps_param() {
        let task = Task::async_bus("channel/play/100011");
        assert_eq!(task.param, "100011");
        assert!(task.body.is_empty());
    }

    #[test]
    fn internal_route_with_numeric_param() {
        let task = Task::internal("common/close/42", Bytes::new());
        assert_eq!(task.verb, TaskVerb::Internal);
        assert_eq!(task.controller, "common");
        assert_eq!(task.action, "close");
        assert_eq!(task.param, "42");
    }
}
