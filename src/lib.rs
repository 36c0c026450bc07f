//! WireMQ - MQTT v3.1.1 wire-protocol engine
//!
//! Decodes MQTT control packets from raw buffers, produces the immediate
//! protocol acknowledgments, and routes the rest of the work to background
//! task handlers through topic-based routes.

pub mod broker;
pub mod codec;
pub mod config;
pub mod protocol;
pub mod server;
pub mod session;
pub mod worker;

pub use broker::{Dispatcher, Task, TaskVerb, Transport, WorkSubmission};
pub use codec::PacketReader;
pub use config::Config;
pub use protocol::{ControlPacketType, DecodeError, Message, QoS, Reply, ReturnCode};
pub use server::{ConnectionTable, Server};
pub use session::{MemorySessionCache, SessionCache, SessionRecord};
pub use worker::{QueuedWork, TaskWorker};
