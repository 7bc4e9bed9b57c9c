#![deny(unsafe_code)]

//! # tinymq
//!
//! An MQTT v3.1 / v3.1.1 broker engine: topic matching, subscription routing, retained messages,
//! QoS 0/1/2 delivery and persistent sessions.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use tinymq::{Broker, MemoryStore, MqttServer};
//! use tinymq::conf::Settings;
//! use tinymq::net::Builder;
//!
//! #[tokio::main]
//! async fn main() -> tinymq::Result<()> {
//!     let broker = Broker::new(Settings::default(), Arc::new(MemoryStore::new()));
//!     broker.restore().await?;
//!     MqttServer::new(broker)
//!         .listen(Builder::new().name("external/tcp").laddr(([0, 0, 0, 0], 1883).into()))
//!         .await
//! }
//! ```

pub mod auth; // CONNECT authentication hook
pub mod broker; // Shared broker state and publish routing
pub mod inflight; // Unacknowledged outbound QoS 1/2 messages
pub mod logger; // slog backend for the log facade
pub mod packet_id; // Per-client packet identifiers
mod queue; // Inbound queue policy
pub mod registry; // Live sessions by client id
pub mod retain; // Retained messages
pub mod router; // Subscription routing
pub mod server; // Accept loop
pub mod session; // Per-connection protocol handling
pub mod store; // Durable session state
pub mod topic; // Topic names and filters
pub mod trie; // Subscription trie
pub mod types; // Common data types

pub use tinymq_codec as codec;
pub use tinymq_conf as conf;
pub use tinymq_net as net;
pub use tinymq_net::{Error, MqttError, Result};

pub use auth::{AllowAll, Authenticator};
pub use broker::Broker;
pub use registry::Registry;
pub use server::{Acceptor, MqttServer};
pub use session::SessionHandle;
pub use store::{MemoryStore, Store};
pub use types::{ClientId, Reason, SessionState, Stats, TopicFilter, TopicName};
