use std::fmt;
use std::num::NonZeroU16;

use bytestring::ByteString;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub use tinymq_codec::{
    Connect, ConnectAck, ConnectAckReason, LastWill, Packet, Publish, QoS, SubscribeReturnCode,
};
use tinymq_utils::Counter;

pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
pub type HashSet<K> = std::collections::HashSet<K, ahash::RandomState>;

pub type ClientId = ByteString;
pub type TopicFilter = ByteString;
pub type TopicName = ByteString;
pub type PacketId = NonZeroU16;

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    /// The client sent DISCONNECT.
    ConnectDisconnect,
    /// The peer closed the stream or the transport failed.
    RemoteClose(Option<String>),
    KeepaliveTimeout,
    /// Another connection registered the same client id.
    TakenOver,
    /// The authenticator refused the CONNECT.
    NotAuthorized(ConnectAckReason),
    ProtocolError(String),
    HandshakeTimeout,
    InboundQueueFull,
    ServerShutdown,
    /// Internal failure, such as a store error on a path that cannot answer the client.
    Error(String),
}

impl Reason {
    /// Only an explicit DISCONNECT counts as a graceful close; it suppresses the will.
    #[inline]
    pub fn is_graceful(&self) -> bool {
        matches!(self, Reason::ConnectDisconnect)
    }

    #[inline]
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Reason::ProtocolError(msg.into())
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::ConnectDisconnect => write!(f, "Disconnect"),
            Reason::RemoteClose(None) => write!(f, "RemoteClose"),
            Reason::RemoteClose(Some(e)) => write!(f, "RemoteClose({})", e),
            Reason::KeepaliveTimeout => write!(f, "KeepaliveTimeout"),
            Reason::TakenOver => write!(f, "TakenOver"),
            Reason::NotAuthorized(r) => write!(f, "NotAuthorized({})", r.reason()),
            Reason::ProtocolError(e) => write!(f, "ProtocolError({})", e),
            Reason::HandshakeTimeout => write!(f, "HandshakeTimeout"),
            Reason::InboundQueueFull => write!(f, "InboundQueueFull"),
            Reason::ServerShutdown => write!(f, "ServerShutdown"),
            Reason::Error(e) => write!(f, "Error({})", e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    AwaitingConnect,
    Connected,
    Disconnecting,
    Closed,
}

/// Broker level counters. Subscription and retained counts are kept by the router and the
/// retain storage and merged in by `Broker::stats`.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Stats {
    pub connections: Counter,
    pub sessions: Counter,
    pub offline_packets: Counter,
    pub dropped_packets: Counter,
}

impl Stats {
    #[inline]
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "connections.count": self.connections.count(),
            "connections.max": self.connections.max(),
            "sessions.count": self.sessions.count(),
            "sessions.max": self.sessions.max(),
            "offline_packets.count": self.offline_packets.count(),
            "offline_packets.max": self.offline_packets.max(),
            "dropped_packets.count": self.dropped_packets.count(),
        })
    }
}
