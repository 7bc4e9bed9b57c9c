//! MQTT v3.1 / v3.1.1 control packets and their wire codec.
//!
//! [`MqttCodec`] plugs into `tokio_util::codec::{FramedRead, FramedWrite}` and yields typed
//! [`Packet`] values. The broker engine only ever sees these typed packets.

#![deny(unsafe_code)]

#[macro_use]
mod utils;

mod codec;
mod decode;
mod encode;
pub mod error;
mod packet;
pub mod types;

pub use self::codec::MqttCodec;
pub use self::packet::{Connect, ConnectAck, ConnectAckReason, LastWill, Packet, Publish, SubscribeReturnCode};
pub use self::types::{Protocol, QoS};
