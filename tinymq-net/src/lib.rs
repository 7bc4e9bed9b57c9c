#![deny(unsafe_code)]

mod builder;
mod error;

pub use builder::{is_transient_accept_error, Builder, Connection, Listener, PacketReader, PacketWriter};
pub use error::MqttError;

pub type Error = anyhow::Error;
pub type Result<T> = anyhow::Result<T, Error>;
