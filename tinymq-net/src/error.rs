use tinymq_codec::error::{DecodeError, EncodeError};

#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    /// MQTT decoding error
    #[error("Decoding error: {0:?}")]
    Decode(#[from] DecodeError),
    /// MQTT encoding error
    #[error("Encoding error: {0:?}")]
    Encode(#[from] EncodeError),
    #[error("identifier rejected")]
    IdentifierRejected,
    #[error("packet id is required")]
    PacketIdRequired,
    #[error("no packet id available")]
    PacketIdExhausted,
}
