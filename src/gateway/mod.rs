pub mod decode;
pub mod receiver;

use serde::Deserialize;

/// Outer JSON object a gateway broadcasts for one device event.
/// Every field is optional on the wire; missing ones decode as empty strings
/// and non-string scalars are kept as their text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeviceEnvelope {
    #[serde(rename = "cmd", deserialize_with = "decode::lenient_string")]
    pub command: String,
    #[serde(deserialize_with = "decode::lenient_string")]
    pub token: String,
    #[serde(deserialize_with = "decode::lenient_string")]
    pub model: String,
    #[serde(deserialize_with = "decode::lenient_string")]
    pub sid: String,
    #[serde(rename = "short id", deserialize_with = "decode::lenient_string")]
    pub short_id: String,
    /// Double-encoded JSON object holding the sensor fields.
    #[serde(deserialize_with = "decode::lenient_string")]
    pub data: String,
}

/// Decoded `data` payload: field name to scalar value.
pub type FieldMapping = serde_json::Map<String, serde_json::Value>;

/// A single topic/payload pair ready to publish.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid envelope JSON: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("invalid data JSON for {model}/{sid}: {source}")]
    Data {
        model: String,
        sid: String,
        #[source]
        source: serde_json::Error,
    },
}
