use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::debug;

use super::{DecodeError, DeviceEnvelope, FieldMapping, OutboundMessage};

/// Decode one datagram into the messages it fans out to.
///
/// A populated `data` object yields one message per field on
/// `{prefix}/{model}/{sid}/{field}`. An absent, empty or `null` `data` yields a
/// single empty-payload message on `{prefix}/{model}/{sid}`.
pub fn decode_datagram(text: &str, topic_prefix: &str) -> Result<Vec<OutboundMessage>, DecodeError> {
    let envelope: DeviceEnvelope = serde_json::from_str(text).map_err(DecodeError::Envelope)?;
    let fields = parse_fields(&envelope)?;

    debug!(
        command = %envelope.command,
        model = %envelope.model,
        sid = %envelope.sid,
        short_id = %envelope.short_id,
        has_token = !envelope.token.is_empty(),
        fields = fields.len(),
        "Decoded envelope"
    );

    let device_topic = format!("{}/{}/{}", topic_prefix, envelope.model, envelope.sid);

    if fields.is_empty() {
        return Ok(vec![OutboundMessage {
            topic: device_topic,
            payload: String::new(),
        }]);
    }

    Ok(fields
        .iter()
        .map(|(name, value)| OutboundMessage {
            topic: format!("{device_topic}/{name}"),
            payload: render_value(value),
        })
        .collect())
}

fn parse_fields(envelope: &DeviceEnvelope) -> Result<FieldMapping, DecodeError> {
    if envelope.data.trim().is_empty() {
        return Ok(FieldMapping::new());
    }

    let fields: Option<FieldMapping> =
        serde_json::from_str(&envelope.data).map_err(|source| DecodeError::Data {
            model: envelope.model.clone(),
            sid: envelope.sid.clone(),
            source,
        })?;
    Ok(fields.unwrap_or_default())
}

/// Text form of a field value as published on the bus.
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Accept any JSON scalar for an envelope string field.
pub(super) fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(render_value(&Value::deserialize(deserializer)?))
}
