use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Maximum length of `type` and `source` after normalization, in characters.
pub const MAX_FIELD_CHARS: usize = 256;

/// The three-field event envelope exchanged with publishers and consumers.
///
/// The serialized form contains exactly `type`, `source` and `payload`;
/// no identifiers or timestamps are injected on the way through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub payload: Value,
}

/// Envelope validation failure, naming the offending field
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("event must be a JSON object")]
    NotAnObject,
    #[error("{0} is required and must be a string")]
    MissingString(&'static str),
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("{0} exceeds {MAX_FIELD_CHARS} characters")]
    TooLong(&'static str),
    #[error("payload is required")]
    MissingPayload,
}

/// Validate a parsed JSON value against the envelope schema and normalize it.
///
/// `type` is trimmed and lowercased, `source` is trimmed; both are length
/// checked after normalization. `payload` may be any JSON value including
/// `null`, but must be present as a key.
pub fn validate_envelope(value: &Value) -> Result<EventEnvelope, ValidationError> {
    let obj = value.as_object().ok_or(ValidationError::NotAnObject)?;

    let event_type = normalize_field(obj.get("type"), "type")?.to_lowercase();
    let source = normalize_field(obj.get("source"), "source")?;

    let payload = obj
        .get("payload")
        .cloned()
        .ok_or(ValidationError::MissingPayload)?;

    Ok(EventEnvelope {
        event_type,
        source,
        payload,
    })
}

fn normalize_field(
    value: Option<&Value>,
    field: &'static str,
) -> Result<String, ValidationError> {
    let raw = value
        .and_then(|v| v.as_str())
        .ok_or(ValidationError::MissingString(field))?;

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty(field));
    }
    if trimmed.chars().count() > MAX_FIELD_CHARS {
        return Err(ValidationError::TooLong(field));
    }

    Ok(trimmed.to_string())
}
