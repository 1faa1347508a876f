//! Value marshaling between native values and runner JSON text
//!
//! Arguments travel to the engine as one JSON array; results come back as
//! the text the engine produced with `JSON.stringify`, wrapped in a
//! completion envelope that also carries null results and thrown errors.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::{MarshalError, ThrownError};

/// A value as the engine handed it back
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    /// `JSON.stringify` output
    Text(String),
    /// `null` or `undefined`
    Null,
    /// The engine could not stringify the value
    Unstringifiable(String),
}

/// How a runner call settled
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Returned(WireValue),
    /// The addressed method or function does not exist
    MissingMethod,
    Thrown(ThrownError),
}

/// Completion envelope posted by the engine-side bridge helpers
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum Envelope {
    Value { text: String },
    Null,
    Unstringifiable { reason: String },
    Missing,
    Thrown { error: Value },
}

/// Encode one native value
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String, MarshalError> {
    serde_json::to_string(value).map_err(MarshalError::Encode)
}

/// Encode a positional argument list as a JSON array
pub fn encode_arguments(args: &[Value]) -> Result<String, MarshalError> {
    encode(args)
}

/// Decode wire text into `T`
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, MarshalError> {
    serde_json::from_str(text).map_err(|source| MarshalError::ShapeMismatch {
        expected: std::any::type_name::<T>(),
        source,
    })
}

/// Decode a value that must be present
pub fn decode_required<T: DeserializeOwned>(wire: WireValue) -> Result<T, MarshalError> {
    match wire {
        WireValue::Text(text) => decode(&text),
        WireValue::Null => Err(MarshalError::NullResult {
            expected: std::any::type_name::<T>(),
        }),
        WireValue::Unstringifiable(reason) => Err(MarshalError::Unstringifiable(reason)),
    }
}

/// Decode a value where null or undefined means `None`
pub fn decode_optional<T: DeserializeOwned>(wire: WireValue) -> Result<Option<T>, MarshalError> {
    match wire {
        WireValue::Null => Ok(None),
        WireValue::Text(text) if text == "null" => Ok(None),
        other => decode_required(other).map(Some),
    }
}

/// Parse the completion envelope the engine posts for a call
pub fn parse_envelope(raw: &str) -> Result<CallOutcome, MarshalError> {
    let envelope: Envelope =
        serde_json::from_str(raw).map_err(|e| MarshalError::Envelope(e.to_string()))?;

    Ok(match envelope {
        Envelope::Value { text } => CallOutcome::Returned(WireValue::Text(text)),
        Envelope::Null => CallOutcome::Returned(WireValue::Null),
        Envelope::Unstringifiable { reason } => {
            CallOutcome::Returned(WireValue::Unstringifiable(reason))
        }
        Envelope::Missing => CallOutcome::MissingMethod,
        Envelope::Thrown { error } => CallOutcome::Thrown(ThrownError::from_thrown(&error)),
    })
}
