//! Provider Frame Codec
//!
//! Providers send either a single JSON object or an array of objects per
//! frame. [`JsonCodec`] flattens both into a list of values so adapters can
//! classify each message independently.

use serde_json::Value;

use crate::application::ports::CodecError;

/// JSON codec shared by the provider adapters.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode a text frame into its message objects.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not JSON, or is JSON but neither an
    /// object nor an array of objects.
    pub fn decode(&self, text: &str) -> Result<Vec<Value>, CodecError> {
        let trimmed = text.trim();

        if trimmed.starts_with('[') {
            let values: Vec<Value> = serde_json::from_str(trimmed)?;
            if let Some(bad) = values.iter().find(|v| !v.is_object()) {
                return Err(CodecError::InvalidFormat(format!(
                    "array element is not an object: {bad}"
                )));
            }
            Ok(values)
        } else if trimmed.starts_with('{') {
            Ok(vec![serde_json::from_str(trimmed)?])
        } else {
            Err(CodecError::InvalidFormat(format!(
                "expected JSON array or object, got: {}...",
                trimmed.chars().take(50).collect::<String>()
            )))
        }
    }

    /// Encode a value to a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode<T: serde::Serialize>(&self, value: &T) -> Result<String, CodecError> {
        Ok(serde_json::to_string(value)?)
    }
}

/// String field of a message, if present.
pub(crate) fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}
