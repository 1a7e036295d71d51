//! Value payload codec.
//!
//! Inputs and outputs travel as JSON bytes; the framing codec base64s them.

use serde_json::Value;

use crate::error::SerializationError;

pub fn encode_value(value: &Value) -> Result<Vec<u8>, SerializationError> {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode_value(bytes: &[u8]) -> Result<Value, SerializationError> {
    Ok(serde_json::from_slice(bytes)?)
}
