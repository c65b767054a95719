//! Producer records and payload validation.
//!
//! A payload is a flat JSON object. The only schema requirement is a
//! non-empty string `id`; every other field is carried through untouched.

use serde_json::{Map, Value};
use thiserror::Error;

/// Field every payload must carry to identify its producer.
pub const ID_FIELD: &str = "id";

/// Flat key/value payload as submitted by a producer.
pub type Payload = Map<String, Value>;

/// Errors raised while turning a request body into a [`Record`].
#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("payload must be a JSON object")]
    NotAnObject,

    #[error("payload has no \"id\" field")]
    MissingId,

    #[error("payload \"id\" must be a non-empty string")]
    InvalidId,

    #[error("field {key:?} is not a scalar value")]
    NestedValue { key: String },
}

/// Latest payload submitted by one producer.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    id: String,
    payload: Payload,
}

impl Record {
    /// Parse a request body into a record.
    pub fn from_json(body: &[u8]) -> Result<Self, PayloadError> {
        match serde_json::from_slice::<Value>(body)? {
            Value::Object(payload) => Self::from_payload(payload),
            _ => Err(PayloadError::NotAnObject),
        }
    }

    /// Validate an already-decoded payload.
    pub fn from_payload(payload: Payload) -> Result<Self, PayloadError> {
        let id = match payload.get(ID_FIELD) {
            None => return Err(PayloadError::MissingId),
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(_) => return Err(PayloadError::InvalidId),
        };

        if let Some((key, _)) = payload
            .iter()
            .find(|(_, v)| matches!(v, Value::Array(_) | Value::Object(_)))
        {
            return Err(PayloadError::NestedValue { key: key.clone() });
        }

        Ok(Self { id, payload })
    }

    /// Producer identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Full payload, including the `id` field.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }
}
