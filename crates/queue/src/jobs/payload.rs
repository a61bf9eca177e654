//! Tagged job payloads.
//!
//! A payload type is an enum with one variant per job name, serialized with
//! `#[serde(tag = "name", content = "data")]`. On submit the tag becomes the
//! job name and the content becomes the stored payload; processors rebuild the
//! enum from both halves with [`decode`].
//!
//! ```ignore
//! #[derive(Serialize, Deserialize)]
//! #[serde(tag = "name", content = "data")]
//! enum AuthJob {
//!     #[serde(rename = "addAuthUserToDB")]
//!     AddAuthUserToDb { value: AuthUser },
//! }
//! ```

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use chatty_core::{DomainError, JobName};

const TAG: &str = "name";
const CONTENT: &str = "data";

/// Payload could not be turned into a job.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("payload is not a tagged job (expected {{\"name\": .., \"data\": ..}}): {0}")]
    Shape(String),

    #[error(transparent)]
    Name(#[from] DomainError),
}

/// Split a tagged payload into its job name and stored data.
pub fn encode<P: Serialize>(payload: &P) -> Result<(JobName, Value), PayloadError> {
    let value = serde_json::to_value(payload)?;
    let mut map = match value {
        Value::Object(map) => map,
        other => return Err(PayloadError::Shape(format!("got {}", kind_of(&other)))),
    };

    let name = match map.remove(TAG) {
        Some(Value::String(name)) => JobName::new(name)?,
        Some(other) => {
            return Err(PayloadError::Shape(format!(
                "\"{TAG}\" must be a string, got {}",
                kind_of(&other)
            )));
        }
        None => return Err(PayloadError::Shape(format!("missing \"{TAG}\""))),
    };

    let data = map.remove(CONTENT).unwrap_or(Value::Null);
    if !map.is_empty() {
        let extra: Vec<_> = map.keys().cloned().collect();
        return Err(PayloadError::Shape(format!("unexpected keys {extra:?}")));
    }

    Ok((name, data))
}

/// Rebuild a tagged payload from a job name and its stored data.
pub fn decode<P: DeserializeOwned>(name: &JobName, data: &Value) -> Result<P, serde_json::Error> {
    let mut map = Map::with_capacity(2);
    map.insert(TAG.to_string(), Value::String(name.to_string()));
    if !data.is_null() {
        map.insert(CONTENT.to_string(), data.clone());
    }
    serde_json::from_value(Value::Object(map))
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
