//! Payload Serialization Modes
//!
//! Each endpoint picks how its payloads are carried inside an envelope:
//!
//! - **Raw**: the payload is the plain JSON rendering of the value.
//! - **Extended**: the payload is a structure-preserving binary encoding wrapped
//!   in a small JSON object. Use it for values JSON cannot round-trip, such as
//!   non-finite floats, 128-bit integers or maps with non-string keys.
//!
//! ```json
//! { "$extended": "bincode-1", "data": "AAAAAAAA+H8=" }
//! ```
//!
//! Extended payloads are not self-describing; both sides must decode them into
//! the concrete type declared by the endpoint.

use crate::error::WireError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const EXTENDED_MARKER: &str = "$extended";
const EXTENDED_FORMAT: &str = "bincode-1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SerializationMode {
    #[default]
    Raw,
    Extended,
}

impl SerializationMode {
    /// Encode a typed payload into its wire form
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Value, WireError> {
        match self {
            Self::Raw => serde_json::to_value(value)
                .map_err(|e| WireError::encode_with_source("Failed to encode raw payload", e)),
            Self::Extended => {
                let bytes = bincode::serialize(value).map_err(|e| {
                    WireError::encode_with_source("Failed to encode extended payload", e)
                })?;
                Ok(json!({
                    EXTENDED_MARKER: EXTENDED_FORMAT,
                    "data": STANDARD.encode(bytes),
                }))
            }
        }
    }

    /// Decode a wire payload into the endpoint's declared type
    pub fn decode<T: DeserializeOwned>(&self, value: Value) -> Result<T, WireError> {
        match self {
            Self::Raw => serde_json::from_value(value)
                .map_err(|e| WireError::decode_with_source("Payload does not match schema", e)),
            Self::Extended => {
                let format = value.get(EXTENDED_MARKER).and_then(Value::as_str);
                if format != Some(EXTENDED_FORMAT) {
                    return Err(WireError::decode(format!(
                        "Expected an extended payload tagged {:?}",
                        EXTENDED_FORMAT
                    )));
                }
                let data = value
                    .get("data")
                    .and_then(Value::as_str)
                    .ok_or_else(|| WireError::decode("Extended payload is missing data"))?;
                let bytes = STANDARD.decode(data).map_err(|e| {
                    WireError::decode_with_source("Extended payload is not valid base64", e)
                })?;
                bincode::deserialize(&bytes).map_err(|e| {
                    WireError::decode_with_source("Extended payload does not match schema", e)
                })
            }
        }
    }
}
