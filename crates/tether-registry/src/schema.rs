use bytes::Bytes;
use jsonschema::Validator;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::codec::{PacketCodec, PacketFlavor};
use crate::error::{CodecError, RegistryError, Result};
use crate::registry::PacketRegistry;

/// An inbound payload failed JSON Schema validation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("payload violates schema: {message}")]
pub struct SchemaViolation {
    pub message: String,
}

/// Structured codec that validates inbound JSON before decoding it.
pub struct SchemaCodec {
    validator: Validator,
}

impl SchemaCodec {
    /// Compile a schema given as a JSON value.
    pub fn new(schema: &Value) -> std::result::Result<Self, String> {
        jsonschema::validator_for(schema)
            .map(|validator| Self { validator })
            .map_err(|err| err.to_string())
    }

    fn validate(&self, value: &Value) -> std::result::Result<(), SchemaViolation> {
        let mut errors = self.validator.iter_errors(value);
        if let Some(first) = errors.next() {
            let mut message = first.to_string();
            for err in errors.take(3) {
                message.push_str("; ");
                message.push_str(&err.to_string());
            }
            return Err(SchemaViolation { message });
        }
        Ok(())
    }
}

impl std::fmt::Debug for SchemaCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaCodec").finish_non_exhaustive()
    }
}

impl<T> PacketCodec<T> for SchemaCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> std::result::Result<Bytes, CodecError> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn decode(&self, payload: &[u8]) -> std::result::Result<T, CodecError> {
        let value: Value = serde_json::from_slice(payload)?;
        self.validate(&value)?;
        Ok(serde_json::from_value(value)?)
    }

    fn flavor(&self) -> PacketFlavor {
        PacketFlavor::Structured
    }
}

impl PacketRegistry {
    /// Bind `type_id` to structured serialization of `T`, validating inbound
    /// payloads against `schema_json` first.
    pub fn register_structured_with_schema<T>(&mut self, type_id: u32, schema_json: &str) -> Result<()>
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        let schema: Value = serde_json::from_str(schema_json).map_err(|err| {
            RegistryError::SchemaCompile {
                type_id,
                message: err.to_string(),
            }
        })?;
        let codec = SchemaCodec::new(&schema)
            .map_err(|message| RegistryError::SchemaCompile { type_id, message })?;

        self.register::<T, _>(type_id, codec)
    }
}
