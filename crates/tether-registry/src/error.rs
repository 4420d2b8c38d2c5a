/// Error produced by a codec strategy.
pub type CodecError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur in the packet registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No binding or route exists for the type id.
    #[error("no packet type registered for type id {0}")]
    UnknownTypeId(u32),

    /// The type id is already bound; the first binding stays active.
    #[error("type id {type_id} already registered for {existing}")]
    DuplicateTypeId {
        type_id: u32,
        existing: &'static str,
    },

    /// The value could not be serialized.
    #[error("failed to encode type id {type_id}: {source}")]
    Encode { type_id: u32, source: CodecError },

    /// The payload could not be deserialized.
    #[error("failed to decode type id {type_id}: {source}")]
    Decode { type_id: u32, source: CodecError },

    /// The type id is bound to a different Rust type than requested.
    #[error("type id {type_id} is bound to {registered}, not {requested}")]
    TypeMismatch {
        type_id: u32,
        registered: &'static str,
        requested: &'static str,
    },

    /// A JSON Schema could not be compiled.
    #[cfg(feature = "schema")]
    #[error("failed to compile schema for type id {type_id}: {message}")]
    SchemaCompile { type_id: u32, message: String },
}

pub type Result<T> = std::result::Result<T, RegistryError>;
