use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::codec::{
    BinaryCodec, BinaryPacket, FnCodec, JsonCodec, PacketCodec, PacketFlavor, TypedPacket,
};
use crate::error::{CodecError, RegistryError, Result};

/// Type-id keyed registry of packet codecs.
///
/// Populate it with `&mut self` at startup, then share it as
/// `Arc<PacketRegistry>`; lookups never lock.
pub struct PacketRegistry {
    bindings: HashMap<u32, Binding>,
}

struct Binding {
    rust_type: TypeId,
    type_name: &'static str,
    flavor: PacketFlavor,
    /// `Arc<dyn PacketCodec<T>>` for the bound `T`.
    codec: Box<dyn Any + Send + Sync>,
}

/// Public description of a registered binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingInfo {
    pub type_id: u32,
    pub type_name: &'static str,
    pub flavor: PacketFlavor,
}

impl PacketRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            bindings: HashMap::new(),
        }
    }

    /// Bind `type_id` to a codec for `T`.
    ///
    /// Fails with [`RegistryError::DuplicateTypeId`] if `type_id` is already
    /// bound; the existing binding is left untouched.
    pub fn register<T, C>(&mut self, type_id: u32, codec: C) -> Result<()>
    where
        T: 'static,
        C: PacketCodec<T>,
    {
        if let Some(existing) = self.bindings.get(&type_id) {
            return Err(RegistryError::DuplicateTypeId {
                type_id,
                existing: existing.type_name,
            });
        }

        let flavor = codec.flavor();
        let codec: Arc<dyn PacketCodec<T>> = Arc::new(codec);
        self.bindings.insert(
            type_id,
            Binding {
                rust_type: TypeId::of::<T>(),
                type_name: type_name::<T>(),
                flavor,
                codec: Box::new(codec),
            },
        );

        debug!(type_id, rust_type = type_name::<T>(), ?flavor, "registered packet type");
        Ok(())
    }

    /// Bind `type_id` to explicit encode/decode functions.
    pub fn register_fn<T, E, D>(&mut self, type_id: u32, encode: E, decode: D) -> Result<()>
    where
        T: 'static,
        E: Fn(&T) -> std::result::Result<Bytes, CodecError> + Send + Sync + 'static,
        D: Fn(&[u8]) -> std::result::Result<T, CodecError> + Send + Sync + 'static,
    {
        self.register::<T, _>(type_id, FnCodec::new(encode, decode))
    }

    /// Bind `type_id` to generic structured (JSON) serialization of `T`.
    pub fn register_structured<T>(&mut self, type_id: u32) -> Result<()>
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        self.register::<T, _>(type_id, JsonCodec)
    }

    /// Bind `type_id` to `T`'s own binary encoding.
    pub fn register_binary<T>(&mut self, type_id: u32) -> Result<()>
    where
        T: BinaryPacket + 'static,
    {
        self.register::<T, _>(type_id, BinaryCodec)
    }

    /// Register a structured packet under its own [`TypedPacket::TYPE_ID`].
    pub fn register_packet<T>(&mut self) -> Result<()>
    where
        T: TypedPacket + Serialize + DeserializeOwned + 'static,
    {
        self.register_structured::<T>(T::TYPE_ID)
    }

    /// Register a binary packet under its own [`TypedPacket::TYPE_ID`].
    pub fn register_binary_packet<T>(&mut self) -> Result<()>
    where
        T: TypedPacket + BinaryPacket + 'static,
    {
        self.register_binary::<T>(T::TYPE_ID)
    }

    /// Encode `value` with the codec bound to `type_id`.
    pub fn encode<T: 'static>(&self, value: &T, type_id: u32) -> Result<Bytes> {
        self.codec::<T>(type_id)?
            .encode(value)
            .map_err(|source| RegistryError::Encode { type_id, source })
    }

    /// Decode `payload` with the codec bound to `type_id`.
    pub fn decode<T: 'static>(&self, payload: &[u8], type_id: u32) -> Result<T> {
        self.codec::<T>(type_id)?
            .decode(payload)
            .map_err(|source| RegistryError::Decode { type_id, source })
    }

    /// Check that `type_id` is bound to `T`.
    pub fn ensure_type<T: 'static>(&self, type_id: u32) -> Result<()> {
        self.codec::<T>(type_id).map(|_| ())
    }

    /// Check if a type id is bound.
    pub fn contains(&self, type_id: u32) -> bool {
        self.bindings.contains_key(&type_id)
    }

    /// Bound type ids, ascending.
    pub fn type_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.bindings.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn binding_info(&self, type_id: u32) -> Option<BindingInfo> {
        self.bindings.get(&type_id).map(|binding| BindingInfo {
            type_id,
            type_name: binding.type_name,
            flavor: binding.flavor,
        })
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    fn codec<T: 'static>(&self, type_id: u32) -> Result<&Arc<dyn PacketCodec<T>>> {
        let binding = self
            .bindings
            .get(&type_id)
            .ok_or(RegistryError::UnknownTypeId(type_id))?;

        if binding.rust_type != TypeId::of::<T>() {
            return Err(RegistryError::TypeMismatch {
                type_id,
                registered: binding.type_name,
                requested: type_name::<T>(),
            });
        }

        binding
            .codec
            .downcast_ref::<Arc<dyn PacketCodec<T>>>()
            .ok_or(RegistryError::TypeMismatch {
                type_id,
                registered: binding.type_name,
                requested: type_name::<T>(),
            })
    }
}

impl Default for PacketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PacketRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketRegistry")
            .field("type_ids", &self.type_ids())
            .finish()
    }
}
