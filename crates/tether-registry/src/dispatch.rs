use std::any::type_name;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tether_frame::FrameEnvelope;
use tracing::trace;

use crate::error::{RegistryError, Result};
use crate::registry::PacketRegistry;

type Handler = Box<dyn Fn(Bytes) -> Result<()> + Send + Sync>;

struct Route {
    target: &'static str,
    handler: Handler,
}

/// Routes inbound `(type_id, payload)` pairs to application handlers.
///
/// Typed routes decode through the shared [`PacketRegistry`] before calling
/// the handler; raw routes receive the payload bytes untouched. Like the
/// registry, a dispatcher is configured up front and then only read.
pub struct Dispatcher {
    registry: Arc<PacketRegistry>,
    routes: HashMap<u32, Route>,
}

impl Dispatcher {
    pub fn new(registry: Arc<PacketRegistry>) -> Self {
        Self {
            registry,
            routes: HashMap::new(),
        }
    }

    /// Route `type_id` to a handler taking decoded `T` values.
    ///
    /// `type_id` must already be bound to `T` in the registry.
    pub fn route<T, F>(&mut self, type_id: u32, handler: F) -> Result<()>
    where
        T: 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.registry.ensure_type::<T>(type_id)?;
        self.check_free(type_id)?;

        let registry = Arc::clone(&self.registry);
        self.routes.insert(
            type_id,
            Route {
                target: type_name::<T>(),
                handler: Box::new(move |payload| {
                    handler(registry.decode::<T>(&payload, type_id)?);
                    Ok(())
                }),
            },
        );
        Ok(())
    }

    /// Route `type_id` to a handler taking the raw payload.
    pub fn route_raw<F>(&mut self, type_id: u32, handler: F) -> Result<()>
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        self.check_free(type_id)?;
        self.routes.insert(
            type_id,
            Route {
                target: "raw payload",
                handler: Box::new(move |payload| {
                    handler(payload);
                    Ok(())
                }),
            },
        );
        Ok(())
    }

    /// Whether inbound frames of `type_id` have somewhere to go.
    pub fn accepts(&self, type_id: u32) -> bool {
        self.routes.contains_key(&type_id)
    }

    pub fn dispatch(&self, type_id: u32, payload: Bytes) -> Result<()> {
        let route = self
            .routes
            .get(&type_id)
            .ok_or(RegistryError::UnknownTypeId(type_id))?;

        trace!(type_id, len = payload.len(), target = route.target, "dispatching payload");
        (route.handler)(payload)
    }

    pub fn dispatch_frame(&self, frame: &FrameEnvelope) -> Result<()> {
        self.dispatch(frame.type_id, frame.payload.clone())
    }

    pub fn registry(&self) -> &Arc<PacketRegistry> {
        &self.registry
    }

    /// Routed type ids, ascending.
    pub fn routed_types(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.routes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn check_free(&self, type_id: u32) -> Result<()> {
        match self.routes.get(&type_id) {
            Some(existing) => Err(RegistryError::DuplicateTypeId {
                type_id,
                existing: existing.target,
            }),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("routed_types", &self.routed_types())
            .finish()
    }
}
