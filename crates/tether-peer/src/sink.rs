use std::sync::Arc;

use bytes::Bytes;
use tether_frame::{FrameFilter, FrameHeader};
use tether_registry::{Dispatcher, RegistryError};
use tokio::sync::mpsc;
use tracing::warn;

/// Application-side receiver of connection events.
///
/// `did_receive_data` and `did_change_connection` are called from the
/// connection's control task, one at a time. `should_accept_data_of_type` is
/// also consulted by channel reader tasks before a payload is read, so it
/// must be a cheap, side-effect free query.
pub trait PeerEventSink: Send + Sync {
    fn should_accept_data_of_type(&self, type_id: u32) -> bool;

    fn did_receive_data(&self, payload: Bytes, type_id: u32);

    fn did_change_connection(&self, connected: bool);
}

/// Frame filter backed by a sink's acceptance check.
#[derive(Clone)]
pub struct SinkFilter {
    sink: Arc<dyn PeerEventSink>,
}

impl SinkFilter {
    pub fn new(sink: Arc<dyn PeerEventSink>) -> Self {
        Self { sink }
    }
}

impl FrameFilter for SinkFilter {
    fn accept(&self, header: &FrameHeader) -> bool {
        self.sink.should_accept_data_of_type(header.type_id)
    }
}

impl std::fmt::Debug for SinkFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkFilter").finish_non_exhaustive()
    }
}

type ConnectionCallback = Box<dyn Fn(bool) + Send + Sync>;

/// Sink that routes inbound payloads through a [`Dispatcher`].
///
/// Only routed type ids are accepted. Payloads that fail to decode are
/// dropped and reported on the error channel returned by [`RoutedSink::new`].
pub struct RoutedSink {
    dispatcher: Dispatcher,
    on_connection: Option<ConnectionCallback>,
    errors: mpsc::UnboundedSender<RegistryError>,
}

impl RoutedSink {
    pub fn new(dispatcher: Dispatcher) -> (Self, mpsc::UnboundedReceiver<RegistryError>) {
        let (errors, rx) = mpsc::unbounded_channel();
        let sink = Self {
            dispatcher,
            on_connection: None,
            errors,
        };
        (sink, rx)
    }

    /// Call `callback` on every connection change.
    pub fn on_connection_changed(mut self, callback: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.on_connection = Some(Box::new(callback));
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

impl PeerEventSink for RoutedSink {
    fn should_accept_data_of_type(&self, type_id: u32) -> bool {
        self.dispatcher.accepts(type_id)
    }

    fn did_receive_data(&self, payload: Bytes, type_id: u32) {
        if let Err(err) = self.dispatcher.dispatch(type_id, payload) {
            warn!(type_id, error = %err, "dropping inbound frame");
            // Nobody listening for errors is fine.
            let _ = self.errors.send(err);
        }
    }

    fn did_change_connection(&self, connected: bool) {
        if let Some(callback) = &self.on_connection {
            callback(connected);
        }
    }
}

impl std::fmt::Debug for RoutedSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutedSink")
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}
