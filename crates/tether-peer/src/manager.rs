use std::net::SocketAddr;
use std::sync::Arc;

use tether_transport::{
    Channel, ChannelEvent, ChannelOptions, DeviceEvent, DeviceId, Subscription, Transport,
    TransportError, TransportListener,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::PeerConfig;
use crate::error::PeerError;
use crate::event::Event;
use crate::sink::{PeerEventSink, SinkFilter};
use crate::state::{ConnectionState, Role, Snapshot};

struct DialAttempt {
    id: u64,
    device: DeviceId,
    cancel: CancellationToken,
}

struct PendingRetry {
    timer: u64,
    device: DeviceId,
    task: JoinHandle<()>,
}

/// Owner of all connection state. Runs as a single task; see [`Event`].
pub(crate) struct ConnectionManager<T: Transport> {
    role: Role,
    port: u16,
    config: PeerConfig,
    transport: Arc<T>,
    sink: Arc<dyn PeerEventSink>,
    events: mpsc::UnboundedSender<Event<T::Stream>>,
    snapshot: Arc<watch::Sender<Snapshot>>,
    subscription: Option<Subscription>,
    shutdown: CancellationToken,

    state: ConnectionState,
    current_device: Option<DeviceId>,
    /// Device whose dial is being pursued; cleared on success or detach.
    connecting: Option<DeviceId>,
    channel: Option<Channel>,
    in_flight: Option<DialAttempt>,
    pending_retry: Option<PendingRetry>,
    listener: Option<CancellationToken>,
    listen_retry: Option<JoinHandle<()>>,
    listen_addr: Option<SocketAddr>,
    next_id: u64,
}

impl<T: Transport> ConnectionManager<T> {
    pub(crate) fn new(
        role: Role,
        port: u16,
        config: PeerConfig,
        transport: Arc<T>,
        sink: Arc<dyn PeerEventSink>,
        events: mpsc::UnboundedSender<Event<T::Stream>>,
        snapshot: Arc<watch::Sender<Snapshot>>,
    ) -> Self {
        Self {
            role,
            port,
            config,
            transport,
            sink,
            events,
            snapshot,
            subscription: None,
            shutdown: CancellationToken::new(),
            state: ConnectionState::Idle,
            current_device: None,
            connecting: None,
            channel: None,
            in_flight: None,
            pending_retry: None,
            listener: None,
            listen_retry: None,
            listen_addr: None,
            next_id: 1,
        }
    }

    pub(crate) fn with_subscription(mut self, subscription: Subscription) -> Self {
        self.subscription = Some(subscription);
        self
    }

    /// Token that stops the loop when cancelled.
    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub(crate) async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event<T::Stream>>) {
        self.begin();
        self.publish();

        let shutdown = self.shutdown.clone();
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Some(Event::Shutdown) | None => break,
                Some(event) => self.handle(event),
            }
            self.publish();
        }

        self.teardown();
        self.publish();
    }

    fn begin(&mut self) {
        info!(
            role = %self.role,
            port = self.port,
            transport = self.transport.name(),
            "starting peer connection"
        );
        let initial = match self.role {
            Role::Host => ConnectionState::Listening,
            Role::Client => ConnectionState::WaitingForDevice,
        };
        self.set_state(initial);
        self.spawn_listener();
    }

    fn handle(&mut self, event: Event<T::Stream>) {
        match event {
            Event::Device(DeviceEvent::Attached(device)) => self.on_attached(device),
            Event::Device(DeviceEvent::Detached(device)) => self.on_detached(device),
            Event::ConnectCompleted {
                attempt,
                device,
                result,
            } => self.on_connect_completed(attempt, device, result),
            Event::Listening(addr) => {
                info!(role = %self.role, %addr, "passive channel listening");
                self.listen_addr = Some(addr);
            }
            Event::ListenFailed(err) => self.on_listen_failed(err),
            Event::ListenRetryDue => {
                self.listen_retry = None;
                if self.listener.is_none() {
                    self.spawn_listener();
                }
            }
            Event::Accepted { stream, from } => self.on_accepted(stream, from),
            Event::Channel(event) => self.on_channel_event(event),
            Event::RetryDue { timer, device } => self.on_retry_due(timer, device),
            Event::Send { frame, reply } => {
                let type_id = frame.type_id;
                let result = match &self.channel {
                    Some(channel) if self.state == ConnectionState::Connected => channel
                        .send_frame(frame)
                        .map_err(|source| PeerError::TransportSend { type_id, source }),
                    _ => Err(PeerError::NotConnected),
                };
                // The caller may have given up waiting.
                let _ = reply.send(result);
            }
            Event::Shutdown => {}
        }
    }

    fn on_attached(&mut self, device: DeviceId) {
        if self.role != Role::Host {
            debug!(%device, "client ignores device attach");
            return;
        }
        if self.state == ConnectionState::Connected {
            debug!(%device, "already connected; ignoring attach");
            return;
        }

        if self.current_device != Some(device) {
            self.cancel_dial();
        }
        self.cancel_retry();
        self.current_device = Some(device);
        self.set_state(ConnectionState::Connecting);
        self.open_connect_channel(device);
    }

    fn on_detached(&mut self, device: DeviceId) {
        if self.current_device != Some(device) {
            debug!(%device, current = ?self.current_device, "detach of untracked device");
            return;
        }

        self.cancel_retry();
        self.cancel_dial();
        self.connecting = None;

        let was_connected = self.state == ConnectionState::Connected;
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        self.current_device = None;
        self.set_state(ConnectionState::Listening);
        info!(%device, "device detached");

        if was_connected && self.config.notify_on_detach {
            self.sink.did_change_connection(false);
        }
    }

    /// Dial `device` unless a dial to it is already in flight.
    fn open_connect_channel(&mut self, device: DeviceId) {
        if self.in_flight.as_ref().is_some_and(|dial| dial.device == device) {
            debug!(%device, "dial already in flight");
            return;
        }

        self.connecting = Some(device);
        let attempt = self.next_id();
        let cancel = self.shutdown.child_token();
        self.in_flight = Some(DialAttempt {
            id: attempt,
            device,
            cancel: cancel.clone(),
        });

        debug!(%device, attempt, port = self.port, "dialing device");
        let transport = Arc::clone(&self.transport);
        let events = self.events.clone();
        let port = self.port;
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = transport.connect(port, device) => result,
            };
            let _ = events.send(Event::ConnectCompleted {
                attempt,
                device,
                result,
            });
        });
    }

    fn on_connect_completed(
        &mut self,
        attempt: u64,
        device: DeviceId,
        result: Result<T::Stream, TransportError>,
    ) {
        if self.in_flight.as_ref().map(|dial| dial.id) != Some(attempt) {
            debug!(%device, attempt, "discarding stale dial result");
            return;
        }
        self.in_flight = None;

        if self.connecting != Some(device) || self.current_device != Some(device) {
            debug!(%device, attempt, "device no longer pursued; discarding dial result");
            return;
        }

        match result {
            Ok(stream) => {
                self.connecting = None;
                self.adopt(stream, Some(device), None);
            }
            Err(source) => {
                let err = PeerError::TransportConnect { device, source };
                warn!(
                    error = %err,
                    retry_in = ?self.config.retry_delay,
                    "dial failed"
                );
                self.schedule_retry(device);
            }
        }
    }

    fn on_accepted(&mut self, stream: T::Stream, from: SocketAddr) {
        self.cancel_retry();
        self.cancel_dial();
        self.connecting = None;
        self.current_device = None;
        self.adopt(stream, None, Some(from));
    }

    /// Make `stream` the active channel, replacing any previous one.
    fn adopt(&mut self, stream: T::Stream, device: Option<DeviceId>, from: Option<SocketAddr>) {
        if let Some(previous) = self.channel.take() {
            debug!(channel = previous.id(), "replacing active channel");
            previous.close();
        }

        let id = self.next_id();
        let mut options = ChannelOptions::new(id)
            .with_frame_config(self.config.frame.clone())
            .with_filter(Arc::new(SinkFilter::new(Arc::clone(&self.sink))));
        if let Some(device) = device {
            options = options.with_device(device);
        }
        if let Some(from) = from {
            options = options.with_peer_addr(from);
        }
        self.channel = Some(Channel::spawn(stream, options, self.events.clone()));

        let was_connected = self.state == ConnectionState::Connected;
        self.set_state(ConnectionState::Connected);
        info!(channel = id, device = ?device, peer = ?from, "channel connected");

        if !was_connected {
            self.sink.did_change_connection(true);
        }
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        let active = self.channel.as_ref().map(Channel::id);
        if active != Some(event.channel()) {
            debug!(channel = event.channel(), ?active, "discarding event from stale channel");
            return;
        }

        match event {
            ChannelEvent::Frame { channel, frame } => {
                trace!(
                    channel,
                    type_id = frame.type_id,
                    len = frame.payload.len(),
                    "frame received"
                );
                self.sink.did_receive_data(frame.payload, frame.type_id);
            }
            ChannelEvent::Ended { error, .. } => self.on_channel_ended(error),
        }
    }

    fn on_channel_ended(&mut self, error: Option<TransportError>) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        match &error {
            Some(err) => warn!(channel = channel.id(), error = %err, "channel failed"),
            None => info!(channel = channel.id(), "channel closed by peer"),
        }

        self.sink.did_change_connection(false);

        match (self.role, channel.device()) {
            (Role::Host, Some(device)) if self.current_device == Some(device) => {
                self.set_state(ConnectionState::Reconnecting);
                self.schedule_retry(device);
            }
            (Role::Host, _) => {
                self.current_device = None;
                self.set_state(ConnectionState::Listening);
            }
            (Role::Client, _) => {
                self.current_device = None;
                self.set_state(ConnectionState::Idle);
            }
        }
    }

    fn schedule_retry(&mut self, device: DeviceId) {
        self.cancel_retry();

        let timer = self.next_id();
        let delay = self.config.retry_delay;
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::RetryDue { timer, device });
        });

        debug!(%device, timer, ?delay, "reconnect scheduled");
        self.pending_retry = Some(PendingRetry {
            timer,
            device,
            task,
        });
    }

    fn on_retry_due(&mut self, timer: u64, device: DeviceId) {
        match &self.pending_retry {
            Some(pending) if pending.timer == timer && pending.device == device => {
                self.pending_retry = None;
            }
            _ => {
                debug!(%device, timer, "discarding cancelled retry");
                return;
            }
        }

        if self.current_device != Some(device) || !self.state.is_dialing() {
            debug!(
                %device,
                current = ?self.current_device,
                state = %self.state,
                "retry no longer applies"
            );
            return;
        }

        self.open_connect_channel(device);
    }

    fn cancel_retry(&mut self) {
        if let Some(pending) = self.pending_retry.take() {
            pending.task.abort();
        }
    }

    fn cancel_dial(&mut self) {
        if let Some(dial) = self.in_flight.take() {
            dial.cancel.cancel();
        }
    }

    fn spawn_listener(&mut self) {
        let token = self.shutdown.child_token();
        self.listener = Some(token.clone());

        let transport = Arc::clone(&self.transport);
        let events = self.events.clone();
        let port = self.config.listen_port.unwrap_or(self.port);
        let address = self.config.listen_address;

        tokio::spawn(async move {
            let mut listener = tokio::select! {
                _ = token.cancelled() => return,
                result = transport.listen(port, address) => match result {
                    Ok(listener) => listener,
                    Err(source) => {
                        let _ = events.send(Event::ListenFailed(PeerError::TransportListen { port, source }));
                        return;
                    }
                },
            };
            if let Ok(local) = listener.local_addr() {
                let _ = events.send(Event::Listening(local));
            }

            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, from)) => {
                            if events.send(Event::Accepted { stream, from }).is_err() {
                                return;
                            }
                        }
                        Err(TransportError::Closed) => {
                            let source = TransportError::Closed;
                            let _ = events.send(Event::ListenFailed(PeerError::TransportListen { port, source }));
                            return;
                        }
                        Err(err) => warn!(error = %err, "accept failed"),
                    },
                }
            }
        });
    }

    fn on_listen_failed(&mut self, err: PeerError) {
        let delay = self.config.retry_delay;
        warn!(error = %err, retry_in = ?delay, "passive channel unavailable");

        if let Some(token) = self.listener.take() {
            token.cancel();
        }
        self.listen_addr = None;

        if let Some(task) = self.listen_retry.take() {
            task.abort();
        }
        let events = self.events.clone();
        self.listen_retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::ListenRetryDue);
        }));
    }

    fn teardown(&mut self) {
        self.cancel_retry();
        self.cancel_dial();
        if let Some(task) = self.listen_retry.take() {
            task.abort();
        }
        if let Some(token) = self.listener.take() {
            token.cancel();
        }
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.shutdown.cancel();

        let was_connected = self.state == ConnectionState::Connected;
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        self.connecting = None;
        self.current_device = None;
        self.listen_addr = None;
        self.set_state(ConnectionState::Idle);

        if was_connected {
            self.sink.did_change_connection(false);
        }
        info!(role = %self.role, "peer connection stopped");
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            info!(
                role = %self.role,
                from = %self.state,
                to = %next,
                device = ?self.current_device,
                "connection state changed"
            );
            self.state = next;
        }
    }

    fn publish(&self) {
        let next = Snapshot {
            state: self.state,
            device: self.current_device,
            listen_addr: self.listen_addr,
        };
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}
