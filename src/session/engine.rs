//! Session supervisor and event loop.
//!
//! One task owns every piece of mutable session state: the message-id
//! counter, the retransmission and waiter tables, the OTA receive session,
//! and the frame sink. All transitions happen at its suspension points:
//! inbound frames, command arrivals, and timer deadlines.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use coap_lite::Packet;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep, sleep_until, Duration, Instant};
use tracing::{debug, info, warn};

use crate::client::config::EndpointConfig;
use crate::codec::{self, Method, Status, UriCode};
use crate::core::{
    CallbackError, DeviceError, DeviceIdentity, ProtocolError, TransportError, ACK_AWAIT_TIMEOUT,
    HELLO_FLAG_DIAGNOSTICS, HELLO_FLAG_IMMEDIATE_UPDATES, HELLO_FLAG_OTA_SUCCESSFUL,
    HELLO_TIMEOUT, OTA_RECOVERY_WINDOW, RECONNECT_DELAY, SUBSCRIPTION_REPLAY_PACING,
    SYSTEM_EVENT_PREFIX,
};
use crate::ota::{ReceiveSession, UpdateBegin};
use crate::rpc::dispatcher::{self, Inbound};
use crate::rpc::registry::{Registries, SubscriptionScope};
use crate::session::events::{
    is_reserved_name, prefix_matches, CloudEvent, ConnectionErrorKind, Event, EventBus,
};
use crate::session::mux::{
    ListenFilter, ListenKind, MessageIdCounter, MessageWaiter, RetransmitTable, WaiterTable,
};
use crate::transport::{tcp, udp, DeviceKey, DtlsKeys, FrameSink, Link, LinkEvent, ServerKey};

/// Event name carrying the one-shot claim code.
const CLAIM_CODE_EVENT: &str = "iotready/device/claim/code";

/// System event names interpreted by the internal subscription.
const EVENT_RESET: &str = "iotready/device/reset";
pub(crate) const EVENT_UPDATES_FORCED: &str = "iotready/device/updates/forced";
const EVENT_UPDATES_PENDING: &str = "iotready/device/updates/pending";
pub(crate) const EVENT_UPDATES_ENABLED: &str = "iotready/device/updates/enabled";
const EVENT_OWNERS: &str = "iotready/device/owners";

/// Lifecycle of the single session per instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session, no reconnect pending.
    Disconnected,
    /// Dialing the endpoint.
    Connecting,
    /// Transport up, session keys being established.
    Handshaking,
    /// Session live.
    Connected,
    /// Session died; reconnect delay running.
    Reconnecting,
}

/// Confirmability policy of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckPolicy {
    /// Confirmable on UDP, non-confirmable on TCP.
    #[default]
    Default,
    /// Always confirmable; a `PublishCompleted` event follows.
    WithAck,
    /// Never confirmable.
    NoAck,
}

/// A publish submitted through the client API or an internal flow.
pub(crate) struct PublishRequest {
    pub name: String,
    pub data: Vec<u8>,
    pub private: bool,
    pub policy: AckPolicy,
    pub message_id: Option<u16>,
    pub done: Option<oneshot::Sender<Result<(), DeviceError>>>,
}

/// Commands the engine serves from its loop.
pub(crate) enum Command {
    Connect,
    Disconnect,
    Publish(PublishRequest),
    WireSubscribe {
        name: String,
        scope: SubscriptionScope,
    },
    SyncTime,
    SetKeepalive(Duration),
    SendFrame {
        bytes: Vec<u8>,
        confirmable_id: Option<u16>,
    },
    ListenFor {
        filter: ListenFilter,
        timeout: Option<Duration>,
        tx: MessageWaiter,
    },
    NextMessageId {
        tx: oneshot::Sender<u16>,
    },
    RollbackMessageId,
}

/// Cheap handle internal flows use to talk back into the loop.
#[derive(Clone)]
pub(crate) struct EngineHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl EngineHandle {
    /// Enqueue a command; false when the engine is gone.
    pub fn send(&self, command: Command) -> bool {
        self.tx.send(command).is_ok()
    }

    /// Take the next outbound message id.
    pub async fn next_message_id(&self) -> Result<u16, DeviceError> {
        let (tx, rx) = oneshot::channel();
        if !self.send(Command::NextMessageId { tx }) {
            return Err(DeviceError::Disconnected);
        }
        rx.await.map_err(|_| DeviceError::Disconnected)
    }

    /// Register a waiter and return its receiver; send the frame afterwards
    /// so the waiter is armed before the bytes go out.
    pub fn start_listen(
        &self,
        filter: ListenFilter,
        timeout: Option<Duration>,
    ) -> oneshot::Receiver<Result<Packet, DeviceError>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ListenFor {
            filter,
            timeout,
            tx,
        });
        rx
    }

    /// Enqueue a frame; confirmable frames carry their id for tracking.
    pub fn send_frame(&self, bytes: Vec<u8>, confirmable_id: Option<u16>) {
        self.send(Command::SendFrame {
            bytes,
            confirmable_id,
        });
    }
}

/// State shared between the client handle and the engine task.
pub(crate) struct SharedState {
    pub identity: DeviceIdentity,
    pub endpoint: EndpointConfig,
    pub registries: Mutex<Registries>,
    pub bus: EventBus,
    pub state: Mutex<SessionState>,
    pub updates_enabled: AtomicBool,
    pub updates_forced: AtomicBool,
    pub updates_pending: AtomicBool,
    pub ota_upgrade_successful: AtomicBool,
    pub latched_disconnect: AtomicBool,
    pub claim_code: Mutex<Option<String>>,
}

impl SharedState {
    pub(crate) fn new(
        identity: DeviceIdentity,
        endpoint: EndpointConfig,
        claim_code: Option<String>,
    ) -> Self {
        Self {
            identity,
            endpoint,
            registries: Mutex::new(Registries::new()),
            bus: EventBus::default(),
            state: Mutex::new(SessionState::Disconnected),
            updates_enabled: AtomicBool::new(true),
            updates_forced: AtomicBool::new(false),
            updates_pending: AtomicBool::new(false),
            ota_upgrade_successful: AtomicBool::new(false),
            latched_disconnect: AtomicBool::new(false),
            claim_code: Mutex::new(claim_code),
        }
    }

    pub(crate) fn registries(&self) -> MutexGuard<'_, Registries> {
        self.registries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn session_state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }
}

/// How a connected session ended.
enum SessionEnd {
    UserDisconnect,
    Died(DeviceError),
    Shutdown,
}

/// What a handled command asks of the loop.
enum LoopAction {
    Continue,
    KeepaliveChanged,
    Disconnect,
}

/// The session engine task.
pub(crate) struct Engine {
    shared: Arc<SharedState>,
    handle: EngineHandle,
    keepalive: Duration,
    counter: MessageIdCounter,
    retransmit: RetransmitTable,
    waiters: WaiterTable,
    sink: Option<FrameSink>,
    ota: Option<ReceiveSession>,
    hello_deadline: Option<Instant>,
    hello_message_id: Option<u16>,
}

impl Engine {
    /// Build the engine and its command channel.
    pub(crate) fn new(
        shared: Arc<SharedState>,
        keepalive: Duration,
    ) -> (Self, EngineHandle, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = EngineHandle { tx };
        let engine = Self {
            shared,
            handle: handle.clone(),
            keepalive,
            counter: MessageIdCounter::new(0),
            retransmit: RetransmitTable::new(),
            waiters: WaiterTable::new(),
            sink: None,
            ota: None,
            hello_deadline: None,
            hello_message_id: None,
        };
        (engine, handle, rx)
    }

    fn bus(&self) -> EventBus {
        self.shared.bus.clone()
    }

    fn is_tcp(&self) -> bool {
        self.shared.endpoint.force_tcp
    }

    /// Supervisor loop: connect, run, classify failures, back off, repeat.
    pub(crate) async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            if self.shared.latched_disconnect.load(Ordering::SeqCst) {
                match cmd_rx.recv().await {
                    None => return,
                    Some(cmd) => {
                        self.handle_offline_command(cmd);
                        continue;
                    }
                }
            }

            self.shared.set_state(SessionState::Connecting);
            self.bus().emit(Event::Connect);

            match self.establish().await {
                Ok(link) => {
                    let end = self.run_connected(link, &mut cmd_rx).await;
                    self.teardown();
                    match end {
                        SessionEnd::Shutdown => return,
                        SessionEnd::UserDisconnect => {
                            self.shared.set_state(SessionState::Disconnected);
                            self.bus().emit(Event::Disconnect);
                        }
                        SessionEnd::Died(err) => {
                            warn!(error = %err, "session died, scheduling reconnect");
                            self.emit_connection_error(&err);
                            self.shared.set_state(SessionState::Reconnecting);
                            self.bus().emit(Event::Reconnect);
                            if self.sleep_offline(RECONNECT_DELAY, &mut cmd_rx).await {
                                return;
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "connect attempt failed");
                    self.emit_connection_error(&err);
                    self.shared.set_state(SessionState::Reconnecting);
                    self.bus().emit(Event::Reconnect);
                    if self.sleep_offline(RECONNECT_DELAY, &mut cmd_rx).await {
                        return;
                    }
                }
            }
        }
    }

    /// Resolve the endpoint and bring up the selected secure transport.
    async fn establish(&mut self) -> Result<Link, DeviceError> {
        let endpoint = self.shared.endpoint.clone();
        let target = (endpoint.host.clone(), endpoint.port);
        let addr = tokio::net::lookup_host(target)
            .await
            .map_err(|_| TransportError::DnsNotFound(endpoint.host.clone()))?
            .next()
            .ok_or_else(|| TransportError::DnsNotFound(endpoint.host.clone()))?;

        self.shared.set_state(SessionState::Handshaking);

        if endpoint.force_tcp {
            let (DeviceKey::Rsa(device_key), ServerKey::Rsa(server_key)) =
                (&endpoint.device_key, &endpoint.server_key)
            else {
                return Err(crate::core::ConfigError::KeyKindMismatch {
                    transport: "TCP",
                    expected: "RSA",
                }
                .into());
            };
            tcp::connect(addr, &self.shared.identity, device_key, server_key).await
        } else {
            let DeviceKey::EccDer(device_der) = &endpoint.device_key else {
                return Err(crate::core::ConfigError::KeyKindMismatch {
                    transport: "UDP",
                    expected: "ECC",
                }
                .into());
            };
            let server_der = match &endpoint.server_key {
                ServerKey::EccDer(der) => der.clone(),
                ServerKey::Rsa(_) => Vec::new(),
            };
            let keys = DtlsKeys {
                device_private_key_der: device_der.clone(),
                server_public_key_der: server_der,
            };
            udp::connect(addr, keys, endpoint.connector.as_ref()).await
        }
    }

    /// Drive one live session until it ends.
    async fn run_connected(
        &mut self,
        link: Link,
        cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    ) -> SessionEnd {
        let Link {
            mut frames,
            sink,
            initial_message_id,
        } = link;
        self.sink = Some(sink);
        self.counter = MessageIdCounter::new(initial_message_id.unwrap_or_else(rand::random));
        self.retransmit = RetransmitTable::new();
        self.waiters = WaiterTable::new();
        self.ota = None;

        if let Err(e) = self.send_hello().await {
            return SessionEnd::Died(e);
        }
        if self.is_tcp() {
            self.hello_deadline = Some(Instant::now() + HELLO_TIMEOUT);
        }

        self.shared.set_state(SessionState::Connected);
        self.bus().emit(Event::Connected);
        info!("session connected");
        tokio::spawn(post_connect_sequence(
            self.handle.clone(),
            self.shared.clone(),
        ));

        let mut ping = interval_at(Instant::now() + self.keepalive, self.keepalive);

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                event = frames.recv() => match event {
                    Some(LinkEvent::Frame(bytes)) => {
                        if let Err(e) = self.handle_frame(&bytes).await {
                            return SessionEnd::Died(e);
                        }
                    }
                    Some(LinkEvent::Closed(err)) => return SessionEnd::Died(err.into()),
                    None => return SessionEnd::Died(TransportError::SocketClosed.into()),
                },
                cmd = cmd_rx.recv() => match cmd {
                    None => return SessionEnd::Shutdown,
                    Some(cmd) => match self.handle_command(cmd).await {
                        Ok(LoopAction::Continue) => {}
                        Ok(LoopAction::KeepaliveChanged) => {
                            ping = interval_at(
                                Instant::now() + self.keepalive,
                                self.keepalive,
                            );
                        }
                        Ok(LoopAction::Disconnect) => return SessionEnd::UserDisconnect,
                        Err(e) => return SessionEnd::Died(e),
                    },
                },
                _ = ping.tick() => {
                    if let Err(e) = self.send_ping().await {
                        return SessionEnd::Died(e);
                    }
                }
                _ = sleep_until_opt(deadline) => {
                    if let Err(e) = self.handle_deadlines().await {
                        return SessionEnd::Died(e);
                    }
                }
            }
        }
    }

    /// Earliest of the retransmission, waiter, hello, and OTA deadlines.
    fn next_deadline(&self) -> Option<Instant> {
        [
            self.retransmit.next_deadline(),
            self.waiters.next_deadline(),
            self.hello_deadline,
            self.ota.as_ref().and_then(|o| o.recovery_deadline),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Fire every deadline that has passed.
    async fn handle_deadlines(&mut self) -> Result<(), DeviceError> {
        let now = Instant::now();

        if self.hello_deadline.is_some_and(|d| d <= now) {
            return Err(TransportError::HelloTimeout.into());
        }

        let outcome = self.retransmit.on_deadline(now);
        if outcome.exhausted {
            return Err(TransportError::RetransmitExhausted.into());
        }
        for frame in outcome.resend {
            debug!(bytes = frame.len(), "retransmitting confirmable frame");
            self.write_frame(&frame).await?;
        }

        self.waiters.expire(now);

        if self
            .ota
            .as_ref()
            .is_some_and(|o| o.recovery_deadline.is_some_and(|d| d <= now))
        {
            warn!("fast-OTA recovery window elapsed, dropping transfer");
            self.ota = None;
        }

        Ok(())
    }

    fn teardown(&mut self) {
        self.sink = None;
        self.retransmit.clear();
        self.waiters.reject_all();
        self.ota = None;
        self.hello_deadline = None;
        self.hello_message_id = None;
    }

    fn emit_connection_error(&self, err: &DeviceError) {
        let kind = match err {
            DeviceError::Transport(t) => ConnectionErrorKind::classify(t),
            _ => ConnectionErrorKind::Other,
        };
        self.bus().emit(Event::ConnectionError {
            kind,
            message: err.to_string(),
        });
    }

    /// Back off before reconnecting, still serving commands. True = shutdown.
    async fn sleep_offline(
        &mut self,
        delay: Duration,
        cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    ) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return false,
                cmd = cmd_rx.recv() => match cmd {
                    None => return true,
                    Some(cmd) => self.handle_offline_command(cmd),
                },
            }
        }
    }

    fn handle_offline_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => {
                self.shared
                    .latched_disconnect
                    .store(false, Ordering::SeqCst);
            }
            Command::Disconnect => {
                self.shared.latched_disconnect.store(true, Ordering::SeqCst);
            }
            Command::Publish(req) => {
                if let Some(done) = req.done {
                    let _ = done.send(Err(DeviceError::NotConnected));
                }
            }
            Command::ListenFor { tx, .. } => {
                let _ = tx.send(Err(DeviceError::Disconnected));
            }
            Command::NextMessageId { tx } => {
                let _ = tx.send(self.counter.next_id());
            }
            Command::SetKeepalive(keepalive) => self.keepalive = keepalive,
            Command::WireSubscribe { .. }
            | Command::SyncTime
            | Command::SendFrame { .. }
            | Command::RollbackMessageId => {}
        }
    }

    async fn handle_command(&mut self, cmd: Command) -> Result<LoopAction, DeviceError> {
        match cmd {
            Command::Connect => Ok(LoopAction::Continue),
            Command::Disconnect => {
                self.shared.latched_disconnect.store(true, Ordering::SeqCst);
                Ok(LoopAction::Disconnect)
            }
            Command::SetKeepalive(keepalive) => {
                self.keepalive = keepalive;
                Ok(LoopAction::KeepaliveChanged)
            }
            Command::Publish(req) => {
                self.handle_publish(req).await?;
                Ok(LoopAction::Continue)
            }
            Command::WireSubscribe { name, scope } => {
                self.send_subscribe(name, scope).await?;
                Ok(LoopAction::Continue)
            }
            Command::SyncTime => {
                self.send_time_request().await?;
                Ok(LoopAction::Continue)
            }
            Command::SendFrame {
                bytes,
                confirmable_id,
            } => {
                if let Some(id) = confirmable_id {
                    self.retransmit.register(id, bytes.clone());
                }
                self.write_frame(&bytes).await?;
                Ok(LoopAction::Continue)
            }
            Command::ListenFor {
                filter,
                timeout,
                tx,
            } => {
                let timeout = timeout.unwrap_or(self.keepalive * 2);
                self.waiters.insert(filter, Instant::now() + timeout, tx);
                Ok(LoopAction::Continue)
            }
            Command::NextMessageId { tx } => {
                let _ = tx.send(self.counter.next_id());
                Ok(LoopAction::Continue)
            }
            Command::RollbackMessageId => {
                self.counter.rollback();
                Ok(LoopAction::Continue)
            }
        }
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    async fn write_frame(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
        let sink = self.sink.as_mut().ok_or(DeviceError::NotConnected)?;
        sink.send(bytes).await?;
        Ok(())
    }

    async fn send_packet_now(&mut self, packet: &Packet) -> Result<(), DeviceError> {
        let bytes = codec::encode(packet)?;
        self.write_frame(&bytes).await
    }

    /// Send a confirmable packet: register it for retransmission first.
    async fn send_confirmable(&mut self, packet: &Packet) -> Result<(), DeviceError> {
        let bytes = codec::encode(packet)?;
        self.retransmit
            .register(packet.header.message_id, bytes.clone());
        self.write_frame(&bytes).await
    }

    async fn send_ping(&mut self) -> Result<(), DeviceError> {
        let id = self.counter.next_id();
        debug!(message_id = id, "keepalive ping");
        self.send_confirmable(&codec::ping(id)).await
    }

    async fn send_hello(&mut self) -> Result<(), DeviceError> {
        let identity = &self.shared.identity;
        let mut flags = HELLO_FLAG_DIAGNOSTICS | HELLO_FLAG_IMMEDIATE_UPDATES;
        if self.shared.ota_upgrade_successful.load(Ordering::SeqCst) {
            flags |= HELLO_FLAG_OTA_SUCCESSFUL;
        }

        let mut payload = Vec::with_capacity(10 + identity.device_id.len());
        payload.extend_from_slice(&identity.product_id.to_be_bytes());
        payload.extend_from_slice(&identity.product_firmware_version.to_be_bytes());
        payload.push(0x00);
        payload.push(flags);
        payload.extend_from_slice(&identity.platform_id.to_be_bytes());
        payload.extend_from_slice(&(identity.device_id.len() as u16).to_be_bytes());
        payload.extend_from_slice(&identity.device_id);

        let id = self.counter.next_id();
        self.hello_message_id = Some(id);
        let packet = codec::request(Method::Post, true, id, &["h"], &[], vec![], payload);
        self.send_confirmable(&packet).await
    }

    async fn handle_publish(&mut self, req: PublishRequest) -> Result<(), DeviceError> {
        let confirmable = match req.policy {
            AckPolicy::WithAck => true,
            AckPolicy::NoAck => false,
            AckPolicy::Default => !self.is_tcp(),
        };
        let id = req.message_id.unwrap_or_else(|| self.counter.next_id());

        let code = if req.private {
            UriCode::PrivateEvent
        } else {
            UriCode::PublicEvent
        };
        let mut segments = vec![code.as_str()];
        segments.extend(req.name.split('/'));

        let packet = codec::request(
            Method::Post,
            confirmable,
            id,
            &segments,
            &[],
            vec![],
            req.data.clone(),
        );
        let bytes = match codec::encode(&packet) {
            Ok(bytes) => bytes,
            Err(e) => {
                if let Some(done) = req.done {
                    let _ = done.send(Err(e.into()));
                }
                return Ok(());
            }
        };

        if confirmable {
            self.retransmit.register(id, bytes.clone());
        }
        self.write_frame(&bytes).await?;

        if !is_reserved_name(&req.name) {
            self.bus().emit(Event::Publish {
                name: req.name.clone(),
                data: req.data,
            });
        }

        if confirmable {
            let rx = self.waiters.register(
                ListenFilter::for_message(ListenKind::Complete, id),
                Instant::now() + ACK_AWAIT_TIMEOUT,
            );
            let bus = self.bus();
            let name = req.name;
            tokio::spawn(async move {
                let success = matches!(rx.await, Ok(Ok(_)));
                bus.emit(Event::PublishCompleted { name, success });
            });
        }

        if let Some(done) = req.done {
            let _ = done.send(Ok(()));
        }
        Ok(())
    }

    async fn send_subscribe(
        &mut self,
        name: String,
        scope: SubscriptionScope,
    ) -> Result<(), DeviceError> {
        let id = self.counter.next_id();
        let mut segments = vec![UriCode::PublicEvent.as_str()];
        segments.extend(name.split('/'));
        let queries = match scope {
            SubscriptionScope::MyDevices => vec![b"u".to_vec()],
            SubscriptionScope::AllDevices => vec![],
        };
        let packet = codec::request(Method::Get, true, id, &segments, &queries, vec![], vec![]);
        self.send_confirmable(&packet).await?;

        let rx = self.waiters.register(
            ListenFilter::for_message(ListenKind::Complete, id),
            Instant::now() + ACK_AWAIT_TIMEOUT,
        );
        let bus = self.bus();
        tokio::spawn(async move {
            match rx.await {
                Ok(Ok(_)) => bus.emit(Event::Subscribe { name }),
                _ => bus.emit_error(format!("subscription {name} was not acknowledged")),
            }
        });
        Ok(())
    }

    async fn send_time_request(&mut self) -> Result<(), DeviceError> {
        let id = self.counter.next_id();
        let packet = codec::request(
            Method::Get,
            true,
            id,
            &[UriCode::GetTime.as_str()],
            &[],
            vec![],
            vec![],
        );
        self.send_confirmable(&packet).await?;

        let rx = self.waiters.register(
            ListenFilter::for_message(ListenKind::Response, id),
            Instant::now() + self.keepalive * 2,
        );
        let bus = self.bus();
        tokio::spawn(async move {
            if let Ok(Ok(packet)) = rx.await {
                bus.emit(Event::Time {
                    epoch_seconds: codec::be_uint(&packet.payload),
                });
            }
        });
        Ok(())
    }

    /// Publish to the cloud from inside the engine (system state events).
    async fn internal_publish(&mut self, name: &str, data: Vec<u8>) -> Result<(), DeviceError> {
        self.handle_publish(PublishRequest {
            name: name.to_string(),
            data,
            private: true,
            policy: AckPolicy::Default,
            message_id: None,
            done: None,
        })
        .await
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    async fn handle_frame(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
        let packet = match codec::decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                self.bus().emit_error(format!("undecodable packet: {e}"));
                return Ok(());
            }
        };

        match dispatcher::classify(packet) {
            Inbound::EmptyPing { message_id } => {
                debug!(message_id, "coap ping, answering");
                self.send_packet_now(&codec::ack_empty(message_id)).await
            }
            Inbound::EmptyAck(packet) => {
                self.note_acknowledged(packet.header.message_id);
                self.waiters.resolve(ListenKind::Ack, &packet);
                self.waiters.resolve(ListenKind::Complete, &packet);
                Ok(())
            }
            Inbound::ResponseAck(packet) => {
                self.note_acknowledged(packet.header.message_id);
                self.waiters.resolve(ListenKind::Complete, &packet);
                self.waiters.resolve(ListenKind::Response, &packet);
                Ok(())
            }
            Inbound::Response(packet) => {
                self.waiters.resolve(ListenKind::Response, &packet);
                Ok(())
            }
            Inbound::Request { uri, packet } => self.handle_request(uri, packet).await,
            Inbound::Unknown(packet) => {
                let path = codec::uri_path(&packet).join("/");
                self.bus()
                    .emit_error(ProtocolError::UnknownUri(path).to_string());
                Ok(())
            }
        }
    }

    fn note_acknowledged(&mut self, message_id: u16) {
        self.retransmit.complete(message_id);
        if self.hello_message_id == Some(message_id) {
            self.hello_deadline = None;
        }
    }

    async fn handle_request(&mut self, uri: UriCode, packet: Packet) -> Result<(), DeviceError> {
        match uri {
            UriCode::Hello => {
                self.hello_deadline = None;
                if codec::is_confirmable(&packet) {
                    self.send_packet_now(&codec::ack_empty(packet.header.message_id))
                        .await?;
                }
                Ok(())
            }
            UriCode::Describe => self.handle_describe(packet).await,
            UriCode::Function => self.handle_function(packet).await,
            UriCode::Variable => self.handle_variable(packet).await,
            UriCode::PublicEvent => self.handle_cloud_event(packet, false).await,
            UriCode::PrivateEvent => self.handle_cloud_event(packet, true).await,
            UriCode::Signal => {
                let on = dispatcher::signal_on(&packet);
                self.bus().emit(Event::Signal { on });
                self.send_packet_now(&codec::ack_with(
                    Status::Changed,
                    packet.header.message_id,
                    codec::token(&packet),
                    vec![],
                ))
                .await
            }
            UriCode::FileRequest => self.handle_file_request(packet).await,
            UriCode::Update => match codec::method(&packet) {
                Some(Method::Put) => self.handle_update_done(packet).await,
                _ => self.handle_update_begin(packet).await,
            },
            UriCode::Chunk => self.handle_chunk(packet).await,
            UriCode::UpdateProperty => {
                debug!("property update acknowledged");
                self.send_packet_now(&codec::ack_with(
                    Status::Changed,
                    packet.header.message_id,
                    codec::token(&packet),
                    vec![],
                ))
                .await
            }
            UriCode::GetTime => {
                self.bus()
                    .emit_error(ProtocolError::UnknownUri("t".into()).to_string());
                Ok(())
            }
        }
    }

    async fn handle_describe(&mut self, packet: Packet) -> Result<(), DeviceError> {
        let flags = dispatcher::describe_flags(&packet);
        let payload = {
            let registries = self.shared.registries();
            crate::rpc::describe::payload_for_flags(flags, &registries, &self.shared.identity)
        };
        let reply = match payload {
            Ok(payload) => codec::ack_with(
                Status::Content,
                packet.header.message_id,
                codec::token(&packet),
                payload,
            ),
            Err(e) => {
                self.bus().emit_error(e.to_string());
                codec::ack_with(
                    Status::BadRequest,
                    packet.header.message_id,
                    codec::token(&packet),
                    e.to_string().into_bytes(),
                )
            }
        };
        self.send_packet_now(&reply).await
    }

    async fn handle_function(&mut self, packet: Packet) -> Result<(), DeviceError> {
        let message_id = packet.header.message_id;
        let token = codec::token(&packet);

        let (name, call) = match dispatcher::function_target(&packet) {
            Ok(parts) => parts,
            Err(e) => {
                let status = match e {
                    ProtocolError::ArgsTooLong(_) => Status::BadRequest,
                    _ => Status::NotFound,
                };
                self.bus().emit_error(e.to_string());
                return self
                    .send_packet_now(&codec::ack_with(
                        status,
                        message_id,
                        token,
                        e.to_string().into_bytes(),
                    ))
                    .await;
            }
        };

        let Some(entry) = self.shared.registries().function(&name) else {
            let e = ProtocolError::FunctionNotFound(name);
            self.bus().emit_error(e.to_string());
            return self
                .send_packet_now(&codec::ack_with(
                    Status::NotFound,
                    message_id,
                    token,
                    e.to_string().into_bytes(),
                ))
                .await;
        };

        if entry.flags.owner_only {
            let allowed = call
                .caller
                .as_deref()
                .is_some_and(|caller| self.shared.registries().is_owner(caller));
            if !allowed {
                let e = ProtocolError::NotAnOwner;
                self.bus().emit_error(e.to_string());
                return self
                    .send_packet_now(&codec::ack_with(
                        Status::Forbidden,
                        message_id,
                        token,
                        e.to_string().into_bytes(),
                    ))
                    .await;
            }
        }

        // Reserve the success-response id now; roll it back on failure.
        let response_id = self.counter.next_id();
        let handle = self.handle.clone();
        let bus = self.bus();
        let future = (*entry.callback)(call);
        tokio::spawn(async move {
            match future.await {
                Ok(value) => {
                    let reply = codec::response(
                        Status::Content,
                        response_id,
                        token,
                        dispatcher::encode_function_result(value),
                    );
                    if let Ok(bytes) = codec::encode(&reply) {
                        handle.send_frame(bytes, None);
                    }
                }
                Err(err) => {
                    handle.send(Command::RollbackMessageId);
                    write_error(&handle, message_id, token, &err);
                    bus.emit_error(format!("function callback failed: {err}"));
                }
            }
        });
        Ok(())
    }

    async fn handle_variable(&mut self, packet: Packet) -> Result<(), DeviceError> {
        let message_id = packet.header.message_id;
        let token = codec::token(&packet);

        let Some((selector, full_path)) = dispatcher::variable_target(&packet) else {
            let e = ProtocolError::VariableNotFound(String::new());
            self.bus().emit_error(e.to_string());
            return self
                .send_packet_now(&codec::ack_with(
                    Status::NotFound,
                    message_id,
                    token,
                    e.to_string().into_bytes(),
                ))
                .await;
        };

        let Some(entry) = self.shared.registries().variable(&selector) else {
            let e = ProtocolError::VariableNotFound(selector);
            self.bus().emit_error(e.to_string());
            return self
                .send_packet_now(&codec::ack_with(
                    Status::NotFound,
                    message_id,
                    token,
                    e.to_string().into_bytes(),
                ))
                .await;
        };

        let handle = self.handle.clone();
        let bus = self.bus();
        let kind = entry.kind;
        let future = (*entry.callback)(full_path);
        tokio::spawn(async move {
            let encoded = match future.await {
                Ok(value) => value.encode(kind),
                Err(err) => Err(err),
            };
            match encoded {
                Ok(payload) => {
                    let reply = codec::ack_with(Status::Content, message_id, token, payload);
                    if let Ok(bytes) = codec::encode(&reply) {
                        handle.send_frame(bytes, None);
                    }
                }
                Err(err) => {
                    write_error(&handle, message_id, token, &err);
                    bus.emit_error(format!("variable callback failed: {err}"));
                }
            }
        });
        Ok(())
    }

    async fn handle_cloud_event(
        &mut self,
        packet: Packet,
        private: bool,
    ) -> Result<(), DeviceError> {
        if codec::is_confirmable(&packet) {
            self.send_packet_now(&codec::ack_empty(packet.header.message_id))
                .await?;
        }

        let name = dispatcher::event_name(&packet);
        let event = CloudEvent {
            name: name.clone(),
            data: packet.payload.clone(),
            private,
        };

        if name.starts_with(SYSTEM_EVENT_PREFIX) {
            self.handle_system_event(&event).await?;
        }

        let subscriptions = self.shared.registries().subscriptions();
        for sub in subscriptions {
            if prefix_matches(&sub.name, &event.name) {
                (*sub.handler)(event.clone());
            }
        }
        Ok(())
    }

    /// The internal `iotready` subscription: device-control events.
    async fn handle_system_event(&mut self, event: &CloudEvent) -> Result<(), DeviceError> {
        let payload = String::from_utf8_lossy(&event.data).into_owned();
        match event.name.as_str() {
            EVENT_RESET => {
                match payload.as_str() {
                    "dfu" => self.bus().emit(Event::Dfu),
                    "safe mode" => self.bus().emit(Event::SafeMode),
                    "reboot" => self.bus().emit(Event::Reboot),
                    other => self
                        .bus()
                        .emit_error(format!("unknown reset request: {other}")),
                }
                Ok(())
            }
            EVENT_UPDATES_FORCED => {
                let forced = matches!(payload.as_str(), "true" | "1");
                let previous = self
                    .shared
                    .updates_forced
                    .swap(forced, Ordering::SeqCst);
                if previous != forced {
                    self.bus().emit(Event::FirmwareUpdateForced { forced });
                    self.internal_publish(EVENT_UPDATES_FORCED, payload.into_bytes())
                        .await?;
                }
                Ok(())
            }
            EVENT_UPDATES_PENDING => {
                let previous = self.shared.updates_pending.swap(true, Ordering::SeqCst);
                if !previous {
                    self.bus().emit(Event::FirmwareUpdatePending);
                    self.internal_publish(EVENT_UPDATES_PENDING, Vec::new())
                        .await?;
                }
                Ok(())
            }
            EVENT_OWNERS => {
                let owners: Vec<String> = payload
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                debug!(count = owners.len(), "owners list replaced");
                self.shared.registries().set_owners(owners);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    // =========================================================================
    // OTA / file transfer
    // =========================================================================

    async fn handle_update_begin(&mut self, packet: Packet) -> Result<(), DeviceError> {
        let message_id = packet.header.message_id;
        let token = codec::token(&packet);

        let begin = match UpdateBegin::parse(&packet.payload) {
            Ok(begin) => begin,
            Err(e) => {
                self.bus().emit_error(e.to_string());
                return self
                    .send_packet_now(&codec::ack_with(
                        Status::BadRequest,
                        message_id,
                        token,
                        e.to_string().into_bytes(),
                    ))
                    .await;
            }
        };

        let updates_allowed = self.shared.updates_enabled.load(Ordering::SeqCst)
            || self.shared.updates_forced.load(Ordering::SeqCst);
        if begin.is_firmware() && !updates_allowed {
            self.bus().emit_error("firmware update refused: updates disabled");
            return self
                .send_packet_now(&codec::ack_with(
                    Status::ServiceUnavailable,
                    message_id,
                    token,
                    b"Service Unavailable".to_vec(),
                ))
                .await;
        }

        if let Err(e) = begin.check_size() {
            self.bus().emit_error(e.to_string());
            return self
                .send_packet_now(&codec::ack_with(
                    Status::BadRequest,
                    message_id,
                    token,
                    e.to_string().into_bytes(),
                ))
                .await;
        }

        info!(
            size = begin.file_size,
            chunk_size = begin.chunk_size,
            name = begin.file_name.as_deref().unwrap_or("<firmware>"),
            "inbound transfer started"
        );
        self.ota = Some(ReceiveSession::new(&begin));
        self.send_packet_now(&codec::ack_with(
            Status::Changed,
            message_id,
            token,
            vec![crate::core::UPDATE_READY_MARKER],
        ))
        .await
    }

    async fn handle_chunk(&mut self, packet: Packet) -> Result<(), DeviceError> {
        let confirmable = codec::is_confirmable(&packet);
        let message_id = packet.header.message_id;

        let queries = codec::uri_queries(&packet);
        let crc = queries.first().map(|q| codec::be_uint(q) as u32);
        let index = queries.get(1).map(|q| codec::be_uint(q) as usize);

        let mut malformed = false;
        match (self.ota.as_mut(), crc, index) {
            (Some(ota), Some(crc), Some(index)) => {
                let outcome = ota.handle_chunk(crc, index, &packet.payload);
                debug!(index, ?outcome, "chunk processed");
            }
            (Some(_), _, _) => malformed = true,
            (None, _, _) => debug!("chunk outside a transfer, ignored"),
        }
        if malformed {
            self.bus()
                .emit_error("chunk packet missing crc or index query");
        }

        if confirmable {
            self.send_packet_now(&codec::ack_empty(message_id)).await?;
        }
        Ok(())
    }

    async fn handle_update_done(&mut self, packet: Packet) -> Result<(), DeviceError> {
        let message_id = packet.header.message_id;
        let token = codec::token(&packet);

        enum DoneAction {
            NoSession,
            Complete,
            Recover(Vec<u8>),
        }

        let action = match self.ota.as_mut() {
            None => DoneAction::NoSession,
            Some(ota) if ota.is_complete() => DoneAction::Complete,
            Some(ota) => {
                // Fast-OTA: one aggregated re-request for the missed batch.
                ota.recovery_deadline = Some(Instant::now() + OTA_RECOVERY_WINDOW);
                DoneAction::Recover(ota.missed_payload())
            }
        };

        match action {
            DoneAction::NoSession => {
                self.bus().emit_error("update done outside a transfer");
                self.send_packet_now(&codec::ack_with(
                    Status::BadRequest,
                    message_id,
                    token,
                    vec![],
                ))
                .await
            }
            DoneAction::Complete => {
                self.send_packet_now(&codec::ack_with(
                    Status::Changed,
                    message_id,
                    token,
                    vec![],
                ))
                .await?;
                if let Some(session) = self.ota.take() {
                    self.finish_transfer(session);
                }
                Ok(())
            }
            DoneAction::Recover(missed) => {
                self.send_packet_now(&codec::ack_with(
                    Status::BadRequest,
                    message_id,
                    token,
                    vec![],
                ))
                .await?;

                let id = self.counter.next_id();
                let request = codec::request(
                    Method::Get,
                    true,
                    id,
                    &[UriCode::Chunk.as_str()],
                    &[],
                    vec![],
                    missed,
                );
                self.send_confirmable(&request).await
            }
        }
    }

    fn finish_transfer(&mut self, session: ReceiveSession) {
        let (buffer, name) = session.finish();
        if let Some(name) = name.filter(|n| self.shared.registries().file(n).is_some()) {
            info!(%name, size = buffer.len(), "file received");
            self.bus().emit(Event::FileReceived { name, data: buffer });
            return;
        }

        match crate::ota::validate_firmware(&buffer) {
            Ok(image) => {
                info!(size = image.len(), "firmware image validated");
                self.bus().emit(Event::OtaReceived { image });
            }
            Err(e) => self.bus().emit_error(e.to_string()),
        }
    }

    async fn handle_file_request(&mut self, packet: Packet) -> Result<(), DeviceError> {
        let message_id = packet.header.message_id;
        let token = codec::token(&packet);

        let Some(name) = dispatcher::file_request_name(&packet) else {
            let e = ProtocolError::FileNotFound(String::new());
            self.bus().emit_error(e.to_string());
            return self
                .send_packet_now(&codec::ack_with(
                    Status::NotFound,
                    message_id,
                    token,
                    e.to_string().into_bytes(),
                ))
                .await;
        };

        let Some(entry) = self.shared.registries().file(&name) else {
            let e = ProtocolError::FileNotFound(name);
            self.bus().emit_error(e.to_string());
            return self
                .send_packet_now(&codec::ack_with(
                    Status::NotFound,
                    message_id,
                    token,
                    e.to_string().into_bytes(),
                ))
                .await;
        };

        // FileReturn: accept the request before producing the contents.
        self.send_packet_now(&codec::ack_with(
            Status::Changed,
            message_id,
            token.clone(),
            vec![1],
        ))
        .await?;

        tokio::spawn(send_file_flow(
            self.handle.clone(),
            self.bus(),
            entry.callback.clone(),
            name,
            message_id,
            token,
        ));
        Ok(())
    }
}

/// Sleep until the deadline, or forever when none is armed.
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Report a request failure to the peer with the caller-supplied or default
/// (5.00) code.
fn write_error(handle: &EngineHandle, message_id: u16, token: Vec<u8>, err: &CallbackError) {
    let status = err.code.unwrap_or(Status::InternalServerError);
    let reply = codec::ack_with(status, message_id, token, err.message.clone().into_bytes());
    if let Ok(bytes) = codec::encode(&reply) {
        handle.send_frame(bytes, None);
    }
}

/// Post-connect sequence: replay subscriptions with pacing, sync time,
/// publish the claim code once, then advertise the updates flags.
async fn post_connect_sequence(handle: EngineHandle, shared: Arc<SharedState>) {
    let subscriptions = shared.registries().subscriptions();
    for sub in subscriptions {
        handle.send(Command::WireSubscribe {
            name: sub.name.clone(),
            scope: sub.scope,
        });
        sleep(SUBSCRIPTION_REPLAY_PACING).await;
    }

    handle.send(Command::SyncTime);

    let claim_code = shared
        .claim_code
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take();
    if let Some(code) = claim_code {
        handle.send(Command::Publish(PublishRequest {
            name: CLAIM_CODE_EVENT.into(),
            data: code.into_bytes(),
            private: true,
            policy: AckPolicy::Default,
            message_id: None,
            done: None,
        }));
    }

    for (name, flag) in [
        (EVENT_UPDATES_ENABLED, &shared.updates_enabled),
        (EVENT_UPDATES_FORCED, &shared.updates_forced),
    ] {
        let value = flag.load(Ordering::SeqCst);
        handle.send(Command::Publish(PublishRequest {
            name: name.into(),
            data: value.to_string().into_bytes(),
            private: true,
            policy: AckPolicy::Default,
            message_id: None,
            done: None,
        }));
    }
}

/// Outbound file transfer: UpdateBegin, await UpdateReady, stream chunks,
/// UpdateDone.
async fn send_file_flow(
    handle: EngineHandle,
    bus: EventBus,
    callback: crate::rpc::registry::FileCallback,
    name: String,
    request_message_id: u16,
    request_token: Vec<u8>,
) {
    let data = match (*callback)(name.clone()).await {
        Ok(data) if !data.is_empty() => data,
        Ok(_) => {
            let err = CallbackError::with_code("file callback returned no data", Status::NotFound);
            write_error(&handle, request_message_id, request_token, &err);
            bus.emit_error(format!("file {name}: empty contents"));
            return;
        }
        Err(err) => {
            write_error(&handle, request_message_id, request_token, &err);
            bus.emit_error(format!("file {name}: {err}"));
            return;
        }
    };

    // UpdateBegin announces the transfer and negotiates fast OTA.
    let Ok(begin_id) = handle.next_message_id().await else {
        return;
    };
    let begin = codec::request(
        Method::Post,
        true,
        begin_id,
        &[UriCode::Update.as_str()],
        &[],
        vec![],
        crate::ota::update_begin_payload(data.len() as u32, Some(&name)),
    );
    let Ok(begin_bytes) = codec::encode(&begin) else {
        return;
    };
    let ready = handle.start_listen(
        ListenFilter::for_message(ListenKind::Response, begin_id),
        Some(ACK_AWAIT_TIMEOUT),
    );
    handle.send_frame(begin_bytes, Some(begin_id));
    match ready.await {
        Ok(Ok(_)) => {}
        _ => {
            bus.emit_error(format!("file {name}: peer never became ready"));
            return;
        }
    }

    for chunk in crate::ota::partition(&data, crate::core::DEFAULT_CHUNK_SIZE) {
        let Ok(id) = handle.next_message_id().await else {
            return;
        };
        let packet = codec::request(
            Method::Post,
            true,
            id,
            &[UriCode::Chunk.as_str()],
            &chunk.queries(),
            vec![],
            chunk.payload.clone(),
        );
        let Ok(bytes) = codec::encode(&packet) else {
            return;
        };
        let acked = handle.start_listen(
            ListenFilter::for_message(ListenKind::Complete, id),
            Some(ACK_AWAIT_TIMEOUT),
        );
        handle.send_frame(bytes, Some(id));
        match acked.await {
            Ok(Ok(_)) => {}
            _ => {
                bus.emit_error(format!(
                    "file {name}: chunk {} was not acknowledged",
                    chunk.index
                ));
                return;
            }
        }
    }

    let Ok(done_id) = handle.next_message_id().await else {
        return;
    };
    let done = codec::request(
        Method::Put,
        true,
        done_id,
        &[UriCode::Update.as_str()],
        &[],
        vec![],
        vec![],
    );
    let Ok(done_bytes) = codec::encode(&done) else {
        return;
    };
    let acked = handle.start_listen(
        ListenFilter::for_message(ListenKind::Complete, done_id),
        Some(ACK_AWAIT_TIMEOUT),
    );
    handle.send_frame(done_bytes, Some(done_id));
    match acked.await {
        Ok(Ok(_)) => bus.emit(Event::FileSent { name }),
        _ => bus.emit_error(format!("file {name}: transfer was not acknowledged")),
    }
}
