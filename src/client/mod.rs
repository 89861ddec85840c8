//! Public device-client API.
//!
//! The application constructs a [`DeviceClient`], calls [`DeviceClient::begin`]
//! with its identity and key material, registers functions/variables/files/
//! subscriptions, and then [`DeviceClient::connect`]s. One client owns one
//! session; all signals arrive on the [`DeviceClient::events`] channel.

pub mod config;

use std::net::ToSocketAddrs;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

use crate::client::config::{CloudOptions, EndpointConfig};
use crate::core::{ConfigError, DeviceError, DeviceIdentity};
use crate::rpc::registry::{FileCallback, FunctionCallback, SubscriptionHandler, VariableCallback};
use crate::rpc::{FunctionFlags, SubscriptionScope, VariableKind};
use crate::session::engine::{
    AckPolicy, Command, Engine, EngineHandle, PublishRequest, SharedState, EVENT_UPDATES_ENABLED,
    EVENT_UPDATES_FORCED,
};
use crate::session::{Event, SessionState};
use crate::transport::{DeviceKey, PlainText, ServerKey};

/// Event visibility of an outbound publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishScope {
    /// Delivered to every subscriber of the event stream.
    Public,
    /// Delivered only within the owning account.
    #[default]
    Private,
}

struct Inner {
    shared: Arc<SharedState>,
    handle: EngineHandle,
    engine: Mutex<Option<(Engine, mpsc::UnboundedReceiver<Command>)>>,
}

/// Device-side client of the iotready cloud.
pub struct DeviceClient {
    options: CloudOptions,
    inner: Option<Inner>,
}

impl DeviceClient {
    /// Create an uninitialized client from init options.
    pub fn new(options: CloudOptions) -> Self {
        Self {
            options,
            inner: None,
        }
    }

    /// Initialize the client: parse the identity and keys, resolve the cloud
    /// endpoint, and build the session engine.
    pub fn begin(
        &mut self,
        device_id_hex: &str,
        private_key: &[u8],
        product_id: u16,
        product_firmware_version: u16,
        platform_id: u16,
    ) -> Result<(), ConfigError> {
        let identity = DeviceIdentity::new(
            device_id_hex,
            product_id,
            product_firmware_version,
            platform_id,
        )?;

        let device_key = if self.options.force_tcp {
            DeviceKey::rsa_from_bytes(private_key)?
        } else {
            DeviceKey::ecc_from_bytes(private_key)?
        };

        let server_key = if self.options.force_tcp {
            let bytes = self.options.server_public_key.as_ref().ok_or_else(|| {
                ConfigError::InvalidServerKey(
                    "a server public key is required for the TCP transport".into(),
                )
            })?;
            ServerKey::rsa_from_bytes(bytes)?
        } else {
            ServerKey::ecc_from_bytes(
                self.options
                    .server_public_key
                    .clone()
                    .unwrap_or_default()
                    .as_slice(),
            )
        };

        let host = self.options.effective_address(&identity.id_hex());
        let port = self.options.effective_port();
        (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|_| ConfigError::UnresolvableHost(host.clone()))?
            .next()
            .ok_or_else(|| ConfigError::UnresolvableHost(host.clone()))?;

        let connector = self
            .options
            .dtls_connector
            .clone()
            .unwrap_or_else(|| Arc::new(PlainText));

        let endpoint = EndpointConfig {
            host,
            port,
            force_tcp: self.options.force_tcp,
            device_key,
            server_key,
            connector,
        };

        let shared = Arc::new(SharedState::new(
            identity,
            endpoint,
            self.options.claim_code.clone(),
        ));
        let (engine, handle, cmd_rx) = Engine::new(shared.clone(), self.options.effective_keepalive());
        self.inner = Some(Inner {
            shared,
            handle,
            engine: Mutex::new(Some((engine, cmd_rx))),
        });
        debug!("client initialized");
        Ok(())
    }

    fn inner(&self) -> Result<&Inner, ConfigError> {
        self.inner.as_ref().ok_or(ConfigError::NotInitialized)
    }

    /// Start (or resume) the session. Idempotent; requires a prior `begin`.
    ///
    /// Must be called from within a tokio runtime: the session engine runs as
    /// a background task.
    pub fn connect(&self) -> Result<(), ConfigError> {
        let inner = self.inner()?;
        let parts = inner
            .engine
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some((engine, cmd_rx)) = parts {
            tokio::spawn(engine.run(cmd_rx));
        }
        inner.handle.send(Command::Connect);
        Ok(())
    }

    /// Whether a session is currently established.
    pub fn connected(&self) -> bool {
        self.inner
            .as_ref()
            .map(|inner| inner.shared.session_state() == SessionState::Connected)
            .unwrap_or(false)
    }

    /// The current session state.
    pub fn session_state(&self) -> SessionState {
        self.inner
            .as_ref()
            .map(|inner| inner.shared.session_state())
            .unwrap_or(SessionState::Disconnected)
    }

    /// Latch the no-reconnect flag and tear the session down.
    pub fn disconnect(&self) {
        if let Some(inner) = &self.inner {
            inner.handle.send(Command::Disconnect);
        }
    }

    /// Override the ping period of the live and future sessions.
    pub fn set_keepalive(&self, keepalive: Duration) {
        if let Some(inner) = &self.inner {
            inner.handle.send(Command::SetKeepalive(keepalive));
        }
    }

    /// Set the one-shot claim code published after the next connect.
    pub fn set_claim_code(&mut self, code: impl Into<String>) {
        let code = code.into();
        self.options.claim_code = Some(code.clone());
        if let Some(inner) = &self.inner {
            *inner
                .shared
                .claim_code
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(code);
        }
    }

    /// Register a cloud-callable function. Returns false when the name is
    /// invalid or the registry is full.
    pub fn post(&self, name: &str, callback: FunctionCallback, flags: FunctionFlags) -> bool {
        match self.inner() {
            Ok(inner) => inner.shared.registries().register_function(name, flags, callback),
            Err(_) => false,
        }
    }

    /// Register a cloud-readable variable under a declared type.
    pub fn get(&self, name: &str, kind: VariableKind, callback: VariableCallback) -> bool {
        match self.inner() {
            Ok(inner) => inner.shared.registries().register_variable(name, kind, callback),
            Err(_) => false,
        }
    }

    /// Register a transferable file.
    pub fn file(&self, name: &str, mime_type: &str, callback: FileCallback) -> bool {
        match self.inner() {
            Ok(inner) => inner
                .shared
                .registries()
                .register_file(name, mime_type, callback),
            Err(_) => false,
        }
    }

    /// Register a subscription; when connected, the wire subscription is sent
    /// immediately, otherwise it is replayed on the next connect.
    pub fn subscribe(
        &self,
        name: &str,
        handler: SubscriptionHandler,
        scope: SubscriptionScope,
    ) -> bool {
        let Ok(inner) = self.inner() else {
            return false;
        };
        let registered = inner
            .shared
            .registries()
            .register_subscription(name, scope, handler);
        if registered && inner.shared.session_state() == SessionState::Connected {
            inner.handle.send(Command::WireSubscribe {
                name: name.to_string(),
                scope,
            });
        }
        registered
    }

    /// Remove a subscription by name.
    pub fn unsubscribe(&self, name: &str) -> bool {
        match self.inner() {
            Ok(inner) => inner.shared.registries().unsubscribe(name),
            Err(_) => false,
        }
    }

    /// Publish a private event with the transport-default confirmability.
    pub async fn publish(
        &self,
        name: &str,
        data: impl Into<Vec<u8>>,
    ) -> Result<(), DeviceError> {
        self.publish_with(name, data, PublishScope::Private, AckPolicy::Default, None)
            .await
    }

    /// Publish with explicit scope, confirmability, and message id.
    pub async fn publish_with(
        &self,
        name: &str,
        data: impl Into<Vec<u8>>,
        scope: PublishScope,
        policy: AckPolicy,
        message_id: Option<u16>,
    ) -> Result<(), DeviceError> {
        let inner = self.inner().map_err(DeviceError::Config)?;
        let (done, rx) = oneshot::channel();
        let request = PublishRequest {
            name: name.to_string(),
            data: data.into(),
            private: scope == PublishScope::Private,
            policy,
            message_id,
            done: Some(done),
        };
        if !inner.handle.send(Command::Publish(request)) {
            return Err(DeviceError::Disconnected);
        }
        rx.await.map_err(|_| DeviceError::Disconnected)?
    }

    /// Allow firmware OTA transfers and advertise the new state.
    pub fn enable_updates(&self) {
        self.set_updates_enabled(true);
    }

    /// Refuse firmware OTA transfers and advertise the new state.
    pub fn disable_updates(&self) {
        self.set_updates_enabled(false);
    }

    fn set_updates_enabled(&self, enabled: bool) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner
            .shared
            .updates_enabled
            .store(enabled, Ordering::SeqCst);
        if inner.shared.session_state() == SessionState::Connected {
            inner.handle.send(Command::Publish(PublishRequest {
                name: EVENT_UPDATES_ENABLED.to_string(),
                data: enabled.to_string().into_bytes(),
                private: true,
                policy: AckPolicy::Default,
                message_id: None,
                done: None,
            }));
        }
    }

    /// Whether firmware OTA transfers are currently allowed.
    pub fn updates_enabled(&self) -> bool {
        self.inner
            .as_ref()
            .map(|i| i.shared.updates_enabled.load(Ordering::SeqCst))
            .unwrap_or(true)
    }

    /// Whether the cloud has asserted the updates-forced flag.
    pub fn updates_forced(&self) -> bool {
        self.inner
            .as_ref()
            .map(|i| i.shared.updates_forced.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Whether a firmware update is pending on the cloud side.
    pub fn updates_pending(&self) -> bool {
        self.inner
            .as_ref()
            .map(|i| i.shared.updates_pending.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Record whether the previous OTA upgrade completed; advertised in the
    /// Hello flags of the next session.
    pub fn set_ota_upgrade_successful(&self, successful: bool) {
        if let Some(inner) = &self.inner {
            inner
                .shared
                .ota_upgrade_successful
                .store(successful, Ordering::SeqCst);
        }
    }

    /// Attach an application listener for session events.
    pub fn events(&self) -> Result<broadcast::Receiver<Event>, ConfigError> {
        Ok(self.inner()?.shared.bus.subscribe())
    }

    /// Re-publish the current updates-forced state (used after reconnects by
    /// applications that track it externally).
    pub fn publish_updates_forced(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        let forced = inner.shared.updates_forced.load(Ordering::SeqCst);
        inner.handle.send(Command::Publish(PublishRequest {
            name: EVENT_UPDATES_FORCED.to_string(),
            data: forced.to_string().into_bytes(),
            private: true,
            policy: AckPolicy::Default,
            message_id: None,
            done: None,
        }));
    }
}
