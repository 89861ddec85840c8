//! Client configuration: user-facing init options and the resolved endpoint
//! the session engine dials.

use std::sync::Arc;
use std::time::Duration;

use crate::core::{
    DEFAULT_TCP_HOST, DEFAULT_TCP_KEEPALIVE, DEFAULT_TCP_PORT, DEFAULT_UDP_HOST_SUFFIX,
    DEFAULT_UDP_KEEPALIVE, DEFAULT_UDP_PORT,
};
use crate::transport::{DeviceKey, DtlsConnector, ServerKey};

/// Init options, all defaulted per the cloud protocol.
#[derive(Clone)]
pub struct CloudOptions {
    /// Target host; defaults to the transport's cloud endpoint.
    pub address: Option<String>,
    /// Target port; defaults to 5683 (TCP) or 5684 (UDP).
    pub port: Option<u16>,
    /// Server public key override (PEM or DER).
    pub server_public_key: Option<Vec<u8>>,
    /// Select the TCP+RSA transport instead of UDP/DTLS.
    pub force_tcp: bool,
    /// Ping period override.
    pub keepalive: Option<Duration>,
    /// One-shot claim code published after connect.
    pub claim_code: Option<String>,
    /// External DTLS implementation for the UDP transport.
    pub dtls_connector: Option<Arc<dyn DtlsConnector>>,
}

impl Default for CloudOptions {
    fn default() -> Self {
        Self {
            address: None,
            port: None,
            server_public_key: None,
            force_tcp: false,
            keepalive: None,
            claim_code: None,
            dtls_connector: None,
        }
    }
}

impl std::fmt::Debug for CloudOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudOptions")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("force_tcp", &self.force_tcp)
            .field("keepalive", &self.keepalive)
            .finish()
    }
}

impl CloudOptions {
    /// Options with every default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the target host.
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Set the target port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Override the server public key (PEM or DER).
    pub fn server_public_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.server_public_key = Some(key.into());
        self
    }

    /// Select the TCP+RSA transport.
    pub fn force_tcp(mut self, force: bool) -> Self {
        self.force_tcp = force;
        self
    }

    /// Override the ping period.
    pub fn keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = Some(keepalive);
        self
    }

    /// Set the one-shot claim code.
    pub fn claim_code(mut self, code: impl Into<String>) -> Self {
        self.claim_code = Some(code.into());
        self
    }

    /// Inject the external DTLS implementation.
    pub fn dtls_connector(mut self, connector: Arc<dyn DtlsConnector>) -> Self {
        self.dtls_connector = Some(connector);
        self
    }

    /// The effective keepalive for the selected transport.
    pub fn effective_keepalive(&self) -> Duration {
        self.keepalive.unwrap_or(if self.force_tcp {
            DEFAULT_TCP_KEEPALIVE
        } else {
            DEFAULT_UDP_KEEPALIVE
        })
    }

    /// The effective host for the selected transport and device id.
    pub fn effective_address(&self, device_id_hex: &str) -> String {
        if let Some(address) = &self.address {
            return address.clone();
        }
        if self.force_tcp {
            DEFAULT_TCP_HOST.to_string()
        } else {
            format!("{device_id_hex}.{DEFAULT_UDP_HOST_SUFFIX}")
        }
    }

    /// The effective port for the selected transport.
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(if self.force_tcp {
            DEFAULT_TCP_PORT
        } else {
            DEFAULT_UDP_PORT
        })
    }
}

/// Endpoint configuration resolved and validated by `begin`.
#[derive(Clone)]
pub(crate) struct EndpointConfig {
    pub host: String,
    pub port: u16,
    pub force_tcp: bool,
    pub device_key: DeviceKey,
    pub server_key: ServerKey,
    pub connector: Arc<dyn DtlsConnector>,
}

impl EndpointConfig {
    /// A loopback-style endpoint used by engine unit tests.
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            force_tcp: true,
            device_key: DeviceKey::EccDer(vec![0]),
            server_key: ServerKey::EccDer(vec![0]),
            connector: Arc::new(crate::transport::PlainText),
        }
    }
}
