//! # iotready-device
//!
//! Device-side client for the iotready cloud. A constrained device opens one
//! encrypted, long-lived session with a cloud endpoint; the cloud invokes
//! registered functions, reads typed variables, subscribes the device to
//! event streams, pushes firmware over-the-air, and requests named file
//! transfers. The device publishes events and receives system events back.
//!
//! The crate is the session engine:
//!
//! - [`transport`]: the two secure channel variants (TCP with the RSA
//!   handshake and an AES-CBC chunked stream, or UDP under an externally
//!   negotiated DTLS layer)
//! - [`session`]: the lifecycle supervisor, the CoAP request/response
//!   multiplexer with confirmable retransmission, and the typed event bus
//! - [`rpc`]: bounded registries, type-directed variable encoding, the
//!   device descriptor, and inbound request dispatch
//! - [`ota`]: chunked, CRC-validated transfers in both directions with
//!   fast-OTA missed-chunk recovery
//! - [`client`]: the public [`DeviceClient`] API
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use iotready_device::{CloudOptions, DeviceClient, FunctionFlags};
//!
//! let mut device = DeviceClient::new(CloudOptions::new());
//! device.begin("000102030405060708090a0b", &private_key_der, 1, 1, 6)?;
//!
//! device.post(
//!     "reboot",
//!     Arc::new(|_call| Box::pin(async { Ok(0) })),
//!     FunctionFlags::default(),
//! );
//!
//! let mut events = device.events()?;
//! device.connect()?;
//! while let Ok(event) = events.recv().await {
//!     // react to session events
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod codec;
pub mod core;
pub mod ota;
pub mod rpc;
pub mod session;
pub mod transport;

pub use client::config::CloudOptions;
pub use client::{DeviceClient, PublishScope};
pub use crate::core::{
    CallbackError, ConfigError, DeviceError, DeviceIdentity, HandshakeError, ProtocolError,
    TransportError,
};
pub use rpc::{FunctionCall, FunctionFlags, SubscriptionScope, VariableKind, VariableValue};
pub use session::{AckPolicy, CloudEvent, ConnectionErrorKind, Event, SessionState};
pub use transport::{DtlsConnector, DtlsKeys, RecordCipher};
