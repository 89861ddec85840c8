//! Core types shared across the session engine: protocol constants, the
//! error taxonomy, and the immutable device identity.

pub mod constants;
pub mod error;
pub mod identity;

pub use constants::*;
pub use error::{
    CallbackError, ConfigError, DeviceError, HandshakeError, ProtocolError, TransportError,
};
pub use identity::DeviceIdentity;
