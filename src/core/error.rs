//! Error types for the device-cloud session engine.

use thiserror::Error;

/// Errors raised synchronously from `begin` for invalid initialization input.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The device id is empty or not 24 hex characters.
    #[error("invalid device id: {0}")]
    InvalidDeviceId(String),

    /// No private key was supplied.
    #[error("missing private key")]
    MissingPrivateKey,

    /// The private key could not be parsed.
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// The server public key could not be parsed.
    #[error("invalid server public key: {0}")]
    InvalidServerKey(String),

    /// The key variant does not match the selected transport.
    #[error("key kind mismatch: {transport} transport requires {expected} keys")]
    KeyKindMismatch {
        /// Selected transport variant.
        transport: &'static str,
        /// Required key kind.
        expected: &'static str,
    },

    /// The cloud host could not be resolved.
    #[error("unresolvable host: {0}")]
    UnresolvableHost(String),

    /// `connect` was called before `begin`.
    #[error("client not initialized")]
    NotInitialized,
}

/// Transport failures; each one triggers a session reconnect.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// DNS lookup returned no address.
    #[error("dns lookup failed for {0}")]
    DnsNotFound(String),

    /// The peer refused the connection.
    #[error("connection refused by {0}")]
    ConnectionRefused(String),

    /// The socket closed underneath the session.
    #[error("socket closed")]
    SocketClosed,

    /// No bytes arrived within the inactivity timeout.
    #[error("socket timeout")]
    SocketTimeout,

    /// The DTLS handshake did not complete within its timer.
    #[error("dtls handshake timeout")]
    DtlsHandshakeTimeout,

    /// The Hello response was not observed within its timer.
    #[error("hello timeout")]
    HelloTimeout,

    /// A confirmable message burned all three attempts without COMPLETE.
    #[error("confirmable retransmission exhausted")]
    RetransmitExhausted,

    /// Any other socket-level failure.
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => {
                TransportError::ConnectionRefused(err.to_string())
            }
            std::io::ErrorKind::TimedOut => TransportError::SocketTimeout,
            std::io::ErrorKind::UnexpectedEof => TransportError::SocketClosed,
            _ => TransportError::Io(err.to_string()),
        }
    }
}

/// Session-establishment failures; fatal within a session.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The computed HMAC does not match the server-signed blob.
    #[error("hmac mismatch")]
    HmacMismatch,

    /// The decrypted session material has the wrong shape.
    #[error("malformed session material: {0}")]
    MalformedSessionMaterial(String),

    /// An RSA operation failed.
    #[error("rsa failure: {0}")]
    Rsa(String),

    /// The socket failed mid-handshake.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Peer-visible protocol violations; surfaced as `error` events and answered
/// with a typed CoAP error reply where a request is in flight.
#[derive(Debug, Error, Clone)]
pub enum ProtocolError {
    /// The first URI segment names no known message type.
    #[error("unknown message uri: {0}")]
    UnknownUri(String),

    /// Describe arrived with flags other than 3 or 4.
    #[error("bad descriptor flags: {0}")]
    BadDescribeFlags(u8),

    /// Function arguments exceeded the allowed length.
    #[error("invalid args length: {0}")]
    ArgsTooLong(usize),

    /// An OWNER_ONLY function was called by a non-owner.
    #[error("caller is not an owner")]
    NotAnOwner,

    /// The named function is not registered.
    #[error("function not found: {0}")]
    FunctionNotFound(String),

    /// The named variable is not registered.
    #[error("variable not found: {0}")]
    VariableNotFound(String),

    /// The named file is not registered.
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// An inbound packet could not be parsed as CoAP.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// A transfer payload violated the chunk protocol.
    #[error("invalid transfer payload: {0}")]
    InvalidTransfer(String),
}

/// Failure reported by a user-supplied callback.
#[derive(Debug, Error, Clone)]
#[error("{message}")]
pub struct CallbackError {
    /// Message relayed to the peer as the error payload.
    pub message: String,
    /// Response code override; `None` uses the 5.00 default.
    pub code: Option<crate::codec::Status>,
}

impl CallbackError {
    /// Create an error with the default response code.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Create an error carrying an explicit response code.
    pub fn with_code(message: impl Into<String>, code: crate::codec::Status) -> Self {
        Self {
            message: message.into(),
            code: Some(code),
        }
    }
}

/// Top-level error of the device client.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Initialization error.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Handshake error.
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The session is not connected.
    #[error("not connected")]
    NotConnected,

    /// A confirmable send exhausted its attempts or its waiter timed out.
    #[error("operation timed out")]
    Timeout,

    /// The session engine has shut down.
    #[error("client disconnected")]
    Disconnected,
}
