//! Protocol constants for the iotready device-cloud session.
//!
//! These values are fixed by the cloud protocol and MUST NOT be changed.

use std::time::Duration;

// =============================================================================
// CLOUD ENDPOINTS
// =============================================================================

/// Default cloud host for the TCP transport.
pub const DEFAULT_TCP_HOST: &str = "device.iotready.it";

/// Default cloud host suffix for the UDP transport; the 24-char device id
/// is prepended (`<devId>.udp.device.iotready.it`).
pub const DEFAULT_UDP_HOST_SUFFIX: &str = "udp.device.iotready.it";

/// Default cloud port for the TCP transport.
pub const DEFAULT_TCP_PORT: u16 = 5683;

/// Default cloud port for the UDP transport.
pub const DEFAULT_UDP_PORT: u16 = 5684;

// =============================================================================
// TIMING
// =============================================================================

/// Ping period on the TCP transport.
pub const DEFAULT_TCP_KEEPALIVE: Duration = Duration::from_millis(15_000);

/// Ping period on the UDP transport.
pub const DEFAULT_UDP_KEEPALIVE: Duration = Duration::from_millis(30_000);

/// Read-inactivity timeout on the raw TCP socket.
pub const TCP_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(31);

/// Bound on DTLS handshake completion.
pub const DTLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on observing the Hello response after sending Hello (TCP).
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(2);

/// Delay before re-entering `Connecting` after a session death.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Base timeout of a confirmable attempt; attempt n waits `base * 2^(n-1)`.
pub const RETRANSMIT_BASE_TIMEOUT: Duration = Duration::from_secs(4);

/// Attempts per confirmable message before the session is declared broken.
pub const MAX_RETRANSMIT_ATTEMPTS: u8 = 3;

/// How long outbound publish/subscribe flows wait for their ACK.
pub const ACK_AWAIT_TIMEOUT: Duration = Duration::from_secs(20);

/// Pacing between replayed subscriptions after connect.
pub const SUBSCRIPTION_REPLAY_PACING: Duration = Duration::from_millis(50);

/// Window granted to the server for chunk retransmission in fast OTA.
pub const OTA_RECOVERY_WINDOW: Duration = Duration::from_secs(9);

// =============================================================================
// SESSION MATERIAL (TCP handshake)
// =============================================================================

/// Length of the server-generated nonce.
pub const HANDSHAKE_NONCE_SIZE: usize = 40;

/// Length of the decrypted session material.
pub const SESSION_MATERIAL_SIZE: usize = 40;

/// Length of the RSA ciphertext carrying the session material.
pub const SESSION_CIPHERTEXT_SIZE: usize = 128;

/// AES-128 key size.
pub const AES_KEY_SIZE: usize = 16;

/// AES-CBC IV size.
pub const AES_IV_SIZE: usize = 16;

// =============================================================================
// REGISTRIES
// =============================================================================

/// Registered-function capacity.
pub const MAX_FUNCTIONS: usize = 10;

/// Registered-variable capacity.
pub const MAX_VARIABLES: usize = 10;

/// Registered-file capacity.
pub const MAX_FILES: usize = 4;

/// Subscription capacity.
pub const MAX_SUBSCRIPTIONS: usize = 4;

/// Maximum length of a registered function/variable/file name.
pub const MAX_NAME_LENGTH: usize = 64;

/// Maximum function-argument length and encoded variable payload length.
pub const MAX_PAYLOAD_LENGTH: usize = 622;

// =============================================================================
// OTA / FILE TRANSFER
// =============================================================================

/// Chunk size used when the peer requests none.
pub const DEFAULT_CHUNK_SIZE: usize = 256;

/// Upper bound on an inbound transfer; larger UpdateBegin sizes are rejected.
pub const MAX_OTA_FILE_SIZE: usize = 4 * 1024 * 1024;

/// Firmware image header stripped before surfacing the image.
pub const FIRMWARE_HEADER_SIZE: usize = 24;

/// Firmware trailer (40 bytes) plus CRC-32 (4 bytes) stripped from the end.
pub const FIRMWARE_TRAILER_SIZE: usize = 44;

/// Marker byte carried in the UpdateBegin 2.04 reply (the update URI byte).
pub const UPDATE_READY_MARKER: u8 = b'u';

/// UpdateBegin flag advertising fast-OTA (aggregated missed-chunk recovery).
pub const FAST_OTA_FLAG: u8 = 1;

/// UpdateBegin destination flag for outbound named transfers.
pub const FILE_DEST_FLAG: u8 = 128;

// =============================================================================
// EVENTS
// =============================================================================

/// Event-name prefixes reserved for system traffic; events carrying them are
/// sent but never surfaced to the user publish signal.
pub const RESERVED_EVENT_PREFIXES: [&str; 2] = ["iotready", "trackle"];

/// Prefix of cloud-originated device-control events.
pub const SYSTEM_EVENT_PREFIX: &str = "iotready";

// =============================================================================
// HELLO FLAGS
// =============================================================================

/// Hello flag: the previous OTA upgrade completed successfully.
pub const HELLO_FLAG_OTA_SUCCESSFUL: u8 = 0x01;

/// Hello flag: the device answers metrics Describe requests.
pub const HELLO_FLAG_DIAGNOSTICS: u8 = 0x02;

/// Hello flag: the device applies updates immediately.
pub const HELLO_FLAG_IMMEDIATE_UPDATES: u8 = 0x04;
