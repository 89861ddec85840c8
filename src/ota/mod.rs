//! OTA / file transfer engine: chunked, CRC-validated transfers in both
//! directions with fast-OTA missed-chunk recovery.

pub mod receive;
pub mod send;

pub use receive::{validate_firmware, ChunkOutcome, ReceiveSession, UpdateBegin};
pub use send::{partition, update_begin_payload, OutboundChunk};
