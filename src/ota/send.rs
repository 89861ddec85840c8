//! Outbound (device -> cloud) transfer helpers: UpdateBegin payload layout
//! and fixed-size chunk partitioning with per-chunk CRCs.

use crate::core::{DEFAULT_CHUNK_SIZE, FAST_OTA_FLAG, FILE_DEST_FLAG};
use crate::ota::receive::crc32;

/// Build the UpdateBegin payload announcing an outbound transfer.
///
/// Layout: flags u8 (fast-OTA), chunk size u16, file size u32, dest flag u8,
/// dest address u32, then a length-prefixed name when one is present.
pub fn update_begin_payload(file_size: u32, name: Option<&str>) -> Vec<u8> {
    let mut payload = Vec::with_capacity(12 + name.map_or(0, |n| 1 + n.len()));
    payload.push(FAST_OTA_FLAG);
    payload.extend_from_slice(&(DEFAULT_CHUNK_SIZE as u16).to_be_bytes());
    payload.extend_from_slice(&file_size.to_be_bytes());
    payload.push(FILE_DEST_FLAG);
    payload.extend_from_slice(&0u32.to_be_bytes());
    if let Some(name) = name {
        payload.push(name.len() as u8);
        payload.extend_from_slice(name.as_bytes());
    }
    payload
}

/// One outbound chunk: the padded wire payload and its query options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundChunk {
    /// Chunk index.
    pub index: u16,
    /// Wire payload, zero-padded to the chunk size.
    pub payload: Vec<u8>,
    /// CRC-32 over the bytes before padding.
    pub crc: u32,
}

impl OutboundChunk {
    /// The Uri-Query options for this chunk: big-endian CRC, then index.
    pub fn queries(&self) -> Vec<Vec<u8>> {
        vec![
            self.crc.to_be_bytes().to_vec(),
            self.index.to_be_bytes().to_vec(),
        ]
    }
}

/// Partition a buffer into fixed-size chunks, zero-padding the last one.
pub fn partition(data: &[u8], chunk_size: usize) -> Vec<OutboundChunk> {
    data.chunks(chunk_size)
        .enumerate()
        .map(|(index, chunk)| {
            let crc = crc32(chunk);
            let mut payload = chunk.to_vec();
            payload.resize(chunk_size, 0);
            OutboundChunk {
                index: index as u16,
                payload,
                crc,
            }
        })
        .collect()
}
