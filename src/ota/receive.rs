//! Inbound (cloud -> device) chunked transfer: UpdateBegin parsing, chunk
//! CRC validation and placement, fast-OTA missed-chunk accounting, and
//! firmware image validation.

use crc32fast::Hasher;

use crate::core::{
    ProtocolError, DEFAULT_CHUNK_SIZE, FIRMWARE_HEADER_SIZE, FIRMWARE_TRAILER_SIZE,
    MAX_OTA_FILE_SIZE,
};

/// CRC-32 of a byte slice.
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Parsed UpdateBegin payload.
///
/// Layout (big-endian): flags u8, chunk size u16 (0 means default), file
/// size u32, 5 reserved bytes, then optionally a length-prefixed file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateBegin {
    /// Transfer flags as sent by the peer.
    pub flags: u8,
    /// Negotiated chunk size.
    pub chunk_size: usize,
    /// Declared total size.
    pub file_size: usize,
    /// Destination file name; `None` marks a firmware OTA.
    pub file_name: Option<String>,
}

impl UpdateBegin {
    /// Parse the wire payload.
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < 12 {
            return Err(ProtocolError::InvalidTransfer(format!(
                "update begin payload too short: {} bytes",
                payload.len()
            )));
        }
        let flags = payload[0];
        let mut chunk_size = u16::from_be_bytes([payload[1], payload[2]]) as usize;
        if chunk_size == 0 {
            chunk_size = DEFAULT_CHUNK_SIZE;
        }
        let file_size =
            u32::from_be_bytes([payload[3], payload[4], payload[5], payload[6]]) as usize;

        let file_name = if payload.len() > 12 {
            let name_len = payload[12] as usize;
            let name_bytes = payload
                .get(13..13 + name_len)
                .ok_or_else(|| ProtocolError::InvalidTransfer("truncated file name".into()))?;
            Some(String::from_utf8_lossy(name_bytes).into_owned())
        } else {
            None
        };

        Ok(Self {
            flags,
            chunk_size,
            file_size,
            file_name,
        })
    }

    /// Whether this transfer is a firmware OTA (12-byte payload, no name).
    pub fn is_firmware(&self) -> bool {
        self.file_name.is_none()
    }

    /// Reject zero-sized and oversized transfers before allocating.
    pub fn check_size(&self) -> Result<(), ProtocolError> {
        if self.file_size == 0 {
            return Err(ProtocolError::InvalidTransfer("zero file size".into()));
        }
        if self.file_size > MAX_OTA_FILE_SIZE {
            return Err(ProtocolError::InvalidTransfer(format!(
                "declared size {} exceeds the {} byte limit",
                self.file_size, MAX_OTA_FILE_SIZE
            )));
        }
        Ok(())
    }
}

/// Outcome of feeding one chunk into a receive session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// CRC matched; payload stored.
    Stored,
    /// CRC matched an already-stored chunk; ignored.
    Duplicate,
    /// CRC did not match; the index joins the missed list.
    CrcMismatch,
    /// Index beyond the declared chunk count; ignored.
    OutOfRange,
}

/// State of one inbound transfer, destroyed on completion or session death.
#[derive(Debug)]
pub struct ReceiveSession {
    chunk_size: usize,
    file_size: usize,
    chunk_count: usize,
    buffer: Vec<u8>,
    received: Vec<bool>,
    received_count: usize,
    file_name: Option<String>,
    /// Deadline of the fast-OTA recovery window, when one is open.
    pub recovery_deadline: Option<tokio::time::Instant>,
}

impl ReceiveSession {
    /// Allocate the buffer and bitmap for a parsed UpdateBegin.
    pub fn new(begin: &UpdateBegin) -> Self {
        let chunk_count = begin.file_size.div_ceil(begin.chunk_size);
        Self {
            chunk_size: begin.chunk_size,
            file_size: begin.file_size,
            chunk_count,
            buffer: vec![0u8; begin.file_size],
            received: vec![false; chunk_count],
            received_count: 0,
            file_name: begin.file_name.clone(),
            recovery_deadline: None,
        }
    }

    /// Expected chunk count.
    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    /// Chunks stored so far.
    pub fn received_count(&self) -> usize {
        self.received_count
    }

    /// Destination name, when this is a named file transfer.
    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    /// Validate and place one chunk.
    ///
    /// The CRC covers the chunk as the sender computed it: over the stored
    /// span for a short final chunk, or over the padded payload.
    pub fn handle_chunk(&mut self, crc: u32, index: usize, payload: &[u8]) -> ChunkOutcome {
        if index >= self.chunk_count {
            return ChunkOutcome::OutOfRange;
        }

        let offset = self.chunk_size * index;
        let span = self.chunk_size.min(self.file_size - offset);
        let stored = &payload[..span.min(payload.len())];

        if crc32(stored) != crc && crc32(payload) != crc {
            return ChunkOutcome::CrcMismatch;
        }
        if self.received[index] {
            return ChunkOutcome::Duplicate;
        }

        self.buffer[offset..offset + stored.len()].copy_from_slice(stored);
        self.received[index] = true;
        self.received_count += 1;
        ChunkOutcome::Stored
    }

    /// Whether every chunk has been stored.
    pub fn is_complete(&self) -> bool {
        self.received_count == self.chunk_count
    }

    /// Indices never stored: CRC failures and wholly lost chunks alike.
    pub fn missing_chunks(&self) -> Vec<u16> {
        self.received
            .iter()
            .enumerate()
            .filter(|(_, stored)| !**stored)
            .map(|(i, _)| i as u16)
            .collect()
    }

    /// The aggregated fast-OTA re-request payload: big-endian u16 indices.
    pub fn missed_payload(&self) -> Vec<u8> {
        self.missing_chunks()
            .into_iter()
            .flat_map(|i| i.to_be_bytes())
            .collect()
    }

    /// Consume the session, yielding the reassembled buffer and name.
    pub fn finish(self) -> (Vec<u8>, Option<String>) {
        (self.buffer, self.file_name)
    }
}

/// Validate a firmware image: the trailing 4 bytes are the big-endian CRC-32
/// of everything before them. Yields the inner image with the 24-byte header
/// and 44-byte trailer+CRC stripped.
pub fn validate_firmware(buffer: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if buffer.len() < FIRMWARE_HEADER_SIZE + FIRMWARE_TRAILER_SIZE {
        return Err(ProtocolError::InvalidTransfer(format!(
            "firmware image too short: {} bytes",
            buffer.len()
        )));
    }
    let crc_offset = buffer.len() - 4;
    let expected = u32::from_be_bytes([
        buffer[crc_offset],
        buffer[crc_offset + 1],
        buffer[crc_offset + 2],
        buffer[crc_offset + 3],
    ]);
    if crc32(&buffer[..crc_offset]) != expected {
        return Err(ProtocolError::InvalidTransfer("crc not valid".into()));
    }
    Ok(buffer[FIRMWARE_HEADER_SIZE..buffer.len() - FIRMWARE_TRAILER_SIZE].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn begin_payload(chunk_size: u16, file_size: u32, name: Option<&str>) -> Vec<u8> {
        let mut payload = vec![0u8; 12];
        payload[0] = 1;
        payload[1..3].copy_from_slice(&chunk_size.to_be_bytes());
        payload[3..7].copy_from_slice(&file_size.to_be_bytes());
        if let Some(name) = name {
            payload.push(name.len() as u8);
            payload.extend_from_slice(name.as_bytes());
        }
        payload
    }

    #[test]
    fn parses_firmware_and_named_begins() {
        let fw = UpdateBegin::parse(&begin_payload(0, 1000, None)).unwrap();
        assert!(fw.is_firmware());
        assert_eq!(fw.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(fw.file_size, 1000);

        let named = UpdateBegin::parse(&begin_payload(128, 500, Some("cfg.json"))).unwrap();
        assert!(!named.is_firmware());
        assert_eq!(named.chunk_size, 128);
        assert_eq!(named.file_name.as_deref(), Some("cfg.json"));
    }

    #[test]
    fn rejects_short_and_oversized() {
        assert!(UpdateBegin::parse(&[0u8; 11]).is_err());

        let huge = UpdateBegin::parse(&begin_payload(0, (MAX_OTA_FILE_SIZE + 1) as u32, None))
            .unwrap();
        assert!(huge.check_size().is_err());

        let zero = UpdateBegin::parse(&begin_payload(0, 0, None)).unwrap();
        assert!(zero.check_size().is_err());
    }

    #[test]
    fn two_chunk_transfer_with_short_tail() {
        // 500 bytes at chunk size 256: chunk 1 holds 244 bytes.
        let begin = UpdateBegin::parse(&begin_payload(0, 500, Some("f"))).unwrap();
        let mut session = ReceiveSession::new(&begin);
        assert_eq!(session.chunk_count(), 2);

        let chunk0 = vec![0x11u8; 256];
        assert_eq!(
            session.handle_chunk(crc32(&chunk0), 0, &chunk0),
            ChunkOutcome::Stored
        );

        // Tail chunk padded to 256 on the wire, CRC over the real 244 bytes.
        let tail = vec![0x22u8; 244];
        let mut padded = tail.clone();
        padded.resize(256, 0);
        assert_eq!(
            session.handle_chunk(crc32(&tail), 1, &padded),
            ChunkOutcome::Stored
        );

        assert!(session.is_complete());
        let (buffer, name) = session.finish();
        assert_eq!(buffer.len(), 500);
        assert_eq!(&buffer[..256], &chunk0[..]);
        assert_eq!(&buffer[256..], &tail[..]);
        assert_eq!(name.as_deref(), Some("f"));
    }

    #[test]
    fn crc_mismatch_lands_in_missed_list() {
        let begin = UpdateBegin::parse(&begin_payload(0, 500, None)).unwrap();
        let mut session = ReceiveSession::new(&begin);

        let chunk0 = vec![0x11u8; 256];
        assert_eq!(
            session.handle_chunk(crc32(&chunk0), 0, &chunk0),
            ChunkOutcome::Stored
        );
        let chunk1 = vec![0x22u8; 244];
        assert_eq!(
            session.handle_chunk(0xdead_beef, 1, &chunk1),
            ChunkOutcome::CrcMismatch
        );

        assert!(!session.is_complete());
        assert_eq!(session.missing_chunks(), vec![1]);
        assert_eq!(session.missed_payload(), vec![0x00, 0x01]);

        // Retransmission with a valid CRC completes the transfer; the result
        // matches a single-shot transfer of the same source.
        assert_eq!(
            session.handle_chunk(crc32(&chunk1), 1, &chunk1),
            ChunkOutcome::Stored
        );
        assert!(session.is_complete());
        let (buffer, _) = session.finish();
        assert_eq!(&buffer[256..], &chunk1[..]);
    }

    #[test]
    fn duplicates_and_out_of_range_are_ignored() {
        let begin = UpdateBegin::parse(&begin_payload(0, 256, None)).unwrap();
        let mut session = ReceiveSession::new(&begin);

        let chunk = vec![0x33u8; 256];
        assert_eq!(
            session.handle_chunk(crc32(&chunk), 0, &chunk),
            ChunkOutcome::Stored
        );
        assert_eq!(
            session.handle_chunk(crc32(&chunk), 0, &chunk),
            ChunkOutcome::Duplicate
        );
        assert_eq!(session.received_count(), 1);
        assert_eq!(
            session.handle_chunk(crc32(&chunk), 5, &chunk),
            ChunkOutcome::OutOfRange
        );
    }

    #[test]
    fn firmware_validation_strips_header_and_trailer() {
        // 24-byte header, 100-byte image, 40-byte trailer, 4-byte CRC.
        let mut image = Vec::new();
        image.extend_from_slice(&[0xaa; 24]);
        image.extend_from_slice(&[0xbb; 100]);
        image.extend_from_slice(&[0xcc; 40]);
        let crc = crc32(&image);
        image.extend_from_slice(&crc.to_be_bytes());

        let inner = validate_firmware(&image).unwrap();
        assert_eq!(inner, vec![0xbb; 100]);
        assert_eq!(inner.len(), image.len() - 24 - 44);
    }

    #[test]
    fn firmware_validation_rejects_bad_crc() {
        let mut image = vec![0x55u8; 200];
        let len = image.len();
        image[len - 4..].copy_from_slice(&0u32.to_be_bytes());
        let err = validate_firmware(&image).unwrap_err();
        assert!(err.to_string().contains("crc not valid"));
    }
}
