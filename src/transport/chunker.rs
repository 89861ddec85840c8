//! Length-prefixed chunk framing for the TCP byte stream.
//!
//! Each ciphertext chunk travels as a big-endian u16 length followed by the
//! chunk bytes. The reassembler tolerates arbitrary read fragmentation.

use crate::core::TransportError;

/// Prefix a chunk with its big-endian u16 length.
pub fn frame(chunk: &[u8]) -> Result<Vec<u8>, TransportError> {
    let len = u16::try_from(chunk.len())
        .map_err(|_| TransportError::Io(format!("chunk too large: {} bytes", chunk.len())))?;
    let mut out = Vec::with_capacity(2 + chunk.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(chunk);
    Ok(out)
}

/// Incremental reassembler for length-prefixed chunks.
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: Vec<u8>,
}

impl Reassembler {
    /// Create an empty reassembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw socket bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pop the next complete chunk, if one has fully arrived.
    pub fn next_chunk(&mut self) -> Option<Vec<u8>> {
        if self.buffer.len() < 2 {
            return None;
        }
        let len = u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;
        if self.buffer.len() < 2 + len {
            return None;
        }
        let chunk = self.buffer[2..2 + len].to_vec();
        self.buffer.drain(..2 + len);
        Some(chunk)
    }

    /// Bytes currently buffered but not yet consumed.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip() {
        let framed = frame(b"hello").unwrap();
        assert_eq!(&framed[..2], &[0, 5]);

        let mut r = Reassembler::new();
        r.push(&framed);
        assert_eq!(r.next_chunk().unwrap(), b"hello");
        assert!(r.next_chunk().is_none());
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn reassembles_across_fragments() {
        let framed = frame(&[0xaa; 300]).unwrap();
        let mut r = Reassembler::new();

        r.push(&framed[..1]);
        assert!(r.next_chunk().is_none());
        r.push(&framed[1..150]);
        assert!(r.next_chunk().is_none());
        r.push(&framed[150..]);
        assert_eq!(r.next_chunk().unwrap(), vec![0xaa; 300]);
    }

    #[test]
    fn splits_coalesced_chunks() {
        let mut wire = frame(b"one").unwrap();
        wire.extend(frame(b"two").unwrap());

        let mut r = Reassembler::new();
        r.push(&wire);
        assert_eq!(r.next_chunk().unwrap(), b"one");
        assert_eq!(r.next_chunk().unwrap(), b"two");
        assert!(r.next_chunk().is_none());
    }

    #[test]
    fn rejects_oversized_chunk() {
        assert!(frame(&vec![0u8; 70_000]).is_err());
    }
}
