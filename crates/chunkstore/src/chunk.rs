//! Chunks and their framing.
//!
//! A chunk's plaintext is `span || payload`, where `span` is the number of
//! stream bytes the chunk's subtree covers (u64, little-endian). Leaves carry
//! raw stream bytes; internal nodes carry child references. For encrypted
//! trees the whole framed plaintext is sealed and the chunk holds ciphertext.

use bytes::Bytes;
use std::fmt;

use crate::address::Address;

/// Maximum payload carried by one chunk.
pub const CHUNK_SIZE: usize = 4096;

/// Width of the span prefix.
pub const SPAN_SIZE: usize = 8;

/// Largest valid chunk: a full framed payload plus the encryption tag.
pub const MAX_CHUNK_LEN: usize = SPAN_SIZE + CHUNK_SIZE + crate::encryption::TAG_LEN;

/// A content-addressed unit of storage. Write-once: the data never changes
/// after construction.
#[derive(Clone, PartialEq, Eq)]
pub struct Chunk {
    address: Address,
    data: Bytes,
}

impl Chunk {
    /// Build a chunk, computing its address from `data`.
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            address: Address::from_data(&data),
            data,
        }
    }

    /// Build a chunk with a known address (e.g. loaded from storage).
    /// Use [`Chunk::verify`] when the pairing is not trusted.
    pub fn with_address(address: Address, data: impl Into<Bytes>) -> Self {
        Self {
            address,
            data: data.into(),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Check that the data still hashes to the address.
    pub fn verify(&self) -> bool {
        Address::from_data(&self.data) == self.address
    }

    /// Whether the data fits within [`MAX_CHUNK_LEN`].
    pub fn is_within_bounds(&self) -> bool {
        self.data.len() <= MAX_CHUNK_LEN
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("address", &self.address)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Frame a payload with its span.
pub fn frame(span: u64, payload: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(SPAN_SIZE + payload.len());
    data.extend_from_slice(&span.to_le_bytes());
    data.extend_from_slice(payload);
    data
}

/// Split framed plaintext into `(span, payload)`. `None` if shorter than the span prefix.
pub fn unframe(data: &[u8]) -> Option<(u64, &[u8])> {
    if data.len() < SPAN_SIZE {
        return None;
    }
    let (span, payload) = data.split_at(SPAN_SIZE);
    let span = u64::from_le_bytes(span.try_into().ok()?);
    Some((span, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_computes_address() {
        let chunk = Chunk::new(b"payload".to_vec());
        assert_eq!(*chunk.address(), Address::from_data(b"payload"));
        assert!(chunk.verify());
    }

    #[test]
    fn test_with_address_can_fail_verification() {
        let chunk = Chunk::with_address(Address::from_data(b"other"), b"payload".to_vec());
        assert!(!chunk.verify());
    }

    #[test]
    fn test_frame_unframe() {
        let framed = frame(4096, b"abc");
        assert_eq!(framed.len(), SPAN_SIZE + 3);
        let (span, payload) = unframe(&framed).unwrap();
        assert_eq!(span, 4096);
        assert_eq!(payload, b"abc");
    }

    #[test]
    fn test_span_is_little_endian() {
        let framed = frame(1, &[]);
        assert_eq!(&framed[..], &[1, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_unframe_too_short() {
        assert!(unframe(&[0u8; 7]).is_none());
    }
}
