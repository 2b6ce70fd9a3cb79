//! Hash tree geometry, shared by the splitter and the joiner.
//!
//! Leaves hold up to [`CHUNK_SIZE`] stream bytes. Internal nodes hold child
//! references, so a node fits `CHUNK_SIZE / width` children: 128 for plain
//! trees (32-byte references), 64 for encrypted ones (address + key).
//!
//! The tree shape is a function of stream length alone:
//! - a node is a leaf iff its span is at most `CHUNK_SIZE`
//! - children of a node spanning `S` cover consecutive windows of
//!   [`child_unit`] bytes, the last one taking the remainder
//! - a group of one child is never wrapped; the child takes its place
//!
//! so any offset maps to exactly one root-to-leaf path.

use bytes::Bytes;

use crate::address::{Address, Reference};
use crate::chunk::{frame, unframe, Chunk, CHUNK_SIZE, SPAN_SIZE};
use crate::encryption::{decrypt_chunk, encrypt_chunk, FileKey};
use crate::error::{Result, StoreError};

mod join;
mod split;

pub use join::{LazyChunkReader, ReadOutcome};
pub use split::{Splitter, StoreCompletion};

/// Children per internal node.
pub fn branches(encrypted: bool) -> usize {
    CHUNK_SIZE / Reference::encoded_len(encrypted)
}

/// Stream bytes covered by each child of an internal node spanning `span`.
pub fn child_unit(span: u64, branches: usize) -> u64 {
    let branches = branches as u64;
    let mut unit = CHUNK_SIZE as u64;
    while unit.saturating_mul(branches) < span {
        unit *= branches;
    }
    unit
}

pub fn is_leaf(span: u64) -> bool {
    span <= CHUNK_SIZE as u64
}

/// Frame, optionally encrypt, and address one tree node.
pub(crate) fn seal(span: u64, payload: &[u8], key: Option<&FileKey>) -> Result<(Chunk, Reference)> {
    let plaintext = frame(span, payload);
    match key {
        None => {
            let chunk = Chunk::new(plaintext);
            let reference = Reference::Plain(*chunk.address());
            Ok((chunk, reference))
        }
        Some(file_key) => {
            let chunk_key = file_key.derive_chunk_key(&plaintext)?;
            let chunk = Chunk::new(encrypt_chunk(&chunk_key, &plaintext)?);
            let reference = Reference::Encrypted {
                address: *chunk.address(),
                key: chunk_key,
            };
            Ok((chunk, reference))
        }
    }
}

/// A fetched tree node, decrypted and unframed.
#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub address: Address,
    pub span: u64,
    pub payload: Bytes,
}

/// Reverse of [`seal`] for a chunk fetched through `reference`.
pub(crate) fn open(reference: &Reference, chunk: &Chunk) -> Result<Node> {
    let address = *reference.address();
    let plaintext = match reference.key() {
        Some(key) => Bytes::from(decrypt_chunk(key, &address, chunk.data())?),
        None => chunk.data().clone(),
    };
    let (span, _) = unframe(&plaintext)
        .ok_or_else(|| StoreError::corrupt(address, "chunk shorter than its span header"))?;
    Ok(Node {
        address,
        span,
        payload: plaintext.slice(SPAN_SIZE..),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branches() {
        assert_eq!(branches(false), 128);
        assert_eq!(branches(true), 64);
    }

    #[test]
    fn test_child_unit_levels() {
        let b = branches(false);
        let leaf = CHUNK_SIZE as u64;
        assert_eq!(child_unit(leaf + 1, b), leaf);
        assert_eq!(child_unit(leaf * 128, b), leaf);
        assert_eq!(child_unit(leaf * 128 + 1, b), leaf * 128);
        assert_eq!(child_unit(leaf * 128 * 128, b), leaf * 128);
        assert_eq!(child_unit(leaf * 128 * 128 + 1, b), leaf * 128 * 128);
    }

    #[test]
    fn test_child_unit_encrypted() {
        let leaf = CHUNK_SIZE as u64;
        assert_eq!(child_unit(leaf * 64, 64), leaf);
        assert_eq!(child_unit(leaf * 64 + 1, 64), leaf * 64);
    }

    #[test]
    fn test_child_unit_does_not_overflow() {
        let unit = child_unit(u64::MAX, branches(false));
        assert!(unit.saturating_mul(128) >= u64::MAX);
    }

    #[test]
    fn test_is_leaf() {
        assert!(is_leaf(0));
        assert!(is_leaf(CHUNK_SIZE as u64));
        assert!(!is_leaf(CHUNK_SIZE as u64 + 1));
    }

    #[test]
    fn test_seal_open_plain() {
        let (chunk, reference) = seal(3, b"abc", None).unwrap();
        assert!(!reference.is_encrypted());
        assert_eq!(chunk.len(), SPAN_SIZE + 3);

        let node = open(&reference, &chunk).unwrap();
        assert_eq!(node.span, 3);
        assert_eq!(&node.payload[..], b"abc");
    }

    #[test]
    fn test_seal_open_encrypted() {
        let key = FileKey::generate();
        let (chunk, reference) = seal(3, b"abc", Some(&key)).unwrap();
        assert!(reference.is_encrypted());
        assert!(!chunk.data().windows(3).any(|w| w == b"abc"));

        let node = open(&reference, &chunk).unwrap();
        assert_eq!(node.span, 3);
        assert_eq!(&node.payload[..], b"abc");
    }

    #[test]
    fn test_seal_is_deterministic_under_one_key() {
        let key = FileKey::from_bytes([9u8; 32]);
        let (_, a) = seal(5, b"hello", Some(&key)).unwrap();
        let (_, b) = seal(5, b"hello", Some(&key)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_open_short_chunk_is_corrupt() {
        let chunk = Chunk::new(vec![1, 2, 3]);
        let reference = Reference::Plain(*chunk.address());
        let err = open(&reference, &chunk).unwrap_err();
        assert!(matches!(err, StoreError::CorruptTree { .. }));
    }
}
