//! Per-chunk encryption.
//!
//! Key scope is one store operation: a [`FileKey`] is generated (or supplied)
//! per stream. Each chunk is sealed with its own [`ChunkKey`], derived with
//! HKDF-SHA256 from the file key and the BLAKE3 digest of the chunk plaintext.
//! Sealing is ChaCha20-Poly1305 with an all-zero nonce: a chunk key only ever
//! encrypts the one plaintext it was derived from.
//!
//! The parent node stores `(child address, child key)`, and the root key
//! travels inside [`crate::Reference::Encrypted`]. The address is computed
//! over the ciphertext, so stored bytes and addresses both reflect it.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::address::{Address, AddressError};
use crate::error::{Result, StoreError};

/// Length of file and chunk keys in bytes.
pub const KEY_LEN: usize = 32;

/// Bytes the AEAD tag adds to every sealed chunk.
pub const TAG_LEN: usize = 16;

/// HKDF salt (domain separation for chunk keys)
const CHUNK_KEY_SALT: &[u8] = b"chunkstore-chunk-key-v1";

const ZERO_NONCE: [u8; 12] = [0u8; 12];

/// Key material for one store operation.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct FileKey([u8; KEY_LEN]);

impl FileKey {
    /// Fresh random key from the OS RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Derive the key for one chunk from its plaintext.
    ///
    /// Deterministic: the same file key and plaintext always give the same
    /// chunk key, which keeps addressing idempotent under a fixed file key.
    pub fn derive_chunk_key(&self, plaintext: &[u8]) -> Result<ChunkKey> {
        let digest = blake3::hash(plaintext);
        let hk = Hkdf::<Sha256>::new(Some(CHUNK_KEY_SALT), &self.0);
        let mut okm = [0u8; KEY_LEN];
        hk.expand(digest.as_bytes(), &mut okm)
            .map_err(|e| StoreError::Encryption(format!("chunk key derivation failed: {e}")))?;
        Ok(ChunkKey(okm))
    }
}

impl fmt::Debug for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FileKey(<redacted>)")
    }
}

/// Key for a single chunk. Carried in parent nodes and in encrypted references.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ChunkKey([u8; KEY_LEN]);

impl ChunkKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> std::result::Result<Self, AddressError> {
        let array: [u8; KEY_LEN] = bytes.try_into().map_err(|_| AddressError::InvalidLength {
            expected: KEY_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChunkKey(<redacted>)")
    }
}

/// Seal a chunk plaintext. Output is `plaintext.len() + TAG_LEN` bytes.
pub fn encrypt_chunk(key: &ChunkKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new((&key.0).into());
    cipher
        .encrypt(Nonce::from_slice(&ZERO_NONCE), plaintext)
        .map_err(|e| StoreError::Encryption(format!("chunk encryption failed: {e}")))
}

/// Open a sealed chunk fetched from `address`.
///
/// A wrong key or tampered ciphertext fails the tag check and yields
/// [`StoreError::Decryption`]; garbage plaintext is never returned.
pub fn decrypt_chunk(key: &ChunkKey, address: &Address, ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() < TAG_LEN {
        return Err(StoreError::Decryption(*address));
    }
    let cipher = ChaCha20Poly1305::new((&key.0).into());
    cipher
        .decrypt(Nonce::from_slice(&ZERO_NONCE), ciphertext)
        .map_err(|_| StoreError::Decryption(*address))
}
