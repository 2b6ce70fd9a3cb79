//! Address and Reference: content addressing for chunks and trees.
//!
//! An [`Address`] is the full 256-bit BLAKE3 digest of a chunk's stored bytes.
//! A [`Reference`] is what callers hold on to after storing a stream: the root
//! address, plus the root chunk key when the tree is encrypted.
//!
//! Both render as lowercase hex. A plain reference is 64 hex chars, an
//! encrypted one is 128 (address followed by key).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::encryption::{ChunkKey, KEY_LEN};

/// Length of an address in bytes.
pub const ADDRESS_LEN: usize = 32;

/// Content address of a chunk: BLAKE3 over the bytes as stored.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; ADDRESS_LEN]);

/// Errors that can occur when parsing addresses and references.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid address length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("invalid hex character in address")]
    InvalidHex,
}

impl Address {
    /// Hash data and return its address.
    pub fn from_data(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub const fn from_bytes(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    /// Build from a byte slice that must be exactly [`ADDRESS_LEN`] long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, AddressError> {
        let array: [u8; ADDRESS_LEN] =
            bytes.try_into().map_err(|_| AddressError::InvalidLength {
                expected: ADDRESS_LEN,
                actual: bytes.len(),
            })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short form for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ADDRESS_LEN * 2 {
            return Err(AddressError::InvalidLength {
                expected: ADDRESS_LEN,
                actual: s.len() / 2,
            });
        }
        let bytes = hex::decode(s).map_err(|_| AddressError::InvalidHex)?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Handle to a stored tree (or to one child inside an internal node).
///
/// The variant is the encryption flag: it is fixed at store time and travels
/// with the handle, so retrieval never has to guess.
#[derive(Clone, PartialEq, Eq)]
pub enum Reference {
    Plain(Address),
    Encrypted { address: Address, key: ChunkKey },
}

impl Reference {
    /// Encoded width of a plain reference inside an internal node.
    pub const PLAIN_LEN: usize = ADDRESS_LEN;
    /// Encoded width of an encrypted reference inside an internal node.
    pub const ENCRYPTED_LEN: usize = ADDRESS_LEN + KEY_LEN;

    pub fn address(&self) -> &Address {
        match self {
            Reference::Plain(address) => address,
            Reference::Encrypted { address, .. } => address,
        }
    }

    pub fn key(&self) -> Option<&ChunkKey> {
        match self {
            Reference::Plain(_) => None,
            Reference::Encrypted { key, .. } => Some(key),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, Reference::Encrypted { .. })
    }

    /// Width of a reference in the given mode.
    pub fn encoded_len(encrypted: bool) -> usize {
        if encrypted {
            Self::ENCRYPTED_LEN
        } else {
            Self::PLAIN_LEN
        }
    }

    /// Append the wire form (address, then key if any) to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.address().as_bytes());
        if let Some(key) = self.key() {
            out.extend_from_slice(key.as_bytes());
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::encoded_len(self.is_encrypted()));
        self.write_to(&mut out);
        out
    }

    /// Decode from exactly 32 (plain) or 64 (encrypted) bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, AddressError> {
        match bytes.len() {
            Self::PLAIN_LEN => Ok(Reference::Plain(Address::from_slice(bytes)?)),
            Self::ENCRYPTED_LEN => {
                let (address, key) = bytes.split_at(ADDRESS_LEN);
                Ok(Reference::Encrypted {
                    address: Address::from_slice(address)?,
                    key: ChunkKey::from_slice(key)?,
                })
            }
            actual => Err(AddressError::InvalidLength {
                expected: Self::PLAIN_LEN,
                actual,
            }),
        }
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}

impl From<Address> for Reference {
    fn from(address: Address) -> Self {
        Reference::Plain(address)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Plain(address) => write!(f, "Reference::Plain({address})"),
            Reference::Encrypted { address, .. } => {
                write!(f, "Reference::Encrypted({address}, <key>)")
            }
        }
    }
}

impl FromStr for Reference {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() % 2 != 0 {
            return Err(AddressError::InvalidHex);
        }
        let bytes = hex::decode(s).map_err(|_| AddressError::InvalidHex)?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for Reference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Reference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_data_is_deterministic() {
        let a = Address::from_data(b"test data");
        let b = Address::from_data(b"test data");
        assert_eq!(a, b);
    }

    #[test]
    fn test_from_data_different_input_different_address() {
        assert_ne!(Address::from_data(b"data a"), Address::from_data(b"data b"));
    }

    #[test]
    fn test_address_is_full_blake3() {
        let address = Address::from_data(b"");
        assert_eq!(
            address.to_hex(),
            "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262"
        );
    }

    #[test]
    fn test_address_hex_roundtrip() {
        let address = Address::from_data(b"hex");
        let parsed: Address = address.to_hex().parse().unwrap();
        assert_eq!(address, parsed);
    }

    #[test]
    fn test_address_invalid_length() {
        let result: Result<Address, _> = "abcd".parse();
        assert!(matches!(result, Err(AddressError::InvalidLength { .. })));
    }

    #[test]
    fn test_address_invalid_hex() {
        let result: Result<Address, _> = "zz".repeat(32).parse();
        assert_eq!(result, Err(AddressError::InvalidHex));
    }

    #[test]
    fn test_plain_reference_roundtrip() {
        let reference = Reference::Plain(Address::from_data(b"plain"));
        assert_eq!(reference.to_hex().len(), 64);
        let parsed: Reference = reference.to_hex().parse().unwrap();
        assert_eq!(parsed, reference);
        assert!(!parsed.is_encrypted());
    }

    #[test]
    fn test_encrypted_reference_roundtrip() {
        let reference = Reference::Encrypted {
            address: Address::from_data(b"cipher"),
            key: ChunkKey::from_bytes([7u8; KEY_LEN]),
        };
        let hex = reference.to_hex();
        assert_eq!(hex.len(), 128);
        let parsed: Reference = hex.parse().unwrap();
        assert!(parsed.is_encrypted());
        assert_eq!(parsed, reference);
    }

    #[test]
    fn test_reference_rejects_odd_widths() {
        let result = Reference::from_slice(&[0u8; 40]);
        assert!(matches!(result, Err(AddressError::InvalidLength { actual: 40, .. })));
    }

    #[test]
    fn test_reference_debug_hides_key() {
        let reference = Reference::Encrypted {
            address: Address::from_data(b"secret"),
            key: ChunkKey::from_bytes([0xAB; KEY_LEN]),
        };
        assert!(!format!("{reference:?}").contains("abab"));
    }

    #[test]
    fn test_serde_roundtrip() {
        let reference = Reference::Plain(Address::from_data(b"serde test"));
        let json = serde_json::to_string(&reference).unwrap();
        let restored: Reference = serde_json::from_str(&json).unwrap();
        assert_eq!(reference, restored);
    }
}
