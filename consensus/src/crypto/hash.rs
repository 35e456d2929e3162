/// Hash function implementation for cycle consensus
///
/// Supports:
/// - SHA-256 (compatibility, wide support)
/// - BLAKE3 (default, used for markers and gossip fingerprints)
///
/// Structured values are hashed over their canonical JSON encoding so every
/// node derives the same digest for the same logical value.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

pub const HASH_SIZE: usize = 32;

#[derive(Error, Debug)]
pub enum HashError {
    #[error("Invalid hash size")]
    InvalidSize,
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("Canonical encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Hash output (32 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    pub fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, HashError> {
        if slice.len() != HASH_SIZE {
            return Err(HashError::InvalidSize);
        }
        let mut bytes = [0u8; HASH_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    pub fn from_hex(s: &str) -> Result<Self, HashError> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// All-zero hash, used as the `previous` marker of the genesis record
    /// and as the placeholder marker of provisionally stored cycles.
    pub fn zero() -> Self {
        Self([0u8; HASH_SIZE])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_SIZE]
    }

    /// Leading 32 bits, big-endian.
    pub fn prefix_u32(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash::from_hex(&s).map_err(de::Error::custom)
    }
}

/// Hash function selection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum HashFunction {
    /// SHA-256 (compatibility)
    Sha256,
    /// BLAKE3 (performance)
    #[default]
    Blake3,
}

/// Hash arbitrary data
pub fn hash_data(data: &[u8]) -> Hash {
    hash_data_with(data, HashFunction::default())
}

/// Hash data with specific function
pub fn hash_data_with(data: &[u8], function: HashFunction) -> Hash {
    match function {
        HashFunction::Sha256 => {
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            hasher.update(data);
            let result = hasher.finalize();
            Hash::new(result.into())
        }
        HashFunction::Blake3 => {
            let result = blake3::hash(data);
            Hash::new(*result.as_bytes())
        }
    }
}

/// Hash a serializable value over its canonical JSON encoding.
///
/// Struct fields serialize in declaration order and maps are `BTreeMap`s,
/// so the encoding depends only on the value, never on how it was built.
pub fn hash_object<T: Serialize + ?Sized>(value: &T) -> Result<Hash, HashError> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_data(&bytes))
}
