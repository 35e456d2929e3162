/// ECDSA signatures for node identities
///
/// Uses secp256k1. Every node owns one key pair: it signs cycle certificates,
/// submodule proposals and the recipient-bound tags on internal messages.

use k256::ecdsa::{
    signature::{Signer, Verifier},
    Signature as K256Signature, SigningKey, VerifyingKey,
};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::hash::{Hash as StdHash, Hasher};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ECDSAError {
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Invalid key")]
    InvalidKey,
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// ECDSA secret key (secp256k1)
#[derive(Clone)]
pub struct ECDSASecretKey {
    inner: SigningKey,
}

impl ECDSASecretKey {
    /// Generate a new random secret key
    pub fn generate() -> Self {
        let inner = SigningKey::random(&mut rand::thread_rng());
        Self { inner }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ECDSAError> {
        let inner = SigningKey::from_slice(bytes).map_err(|_| ECDSAError::InvalidKey)?;
        Ok(Self { inner })
    }

    /// Get the corresponding public key
    pub fn public_key(&self) -> ECDSAPublicKey {
        ECDSAPublicKey {
            inner: self.inner.verifying_key().clone(),
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.to_bytes().to_vec()
    }
}

impl fmt::Debug for ECDSASecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ECDSASecretKey(..)")
    }
}

/// ECDSA public key (secp256k1), hex-encoded SEC1 on the wire
#[derive(Clone)]
pub struct ECDSAPublicKey {
    inner: VerifyingKey,
}

impl ECDSAPublicKey {
    /// Create from raw SEC1 bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ECDSAError> {
        let inner = VerifyingKey::from_sec1_bytes(bytes).map_err(|_| ECDSAError::InvalidKey)?;
        Ok(Self { inner })
    }

    pub fn from_hex(s: &str) -> Result<Self, ECDSAError> {
        Self::from_bytes(&hex::decode(s)?)
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.to_sec1_bytes().to_vec()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}

impl PartialEq for ECDSAPublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for ECDSAPublicKey {}

impl StdHash for ECDSAPublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl PartialOrd for ECDSAPublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ECDSAPublicKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_bytes().cmp(&other.to_bytes())
    }
}

impl fmt::Debug for ECDSAPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ECDSAPublicKey({})", self.to_hex())
    }
}

impl Serialize for ECDSAPublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ECDSAPublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ECDSAPublicKey::from_hex(&s).map_err(de::Error::custom)
    }
}

/// ECDSA signature, hex-encoded on the wire
#[derive(Clone, PartialEq, Eq)]
pub struct ECDSASignature {
    inner: K256Signature,
}

impl ECDSASignature {
    /// Create from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ECDSAError> {
        let inner = K256Signature::from_slice(bytes).map_err(|_| ECDSAError::InvalidSignature)?;
        Ok(Self { inner })
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.to_bytes().to_vec()
    }
}

impl fmt::Debug for ECDSASignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ECDSASignature({})", hex::encode(&self.to_bytes()[..8]))
    }
}

impl Serialize for ECDSASignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.to_bytes()))
    }
}

impl<'de> Deserialize<'de> for ECDSASignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(de::Error::custom)?;
        ECDSASignature::from_bytes(&bytes).map_err(de::Error::custom)
    }
}

/// Node key pair (secret + public key)
#[derive(Clone, Debug)]
pub struct KeyPair {
    pub secret_key: ECDSASecretKey,
    pub public_key: ECDSAPublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secret_key = ECDSASecretKey::generate();
        let public_key = secret_key.public_key();
        Self { secret_key, public_key }
    }

    /// Derive a key pair from a seed. Deterministic, for tests and simulation.
    pub fn from_seed(seed: u64) -> Self {
        let mut counter = 0u64;
        loop {
            let mut material = seed.to_le_bytes().to_vec();
            material.extend_from_slice(&counter.to_le_bytes());
            let digest = blake3::hash(&material);
            if let Ok(secret_key) = ECDSASecretKey::from_bytes(digest.as_bytes()) {
                let public_key = secret_key.public_key();
                return Self { secret_key, public_key };
            }
            counter += 1;
        }
    }
}

/// Sign a message with ECDSA
pub fn sign(secret_key: &ECDSASecretKey, message: &[u8]) -> ECDSASignature {
    let signature: K256Signature = secret_key.inner.sign(message);
    ECDSASignature { inner: signature }
}

/// Verify an ECDSA signature
pub fn verify(public_key: &ECDSAPublicKey, message: &[u8], signature: &ECDSASignature) -> bool {
    public_key.inner.verify(message, &signature.inner).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ecdsa_sign_verify() {
        let keypair = KeyPair::generate();

        let message = b"cycle marker";
        let signature = sign(&keypair.secret_key, message);

        assert!(verify(&keypair.public_key, message, &signature));
    }

    #[test]
    fn test_ecdsa_wrong_message_fails() {
        let keypair = KeyPair::generate();
        let signature = sign(&keypair.secret_key, b"original message");

        assert!(!verify(&keypair.public_key, b"tampered message", &signature));
    }

    #[test]
    fn test_ecdsa_wrong_key_fails() {
        let signer = KeyPair::from_seed(1);
        let other = KeyPair::from_seed(2);
        let signature = sign(&signer.secret_key, b"msg");

        assert!(!verify(&other.public_key, b"msg", &signature));
    }

    #[test]
    fn test_seeded_keypairs_are_stable() {
        assert_eq!(KeyPair::from_seed(7).public_key, KeyPair::from_seed(7).public_key);
        assert_ne!(KeyPair::from_seed(7).public_key, KeyPair::from_seed(8).public_key);
    }

    #[test]
    fn test_public_key_and_signature_serde() {
        let keypair = KeyPair::from_seed(3);
        let signature = sign(&keypair.secret_key, b"payload");

        let pk_json = serde_json::to_string(&keypair.public_key).unwrap();
        let sig_json = serde_json::to_string(&signature).unwrap();

        let pk: ECDSAPublicKey = serde_json::from_str(&pk_json).unwrap();
        let sig: ECDSASignature = serde_json::from_str(&sig_json).unwrap();
        assert!(verify(&pk, b"payload", &sig));

        assert!(serde_json::from_str::<ECDSAPublicKey>("\"00ff\"").is_err());
    }
}
