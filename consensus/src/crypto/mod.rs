/// Cryptography module for cycle consensus
///
/// Implements:
/// - ECDSA (secp256k1) node identities, certificate signatures and message tags
/// - Hash functions (BLAKE3 / SHA-256) and canonical object hashing

pub mod ecdsa;
pub mod hash;

pub use ecdsa::{
    sign as ecdsa_sign, verify as ecdsa_verify, ECDSAError, ECDSAPublicKey, ECDSASecretKey,
    ECDSASignature, KeyPair,
};
pub use hash::{hash_data, hash_object, Hash, HashError, HashFunction};

// Convenience re-exports
pub use hash::hash_data as hash;
