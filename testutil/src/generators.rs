/// Test data generators

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Same bytes for the same seed
pub fn seeded_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

/// `n` distinct key seeds starting at `base`
pub fn key_seeds(base: u64, n: usize) -> Vec<u64> {
    (0..n as u64).map(|i| base + i).collect()
}
