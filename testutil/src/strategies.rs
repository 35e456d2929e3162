/// Proptest strategies

use proptest::prelude::*;

/// Seeds for deterministic keys and rngs
pub fn arb_seed() -> impl Strategy<Value = u64> {
    1u64..10_000
}

/// Sequence of `(bundle, signer)` deliveries over `bundles` candidates and
/// `signers` keys, repeats allowed
pub fn arb_deliveries(bundles: usize, signers: usize, max_len: usize) -> impl Strategy<Value = Vec<(usize, usize)>> {
    prop::collection::vec((0..bundles, 0..signers), 1..max_len)
}
