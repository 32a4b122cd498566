use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::identity::{Identity, Seed};

pub fn test_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// A deterministic seed: `tag` followed by zeros.
pub fn test_seed(tag: u8) -> Seed {
    let mut bytes = [0u8; 32];
    bytes[0] = tag;
    Seed::from_bytes(bytes)
}

/// A deterministic identity. The signing keys depend only on `tag`; the
/// session box keys depend on `rng_seed`.
pub fn test_identity(tag: u8, rng_seed: u64) -> Identity {
    Identity::from_seed(test_seed(tag), &mut test_rng(rng_seed))
}
