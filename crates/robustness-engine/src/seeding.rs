use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

/// Derive an independent seed for one unit of work (a simulation index, a
/// strategy name) from the run seed. Stable across platforms and releases,
/// so parallel and sequential runs agree.
pub fn derive_seed(base: u64, label: &[u8]) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(base.to_le_bytes());
    hasher.update((label.len() as u64).to_le_bytes());
    hasher.update(label);
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

pub fn unit_rng(base: u64, label: &[u8]) -> StdRng {
    StdRng::seed_from_u64(derive_seed(base, label))
}

pub fn indexed_rng(base: u64, index: usize) -> StdRng {
    unit_rng(base, &(index as u64).to_le_bytes())
}

/// The configured seed, or a fresh one from the thread-local RNG.
pub fn resolve_seed(seed: Option<u64>) -> u64 {
    seed.unwrap_or_else(|| rand::thread_rng().gen())
}
