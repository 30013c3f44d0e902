//! RNG helpers separating true entropy from reproducible streams.
//!
//! Key generation, CBC IVs, and frame nonces draw from an OS-backed
//! `OsRng`. The troll and the test suites instead want replayable runs, so
//! deterministic streams are derived from a caller-supplied label through
//! BLAKE3 into `ChaCha20Rng`.

use blake3::Hasher;
use rand::rngs::OsRng;
use rand_chacha::ChaCha20Rng;
use rand_core::SeedableRng;

/// Convenience alias for the OS-backed RNG used for keys, IVs, and nonces.
pub type SecureRng = OsRng;

/// Deterministic RNG derived from an arbitrary label.
pub fn derive_rng(label: &[u8]) -> ChaCha20Rng {
    let mut hasher = Hasher::new();
    hasher.update(b"harden-mqtt::rng");
    hasher.update(label);
    let digest = hasher.finalize();
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&digest.as_bytes()[..32]);
    ChaCha20Rng::from_seed(seed)
}

/// Helper that exposes a mutable secure RNG reference while documenting intent.
pub fn secure_rng() -> SecureRng {
    OsRng
}
