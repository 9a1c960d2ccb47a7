//! Environment abstraction for deterministic testing.
//!
//! Decouples protocol logic from system resources (time, randomness). The
//! engine never calls `Instant::now()` or the OS RNG directly; everything
//! flows through this trait so the simulation harness can substitute a
//! virtual clock and a seeded RNG and replay whole runs from a seed.

use std::time::Duration;

/// Abstract environment providing time and randomness.
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards within one execution context
/// - `random_bytes()` uses cryptographically secure entropy in production
pub trait Environment: Clone {
    /// The instant type used by this environment.
    ///
    /// Production environments use `std::time::Instant`; the simulation
    /// harness uses a virtual instant driven by the test.
    type Instant: Copy + Ord + std::ops::Sub<Output = Duration>;

    /// Current monotonic time.
    fn now(&self) -> Self::Instant;

    /// Current wall-clock time as Unix seconds.
    ///
    /// Used only for human-facing timestamps carried in broadcasts and
    /// sanctions entries; never for timeout arithmetic.
    fn wall_clock_secs(&self) -> u64;

    /// Fill `buffer` with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generate a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generate a random nonce for the packet codec.
    fn random_nonce(&self) -> [u8; conclave_crypto::NONCE_SIZE] {
        let mut nonce = [0u8; conclave_crypto::NONCE_SIZE];
        self.random_bytes(&mut nonce);
        nonce
    }

    /// Generate a padding length in `0..=MAX_PADDING` for the codec.
    fn random_padding(&self) -> usize {
        (self.random_u64() % (conclave_proto::MAX_PADDING as u64 + 1)) as usize
    }

    /// Generate 64 bytes of keypair entropy.
    fn random_entropy(&self) -> [u8; 64] {
        let mut entropy = [0u8; 64];
        self.random_bytes(&mut entropy);
        entropy
    }
}

/// Production environment backed by the OS clock and RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn wall_clock_secs(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        use rand::RngCore;
        rand::thread_rng().fill_bytes(buffer);
    }
}
