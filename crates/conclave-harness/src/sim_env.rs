//! Virtual time and seeded randomness.

use std::{cell::RefCell, rc::Rc, time::Duration};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

use conclave_core::Environment;

/// Wall-clock base so sanction timestamps look like real dates.
const WALL_CLOCK_BASE_SECS: u64 = 1_700_000_000;

/// A point in virtual time (milliseconds since simulation start).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimInstant(u64);

impl std::ops::Sub for SimInstant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        Duration::from_millis(self.0.saturating_sub(rhs.0))
    }
}

struct EnvInner {
    now_ms: u64,
    rng: ChaCha20Rng,
}

/// Deterministic [`Environment`]: virtual clock plus seeded RNG.
///
/// Clones share the same clock and RNG stream, so every engine in a
/// simulation draws from one deterministic sequence.
#[derive(Clone)]
pub struct SimEnv {
    inner: Rc<RefCell<EnvInner>>,
}

impl SimEnv {
    /// Environment seeded for reproducible runs.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            inner: Rc::new(RefCell::new(EnvInner {
                now_ms: 0,
                rng: ChaCha20Rng::seed_from_u64(seed),
            })),
        }
    }

    /// Move virtual time forward.
    pub fn advance(&self, duration: Duration) {
        self.inner.borrow_mut().now_ms += duration.as_millis() as u64;
    }

    /// Milliseconds since simulation start.
    pub fn now_ms(&self) -> u64 {
        self.inner.borrow().now_ms
    }
}

impl Environment for SimEnv {
    type Instant = SimInstant;

    fn now(&self) -> SimInstant {
        SimInstant(self.inner.borrow().now_ms)
    }

    fn wall_clock_secs(&self) -> u64 {
        WALL_CLOCK_BASE_SECS + self.inner.borrow().now_ms / 1000
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.inner.borrow_mut().rng.fill_bytes(buffer);
    }
}
