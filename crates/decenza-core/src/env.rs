//! Environment abstraction for deterministic testing.
//!
//! Decouples engine logic from system resources (time, randomness) so the
//! transport command queue, device session, and session-expiry logic can run
//! under a manual clock in tests and real system resources in production.

use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Abstract environment providing time and randomness.
///
/// Implementations must guarantee that `now()` never goes backwards within a
/// single execution context and that `random_bytes()` uses cryptographically
/// secure entropy in production.
pub trait Environment: Clone + Send + Sync + 'static {
    /// The specific instant type used by this environment.
    ///
    /// Production uses `std::time::Instant`; tests use a virtual clock.
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Current wall-clock time as milliseconds since the Unix epoch.
    ///
    /// Used where a persisted timestamp is needed (shot records, sessions);
    /// never used for interval arithmetic.
    fn unix_millis(&self) -> u64;

    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates a random `u128`, useful for UUIDs and tokens.
    fn random_u128(&self) -> u128 {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        u128::from_be_bytes(bytes)
    }
}

/// Production environment: system clock and OS entropy.
#[derive(Debug, Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a production environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn unix_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(buffer);
    }
}

/// Test environment with a manually advanced clock and a counting RNG.
///
/// `now()` is a [`Duration`] offset from an arbitrary origin; tests call
/// [`ManualEnv::advance`] to move time forward. Random bytes come from a
/// deterministic counter so identifiers are stable across runs.
#[derive(Debug, Clone, Default)]
pub struct ManualEnv {
    inner: Arc<Mutex<ManualState>>,
}

#[derive(Debug, Default)]
struct ManualState {
    elapsed: Duration,
    unix_millis: u64,
    rng_counter: u64,
}

impl ManualEnv {
    /// Create a manual environment at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance both the monotonic clock and the wall clock.
    pub fn advance(&self, by: Duration) {
        if let Ok(mut state) = self.inner.lock() {
            state.elapsed += by;
            state.unix_millis += by.as_millis() as u64;
        }
    }

    /// Set the wall clock without touching the monotonic clock.
    pub fn set_unix_millis(&self, millis: u64) {
        if let Ok(mut state) = self.inner.lock() {
            state.unix_millis = millis;
        }
    }
}

impl Environment for ManualEnv {
    type Instant = Duration;

    fn now(&self) -> Self::Instant {
        self.inner.lock().map(|s| s.elapsed).unwrap_or_default()
    }

    fn unix_millis(&self) -> u64 {
        self.inner.lock().map(|s| s.unix_millis).unwrap_or_default()
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        let mut counter = match self.inner.lock() {
            Ok(mut state) => {
                state.rng_counter += 1;
                state.rng_counter
            },
            Err(_) => 0,
        };
        for byte in buffer.iter_mut() {
            counter = counter.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            *byte = (counter >> 33) as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let env = ManualEnv::new();
        let start = env.now();
        env.advance(Duration::from_millis(250));
        assert_eq!(env.now() - start, Duration::from_millis(250));
    }

    #[test]
    fn manual_rng_is_deterministic() {
        let a = ManualEnv::new();
        let b = ManualEnv::new();
        assert_eq!(a.random_u64(), b.random_u64());
        // Consecutive draws differ
        assert_ne!(a.random_u64(), a.random_u64());
    }

    #[test]
    fn system_env_produces_entropy() {
        let env = SystemEnv::new();
        let mut buf = [0u8; 16];
        env.random_bytes(&mut buf);
        assert_ne!(buf, [0u8; 16]);
    }
}
