//! Hardware abstraction seam.
//!
//! This module provides:
//! - [`Hal`] — the platform contract: secure randomness, blocking delay,
//!   randomized anti-glitch delay, and halting the device
//! - [`StdHal`] — host implementation (OsRng, `thread::sleep`, panic-as-halt)
//! - [`UiProgress`] — the PIN-backoff progress callback
//!
//! On a device the implementation wires the TRNG, the HAL delay timer, and a
//! halt that parks the core with interrupts disabled. On a host, `halt`
//! panics: the process is the device, and a halted device stops running.

use core::hint::black_box;

use rand::rngs::OsRng;
use rand::RngCore;

/// UI callback pumped during the PIN-retry backoff sleep:
/// `(seconds_remaining, progress_permille)`.
pub type UiProgress = Box<dyn FnMut(u32, u32)>;

/// Platform contract consumed by the storage core.
pub trait Hal {
    /// Fill `buf` with cryptographically secure random bytes.
    fn fill_random(&mut self, buf: &mut [u8]);

    /// Block for `ms` milliseconds.
    fn delay_ms(&mut self, ms: u32);

    /// Short randomized delay. Every security-sensitive early exit is paired
    /// with one of these so a glitch cannot be timed against the predicate.
    fn wait_random(&mut self);

    /// Stop the device. Never returns.
    fn halt(&mut self) -> !;
}

/// Draw a uniformly random 32-bit word.
pub(crate) fn random_u32<H: Hal>(hal: &mut H) -> u32 {
    let mut buf = [0u8; 4];
    hal.fill_random(&mut buf);
    u32::from_le_bytes(buf)
}

/// Host implementation of [`Hal`].
pub struct StdHal;

impl Hal for StdHal {
    fn fill_random(&mut self, buf: &mut [u8]) {
        OsRng.fill_bytes(buf);
    }

    fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(std::time::Duration::from_millis(u64::from(ms)));
    }

    fn wait_random(&mut self) {
        let mut n = [0u8; 1];
        OsRng.fill_bytes(&mut n);
        for i in 0..u32::from(n[0]) {
            black_box(i);
        }
    }

    fn halt(&mut self) -> ! {
        panic!("coffre: storage halted");
    }
}

/// Deterministic HAL for unit tests: xorshift randomness, counted delays,
/// panic-as-halt with a sentinel message.
#[cfg(test)]
pub(crate) struct TestHal {
    pub(crate) rng_state: u64,
    pub(crate) delayed_ms: u64,
}

#[cfg(test)]
impl TestHal {
    pub(crate) const fn new(seed: u64) -> Self {
        Self {
            rng_state: if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed },
            delayed_ms: 0,
        }
    }
}

#[cfg(test)]
impl Hal for TestHal {
    fn fill_random(&mut self, buf: &mut [u8]) {
        for byte in buf {
            // xorshift64* — deterministic, good enough for test vectors.
            self.rng_state ^= self.rng_state << 13;
            self.rng_state ^= self.rng_state >> 7;
            self.rng_state ^= self.rng_state << 17;
            *byte = (self.rng_state >> 32) as u8;
        }
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delayed_ms += u64::from(ms);
    }

    fn wait_random(&mut self) {}

    fn halt(&mut self) -> ! {
        panic!("device halted");
    }
}
