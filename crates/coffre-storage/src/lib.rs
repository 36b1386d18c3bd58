//! `coffre-storage` — PIN-protected encrypted key-value storage core.
//!
//! The persistence layer of the COFFRE hardware wallet: an authenticated,
//! tamper-evident store over an append-only flash. Values are addressed by a
//! 16-bit key whose high byte is an APP namespace; protected entries are
//! encrypted with ChaCha20-Poly1305 under a random data-encryption key and
//! their key set is authenticated by a storage-wide HMAC tag, so physical
//! flash readout, entry reordering, and ciphertext swapping are all
//! detected. The DEK is wrapped under a PIN-derived key with a
//! brute-force-resistant retry counter, and every internal consistency
//! check feeds a fault guard that prices glitch attacks in PIN retries.
//!
//! Single-threaded by design: one [`Storage`] context owns the flash and
//! the HAL for the lifetime of a power cycle.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::arithmetic_side_effects))]

pub mod error;
pub mod memory;

pub mod ct;
pub mod hal;
pub mod keys;

mod auth;
mod envelope;
mod kdf;
mod pin_log;

pub mod storage;

pub use error::StorageError;
pub use hal::{Hal, StdHal, UiProgress};
pub use keys::{app, is_public, FLAG_PUBLIC};
pub use memory::{disable_core_dumps, SecretBytes};
pub use pin_log::PIN_MAX_TRIES;
pub use storage::{Storage, PIN_EMPTY};
