//! Storage error types for `coffre-storage`.
//!
//! Three response classes exist. Benign errors (`Locked`, `KeyNotFound`,
//! `ReservedNamespace`) leave state untouched. Authentication errors
//! (`InvalidPin`, `AuthenticationFailed`) consume a PIN retry when raised on
//! the unlock path and escalate to the fault guard everywhere else. `Fault`
//! is internal: public methods never return it — the storage intercepts it
//! and halts the device through the fault guard.

use coffre_flash::FlashError;
use thiserror::Error;

/// Errors produced by storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Operation requires an unlocked storage.
    #[error("storage is locked")]
    Locked,

    /// No value stored under the key.
    #[error("no value for key {0:#06x}")]
    KeyNotFound(u16),

    /// The APP namespace 0x00 is reserved for storage-internal entries.
    #[error("key {0:#06x} lies in the reserved namespace")]
    ReservedNamespace(u16),

    /// PIN verification failed — the derived key did not reproduce the
    /// stored PIN verification code.
    #[error("invalid PIN")]
    InvalidPin,

    /// Authentication failed — storage tag, entry tag, or version mismatch.
    #[error("storage authentication failed")]
    AuthenticationFailed,

    /// A storage-internal entry is missing or malformed.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// The flash layout version is newer than this build understands.
    #[error("unsupported storage version {0}")]
    UnsupportedVersion(u32),

    /// A cryptographic primitive rejected its input.
    #[error("encryption error: {0}")]
    Crypto(String),

    /// An internal consistency check failed — a fault-injection signature.
    /// Never escapes the public API; the fault guard consumes it.
    #[error("consistency fault: {0}")]
    Fault(&'static str),

    /// Flash layer failure.
    #[error(transparent)]
    Flash(#[from] FlashError),
}
