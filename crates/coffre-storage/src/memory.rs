//! Secure memory types for cached key material.
//!
//! This module provides:
//! - [`SecretBytes`] — fixed-size secret wrapper: zeroize-on-drop,
//!   best-effort `mlock`, masked `Debug`/`Display`
//! - [`CachedKeys`] — the unlocked-session DEK ‖ SAK block
//! - [`disable_core_dumps`] — process hardening for host builds
//!
//! Cleartext key material exists only inside these wrappers and only while
//! the storage is unlocked; every lock transition drops them, which zeroizes
//! the bytes with volatile writes the optimizer cannot elide.

use core::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::StorageError;

/// Data encryption key length in bytes.
pub(crate) const DEK_LEN: usize = 32;

/// Storage authentication key length in bytes.
pub(crate) const SAK_LEN: usize = 16;

/// Cached cleartext key block length: DEK ‖ SAK.
pub(crate) const CACHE_LEN: usize = DEK_LEN + SAK_LEN;

// ---------------------------------------------------------------------------
// Platform-specific memory locking
// ---------------------------------------------------------------------------

/// RAII guard that unlocks memory on drop.
///
/// When created, locks a memory region via `mlock` to prevent it from being
/// swapped to disk. On drop, calls `munlock` to release the lock.
struct LockedRegion {
    ptr: *const u8,
    len: usize,
    locked: bool,
}

// SAFETY: The pointer is only used for mlock/munlock system calls, which
// are thread-safe. The pointed-to data is owned by SecretBytes and is not
// accessed through LockedRegion.
unsafe impl Send for LockedRegion {}
unsafe impl Sync for LockedRegion {}

impl LockedRegion {
    /// Attempt to lock a memory region. Returns a guard that unlocks on drop.
    ///
    /// If `mlock` fails (e.g., insufficient privileges or quota), the region
    /// is **not** locked but no error is returned — this is a soft fallback.
    fn try_lock(ptr: *const u8, len: usize) -> Self {
        let locked = platform::try_mlock(ptr, len);
        if !locked && len > 0 {
            static WARNED: std::sync::Once = std::sync::Once::new();
            WARNED.call_once(|| {
                eprintln!(
                    "[coffre-storage] WARNING: mlock failed — \
                     key material may be swapped to disk. \
                     Consider increasing RLIMIT_MEMLOCK."
                );
            });
        }
        Self { ptr, len, locked }
    }
}

impl Drop for LockedRegion {
    fn drop(&mut self) {
        if self.locked {
            platform::try_munlock(self.ptr, self.len);
        }
    }
}

// ---------------------------------------------------------------------------
// SecretBytes<N>
// ---------------------------------------------------------------------------

/// Fixed-size buffer for keys and other fixed-length secrets.
///
/// Derives `Zeroize` + `ZeroizeOnDrop` so the bytes are securely erased when
/// the value goes out of scope.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes<const N: usize> {
    bytes: [u8; N],
    // LockedRegion is NOT inside Zeroize derive — we manage its Drop manually.
    #[zeroize(skip)]
    lock: LockedRegion,
}

impl<const N: usize> SecretBytes<N> {
    /// Create a new `SecretBytes` from a fixed-size array.
    ///
    /// **Note on `mlock`:** The memory region is locked at the current
    /// address. If this value is subsequently moved, the `LockedRegion`
    /// still references the original address. This is acceptable because
    /// `mlock` is best-effort: `munlock` on a stale address is a safe no-op,
    /// and the zeroize-on-drop guarantee is independent of `mlock` status.
    /// Callers should zeroize their copy of `data` after this returns.
    #[must_use]
    pub fn new(data: [u8; N]) -> Self {
        // Two-phase init: create struct with a no-op dummy lock, then
        // replace with a real lock once `bytes` has a stable address.
        // The dummy is safe to drop (locked=false → no munlock call).
        let mut s = Self {
            bytes: data,
            lock: LockedRegion {
                ptr: std::ptr::null(),
                len: 0,
                locked: false,
            },
        };
        s.lock = LockedRegion::try_lock(s.bytes.as_ptr(), N);
        s
    }

    /// Expose the underlying bytes for cryptographic operations.
    #[must_use]
    pub const fn expose(&self) -> &[u8; N] {
        &self.bytes
    }
}

impl<const N: usize> fmt::Debug for SecretBytes<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes<{N}>(***)")
    }
}

impl<const N: usize> fmt::Display for SecretBytes<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes<{N}>(***)")
    }
}

// ---------------------------------------------------------------------------
// CachedKeys
// ---------------------------------------------------------------------------

/// The cleartext DEK ‖ SAK block held while the storage is unlocked.
pub(crate) struct CachedKeys {
    bytes: SecretBytes<CACHE_LEN>,
}

impl CachedKeys {
    pub(crate) fn new(bytes: [u8; CACHE_LEN]) -> Self {
        Self {
            bytes: SecretBytes::new(bytes),
        }
    }

    /// Data encryption key — encrypts protected values.
    pub(crate) fn dek(&self) -> &[u8] {
        &self.bytes.expose()[..DEK_LEN]
    }

    /// Storage authentication key — keys the HMAC over the key set.
    pub(crate) fn sak(&self) -> &[u8] {
        &self.bytes.expose()[DEK_LEN..]
    }

    /// The whole block, for sealing into the EDEK.
    pub(crate) fn raw(&self) -> &[u8; CACHE_LEN] {
        self.bytes.expose()
    }
}

impl fmt::Debug for CachedKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CachedKeys(***)")
    }
}

// ---------------------------------------------------------------------------
// Core dump disabling
// ---------------------------------------------------------------------------

/// Disable core dumps for the current process.
///
/// On Unix: sets `RLIMIT_CORE` to 0 (both soft and hard limits).
/// On non-Unix: no-op (returns `Ok`).
///
/// # Errors
///
/// Returns `StorageError::Crypto` if the `setrlimit` call fails.
pub fn disable_core_dumps() -> Result<(), StorageError> {
    platform::disable_core_dumps_impl()
}

// ---------------------------------------------------------------------------
// Platform-specific implementations
// ---------------------------------------------------------------------------

#[cfg(unix)]
mod platform {
    use crate::error::StorageError;

    pub(super) fn try_mlock(ptr: *const u8, len: usize) -> bool {
        if len == 0 {
            return true;
        }
        // SAFETY: mlock is safe to call with any valid pointer/length pair.
        // If the pointer is invalid, the kernel returns ENOMEM which we handle.
        unsafe { libc::mlock(ptr.cast(), len) == 0 }
    }

    pub(super) fn try_munlock(ptr: *const u8, len: usize) {
        if len == 0 {
            return;
        }
        // SAFETY: munlock is safe to call. Failure is non-critical.
        unsafe {
            libc::munlock(ptr.cast(), len);
        }
    }

    pub(super) fn disable_core_dumps_impl() -> Result<(), StorageError> {
        let limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: setrlimit with RLIMIT_CORE is a standard POSIX call.
        let ret = unsafe { libc::setrlimit(libc::RLIMIT_CORE, &raw const limit) };
        if ret != 0 {
            return Err(StorageError::Crypto(
                "failed to disable core dumps via RLIMIT_CORE".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(not(unix))]
mod platform {
    use crate::error::StorageError;

    pub(super) fn try_mlock(_ptr: *const u8, _len: usize) -> bool {
        false
    }

    pub(super) fn try_munlock(_ptr: *const u8, _len: usize) {}

    pub(super) fn disable_core_dumps_impl() -> Result<(), StorageError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
