//! The storage context: lifecycle, PIN pipeline, public API, fault guard.
//!
//! This module provides:
//! - [`Storage`] — the single owned storage context binding a flash backend
//!   and a HAL for the lifetime of a power cycle
//! - the public operations: `unlock`, `lock`, `has_pin`, `get_pin_rem`,
//!   `change_pin`, `get`, `set`, `delete`, `wipe`
//!
//! # Lifecycle
//!
//! [`Storage::init`] mounts the flash, migrates a version-0 layout if one is
//! found, and factory-initializes empty flash (random DEK‖SAK, the empty-PIN
//! sentinel, a zeroed retry log). Cleartext key material exists only while
//! the storage is unlocked; `lock`, `wipe`, and every failure path drop it.
//!
//! # Fault guard
//!
//! Internal consistency failures (malformed PIN log, tag scan anomalies,
//! readback mismatches) never surface as errors. They funnel into
//! [`Storage::fault`]: one PIN-retry increment and a halt, so a glitch
//! campaign pays out of the retry budget. A second anomaly while the guard
//! is running wipes the storage before halting.

use core::fmt;

use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use coffre_flash::{Flash, FORMAT_VERSION};

use crate::auth::{self, SUM_LEN};
use crate::envelope::{self, IV_LEN, PVC_LEN, TAG_LEN};
use crate::error::StorageError;
use crate::hal::{Hal, UiProgress};
use crate::kdf::{self, RANDOM_SALT_LEN};
use crate::keys::{app, is_public, is_tag_counted, EDEK_PVC_KEY, PIN_NOT_SET_KEY, VERSION_KEY};
use crate::memory::{self, CachedKeys, CACHE_LEN};
use crate::pin_log::{self, PIN_MAX_TRIES};

mod upgrade;

/// The empty-PIN sentinel. Factory state stores this value; callers must
/// encode user PINs so that 1 is unreachable.
pub const PIN_EMPTY: u32 = 1;

/// EDEK_PVC entry layout: salt (4) ‖ EDEK (48) ‖ PVC (8).
const EDEK_PVC_LEN: usize = RANDOM_SALT_LEN + CACHE_LEN + PVC_LEN;

/// Byte offset of the EDEK within the EDEK_PVC entry.
const EDEK_OFFSET: usize = RANDOM_SALT_LEN;

/// Byte offset of the PVC within the EDEK_PVC entry.
const PVC_OFFSET: usize = RANDOM_SALT_LEN + CACHE_LEN;

/// Milliseconds per UI progress tick during the retry backoff.
const BACKOFF_TICK_MS: u32 = 100;

/// PIN-protected encrypted key-value storage over an append-only flash.
///
/// Owns the flash backend and the HAL for the lifetime of a power cycle;
/// the in-memory lifecycle state (unlocked flag, cached keys, running
/// authentication sum) lives and dies with this value.
pub struct Storage<F: Flash, H: Hal> {
    flash: F,
    hal: H,
    ui: Option<UiProgress>,
    hardware_salt: [u8; 32],
    cache: Option<CachedKeys>,
    auth_sum: [u8; SUM_LEN],
    unlocked: bool,
    fault_in_progress: bool,
}

impl<F: Flash, H: Hal> Storage<F, H> {
    /// Mount the storage.
    ///
    /// The hardware salt is the SHA-256 of the caller-provided hardware
    /// secret. Empty flash is factory-initialized; a version-0 layout is
    /// migrated in place, and any migration failure wipes the flash and
    /// halts. The storage comes up locked.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnsupportedVersion`] if the flash carries a
    /// layout newer than this build; propagates flash failures from the
    /// factory initialization.
    pub fn init(
        flash: F,
        hal: H,
        ui: Option<UiProgress>,
        hardware_secret: &[u8],
    ) -> Result<Self, StorageError> {
        // Best-effort process hardening on hosts; a device HAL has no
        // equivalent and the call is a no-op there.
        let _ = memory::disable_core_dumps();

        let mut hardware_salt = [0u8; 32];
        hardware_salt.copy_from_slice(&Sha256::digest(hardware_secret));

        let mut storage = Self {
            flash,
            hal,
            ui,
            hardware_salt,
            cache: None,
            auth_sum: [0u8; SUM_LEN],
            unlocked: false,
            fault_in_progress: false,
        };

        match storage.flash.version() {
            FORMAT_VERSION => {
                if storage.flash.get(EDEK_PVC_KEY).is_none() {
                    storage.wipe();
                }
            }
            0 => {
                if upgrade::from_version_0(&mut storage).is_err() {
                    storage.flash.wipe();
                    storage.purge_session();
                    storage.hal.halt();
                }
            }
            version => return Err(StorageError::UnsupportedVersion(version)),
        }

        Ok(storage)
    }

    // -----------------------------------------------------------------------
    // Fault guard
    // -----------------------------------------------------------------------

    /// Centralized fault response. One retry-counter increment and a halt on
    /// first entry; a second anomaly while handling the first wipes storage
    /// before halting.
    fn fault(&mut self) -> ! {
        if self.fault_in_progress {
            self.flash.wipe();
            self.purge_session();
            self.hal.halt();
        }
        self.fault_in_progress = true;
        if pin_log::increase(&mut self.flash, &mut self.hal).is_err() {
            self.flash.wipe();
        }
        self.purge_session();
        self.hal.halt();
    }

    /// Route fault-class errors into the fault guard; everything else
    /// passes through.
    fn guarded<T>(&mut self, result: Result<T, StorageError>) -> Result<T, StorageError> {
        match result {
            Err(StorageError::Fault(_)) => self.fault(),
            other => other,
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Drop cleartext key material and return to the locked state.
    pub fn lock(&mut self) {
        self.purge_session();
    }

    /// Whether protected entries are currently accessible.
    #[must_use]
    pub const fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    fn purge_session(&mut self) {
        self.cache = None;
        self.auth_sum.zeroize();
        self.unlocked = false;
    }

    /// Erase everything and reinitialize to factory state: fresh random
    /// DEK‖SAK, the empty-PIN sentinel, a zeroed retry log. The storage is
    /// locked afterwards; `unlock(PIN_EMPTY)` opens it.
    pub fn wipe(&mut self) {
        self.flash.wipe();
        self.purge_session();
        if self.factory_init().is_err() {
            // Nothing sensitive survives a failed factory reset on erased
            // flash, but the device is unusable.
            self.fault();
        }
    }

    fn factory_init(&mut self) -> Result<(), StorageError> {
        let mut block = [0u8; CACHE_LEN];
        self.hal.fill_random(&mut block);
        self.cache = Some(CachedKeys::new(block));
        block.zeroize();

        let cache = self.cache.as_ref().ok_or(StorageError::Locked)?;
        auth::init(&mut self.flash, cache.sak(), &mut self.auth_sum)?;

        self.set_encrypted(VERSION_KEY, &FORMAT_VERSION.to_le_bytes())?;
        self.set_pin(PIN_EMPTY)?;
        pin_log::init(&mut self.flash, &mut self.hal, 0)?;
        self.lock();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // PIN lifecycle
    // -----------------------------------------------------------------------

    /// Verify a PIN and unlock the storage, under the full brute-force
    /// discipline: exponential backoff sleep, a retry-counter increment
    /// *before* the attempt, and a wipe once the budget is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidPin`] on a wrong PIN and
    /// [`StorageError::AuthenticationFailed`] when the key set or version
    /// pinning fails to verify; both consume a retry.
    pub fn unlock(&mut self, pin: u32) -> Result<(), StorageError> {
        let mut pin = pin;
        let result = self.unlock_with_backoff(pin);
        pin.zeroize();
        self.guarded(result)
    }

    fn unlock_with_backoff(&mut self, pin: u32) -> Result<(), StorageError> {
        let mut pin = pin;
        self.lock();

        let fails = pin_log::get_fails(&self.flash, &mut self.hal)?;
        if fails >= PIN_MAX_TRIES {
            self.flash.wipe();
            self.purge_session();
            self.hal.halt();
        }
        self.backoff_sleep(fails);

        // Pay for the attempt up front, and insist the payment landed.
        pin_log::increase(&mut self.flash, &mut self.hal)?;
        let paid = pin_log::get_fails(&self.flash, &mut self.hal)?;
        if paid != fails.wrapping_add(1) {
            pin.zeroize();
            return Err(StorageError::Fault("retry counter step"));
        }

        let verified = self.verify_pin(pin);
        pin.zeroize();
        match verified {
            Ok(()) => {
                self.unlocked = true;
                pin_log::reset(&mut self.flash, &mut self.hal)?;
                Ok(())
            }
            Err(
                e @ (StorageError::InvalidPin
                | StorageError::AuthenticationFailed
                | StorageError::Corrupted(_)),
            ) => {
                self.purge_session();
                if fails.wrapping_add(1) >= PIN_MAX_TRIES {
                    self.wipe();
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// The raw PIN verification and key load: derive KEK/KEIV, open the
    /// EDEK against the truncated PVC, initialize the running sum over the
    /// authenticated key set, and pin the storage version.
    fn verify_pin(&mut self, pin: u32) -> Result<(), StorageError> {
        let mut pin = pin;
        let Some(entry) = self.flash.get(EDEK_PVC_KEY) else {
            pin.zeroize();
            return Err(StorageError::Corrupted("missing EDEK entry".into()));
        };
        if entry.len() != EDEK_PVC_LEN {
            pin.zeroize();
            return Err(StorageError::Corrupted("EDEK entry length".into()));
        }
        let mut salt = [0u8; RANDOM_SALT_LEN];
        salt.copy_from_slice(&entry[..EDEK_OFFSET]);
        let mut edek = [0u8; CACHE_LEN];
        edek.copy_from_slice(&entry[EDEK_OFFSET..PVC_OFFSET]);
        let mut pvc = [0u8; PVC_LEN];
        pvc.copy_from_slice(&entry[PVC_OFFSET..]);

        let derived = kdf::derive_kek(pin, &self.hardware_salt, &salt);
        pin.zeroize();
        let opened = envelope::open_keys(&derived.kek, &derived.keiv, &edek, &pvc);
        edek.zeroize();
        let plain = match opened {
            Ok(plain) => plain,
            Err(e) => {
                self.hal.wait_random();
                return Err(e);
            }
        };
        self.hal.wait_random();

        let mut block = [0u8; CACHE_LEN];
        block.copy_from_slice(plain.as_slice());
        drop(plain);
        self.cache = Some(CachedKeys::new(block));
        block.zeroize();

        // Initialize the running sum over the verified key set.
        let cache = self.cache.as_ref().ok_or(StorageError::Locked)?;
        let mut sum = [0u8; SUM_LEN];
        if let Err(e) = auth::get(&self.flash, &mut self.hal, cache.sak(), &mut sum, 0) {
            self.purge_session();
            return Err(e);
        }
        self.auth_sum = sum;

        // The encrypted version entry must match the mounted layout version;
        // a rollback of either is an authentication failure.
        let version_ok = match self.get_encrypted_direct(VERSION_KEY) {
            Ok(value) => {
                value.len() == 4
                    && value.as_slice() == self.flash.version().to_le_bytes().as_slice()
            }
            Err(_) => false,
        };
        if !version_ok {
            self.purge_session();
            return Err(StorageError::AuthenticationFailed);
        }
        Ok(())
    }

    /// Re-wrap the cached DEK‖SAK under a PIN: fresh salt, derived KEK/KEIV,
    /// EDEK with the tag truncated to the PVC, and the PIN_NOT_SET marker.
    /// Does not touch the DEK/SAK themselves.
    fn set_pin(&mut self, pin: u32) -> Result<(), StorageError> {
        let mut pin = pin;
        let result = self.set_pin_inner(pin);
        pin.zeroize();
        result
    }

    fn set_pin_inner(&mut self, pin: u32) -> Result<(), StorageError> {
        let mut salt = [0u8; RANDOM_SALT_LEN];
        self.hal.fill_random(&mut salt);

        let cache = self.cache.as_ref().ok_or(StorageError::Locked)?;
        let derived = kdf::derive_kek(pin, &self.hardware_salt, &salt);
        let (edek, tag) = envelope::seal_keys(&derived.kek, &derived.keiv, cache.raw())?;
        drop(derived);

        let mut entry = [0u8; EDEK_PVC_LEN];
        entry[..EDEK_OFFSET].copy_from_slice(&salt);
        entry[EDEK_OFFSET..PVC_OFFSET].copy_from_slice(&edek);
        entry[PVC_OFFSET..].copy_from_slice(&tag[..PVC_LEN]);
        self.flash.set(EDEK_PVC_KEY, &entry)?;

        let marker: u8 = u8::from(pin == PIN_EMPTY);
        self.flash.set(PIN_NOT_SET_KEY, &[marker])?;
        Ok(())
    }

    /// Change the PIN. Requires an unlocked storage and re-verifies the old
    /// PIN under the full brute-force discipline before re-wrapping.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] when locked and
    /// [`StorageError::InvalidPin`] when the old PIN does not verify (which
    /// also leaves the storage locked and consumes a retry).
    pub fn change_pin(&mut self, old_pin: u32, new_pin: u32) -> Result<(), StorageError> {
        let mut old_pin = old_pin;
        let mut new_pin = new_pin;
        let result = self.change_pin_inner(old_pin, new_pin);
        old_pin.zeroize();
        new_pin.zeroize();
        self.guarded(result)
    }

    fn change_pin_inner(&mut self, old_pin: u32, new_pin: u32) -> Result<(), StorageError> {
        if !self.unlocked {
            return Err(StorageError::Locked);
        }
        self.unlock_with_backoff(old_pin)?;
        self.set_pin(new_pin)
    }

    /// Whether a PIN other than the empty sentinel is set.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Corrupted`] if the marker entry is missing or
    /// malformed.
    pub fn has_pin(&self) -> Result<bool, StorageError> {
        let value = self
            .flash
            .get(PIN_NOT_SET_KEY)
            .ok_or_else(|| StorageError::Corrupted("missing PIN marker".into()))?;
        if value.len() != 1 {
            return Err(StorageError::Corrupted("PIN marker length".into()));
        }
        Ok(value[0] == 0x00)
    }

    /// Remaining PIN attempts before the storage wipes itself. Returns 0 if
    /// the retry log cannot be read.
    pub fn get_pin_rem(&mut self) -> u32 {
        match pin_log::get_fails(&self.flash, &mut self.hal) {
            Ok(fails) => PIN_MAX_TRIES.saturating_sub(fails),
            Err(_) => 0,
        }
    }

    /// Exponential backoff before a PIN attempt: 2^(fails−1) seconds, with
    /// the UI callback pumped every tick and a final `(0, 1000)` report.
    fn backoff_sleep(&mut self, fails: u32) {
        #[allow(clippy::arithmetic_side_effects)] // shift bounded: fails < PIN_MAX_TRIES
        let total_ms: u64 = if fails == 0 {
            0
        } else {
            1000u64 << (fails - 1)
        };
        let mut elapsed: u64 = 0;
        while elapsed < total_ms {
            let remaining_s = total_ms.saturating_sub(elapsed).div_ceil(1000);
            let permille = elapsed
                .saturating_mul(1000)
                .checked_div(total_ms)
                .unwrap_or(1000);
            if let Some(callback) = self.ui.as_mut() {
                callback(remaining_s as u32, permille as u32);
            }
            self.hal.delay_ms(BACKOFF_TICK_MS);
            elapsed = elapsed.saturating_add(u64::from(BACKOFF_TICK_MS));
        }
        if let Some(callback) = self.ui.as_mut() {
            callback(0, 1000);
        }
    }

    // -----------------------------------------------------------------------
    // Public key-value API
    // -----------------------------------------------------------------------

    /// Read a value. Public entries are readable while locked; protected
    /// entries require an unlocked storage and verify the storage tag and
    /// the entry envelope on the way.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ReservedNamespace`] for APP 0x00,
    /// [`StorageError::Locked`] for protected reads while locked, and
    /// [`StorageError::KeyNotFound`] when no value is stored.
    pub fn get(&mut self, key: u16) -> Result<Vec<u8>, StorageError> {
        let result = self.get_inner(key);
        self.guarded(result)
    }

    fn get_inner(&mut self, key: u16) -> Result<Vec<u8>, StorageError> {
        if app(key) == 0 {
            return Err(StorageError::ReservedNamespace(key));
        }
        if is_public(key) {
            return self
                .flash
                .get(key)
                .map(<[u8]>::to_vec)
                .ok_or(StorageError::KeyNotFound(key));
        }
        if !self.unlocked {
            return Err(StorageError::Locked);
        }
        let cache = self.cache.as_ref().ok_or(StorageError::Locked)?;

        let mut sum = [0u8; SUM_LEN];
        let sealed = match auth::get(&self.flash, &mut self.hal, cache.sak(), &mut sum, key) {
            Ok(value) => value,
            // A tag mismatch outside the unlock path is a tamper signature.
            Err(StorageError::AuthenticationFailed) => {
                return Err(StorageError::Fault("storage tag"))
            }
            Err(e) => return Err(e),
        };
        self.auth_sum = sum;

        let cache = self.cache.as_ref().ok_or(StorageError::Locked)?;
        let sealed = sealed.ok_or(StorageError::KeyNotFound(key))?;
        match envelope::open_value(cache.dek(), key, &sealed) {
            Ok(plain) => Ok(plain.to_vec()),
            Err(StorageError::AuthenticationFailed) => Err(StorageError::Fault("value envelope")),
            Err(e) => Err(e),
        }
    }

    /// Store a value. Requires an unlocked storage for public and protected
    /// entries alike; protected values go through the envelope and the
    /// authenticator.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ReservedNamespace`] for APP 0x00 and
    /// [`StorageError::Locked`] while locked; propagates flash failures.
    pub fn set(&mut self, key: u16, value: &[u8]) -> Result<(), StorageError> {
        let result = self.set_inner(key, value);
        self.guarded(result)
    }

    fn set_inner(&mut self, key: u16, value: &[u8]) -> Result<(), StorageError> {
        if app(key) == 0 {
            return Err(StorageError::ReservedNamespace(key));
        }
        if !self.unlocked {
            return Err(StorageError::Locked);
        }
        if is_public(key) {
            self.flash.set(key, value)?;
            return Ok(());
        }
        self.set_encrypted(key, value)
    }

    /// Delete a value and drop its key from the authentication tag.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::KeyNotFound`] if no entry exists, plus the
    /// same policy errors as [`Storage::set`].
    pub fn delete(&mut self, key: u16) -> Result<(), StorageError> {
        let result = self.delete_inner(key);
        self.guarded(result)
    }

    fn delete_inner(&mut self, key: u16) -> Result<(), StorageError> {
        if app(key) == 0 {
            return Err(StorageError::ReservedNamespace(key));
        }
        if !self.unlocked {
            return Err(StorageError::Locked);
        }
        let existed = self.flash.delete(key)?;
        if !existed {
            return Err(StorageError::KeyNotFound(key));
        }
        if is_tag_counted(key) {
            let cache = self.cache.as_ref().ok_or(StorageError::Locked)?;
            // XOR is involutive: the same update that added the key
            // removes it.
            auth::update(&mut self.flash, cache.sak(), &mut self.auth_sum, key)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Envelope plumbing
    // -----------------------------------------------------------------------

    /// Write an encrypted entry: pre-allocate at final length through the
    /// authenticator, then fill IV, ciphertext, and tag in place. A failure
    /// mid-write deletes a newly created entry so the tag invariant holds.
    fn set_encrypted(&mut self, key: u16, value: &[u8]) -> Result<(), StorageError> {
        let total = IV_LEN
            .checked_add(value.len())
            .and_then(|n| n.checked_add(TAG_LEN))
            .ok_or_else(|| StorageError::Crypto("value length overflow".into()))?;

        let mut iv = [0u8; IV_LEN];
        self.hal.fill_random(&mut iv);

        let cache = self.cache.as_ref().ok_or(StorageError::Locked)?;
        let existed = auth::set(&mut self.flash, cache.sak(), &mut self.auth_sum, key, total)?;

        if let Err(e) = write_envelope(&mut self.flash, cache.dek(), &iv, key, value) {
            if !existed {
                let _ = self.flash.delete(key);
                let _ = auth::update(&mut self.flash, cache.sak(), &mut self.auth_sum, key);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Decrypt an internal entry directly, without the tag scan. Used for
    /// the version entry, which lives outside the authenticated key set.
    fn get_encrypted_direct(&self, key: u16) -> Result<Zeroizing<Vec<u8>>, StorageError> {
        let cache = self.cache.as_ref().ok_or(StorageError::Locked)?;
        let sealed = self.flash.get(key).ok_or(StorageError::KeyNotFound(key))?;
        envelope::open_value(cache.dek(), key, sealed)
    }

    // -----------------------------------------------------------------------
    // Raw access
    // -----------------------------------------------------------------------

    /// The underlying flash. Bypasses every protection layer; meant for
    /// device tooling and tamper tests.
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Mutable access to the underlying flash. Bypasses every protection
    /// layer; meant for device tooling and tamper tests.
    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }
}

/// Seal and write a value into a pre-allocated entry.
fn write_envelope<F: Flash>(
    flash: &mut F,
    dek: &[u8],
    iv: &[u8; IV_LEN],
    key: u16,
    value: &[u8],
) -> Result<(), StorageError> {
    let (ciphertext, tag) = envelope::seal_value(dek, iv, key, value)?;
    flash.update_bytes(key, 0, iv)?;
    flash.update_bytes(key, IV_LEN, &ciphertext)?;
    let tag_offset = IV_LEN
        .checked_add(ciphertext.len())
        .ok_or_else(|| StorageError::Crypto("value length overflow".into()))?;
    flash.update_bytes(key, tag_offset, &tag)?;
    Ok(())
}

impl<F: Flash, H: Hal> fmt::Debug for Storage<F, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("unlocked", &self.unlocked)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}
