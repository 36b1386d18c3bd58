//! Version-0 layout migration.
//!
//! The legacy layout stored the PIN in plaintext (key 0x0000) and the fail
//! counter as a bit-cleared word array (key 0x0001); user entries were not
//! enveloped and no storage tag existed. Migration trusts the legacy data —
//! the PIN and counter are read without verification, matching the policy
//! of the original layout — draws fresh key material, re-wraps everything,
//! and only then commits the layout-version bump. The caller wipes and
//! halts if any step fails.

use core::hint::black_box;

use zeroize::{Zeroize, Zeroizing};

use coffre_flash::{Flash, FORMAT_VERSION};

use crate::auth;
use crate::error::StorageError;
use crate::hal::Hal;
use crate::keys::{app, is_public, LEGACY_FAILS_KEY, LEGACY_PIN_KEY, VERSION_KEY};
use crate::memory::{CachedKeys, CACHE_LEN};
use crate::pin_log::{self, PIN_MAX_TRIES};

use super::{Storage, PIN_EMPTY};

/// Migrate a mounted version-0 flash in place.
pub(super) fn from_version_0<F: Flash, H: Hal>(
    storage: &mut Storage<F, H>,
) -> Result<(), StorageError> {
    // Read the legacy values before their slots are overwritten: the PIN
    // logs reuse the legacy counter's key.
    let mut legacy_pin = match storage.flash.get(LEGACY_PIN_KEY) {
        Some(value) => {
            let Ok(bytes) = <[u8; 4]>::try_from(value) else {
                return Err(StorageError::Corrupted("legacy PIN entry".into()));
            };
            u32::from_le_bytes(bytes)
        }
        None => PIN_EMPTY,
    };
    let legacy_fails = storage
        .flash
        .get(LEGACY_FAILS_KEY)
        .map_or(0, decode_legacy_fails);

    let user_keys: Vec<u16> = storage
        .flash
        .entries()
        .map(|(key, _)| key)
        .filter(|&key| app(key) != 0)
        .collect();
    let expected = user_keys.len();

    // Fresh key material; the storage is transiently unlocked while the
    // entries are re-wrapped.
    let mut block = [0u8; CACHE_LEN];
    storage.hal.fill_random(&mut block);
    storage.cache = Some(CachedKeys::new(block));
    block.zeroize();

    let cache = storage.cache.as_ref().ok_or(StorageError::Locked)?;
    auth::init(&mut storage.flash, cache.sak(), &mut storage.auth_sum)?;
    storage.set_encrypted(VERSION_KEY, &FORMAT_VERSION.to_le_bytes())?;

    storage.set_pin(legacy_pin)?;
    legacy_pin.zeroize();
    pin_log::init(&mut storage.flash, &mut storage.hal, legacy_fails)?;
    storage.flash.delete(LEGACY_PIN_KEY)?;

    // Re-store the user entries: protected ones gain an envelope and enter
    // the storage tag, public ones keep their plaintext representation.
    let mut migrated = 0usize;
    for &key in &user_keys {
        if !is_public(key) {
            let value = match storage.flash.get(key) {
                Some(value) => Zeroizing::new(value.to_vec()),
                None => return Err(StorageError::Fault("migration scan")),
            };
            storage.flash.delete(key)?;
            storage.set_encrypted(key, &value)?;
        }
        migrated = migrated.wrapping_add(1);
    }
    if black_box(migrated) != expected {
        return Err(StorageError::Fault("migration count"));
    }

    storage.lock();
    storage.flash.upgrade_finish();
    Ok(())
}

/// Decode the legacy bit-cleared fail counter: the Hamming weight of the
/// first non-zero word's complement. A present but fully drained counter
/// reads as the maximum, so the next unlock wipes rather than granting a
/// fresh budget.
fn decode_legacy_fails(data: &[u8]) -> u32 {
    for chunk in data.chunks_exact(4) {
        let Ok(bytes) = <[u8; 4]>::try_from(chunk) else {
            continue;
        };
        let word = u32::from_le_bytes(bytes);
        if word != 0 {
            return (!word).count_ones().min(PIN_MAX_TRIES);
        }
    }
    PIN_MAX_TRIES
}
