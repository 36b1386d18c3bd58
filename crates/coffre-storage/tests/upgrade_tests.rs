#![allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]

//! Version-0 migration: legacy PIN and fail counter adoption, re-wrapping
//! of user entries, and the layout-version bump.

mod common;

use std::panic::{catch_unwind, AssertUnwindSafe};

use coffre_flash::{Flash, RamFlash, FORMAT_VERSION};
use coffre_storage::{Storage, StorageError, PIN_EMPTY, PIN_MAX_TRIES};

use common::TestHal;

const LEGACY_PIN_KEY: u16 = 0x0000;
const LEGACY_FAILS_KEY: u16 = 0x0001;

fn legacy_image(pin: Option<u32>, fails_word: Option<u32>) -> RamFlash {
    let mut flash = RamFlash::with_version(0);
    if let Some(pin) = pin {
        flash.set(LEGACY_PIN_KEY, &pin.to_le_bytes()).unwrap();
    }
    if let Some(word) = fails_word {
        flash.set(LEGACY_FAILS_KEY, &word.to_le_bytes()).unwrap();
    }
    flash
}

fn migrate(flash: RamFlash, seed: u64) -> Storage<RamFlash, TestHal> {
    Storage::init(flash, TestHal::new(seed), None, b"hardware unit secret")
        .expect("migration must succeed")
}

#[test]
fn migration_bumps_the_layout_version() {
    let storage = migrate(legacy_image(Some(1234), None), 1);
    assert_eq!(storage.flash().version(), FORMAT_VERSION);
}

#[test]
fn legacy_pin_keeps_working_after_migration() {
    let mut storage = migrate(legacy_image(Some(1234), None), 2);
    assert!(storage.has_pin().unwrap());
    storage.unlock(1234).unwrap();
    assert!(storage.is_unlocked());
}

#[test]
fn missing_legacy_pin_migrates_as_empty() {
    let mut storage = migrate(legacy_image(None, None), 3);
    assert!(!storage.has_pin().unwrap());
    storage.unlock(PIN_EMPTY).unwrap();
}

#[test]
fn legacy_plaintext_pin_entry_is_removed() {
    let storage = migrate(legacy_image(Some(1234), None), 4);
    assert!(storage.flash().get(LEGACY_PIN_KEY).is_none());
}

#[test]
fn legacy_fail_counter_is_adopted() {
    // Three cleared bits in the legacy word: three consumed attempts.
    let mut storage = migrate(legacy_image(Some(1234), Some(0xFFFF_FFF8)), 5);
    assert_eq!(storage.get_pin_rem(), PIN_MAX_TRIES - 3);
    storage.unlock(1234).unwrap();
    assert_eq!(storage.get_pin_rem(), PIN_MAX_TRIES);
}

#[test]
fn user_entries_survive_migration_encrypted() {
    let mut flash = legacy_image(Some(7), None);
    flash.set(0x0101, b"legacy protected value").unwrap();
    flash.set(0x8101, b"legacy public value").unwrap();

    let mut storage = migrate(flash, 6);

    // Protected entries are no longer stored in the clear.
    let raw = storage.flash().get(0x0101).unwrap();
    assert!(raw
        .windows(b"legacy protected value".len())
        .all(|w| w != b"legacy protected value".as_slice()));

    // Public entries remain readable while locked.
    assert_eq!(storage.get(0x8101).unwrap(), b"legacy public value");

    storage.unlock(7).unwrap();
    assert_eq!(storage.get(0x0101).unwrap(), b"legacy protected value");
}

#[test]
fn migrated_protected_entries_enter_the_storage_tag() {
    let mut flash = legacy_image(Some(7), None);
    flash.set(0x0101, b"counted").unwrap();
    let mut storage = migrate(flash, 7);
    storage.unlock(7).unwrap();
    // Deleting and re-reading exercises the tag bookkeeping migrated keys
    // participate in.
    storage.delete(0x0101).unwrap();
    assert!(matches!(
        storage.get(0x0101),
        Err(StorageError::KeyNotFound(0x0101))
    ));
}

#[test]
fn malformed_legacy_pin_entry_wipes_and_halts() {
    let mut flash = RamFlash::with_version(0);
    flash.set(LEGACY_PIN_KEY, b"bad").unwrap();

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        Storage::init(flash, TestHal::new(8), None, b"hardware unit secret")
    }));
    let message = *outcome
        .expect_err("malformed legacy image must halt")
        .downcast::<String>()
        .unwrap();
    assert_eq!(message, common::HALT_MSG);
}

#[test]
fn future_layout_version_is_refused() {
    let flash = RamFlash::with_version(FORMAT_VERSION + 1);
    let result = Storage::init(flash, TestHal::new(9), None, b"hardware unit secret");
    assert!(matches!(
        result,
        Err(StorageError::UnsupportedVersion(v)) if v == FORMAT_VERSION + 1
    ));
}
