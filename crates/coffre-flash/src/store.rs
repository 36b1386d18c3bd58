//! The flash contract consumed by the storage core.
//!
//! This module provides:
//! - [`Flash`] — key→value entries with in-place updates and iteration
//! - [`FORMAT_VERSION`] — the current on-flash layout version
//!
//! # Contract
//!
//! Entries are addressed by a 16-bit key and hold up to [`MAX_VALUE_LEN`]
//! bytes. `set` creates or atomically replaces an entry; `allocate` creates a
//! zero-filled entry that the caller then fills through `update_bytes`.
//! `update_word` models NOR flash programming: within an existing entry, a
//! 32-bit little-endian word may transition bits 1→0 only. Iteration visits
//! every live entry in some stable order; `entry_count` lets callers verify
//! that a scan ran to completion.

use crate::error::FlashError;

/// Current on-flash layout version.
pub const FORMAT_VERSION: u32 = 1;

/// Maximum entry value length in bytes (entries carry a 16-bit length).
pub const MAX_VALUE_LEN: usize = 0xFFFF;

/// Key→value flash store with in-place update semantics.
pub trait Flash {
    /// The layout version found when the flash was mounted.
    ///
    /// [`FORMAT_VERSION`] after `wipe` or `upgrade_finish`; older values
    /// indicate a legacy layout awaiting migration.
    fn version(&self) -> u32;

    /// Return the live entry for `key`, if any.
    fn get(&self, key: u16) -> Option<&[u8]>;

    /// Create or replace the entry for `key`.
    ///
    /// Returns whether an entry for `key` already existed.
    ///
    /// # Errors
    ///
    /// Returns [`FlashError::ValueTooLarge`] if `val` exceeds [`MAX_VALUE_LEN`].
    fn set(&mut self, key: u16, val: &[u8]) -> Result<bool, FlashError>;

    /// Create or replace the entry for `key` with `len` zero bytes, to be
    /// filled in place through [`Flash::update_bytes`].
    ///
    /// Returns whether an entry for `key` already existed.
    ///
    /// # Errors
    ///
    /// Returns [`FlashError::ValueTooLarge`] if `len` exceeds [`MAX_VALUE_LEN`].
    fn allocate(&mut self, key: u16, len: usize) -> Result<bool, FlashError>;

    /// Remove the entry for `key`. Returns whether an entry existed.
    fn delete(&mut self, key: u16) -> Result<bool, FlashError>;

    /// Iterate all live entries.
    fn entries(&self) -> Box<dyn Iterator<Item = (u16, &[u8])> + '_>;

    /// Number of live entries. Scans compare their iteration count against
    /// this value to detect truncated or repeated iteration.
    fn entry_count(&self) -> usize;

    /// Write a 32-bit little-endian word in place at `word_index` (in words
    /// from the start of the entry). Bits may only clear.
    ///
    /// # Errors
    ///
    /// Returns [`FlashError::NotFound`] if no entry exists,
    /// [`FlashError::OutOfBounds`] if the word lies outside the entry, and
    /// [`FlashError::BitSetViolation`] if the write would set a cleared bit.
    fn update_word(&mut self, key: u16, word_index: usize, value: u32) -> Result<(), FlashError>;

    /// Overwrite bytes in place within a pre-allocated entry.
    ///
    /// # Errors
    ///
    /// Returns [`FlashError::NotFound`] if no entry exists and
    /// [`FlashError::OutOfBounds`] if the range lies outside the entry.
    fn update_bytes(&mut self, key: u16, offset: usize, buf: &[u8]) -> Result<(), FlashError>;

    /// Erase all entries and reset the layout version to [`FORMAT_VERSION`].
    fn wipe(&mut self);

    /// Commit a layout migration: bump the version to [`FORMAT_VERSION`].
    fn upgrade_finish(&mut self);
}
