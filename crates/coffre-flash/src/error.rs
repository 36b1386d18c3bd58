//! Flash error types for `coffre-flash`.

use thiserror::Error;

/// Errors produced by flash operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlashError {
    /// No live entry exists for the requested key.
    #[error("no entry for key {0:#06x}")]
    NotFound(u16),

    /// Value exceeds the maximum entry length.
    #[error("value too large: {len} bytes (maximum {max})")]
    ValueTooLarge {
        /// Requested length in bytes.
        len: usize,
        /// Maximum entry length in bytes.
        max: usize,
    },

    /// An in-place update addressed bytes outside the entry.
    #[error("update out of bounds: offset {offset} + {len} exceeds entry of {entry_len} bytes")]
    OutOfBounds {
        /// Byte offset of the update.
        offset: usize,
        /// Length of the update.
        len: usize,
        /// Length of the addressed entry.
        entry_len: usize,
    },

    /// A word update attempted a 0→1 bit transition, which flash cannot
    /// perform without an erase.
    #[error("word update would set bits: {old:#010x} -> {new:#010x}")]
    BitSetViolation {
        /// Word currently on flash.
        old: u32,
        /// Word the caller attempted to write.
        new: u32,
    },
}
