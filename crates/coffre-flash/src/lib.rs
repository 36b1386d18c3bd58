//! `coffre-flash` — append-only flash abstraction for COFFRE.
//!
//! The storage core consumes flash through the [`Flash`] trait: key→value
//! entries addressed by a 16-bit key, in-place byte updates within an entry,
//! iteration, wipe, and a format-version marker. [`RamFlash`] is the host
//! implementation used by tests and tooling; it preserves the one property
//! real NOR flash imposes on the core, that an in-place word write may only
//! clear bits (1→0) until the next erase.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::arithmetic_side_effects))]

pub mod error;
pub mod ram;
pub mod store;

pub use error::FlashError;
pub use ram::RamFlash;
pub use store::{Flash, FORMAT_VERSION, MAX_VALUE_LEN};
