//! Brute-force PIN counter log.
//!
//! This module provides:
//! - [`init`] — write a fresh log encoding a given number of consumed attempts
//! - [`increase`] — record one failed attempt by clearing one more data bit
//! - [`reset`] — acknowledge all consumed attempts after a successful unlock
//! - [`get_fails`] — validate the log and return the consumed-attempt count
//!
//! # Layout
//!
//! The log entry is `guard word (1) ‖ success log (16 words) ‖ entry log
//! (16 words)`, 132 bytes of little-endian words, sized so that counter
//! steps are single in-place word writes that only clear bits — no entry
//! rewrite, no erase, no wear.
//!
//! # Guard words
//!
//! Each log is protected by a random guard key: a word with
//! `guard_key mod 6311 = 15`, exactly two set bits among the odd positions
//! of every byte, and no run of five identical bits. Expanding the key
//! yields one guard bit per 2-bit pair (`guard_mask`/`guard`); the other
//! bit of each pair is a data bit. A word is well formed iff its guard bits
//! match, so any single-bit glitch lands either on a guard bit (caught
//! immediately) or on a data bit (caught by the run-shape check).
//!
//! # Counter encoding
//!
//! A word's 16 data bits drain from all-ones (`unused`) to all-zeros
//! (`guard`), one bit per failed attempt, always in `0…01…1` run form. The
//! success log lags the entry log and is advanced to match on successful
//! unlock; the consumed-attempt count is the population of the XOR between
//! the two logs. With [`PIN_MAX_TRIES`] = 16, a single word covers the full
//! retry range and the 16 words cover the device lifetime.

use core::hint::black_box;

use coffre_flash::Flash;

use crate::error::StorageError;
use crate::hal::{random_u32, Hal};
use crate::keys::PIN_LOGS_KEY;

/// Maximum PIN retries before the storage wipes itself.
pub const PIN_MAX_TRIES: u32 = 16;

/// Words per log (success and entry each).
const PIN_LOG_WORDS: usize = 16;

/// Word index of the guard key within the entry.
const GUARD_KEY_INDEX: usize = 0;

/// Word index of the first success-log word.
const SUCCESS_LOG_INDEX: usize = 1;

/// Word index of the first entry-log word.
const ENTRY_LOG_INDEX: usize = 1 + PIN_LOG_WORDS;

/// Total log entry length in bytes.
pub(crate) const PIN_LOGS_LEN: usize = 4 * (1 + 2 * PIN_LOG_WORDS);

/// Guard keys satisfy `guard_key mod MODULUS == REMAINDER`.
const GUARD_KEY_MODULUS: u32 = 6311;
const GUARD_KEY_REMAINDER: u32 = 15;

/// Even-position bit mask.
const LOW_MASK: u32 = 0x5555_5555;

// ---------------------------------------------------------------------------
// Guard key
// ---------------------------------------------------------------------------

/// Check the three guard-key fingerprint conditions.
#[allow(clippy::arithmetic_side_effects)] // fixed-width bit ops and a guarded modulus
fn check_guard_key(guard_key: u32) -> bool {
    if guard_key % GUARD_KEY_MODULUS != GUARD_KEY_REMAINDER {
        return false;
    }
    // Exactly two of the four odd-position bits set in each byte.
    let odd = guard_key & 0xAAAA_AAAA;
    for byte in odd.to_le_bytes() {
        if byte.count_ones() != 2 {
            return false;
        }
    }
    // No run of five or more identical bits.
    let ones = guard_key & (guard_key >> 1) & (guard_key >> 2) & (guard_key >> 3) & (guard_key >> 4);
    let inv = !guard_key;
    let zeros = inv & (inv >> 1) & (inv >> 2) & (inv >> 3) & (inv >> 4);
    ones == 0 && zeros == 0
}

/// Draw a fresh guard key from the HAL RNG.
#[allow(clippy::arithmetic_side_effects)] // wrapping projection onto the residue class
fn generate_guard_key<H: Hal>(hal: &mut H) -> u32 {
    loop {
        let r = random_u32(hal);
        // Project onto the residue class; check_guard_key re-validates it
        // along with the bit-pattern conditions.
        let candidate = r
            .wrapping_sub(r % GUARD_KEY_MODULUS)
            .wrapping_add(GUARD_KEY_REMAINDER);
        if check_guard_key(candidate) {
            return candidate;
        }
    }
}

/// Expand a guard key into the guard-bit positions and their values.
///
/// Each 2-bit pair holds one guard bit and one data bit; the even bit of the
/// key selects which side of the pair the guard occupies and the odd bit
/// supplies its value.
#[allow(clippy::arithmetic_side_effects)] // fixed-width bit ops
const fn expand_guard_key(guard_key: u32) -> (u32, u32) {
    let guard_mask = ((guard_key & LOW_MASK) << 1) | (!guard_key & LOW_MASK);
    let guard = (((guard_key & LOW_MASK) << 1) & guard_key) | ((!guard_key & LOW_MASK) & (guard_key >> 1));
    (guard_mask, guard)
}

// ---------------------------------------------------------------------------
// Data-bit normalization
// ---------------------------------------------------------------------------

/// Strip guard bits and mirror each surviving data bit across its pair.
#[allow(clippy::arithmetic_side_effects)] // fixed-width bit ops
const fn normalize(word: u32, guard_mask: u32) -> u32 {
    let data = word & !guard_mask;
    let even = (data | (data >> 1)) & LOW_MASK;
    even | (even << 1)
}

/// Collapse a normalized word's 16 duplicated pairs to 16 logical bits.
#[allow(clippy::arithmetic_side_effects)] // fixed-width bit ops
const fn collapse(norm: u32) -> u16 {
    let mut x = norm & LOW_MASK;
    x = (x | (x >> 1)) & 0x3333_3333;
    x = (x | (x >> 2)) & 0x0F0F_0F0F;
    x = (x | (x >> 4)) & 0x00FF_00FF;
    x = (x | (x >> 8)) & 0x0000_FFFF;
    x as u16
}

/// Spread 16 logical bits back into duplicated pairs.
#[allow(clippy::arithmetic_side_effects)] // fixed-width bit ops
const fn expand_bits(bits: u16) -> u32 {
    let mut x = bits as u32;
    x = (x | (x << 8)) & 0x00FF_00FF;
    x = (x | (x << 4)) & 0x0F0F_0F0F;
    x = (x | (x << 2)) & 0x3333_3333;
    x = (x | (x << 1)) & LOW_MASK;
    x | (x << 1)
}

/// Logical data bits must always form a `0…01…1` run.
#[allow(clippy::arithmetic_side_effects)] // c+1 cannot overflow past the check
const fn is_ones_run(c: u16) -> bool {
    c & c.wrapping_add(1) == 0
}

/// Rebuild the physical word for a logical data value under a guard pattern.
#[allow(clippy::arithmetic_side_effects)] // fixed-width bit ops
const fn to_word(bits: u16, guard_mask: u32, guard: u32) -> u32 {
    guard | (expand_bits(bits) & !guard_mask)
}

// ---------------------------------------------------------------------------
// Log parsing
// ---------------------------------------------------------------------------

/// Parsed and guard-checked PIN logs.
struct Logs {
    guard_mask: u32,
    guard: u32,
    unused: u32,
    success: [u32; PIN_LOG_WORDS],
    entry: [u32; PIN_LOG_WORDS],
}

impl Logs {
    /// Read and validate the log entry: length, guard-key fingerprint, and
    /// the guard bits of every word. Any mismatch is a fault signature.
    fn read<F: Flash>(flash: &F) -> Result<Self, StorageError> {
        let data = flash
            .get(PIN_LOGS_KEY)
            .ok_or(StorageError::Fault("pin log missing"))?;
        if data.len() != PIN_LOGS_LEN {
            return Err(StorageError::Fault("pin log length"));
        }

        let word_at = |index: usize| -> u32 {
            let mut bytes = [0u8; 4];
            let offset = index.saturating_mul(4);
            bytes.copy_from_slice(&data[offset..offset.saturating_add(4)]);
            u32::from_le_bytes(bytes)
        };

        let guard_key = word_at(GUARD_KEY_INDEX);
        if !check_guard_key(guard_key) {
            return Err(StorageError::Fault("guard key"));
        }
        let (guard_mask, guard) = expand_guard_key(guard_key);
        let unused = guard | !guard_mask;

        let mut success = [0u32; PIN_LOG_WORDS];
        let mut entry = [0u32; PIN_LOG_WORDS];
        let mut scanned = 0u32;
        for i in 0..PIN_LOG_WORDS {
            success[i] = word_at(SUCCESS_LOG_INDEX.saturating_add(i));
            entry[i] = word_at(ENTRY_LOG_INDEX.saturating_add(i));
            if success[i] & guard_mask != guard || entry[i] & guard_mask != guard {
                return Err(StorageError::Fault("log word guard bits"));
            }
            scanned = scanned.wrapping_add(1);
        }
        if black_box(scanned) != PIN_LOG_WORDS as u32 {
            return Err(StorageError::Fault("log scan"));
        }

        Ok(Self {
            guard_mask,
            guard,
            unused,
            success,
            entry,
        })
    }

    fn entry_bits(&self, i: usize) -> u16 {
        collapse(normalize(self.entry[i], self.guard_mask))
    }

    fn success_bits(&self, i: usize) -> u16 {
        collapse(normalize(self.success[i], self.guard_mask))
    }

    /// Structural validation beyond guard bits: every word pair in run form
    /// with the entry log draining ahead of the success log, fully drained
    /// words only ever ahead of the write frontier, untouched words only
    /// behind it.
    fn validate_shape(&self) -> Result<(), StorageError> {
        // Index of the last word that has been written to.
        let mut frontier = 0usize;
        let mut scanned = 0u32;
        for i in 0..PIN_LOG_WORDS {
            if self.entry[i] != self.unused || self.success[i] != self.unused {
                frontier = i;
            }
            scanned = scanned.wrapping_add(1);
        }
        if black_box(scanned) != PIN_LOG_WORDS as u32 {
            return Err(StorageError::Fault("log scan"));
        }

        scanned = 0;
        for i in 0..PIN_LOG_WORDS {
            let e = self.entry_bits(i);
            let s = self.success_bits(i);
            if !is_ones_run(e) || !is_ones_run(s) {
                return Err(StorageError::Fault("log word shape"));
            }
            // The entry log records an attempt before the success log
            // acknowledges it, never the other way around.
            if e & s != e {
                return Err(StorageError::Fault("success log ahead of entry log"));
            }
            if i < frontier && self.entry[i] != self.guard {
                return Err(StorageError::Fault("undrained word behind frontier"));
            }
            if i > frontier && (self.entry[i] != self.unused || self.success[i] != self.unused) {
                return Err(StorageError::Fault("touched word past frontier"));
            }
            scanned = scanned.wrapping_add(1);
        }
        if black_box(scanned) != PIN_LOG_WORDS as u32 {
            return Err(StorageError::Fault("log scan"));
        }
        Ok(())
    }

    /// Consumed attempts: population of the XOR between the two logs.
    fn fails(&self) -> u32 {
        let mut total = 0u32;
        for i in 0..PIN_LOG_WORDS {
            total = total.wrapping_add((self.success_bits(i) ^ self.entry_bits(i)).count_ones());
        }
        total
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Write a fresh log under a new guard key, encoding `fails` consumed
/// attempts in the first entry word.
///
/// # Errors
///
/// Propagates flash write failures.
pub(crate) fn init<F: Flash, H: Hal>(
    flash: &mut F,
    hal: &mut H,
    fails: u32,
) -> Result<(), StorageError> {
    let fails = fails.min(PIN_MAX_TRIES);
    let guard_key = generate_guard_key(hal);
    let (guard_mask, guard) = expand_guard_key(guard_key);
    let unused = guard | !guard_mask;

    let first_entry = if fails >= 16 {
        guard
    } else {
        // Shift bounded by the branch.
        #[allow(clippy::arithmetic_side_effects)]
        let bits = 0xFFFFu16 >> fails;
        to_word(bits, guard_mask, guard)
    };

    let mut buf = [0u8; PIN_LOGS_LEN];
    buf[..4].copy_from_slice(&guard_key.to_le_bytes());
    for i in 0..PIN_LOG_WORDS {
        let success_off = SUCCESS_LOG_INDEX.saturating_add(i).saturating_mul(4);
        buf[success_off..success_off.saturating_add(4)].copy_from_slice(&unused.to_le_bytes());
        let entry_off = ENTRY_LOG_INDEX.saturating_add(i).saturating_mul(4);
        let word = if i == 0 { first_entry } else { unused };
        buf[entry_off..entry_off.saturating_add(4)].copy_from_slice(&word.to_le_bytes());
    }
    flash.set(PIN_LOGS_KEY, &buf)?;
    Ok(())
}

/// Record one failed attempt: clear one more data bit in the first entry
/// word that still has data bits, advancing its `0…0` prefix by one.
///
/// # Errors
///
/// Returns a `Fault` on any malformed word, an exhausted log, or a write
/// that does not read back; the caller routes these to the fault guard.
pub(crate) fn increase<F: Flash, H: Hal>(flash: &mut F, hal: &mut H) -> Result<(), StorageError> {
    let logs = Logs::read(flash)?;

    let mut index = PIN_LOG_WORDS;
    let mut scanned = 0u32;
    for i in 0..PIN_LOG_WORDS {
        if index == PIN_LOG_WORDS && logs.entry[i] != logs.guard {
            index = i;
            hal.wait_random();
        }
        scanned = scanned.wrapping_add(1);
    }
    if black_box(scanned) != PIN_LOG_WORDS as u32 {
        return Err(StorageError::Fault("log scan"));
    }
    if index == PIN_LOG_WORDS {
        return Err(StorageError::Fault("entry log exhausted"));
    }

    let bits = logs.entry_bits(index);
    if !is_ones_run(bits) || bits == 0 {
        return Err(StorageError::Fault("entry word shape"));
    }
    #[allow(clippy::arithmetic_side_effects)] // run form: shift clears exactly the top set bit
    let drained = bits & (bits >> 1);
    if drained.count_ones().wrapping_add(1) != bits.count_ones() {
        return Err(StorageError::Fault("drain step"));
    }

    let word = to_word(drained, logs.guard_mask, logs.guard);
    flash.update_word(PIN_LOGS_KEY, ENTRY_LOG_INDEX.saturating_add(index), word)?;

    // The write must read back exactly; a glitched program operation is an
    // attack signature.
    hal.wait_random();
    let reread = Logs::read(flash)?;
    if reread.entry[index] != word {
        return Err(StorageError::Fault("drain readback"));
    }
    Ok(())
}

/// Acknowledge all consumed attempts after a successful PIN entry by
/// advancing each success word to its entry word. A fully drained log is
/// re-initialized at zero.
///
/// # Errors
///
/// Returns a `Fault` on malformed words; propagates flash failures.
pub(crate) fn reset<F: Flash, H: Hal>(flash: &mut F, hal: &mut H) -> Result<(), StorageError> {
    let logs = Logs::read(flash)?;

    let mut scanned = 0u32;
    for i in 0..PIN_LOG_WORDS {
        if logs.success[i] != logs.entry[i] {
            // Entry words only ever drain ahead of success words, so this
            // write clears bits; anything else errors out at the flash layer.
            flash.update_word(
                PIN_LOGS_KEY,
                SUCCESS_LOG_INDEX.saturating_add(i),
                logs.entry[i],
            )?;
        }
        scanned = scanned.wrapping_add(1);
    }
    if black_box(scanned) != PIN_LOG_WORDS as u32 {
        return Err(StorageError::Fault("log scan"));
    }

    let reread = Logs::read(flash)?;
    let exhausted = reread.entry.iter().all(|&w| w == reread.guard);
    if exhausted {
        hal.wait_random();
        init(flash, hal, 0)?;
    }
    Ok(())
}

/// Validate the whole log and return the consumed-attempt count.
///
/// # Errors
///
/// Returns a `Fault` on any guard, shape, or ordering violation.
pub(crate) fn get_fails<F: Flash, H: Hal>(flash: &F, hal: &mut H) -> Result<u32, StorageError> {
    let logs = Logs::read(flash)?;
    logs.validate_shape()?;
    hal.wait_random();
    Ok(logs.fails())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::TestHal;
    use coffre_flash::RamFlash;

    fn fresh() -> (RamFlash, TestHal) {
        let mut flash = RamFlash::new();
        let mut hal = TestHal::new(7);
        init(&mut flash, &mut hal, 0).unwrap();
        (flash, hal)
    }

    #[test]
    fn guard_key_fingerprint_accepts_known_good_shape() {
        // 0x55AA69A5-style patterns are not automatically valid; generate and
        // confirm the generator only emits keys the checker accepts.
        let mut hal = TestHal::new(1);
        for _ in 0..8 {
            let key = generate_guard_key(&mut hal);
            assert!(check_guard_key(key));
            assert_eq!(key % GUARD_KEY_MODULUS, GUARD_KEY_REMAINDER);
        }
    }

    #[test]
    fn guard_key_rejects_all_zeros_and_all_ones() {
        assert!(!check_guard_key(0));
        assert!(!check_guard_key(u32::MAX));
    }

    #[test]
    fn guard_key_rejects_single_bit_flips() {
        let mut hal = TestHal::new(2);
        let key = generate_guard_key(&mut hal);
        for bit in 0..32u32 {
            assert!(
                !check_guard_key(key ^ (1u32 << bit)),
                "flip of bit {bit} must invalidate the guard key"
            );
        }
    }

    #[test]
    fn expand_produces_one_guard_bit_per_pair() {
        let mut hal = TestHal::new(3);
        let key = generate_guard_key(&mut hal);
        let (mask, guard) = expand_guard_key(key);
        for pair in 0..16 {
            let pair_mask = (mask >> (2 * pair)) & 0b11;
            assert!(pair_mask == 0b01 || pair_mask == 0b10);
        }
        assert_eq!(guard & !mask, 0, "guard values confined to guard positions");
    }

    #[test]
    fn normalize_collapse_expand_roundtrip() {
        let mut hal = TestHal::new(4);
        let key = generate_guard_key(&mut hal);
        let (mask, guard) = expand_guard_key(key);
        for bits in [0u16, 1, 0x00FF, 0x7FFF, 0xFFFF] {
            let word = to_word(bits, mask, guard);
            assert_eq!(word & mask, guard);
            assert_eq!(collapse(normalize(word, mask)), bits);
        }
    }

    #[test]
    fn fresh_log_counts_zero_fails() {
        let (flash, mut hal) = fresh();
        assert_eq!(get_fails(&flash, &mut hal).unwrap(), 0);
    }

    #[test]
    fn init_encodes_preexisting_fails() {
        let mut flash = RamFlash::new();
        let mut hal = TestHal::new(5);
        for fails in [0u32, 1, 7, 15, 16] {
            init(&mut flash, &mut hal, fails).unwrap();
            assert_eq!(get_fails(&flash, &mut hal).unwrap(), fails);
        }
    }

    #[test]
    fn increase_advances_by_exactly_one() {
        let (mut flash, mut hal) = fresh();
        for expected in 1..=PIN_MAX_TRIES {
            increase(&mut flash, &mut hal).unwrap();
            assert_eq!(get_fails(&flash, &mut hal).unwrap(), expected);
        }
    }

    #[test]
    fn reset_returns_count_to_zero() {
        let (mut flash, mut hal) = fresh();
        for _ in 0..5 {
            increase(&mut flash, &mut hal).unwrap();
        }
        reset(&mut flash, &mut hal).unwrap();
        assert_eq!(get_fails(&flash, &mut hal).unwrap(), 0);
    }

    #[test]
    fn count_survives_interleaved_resets() {
        let (mut flash, mut hal) = fresh();
        for round in 0..6 {
            for step in 1..=3 {
                increase(&mut flash, &mut hal).unwrap();
                assert_eq!(get_fails(&flash, &mut hal).unwrap(), step, "round {round}");
            }
            reset(&mut flash, &mut hal).unwrap();
            assert_eq!(get_fails(&flash, &mut hal).unwrap(), 0, "round {round}");
        }
    }

    #[test]
    fn log_words_drain_across_word_boundaries() {
        // 16 cumulative attempts retire the first word pair; the counter
        // keeps working from the second.
        let (mut flash, mut hal) = fresh();
        for _ in 0..4 {
            for _ in 0..4 {
                increase(&mut flash, &mut hal).unwrap();
            }
            reset(&mut flash, &mut hal).unwrap();
        }
        assert_eq!(get_fails(&flash, &mut hal).unwrap(), 0);
        increase(&mut flash, &mut hal).unwrap();
        assert_eq!(get_fails(&flash, &mut hal).unwrap(), 1);
    }

    #[test]
    fn spill_into_next_word_keeps_counting() {
        // 5 acknowledged, then failures exhaust word 0 and spill into word 1.
        let (mut flash, mut hal) = fresh();
        for _ in 0..5 {
            increase(&mut flash, &mut hal).unwrap();
        }
        reset(&mut flash, &mut hal).unwrap();
        for expected in 1..=12 {
            increase(&mut flash, &mut hal).unwrap();
            assert_eq!(get_fails(&flash, &mut hal).unwrap(), expected);
        }
    }

    #[test]
    fn full_lifetime_drain_reinitializes() {
        // 16 words × 16 attempts, all acknowledged: reset re-inits at zero.
        let (mut flash, mut hal) = fresh();
        for _ in 0..PIN_LOG_WORDS {
            for _ in 0..16 {
                increase(&mut flash, &mut hal).unwrap();
            }
            reset(&mut flash, &mut hal).unwrap();
            assert_eq!(get_fails(&flash, &mut hal).unwrap(), 0);
        }
        increase(&mut flash, &mut hal).unwrap();
        assert_eq!(get_fails(&flash, &mut hal).unwrap(), 1);
    }

    #[test]
    fn sixteen_straight_failures_stay_visible() {
        // The transient state before the wipe must still read as 16, not
        // roll over to zero.
        let (mut flash, mut hal) = fresh();
        for _ in 0..16 {
            increase(&mut flash, &mut hal).unwrap();
        }
        assert_eq!(get_fails(&flash, &mut hal).unwrap(), 16);
    }

    #[test]
    fn corrupted_guard_key_is_a_fault() {
        let (mut flash, mut hal) = fresh();
        let mut data = flash.get(PIN_LOGS_KEY).unwrap().to_vec();
        data[0] ^= 0x01;
        flash.set(PIN_LOGS_KEY, &data).unwrap();
        assert!(matches!(
            get_fails(&flash, &mut hal),
            Err(StorageError::Fault(_))
        ));
    }

    #[test]
    fn no_single_bit_flip_goes_unnoticed() {
        // Flip one bit in every log word position in turn. A flip on a guard
        // bit, a success word, or a word behind/past the frontier faults; the
        // one flip indistinguishable from a legitimate drain step may read as
        // a consumed attempt. Nothing may read back as an untouched log.
        let (mut flash, mut hal) = fresh();
        let data = flash.get(PIN_LOGS_KEY).unwrap().to_vec();
        let mut silent = 0u32;
        for word in 1..(1 + 2 * PIN_LOG_WORDS) {
            for bit in 0..32usize {
                let mut tampered = data.clone();
                tampered[word * 4 + bit / 8] ^= 1u8 << (bit % 8);
                flash.set(PIN_LOGS_KEY, &tampered).unwrap();
                match get_fails(&flash, &mut hal) {
                    Err(StorageError::Fault(_)) => {}
                    Ok(fails) => {
                        assert_ne!(fails, 0, "word {word} bit {bit} flip read as untouched");
                        silent += 1;
                    }
                    Err(other) => panic!("unexpected error for word {word} bit {bit}: {other}"),
                }
            }
        }
        // Only the frontier data bit of the first entry word can masquerade
        // as a drain step.
        assert!(silent <= 1, "{silent} flips went undetected");
    }

    #[test]
    fn truncated_log_entry_is_a_fault() {
        let (mut flash, mut hal) = fresh();
        let data = flash.get(PIN_LOGS_KEY).unwrap().to_vec();
        flash.set(PIN_LOGS_KEY, &data[..PIN_LOGS_LEN - 4]).unwrap();
        assert!(matches!(
            get_fails(&flash, &mut hal),
            Err(StorageError::Fault(_))
        ));
    }

    #[test]
    fn missing_log_entry_is_a_fault() {
        let flash = RamFlash::new();
        let mut hal = TestHal::new(6);
        assert!(matches!(
            get_fails(&flash, &mut hal),
            Err(StorageError::Fault(_))
        ));
    }
}
