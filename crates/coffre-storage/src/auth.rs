//! Storage authentication tag maintenance.
//!
//! The storage tag authenticates the *set* of protected keys present in
//! flash: `STORAGE_TAG = HMAC-SAK(⊕ over protected keys k of HMAC-SAK(k))`.
//! XOR makes membership updates involutive — adding and removing a key are
//! the same operation on the running sum — while the outer HMAC keeps the
//! sum itself unforgeable. Public entries and the reserved internal
//! namespace stay outside the tag.
//!
//! [`get`] is the verification path: one linear scan over flash that
//! recomputes the sum, picks up the requested key's value and the stored tag
//! in the same pass, and only repopulates the caller's running sum once the
//! tag verifies. Scan anomalies (short iteration, a key that is counted but
//! not seen, duplicate entries) are fault signatures, not benign misses.

use core::hint::black_box;

use coffre_flash::Flash;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::ct;
use crate::error::StorageError;
use crate::hal::Hal;
use crate::keys::{is_tag_counted, STORAGE_TAG_KEY};

type HmacSha256 = Hmac<Sha256>;

/// Running authentication sum length in bytes (one HMAC-SHA256 output).
pub(crate) const SUM_LEN: usize = 32;

/// Stored storage-tag length in bytes.
pub(crate) const TAG_LEN: usize = 16;

/// HMAC-SAK over a key id, encoded low byte first.
fn key_mac(sak: &[u8], key: u16) -> [u8; SUM_LEN] {
    let mut mac = HmacSha256::new_from_slice(sak).expect("HMAC accepts any key length");
    mac.update(&key.to_le_bytes());
    mac.finalize().into_bytes().into()
}

/// The stored tag for a running sum: HMAC-SAK(sum), truncated to 16 bytes.
fn tag_of(sak: &[u8], sum: &[u8; SUM_LEN]) -> [u8; TAG_LEN] {
    let mut mac = HmacSha256::new_from_slice(sak).expect("HMAC accepts any key length");
    mac.update(sum);
    let full: [u8; SUM_LEN] = mac.finalize().into_bytes().into();
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&full[..TAG_LEN]);
    tag
}

fn xor_into(sum: &mut [u8; SUM_LEN], mac: &[u8; SUM_LEN]) {
    for (s, m) in sum.iter_mut().zip(mac.iter()) {
        *s ^= *m;
    }
}

/// Zero the running sum and store the tag over the empty key set.
///
/// # Errors
///
/// Propagates flash write failures.
pub(crate) fn init<F: Flash>(
    flash: &mut F,
    sak: &[u8],
    sum: &mut [u8; SUM_LEN],
) -> Result<(), StorageError> {
    *sum = [0u8; SUM_LEN];
    let tag = tag_of(sak, sum);
    flash.set(STORAGE_TAG_KEY, &tag)?;
    Ok(())
}

/// Toggle a key's membership in the tag and persist the new tag.
///
/// No-op for keys outside the tag (public or reserved namespace). The
/// running sum is only committed once the tag write succeeded.
///
/// # Errors
///
/// Propagates flash write failures.
pub(crate) fn update<F: Flash>(
    flash: &mut F,
    sak: &[u8],
    sum: &mut [u8; SUM_LEN],
    key: u16,
) -> Result<(), StorageError> {
    if !is_tag_counted(key) {
        return Ok(());
    }
    let mut new_sum = *sum;
    xor_into(&mut new_sum, &key_mac(sak, key));
    let tag = tag_of(sak, &new_sum);
    flash.set(STORAGE_TAG_KEY, &tag)?;
    *sum = new_sum;
    Ok(())
}

/// Allocate an entry through the authenticator.
///
/// The tag is updated exactly when the entry is newly created — never on
/// overwrite, since the tag covers the key set, not values. If the tag
/// update fails the fresh entry is deleted so the invariant holds.
///
/// # Errors
///
/// Propagates flash failures; surfaces the tag-update failure after rolling
/// the creation back.
pub(crate) fn set<F: Flash>(
    flash: &mut F,
    sak: &[u8],
    sum: &mut [u8; SUM_LEN],
    key: u16,
    len: usize,
) -> Result<bool, StorageError> {
    let existed = flash.allocate(key, len)?;
    if !existed {
        if let Err(e) = update(flash, sak, sum, key) {
            let _ = flash.delete(key);
            return Err(e);
        }
    }
    Ok(existed)
}

/// Scan flash, verify the stored tag, and return the requested key's value.
///
/// Recomputes the sum over all tag-counted keys in one pass, caching the
/// requested value and the stored tag on the way. The caller's running sum
/// is repopulated only after the tag verifies. `key` 0 requests no value and
/// is used at unlock time purely to initialize the sum.
///
/// # Errors
///
/// Returns [`StorageError::AuthenticationFailed`] when the stored tag is
/// absent or does not match, and a `Fault` on iteration anomalies or a
/// counted-but-unseen key.
pub(crate) fn get<F: Flash, H: Hal>(
    flash: &F,
    hal: &mut H,
    sak: &[u8],
    sum: &mut [u8; SUM_LEN],
    key: u16,
) -> Result<Option<Vec<u8>>, StorageError> {
    let expected = flash.entry_count();
    let mut scanned = 0usize;
    let mut new_sum = [0u8; SUM_LEN];
    let mut value: Option<Vec<u8>> = None;
    let mut seen = 0usize;
    let mut stored_tag: Option<[u8; TAG_LEN]> = None;

    for (k, val) in flash.entries() {
        scanned = scanned.wrapping_add(1);
        if k == STORAGE_TAG_KEY {
            let Ok(tag) = <[u8; TAG_LEN]>::try_from(val) else {
                return Err(StorageError::Fault("storage tag length"));
            };
            stored_tag = Some(tag);
        }
        if !is_tag_counted(k) {
            continue;
        }
        xor_into(&mut new_sum, &key_mac(sak, k));
        if k == key {
            seen = seen.wrapping_add(1);
            value = Some(val.to_vec());
        }
    }
    if black_box(scanned) != expected {
        return Err(StorageError::Fault("entry scan"));
    }
    hal.wait_random();

    let Some(tag) = stored_tag else {
        return Err(StorageError::AuthenticationFailed);
    };
    if !ct::eq(&tag_of(sak, &new_sum), &tag) {
        return Err(StorageError::AuthenticationFailed);
    }
    hal.wait_random();

    // The single pass and the direct lookup must agree on the key's
    // existence; disagreement means the iteration was tampered with.
    if key != 0 && (flash.get(key).is_some() != value.is_some() || seen > 1) {
        return Err(StorageError::Fault("key presence"));
    }

    *sum = new_sum;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::TestHal;
    use coffre_flash::RamFlash;

    const SAK: [u8; 16] = [0x33; 16];

    fn fresh() -> (RamFlash, TestHal, [u8; SUM_LEN]) {
        let mut flash = RamFlash::new();
        let mut sum = [0u8; SUM_LEN];
        init(&mut flash, &SAK, &mut sum).unwrap();
        (flash, TestHal::new(11), sum)
    }

    #[test]
    fn empty_set_tag_verifies() {
        let (flash, mut hal, mut sum) = fresh();
        let got = get(&flash, &mut hal, &SAK, &mut sum, 0).unwrap();
        assert!(got.is_none());
        assert_eq!(sum, [0u8; SUM_LEN]);
    }

    #[test]
    fn created_key_enters_the_tag() {
        let (mut flash, mut hal, mut sum) = fresh();
        let existed = set(&mut flash, &SAK, &mut sum, 0x0101, 4).unwrap();
        assert!(!existed);
        flash.update_bytes(0x0101, 0, b"abcd").unwrap();

        let mut scan_sum = [0u8; SUM_LEN];
        let got = get(&flash, &mut hal, &SAK, &mut scan_sum, 0x0101).unwrap();
        assert_eq!(got.as_deref(), Some(b"abcd".as_slice()));
        assert_eq!(scan_sum, sum);
    }

    #[test]
    fn overwrite_does_not_touch_the_tag() {
        let (mut flash, mut hal, mut sum) = fresh();
        set(&mut flash, &SAK, &mut sum, 0x0101, 4).unwrap();
        let tag_before = flash.get(STORAGE_TAG_KEY).unwrap().to_vec();

        let existed = set(&mut flash, &SAK, &mut sum, 0x0101, 8).unwrap();
        assert!(existed);
        assert_eq!(flash.get(STORAGE_TAG_KEY).unwrap(), tag_before.as_slice());
        assert!(get(&flash, &mut hal, &SAK, &mut sum, 0x0101).unwrap().is_some());
    }

    #[test]
    fn delete_plus_update_restores_the_empty_tag() {
        let (mut flash, mut hal, mut sum) = fresh();
        let empty_tag = flash.get(STORAGE_TAG_KEY).unwrap().to_vec();

        set(&mut flash, &SAK, &mut sum, 0x0101, 4).unwrap();
        flash.delete(0x0101).unwrap();
        update(&mut flash, &SAK, &mut sum, 0x0101).unwrap();

        assert_eq!(flash.get(STORAGE_TAG_KEY).unwrap(), empty_tag.as_slice());
        assert!(get(&flash, &mut hal, &SAK, &mut sum, 0).unwrap().is_none());
    }

    #[test]
    fn public_and_internal_keys_stay_outside_the_tag() {
        let (mut flash, mut hal, mut sum) = fresh();
        let empty_tag = flash.get(STORAGE_TAG_KEY).unwrap().to_vec();

        flash.set(0x8101, b"public").unwrap();
        update(&mut flash, &SAK, &mut sum, 0x8101).unwrap();
        flash.set(0x0004, b"internal").unwrap();
        update(&mut flash, &SAK, &mut sum, 0x0004).unwrap();

        assert_eq!(flash.get(STORAGE_TAG_KEY).unwrap(), empty_tag.as_slice());
        assert!(get(&flash, &mut hal, &SAK, &mut sum, 0).unwrap().is_none());
    }

    #[test]
    fn tampered_tag_fails_authentication() {
        let (mut flash, mut hal, mut sum) = fresh();
        set(&mut flash, &SAK, &mut sum, 0x0101, 4).unwrap();

        let mut tag = flash.get(STORAGE_TAG_KEY).unwrap().to_vec();
        tag[3] ^= 0x01;
        flash.set(STORAGE_TAG_KEY, &tag).unwrap();

        assert!(matches!(
            get(&flash, &mut hal, &SAK, &mut sum, 0x0101),
            Err(StorageError::AuthenticationFailed)
        ));
    }

    #[test]
    fn missing_tag_fails_authentication() {
        let (mut flash, mut hal, mut sum) = fresh();
        flash.delete(STORAGE_TAG_KEY).unwrap();
        assert!(matches!(
            get(&flash, &mut hal, &SAK, &mut sum, 0),
            Err(StorageError::AuthenticationFailed)
        ));
    }

    #[test]
    fn smuggled_protected_key_fails_authentication() {
        // An entry written behind the authenticator's back changes the
        // recomputed sum and must break the stored tag.
        let (mut flash, mut hal, mut sum) = fresh();
        flash.set(0x0202, b"smuggled").unwrap();
        assert!(matches!(
            get(&flash, &mut hal, &SAK, &mut sum, 0),
            Err(StorageError::AuthenticationFailed)
        ));
    }

    #[test]
    fn wrong_sak_fails_authentication() {
        let (flash, mut hal, mut sum) = fresh();
        let wrong = [0x44u8; 16];
        assert!(matches!(
            get(&flash, &mut hal, &wrong, &mut sum, 0),
            Err(StorageError::AuthenticationFailed)
        ));
    }

    #[test]
    fn get_missing_key_returns_none() {
        let (flash, mut hal, mut sum) = fresh();
        assert!(get(&flash, &mut hal, &SAK, &mut sum, 0x0101)
            .unwrap()
            .is_none());
    }
}
