//! ChaCha20-Poly1305 envelopes.
//!
//! This module provides:
//! - [`seal_value`] / [`open_value`] — the per-entry value envelope:
//!   `IV (12) ‖ ciphertext ‖ Poly1305 tag (16)` under the DEK, with the
//!   16-bit key id as AAD so a ciphertext swapped between keys is rejected
//! - [`seal_keys`] / [`open_keys`] — the DEK‖SAK envelope under the
//!   PIN-derived KEK/KEIV, whose Poly1305 tag is truncated to the 8-byte
//!   PIN verification code
//!
//! The truncated PVC cannot be checked through a sealed AEAD interface, so
//! [`open_keys`] runs the RFC 7539 composition itself: the Poly1305 key is
//! the first half of ChaCha20 block 0, the tag covers the ciphertext and the
//! length block, and the comparison is the constant-time one from [`crate::ct`].

use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20;
use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, Tag};
use poly1305::universal_hash::UniversalHash;
use poly1305::Poly1305;
use zeroize::{Zeroize, Zeroizing};

use crate::ct;
use crate::error::StorageError;
use crate::memory::CACHE_LEN;

/// Envelope IV length in bytes (96 bits).
pub(crate) const IV_LEN: usize = 12;

/// Poly1305 tag length in bytes (128 bits).
pub(crate) const TAG_LEN: usize = 16;

/// PIN verification code length: the truncated tag stored beside the EDEK.
pub(crate) const PVC_LEN: usize = 8;

/// Minimum sealed value length: IV + empty ciphertext + tag.
pub(crate) const MIN_SEALED_LEN: usize = IV_LEN + TAG_LEN;

// ---------------------------------------------------------------------------
// Value envelope
// ---------------------------------------------------------------------------

/// Encrypt a value under the DEK, binding the entry key as AAD.
///
/// Returns the ciphertext (same length as the plaintext) and the 16-byte tag;
/// the caller assembles `iv ‖ ciphertext ‖ tag` in flash.
///
/// # Errors
///
/// Returns [`StorageError::Crypto`] if the AEAD rejects the input (value
/// beyond the ChaCha20-Poly1305 length bound, unreachable for flash-sized
/// entries).
pub(crate) fn seal_value(
    dek: &[u8],
    iv: &[u8; IV_LEN],
    key_id: u16,
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; TAG_LEN]), StorageError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(dek));
    let mut buf = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(iv), &key_id.to_le_bytes(), &mut buf)
        .map_err(|_| {
            buf.zeroize();
            StorageError::Crypto("value encryption failed".into())
        })?;
    Ok((buf, tag.into()))
}

/// Decrypt and authenticate a sealed value `IV ‖ ciphertext ‖ tag`.
///
/// The entry key must match the AAD used when sealing. On any mismatch the
/// working buffer is zeroized before the error is returned; the caller routes
/// the failure to the fault guard.
///
/// # Errors
///
/// Returns [`StorageError::AuthenticationFailed`] if the entry is too short
/// to hold an IV and tag, or if tag verification fails.
pub(crate) fn open_value(
    dek: &[u8],
    key_id: u16,
    sealed: &[u8],
) -> Result<Zeroizing<Vec<u8>>, StorageError> {
    if sealed.len() < MIN_SEALED_LEN {
        return Err(StorageError::AuthenticationFailed);
    }
    let iv = &sealed[..IV_LEN];
    // checked_sub cannot fail: the length guard above ensures room for the tag.
    let ct_end = sealed
        .len()
        .checked_sub(TAG_LEN)
        .ok_or(StorageError::AuthenticationFailed)?;
    let ciphertext = &sealed[IV_LEN..ct_end];
    let tag = &sealed[ct_end..];

    let cipher = ChaCha20Poly1305::new(Key::from_slice(dek));
    let mut buf = Zeroizing::new(ciphertext.to_vec());
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(iv),
            &key_id.to_le_bytes(),
            buf.as_mut_slice(),
            Tag::from_slice(tag),
        )
        .map_err(|_| StorageError::AuthenticationFailed)?;
    Ok(buf)
}

// ---------------------------------------------------------------------------
// DEK‖SAK envelope (truncated-tag PVC)
// ---------------------------------------------------------------------------

/// Encrypt the DEK‖SAK block under the PIN-derived KEK/KEIV.
///
/// Returns the 48-byte EDEK and the full 16-byte tag; the caller stores the
/// first [`PVC_LEN`] bytes as the PIN verification code.
///
/// # Errors
///
/// Returns [`StorageError::Crypto`] if the AEAD rejects the input
/// (unreachable for the fixed 48-byte block).
pub(crate) fn seal_keys(
    kek: &[u8],
    keiv: &[u8; IV_LEN],
    keys: &[u8; CACHE_LEN],
) -> Result<([u8; CACHE_LEN], [u8; TAG_LEN]), StorageError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(kek));
    let mut buf = *keys;
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(keiv), &[], &mut buf)
        .map_err(|_| {
            buf.zeroize();
            StorageError::Crypto("key encryption failed".into())
        })?;
    Ok((buf, tag.into()))
}

/// Decrypt the EDEK and verify the truncated PIN verification code.
///
/// Recomputes the RFC 7539 Poly1305 tag over the ciphertext and compares its
/// first [`PVC_LEN`] bytes against the stored PVC in constant time. Only on a
/// match is the plaintext produced.
///
/// # Errors
///
/// Returns [`StorageError::InvalidPin`] on PVC mismatch — the derived KEK
/// does not belong to the current PIN.
pub(crate) fn open_keys(
    kek: &[u8],
    keiv: &[u8; IV_LEN],
    edek: &[u8; CACHE_LEN],
    pvc: &[u8; PVC_LEN],
) -> Result<Zeroizing<[u8; CACHE_LEN]>, StorageError> {
    let mut cipher = ChaCha20::new(
        chacha20::Key::from_slice(kek),
        chacha20::Nonce::from_slice(keiv),
    );

    // Poly1305 key = first 32 bytes of ChaCha20 block 0; data starts at block 1.
    let mut mac_key = [0u8; 32];
    cipher.apply_keystream(&mut mac_key);
    cipher.seek(64u64);

    let mut mac = Poly1305::new(poly1305::Key::from_slice(&mac_key));
    mac_key.zeroize();
    mac.update_padded(&[]);
    mac.update_padded(edek);
    let mut lengths = poly1305::Block::default();
    lengths[8..].copy_from_slice(&(CACHE_LEN as u64).to_le_bytes());
    mac.update(core::slice::from_ref(&lengths));
    let tag = mac.finalize();

    if !ct::eq(&tag[..PVC_LEN], pvc) {
        return Err(StorageError::InvalidPin);
    }

    let mut out = Zeroizing::new(*edek);
    cipher.apply_keystream(out.as_mut_slice());
    Ok(out)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
