//! PIN key derivation.
//!
//! This module provides:
//! - [`derive_kek`] — derive the key-encryption key and its IV from a PIN
//!   and the two salts via split PBKDF2-HMAC-SHA256
//! - [`DerivedKeys`] — KEK + IV pair, zeroized on drop
//!
//! The PIN enters the KDF as a 4-byte little-endian word regardless of host
//! endianness. The salt is the 32-byte hardware salt followed by the 4-byte
//! random salt drawn at `set_pin` time. KEK and KEIV are the first and second
//! PBKDF2 output blocks: 10000 iterations each, 20000 in total, yielding two
//! independent 32-byte outputs of which the KEIV contributes its first
//! 12 bytes as the ChaCha20-Poly1305 IV.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::memory::DEK_LEN;

/// PBKDF2 iterations per derived output block.
pub(crate) const PIN_ITERATIONS: u32 = 10_000;

/// Random per-PIN salt length in bytes.
pub(crate) const RANDOM_SALT_LEN: usize = 4;

/// Hardware salt length in bytes (SHA-256 of the hardware secret).
pub(crate) const HARDWARE_SALT_LEN: usize = 32;

/// IV length used from the derived KEIV block.
pub(crate) const KEIV_LEN: usize = 12;

/// Key material derived from a PIN: the key-encryption key and its IV.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct DerivedKeys {
    /// Key-encryption key for the DEK‖SAK envelope.
    pub(crate) kek: [u8; DEK_LEN],
    /// IV for the DEK‖SAK envelope (first 12 bytes of the KEIV block).
    pub(crate) keiv: [u8; KEIV_LEN],
}

/// Derive (KEK, KEIV) from a PIN and the two salts.
///
/// The password, salt, and intermediate output are zeroized before this
/// returns; only the [`DerivedKeys`] survive, and those zeroize on drop.
pub(crate) fn derive_kek(
    pin: u32,
    hardware_salt: &[u8; HARDWARE_SALT_LEN],
    random_salt: &[u8; RANDOM_SALT_LEN],
) -> DerivedKeys {
    let mut password = pin.to_le_bytes();
    let mut salt = [0u8; HARDWARE_SALT_LEN + RANDOM_SALT_LEN];
    salt[..HARDWARE_SALT_LEN].copy_from_slice(hardware_salt);
    salt[HARDWARE_SALT_LEN..].copy_from_slice(random_salt);

    // Blocks 1 and 2 of a single PBKDF2 stream are independent outputs with
    // distinct block counters; deriving 64 bytes at once computes both.
    let mut out = [0u8; 2 * DEK_LEN];
    pbkdf2_hmac::<Sha256>(&password, &salt, PIN_ITERATIONS, &mut out);

    let mut kek = [0u8; DEK_LEN];
    kek.copy_from_slice(&out[..DEK_LEN]);
    let mut keiv = [0u8; KEIV_LEN];
    keiv.copy_from_slice(&out[DEK_LEN..DEK_LEN + KEIV_LEN]);

    out.zeroize();
    salt.zeroize();
    password.zeroize();

    DerivedKeys { kek, keiv }
}
