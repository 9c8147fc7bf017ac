//! Key derivation.
//!
//! All key material descends from the 32-byte pre-shared key through
//! HKDF-SHA256 with domain-separating info strings: the 4-byte identity tag
//! is stable for the PSK's lifetime, while AEAD subkeys are salted with the
//! time-window number and rotate forward automatically.

use base64::{engine::general_purpose::STANDARD, Engine};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::crypto::{PSK_SIZE, USER_ID_SIZE};
use crate::error::{Error, Result};

/// Domain separator for the identity tag derivation.
const USER_ID_INFO: &[u8] = b"phantom-userid-v3";

/// Domain separator for per-window subkey derivation.
const SUBKEY_INFO: &[u8] = b"phantom-key-v3";

/// Derive the 4-byte cleartext identity tag from the PSK.
///
/// The tag lets a receiver reject wrong-key traffic before attempting any
/// AEAD work; it carries no authentication weight on its own.
pub fn derive_user_id(psk: &[u8; PSK_SIZE]) -> [u8; USER_ID_SIZE] {
    let hk = Hkdf::<Sha256>::new(None, psk);
    let mut user_id = [0u8; USER_ID_SIZE];
    hk.expand(USER_ID_INFO, &mut user_id)
        .expect("4 bytes is a valid HKDF output length");
    user_id
}

/// Derive the 32-byte AEAD subkey for a time window.
///
/// The window number is the salt, big-endian, so adjacent windows yield
/// unrelated keys.
pub fn derive_subkey(psk: &[u8; PSK_SIZE], window: i64) -> Zeroizing<[u8; PSK_SIZE]> {
    let salt = (window as u64).to_be_bytes();
    let hk = Hkdf::<Sha256>::new(Some(&salt), psk);
    let mut key = Zeroizing::new([0u8; PSK_SIZE]);
    hk.expand(SUBKEY_INFO, key.as_mut())
        .expect("32 bytes is a valid HKDF output length");
    key
}

/// Generate a fresh random PSK, base64-encoded.
pub fn generate_psk() -> String {
    let mut psk = Zeroizing::new([0u8; PSK_SIZE]);
    OsRng.fill_bytes(psk.as_mut());
    STANDARD.encode(psk.as_ref())
}

/// Decode a base64 PSK, enforcing the exact 32-byte length.
pub fn decode_psk(psk_base64: &str) -> Result<Zeroizing<[u8; PSK_SIZE]>> {
    let raw = Zeroizing::new(
        STANDARD
            .decode(psk_base64.trim())
            .map_err(|e| Error::config(format!("invalid base64 psk: {e}")))?,
    );
    if raw.len() != PSK_SIZE {
        return Err(Error::config(format!(
            "psk must be {PSK_SIZE} bytes, got {}",
            raw.len()
        )));
    }
    let mut psk = Zeroizing::new([0u8; PSK_SIZE]);
    psk.copy_from_slice(&raw);
    Ok(psk)
}
