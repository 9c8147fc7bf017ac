//! Cryptographic envelope for phantom.
//!
//! This module provides:
//! - HKDF-SHA256 derivation of the identity tag and per-window subkeys
//! - ChaCha20-Poly1305 AEAD sealing/opening with a replay ledger
//! - Pre-shared key generation and decoding
//!
//! All traffic is wrapped in envelopes keyed by a time-windowed subkey, so
//! keys rotate forward without any handshake. Secret material is zeroized on
//! drop to prevent memory leakage.

mod envelope;
mod kdf;

pub use envelope::EnvelopeCipher;
pub use kdf::{decode_psk, derive_subkey, derive_user_id, generate_psk};

/// Size of the pre-shared key in bytes (256 bits)
pub const PSK_SIZE: usize = 32;

/// Size of the cleartext identity tag in bytes
pub const USER_ID_SIZE: usize = 4;

/// Size of the truncated timestamp in bytes
pub const TIMESTAMP_SIZE: usize = 2;

/// Size of the envelope header (identity tag + timestamp), also the AAD
pub const HEADER_SIZE: usize = USER_ID_SIZE + TIMESTAMP_SIZE;

/// Size of the AEAD nonce in bytes (96 bits for ChaCha20-Poly1305)
pub const NONCE_SIZE: usize = 12;

/// Size of the AEAD authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Smallest valid envelope: header + nonce + tag around an empty plaintext
pub const MIN_ENVELOPE_SIZE: usize = HEADER_SIZE + NONCE_SIZE + TAG_SIZE;
