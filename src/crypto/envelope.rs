//! Time-windowed AEAD envelope.
//!
//! Wire layout of one envelope:
//!
//! ```text
//! ┌──────────┬────────────┬───────────┬────────────┬─────────┐
//! │ UserID 4 │ TsLow 2 BE │ Nonce 12  │ Ciphertext │ Tag 16  │
//! └──────────┴────────────┴───────────┴────────────┴─────────┘
//! ```
//!
//! The 6-byte prefix is the AAD. Subkeys are derived per time window; the
//! opener probes the previous, current and next windows so modest clock skew
//! between peers is tolerated. Accepted nonces go into a replay ledger only
//! after the tag verifies, so unauthenticated traffic can never poison the
//! ledger against legitimate senders.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};
use zeroize::Zeroizing;

use crate::crypto::{
    decode_psk, derive_subkey, derive_user_id, HEADER_SIZE, MIN_ENVELOPE_SIZE, NONCE_SIZE,
    PSK_SIZE, USER_ID_SIZE,
};
use crate::error::{Error, Result};

/// How long an accepted nonce stays in the replay ledger.
pub const REPLAY_TTL: Duration = Duration::from_secs(120);

/// Subkeys for windows older than `current - SUBKEY_RETENTION` are evicted.
pub const SUBKEY_RETENTION: i64 = 2;

/// How many times a colliding send nonce is redrawn before giving up.
const NONCE_REDRAW_ATTEMPTS: usize = 10;

/// Seals and opens envelopes under a shared PSK.
///
/// Safe for concurrent use from any number of flows.
pub struct EnvelopeCipher {
    psk: Zeroizing<[u8; PSK_SIZE]>,
    user_id: [u8; USER_ID_SIZE],
    time_window: u64,

    subkeys: Mutex<HashMap<i64, ChaCha20Poly1305>>,
    recv_nonces: Mutex<HashMap<[u8; NONCE_SIZE], Instant>>,
    send_nonces: Mutex<HashMap<[u8; NONCE_SIZE], Instant>>,
    replay_rejections: AtomicU64,
}

impl EnvelopeCipher {
    /// Create a cipher from a base64 PSK and a time window in seconds.
    pub fn new(psk_base64: &str, time_window: u64) -> Result<Self> {
        if !(1..=300).contains(&time_window) {
            return Err(Error::config("time_window must be within 1..=300"));
        }
        let psk = decode_psk(psk_base64)?;
        let user_id = derive_user_id(&psk);

        Ok(Self {
            psk,
            user_id,
            time_window,
            subkeys: Mutex::new(HashMap::new()),
            recv_nonces: Mutex::new(HashMap::new()),
            send_nonces: Mutex::new(HashMap::new()),
            replay_rejections: AtomicU64::new(0),
        })
    }

    /// The 4-byte identity tag carried in every envelope header.
    pub fn user_id(&self) -> &[u8; USER_ID_SIZE] {
        &self.user_id
    }

    /// Number of envelopes rejected by the replay ledger.
    pub fn replay_rejections(&self) -> u64 {
        self.replay_rejections.load(Ordering::Relaxed)
    }

    /// Seal a plaintext into an envelope under the current window's subkey.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let now_secs = unix_seconds();
        let cipher = self.cipher_for(self.window_of(now_secs));
        let nonce = self.draw_nonce()?;

        let mut out = Vec::with_capacity(MIN_ENVELOPE_SIZE + plaintext.len());
        out.extend_from_slice(&self.user_id);
        out.extend_from_slice(&((now_secs & 0xFFFF) as u16).to_be_bytes());
        out.extend_from_slice(&nonce);

        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &out[..HEADER_SIZE],
                },
            )
            .map_err(|_| Error::crypto("encryption failed"))?;
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Open an envelope, enforcing identity, freshness and once-only nonces.
    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < MIN_ENVELOPE_SIZE {
            return Err(Error::malformed(format!(
                "envelope too short: {} bytes",
                data.len()
            )));
        }

        if data[..USER_ID_SIZE] != self.user_id {
            return Err(Error::AuthFail);
        }

        let ts = u16::from_be_bytes([data[USER_ID_SIZE], data[USER_ID_SIZE + 1]]);
        if !self.timestamp_fresh(ts, unix_seconds()) {
            return Err(Error::AuthFail);
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&data[HEADER_SIZE..HEADER_SIZE + NONCE_SIZE]);
        if self.recv_nonces.lock().contains_key(&nonce) {
            self.replay_rejections.fetch_add(1, Ordering::Relaxed);
            return Err(Error::AuthFail);
        }

        let header = &data[..HEADER_SIZE];
        let ciphertext = &data[HEADER_SIZE + NONCE_SIZE..];

        for window in self.valid_windows() {
            let cipher = self.cipher_for(window);
            if let Ok(plaintext) = cipher.decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext,
                    aad: header,
                },
            ) {
                // Record only after verification; the test-and-set catches a
                // concurrent open of the same captured envelope.
                if self
                    .recv_nonces
                    .lock()
                    .insert(nonce, Instant::now())
                    .is_some()
                {
                    self.replay_rejections.fetch_add(1, Ordering::Relaxed);
                    return Err(Error::AuthFail);
                }
                return Ok(plaintext);
            }
        }

        Err(Error::AuthFail)
    }

    /// Evict expired replay entries and stale subkeys.
    pub fn maintain(&self) {
        let now = Instant::now();
        self.recv_nonces
            .lock()
            .retain(|_, seen| now.duration_since(*seen) <= REPLAY_TTL);
        self.send_nonces
            .lock()
            .retain(|_, seen| now.duration_since(*seen) <= REPLAY_TTL);

        let current = self.window_of(unix_seconds());
        self.subkeys
            .lock()
            .retain(|window, _| current - *window <= SUBKEY_RETENTION);
    }

    /// Draw a random nonce, redrawing on the (vanishingly rare) collision
    /// with a recently sent one.
    fn draw_nonce(&self) -> Result<[u8; NONCE_SIZE]> {
        let mut nonce = [0u8; NONCE_SIZE];
        for _ in 0..NONCE_REDRAW_ATTEMPTS {
            OsRng.fill_bytes(&mut nonce);
            if self
                .send_nonces
                .lock()
                .insert(nonce, Instant::now())
                .is_none()
            {
                return Ok(nonce);
            }
        }
        Err(Error::crypto("could not generate a unique nonce"))
    }

    fn cipher_for(&self, window: i64) -> ChaCha20Poly1305 {
        let mut cache = self.subkeys.lock();
        cache
            .entry(window)
            .or_insert_with(|| {
                let key = derive_subkey(&self.psk, window);
                ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(key.as_ref()))
            })
            .clone()
    }

    fn window_of(&self, unix_secs: u64) -> i64 {
        (unix_secs / self.time_window) as i64
    }

    fn valid_windows(&self) -> [i64; 3] {
        let w = self.window_of(unix_seconds());
        [w - 1, w, w + 1]
    }

    /// Wrap-adjusted freshness of a 16-bit truncated timestamp: the absolute
    /// distance to the current clock must be at most two windows.
    fn timestamp_fresh(&self, ts: u16, now_secs: u64) -> bool {
        let current = (now_secs & 0xFFFF) as i32;
        let mut diff = current - i32::from(ts);
        if diff < -32768 {
            diff += 65536;
        } else if diff > 32768 {
            diff -= 65536;
        }
        u64::from(diff.unsigned_abs()) <= 2 * self.time_window
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_psk;

    fn test_cipher() -> EnvelopeCipher {
        EnvelopeCipher::new(&generate_psk(), 30).unwrap()
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let cipher = test_cipher();
        for len in [0usize, 1, 64, 1200, 65000] {
            let plaintext = vec![0xA5u8; len];
            let sealed = cipher.seal(&plaintext).unwrap();
            assert_eq!(sealed.len(), MIN_ENVELOPE_SIZE + len);
            assert_eq!(cipher.open(&sealed).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_empty_plaintext_is_minimum_envelope() {
        let cipher = test_cipher();
        let sealed = cipher.seal(b"").unwrap();
        assert_eq!(sealed.len(), MIN_ENVELOPE_SIZE);
        assert_eq!(cipher.open(&sealed).unwrap(), b"");
    }

    #[test]
    fn test_short_envelope_is_malformed_and_skips_ledger() {
        let cipher = test_cipher();
        let err = cipher.open(&[0u8; MIN_ENVELOPE_SIZE - 1]).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
        assert!(cipher.recv_nonces.lock().is_empty());
    }

    #[test]
    fn test_replay_rejected_and_counted() {
        let cipher = test_cipher();
        let sealed = cipher.seal(b"once only").unwrap();

        assert!(cipher.open(&sealed).is_ok());
        assert_eq!(cipher.replay_rejections(), 0);

        let err = cipher.open(&sealed).unwrap_err();
        assert!(err.is_auth_failure());
        assert_eq!(cipher.replay_rejections(), 1);
    }

    #[test]
    fn test_cross_key_isolation() {
        let a = test_cipher();
        let b = test_cipher();

        let sealed = a.seal(b"for a only").unwrap();
        assert!(b.open(&sealed).unwrap_err().is_auth_failure());
        // And the failed open must not have recorded the nonce, nor counted
        // as a replay
        assert!(b.recv_nonces.lock().is_empty());
        assert_eq!(b.replay_rejections(), 0);
    }

    #[test]
    fn test_wrong_user_id_rejected_early() {
        let cipher = test_cipher();
        let mut sealed = cipher.seal(b"payload").unwrap();
        sealed[0] ^= 0xFF;
        assert!(cipher.open(&sealed).unwrap_err().is_auth_failure());
        assert!(cipher.recv_nonces.lock().is_empty());
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let cipher = test_cipher();
        let mut sealed = cipher.seal(b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(cipher.open(&sealed).unwrap_err().is_auth_failure());
    }

    #[test]
    fn test_timestamp_freshness_window() {
        let cipher = test_cipher();
        let now = 1_000_000u64;
        let low = (now & 0xFFFF) as u16;

        assert!(cipher.timestamp_fresh(low, now));
        assert!(cipher.timestamp_fresh(low.wrapping_sub(60), now));
        assert!(cipher.timestamp_fresh(low.wrapping_add(60), now));
        assert!(!cipher.timestamp_fresh(low.wrapping_sub(61), now));
        assert!(!cipher.timestamp_fresh(low.wrapping_add(61), now));
    }

    #[test]
    fn test_timestamp_wraparound() {
        let cipher = test_cipher();
        // Clock just past a 16-bit wrap; a packet stamped just before it is
        // only a few seconds old.
        let now = 0x1_0000u64 + 5;
        assert!(cipher.timestamp_fresh(0xFFFB, now));
        assert!(!cipher.timestamp_fresh(0xFF00, now));
    }

    #[test]
    fn test_maintain_evicts_expired_nonces() {
        let cipher = test_cipher();
        let sealed = cipher.seal(b"data").unwrap();
        cipher.open(&sealed).unwrap();
        assert_eq!(cipher.recv_nonces.lock().len(), 1);

        // Age the entry past the TTL, then sweep.
        if let Some(old) = Instant::now().checked_sub(REPLAY_TTL + Duration::from_secs(1)) {
            for seen in cipher.recv_nonces.lock().values_mut() {
                *seen = old;
            }
            cipher.maintain();
            assert!(cipher.recv_nonces.lock().is_empty());
        }
    }

    #[test]
    fn test_maintain_evicts_stale_subkeys() {
        let cipher = test_cipher();
        let current = cipher.window_of(unix_seconds());
        cipher.cipher_for(current);
        cipher.cipher_for(current - 10);
        assert_eq!(cipher.subkeys.lock().len(), 2);

        cipher.maintain();
        let cache = cipher.subkeys.lock();
        assert!(cache.contains_key(&current));
        assert!(!cache.contains_key(&(current - 10)));
    }

    #[test]
    fn test_rejects_bad_time_window() {
        let psk = generate_psk();
        assert!(EnvelopeCipher::new(&psk, 0).is_err());
        assert!(EnvelopeCipher::new(&psk, 301).is_err());
        assert!(EnvelopeCipher::new(&psk, 300).is_ok());
    }
}
