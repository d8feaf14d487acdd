//! Process-wide encryption key capability (spec.md §4.3.4, §9 redesign
//! flag).
//!
//! The spec calls for encrypting broker payloads at rest with a
//! process-scoped symmetric key that rotates on an interval, retaining
//! retired keys for 24h so in-flight messages sealed under them can still
//! be opened. §9 flags the naive "process-wide encryption key store" as a
//! pattern needing re-architecture into an explicit capability rather than
//! global state; `KeyRing` is that capability: built once at the
//! composition root (see [`crate::fabric::ServiceFabric`]) and handed by
//! reference to whatever needs it, with an explicit `shutdown()` that
//! clears all key material.
//!
//! Actual AEAD cryptography is out of spec scope (§1: "assumed available
//! from a host library"). `KeyRing` is generic over a [`Cipher`]
//! implementation so a host can plug in a real AES-GCM/ChaCha20-Poly1305
//! cipher; the bundled [`XorStreamCipher`] is a reference implementation
//! sufficient to exercise the key-lifecycle contract in tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use rand::RngCore;

/// A sealed payload as produced by [`KeyRing::seal`]: spec.md §4.3.4's
/// `{encrypted: true, data, iv}` shape plus the key generation used, so
/// [`KeyRing::open`] can find the right (possibly retired) key.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SealedPayload {
    pub encrypted: bool,
    pub data: Vec<u8>,
    pub iv: Vec<u8>,
    pub key_generation: u64,
}

/// Pluggable symmetric cipher. `iv` is caller-generated and passed to both
/// sides; implementations should treat `key` and `iv` as opaque bytes.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, key: &[u8], iv: &[u8], plaintext: &[u8]) -> Vec<u8>;
    fn decrypt(&self, key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Vec<u8>;
    fn key_len(&self) -> usize;
    fn iv_len(&self) -> usize;
}

/// Reference cipher: a keyed XOR stream. Exercises the `KeyRing` rotation
/// contract without pulling in a cryptography dependency; swap in a real
/// AEAD cipher for production use via [`KeyRing::with_cipher`].
pub struct XorStreamCipher;

impl Cipher for XorStreamCipher {
    fn encrypt(&self, key: &[u8], iv: &[u8], plaintext: &[u8]) -> Vec<u8> {
        xor_stream(key, iv, plaintext)
    }

    fn decrypt(&self, key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Vec<u8> {
        xor_stream(key, iv, ciphertext)
    }

    fn key_len(&self) -> usize {
        32
    }

    fn iv_len(&self) -> usize {
        12
    }
}

fn xor_stream(key: &[u8], iv: &[u8], input: &[u8]) -> Vec<u8> {
    input
        .iter()
        .enumerate()
        .map(|(i, b)| b ^ key[i % key.len()] ^ iv[i % iv.len()])
        .collect()
}

struct KeyMaterial {
    generation: u64,
    key: Vec<u8>,
    created_at: SystemTime,
}

/// Configuration for key rotation.
#[derive(Debug, Clone)]
pub struct KeyRingConfig {
    /// How often a fresh key is minted.
    pub key_rotation_interval: Duration,
    /// How long a retired key is kept around to decrypt outstanding
    /// messages sealed under it (spec.md §4.3.4: 24h).
    pub retired_key_grace: Duration,
}

impl Default for KeyRingConfig {
    fn default() -> Self {
        Self {
            key_rotation_interval: Duration::from_secs(24 * 3600),
            retired_key_grace: Duration::from_secs(24 * 3600),
        }
    }
}

/// Process-scoped keyring with copy-on-rotate semantics (spec.md §5).
pub struct KeyRing {
    config: KeyRingConfig,
    cipher: Box<dyn Cipher>,
    keys: RwLock<BTreeMap<u64, KeyMaterial>>,
    current_generation: AtomicU64,
    shut_down: std::sync::atomic::AtomicBool,
}

impl KeyRing {
    /// Create a keyring using the reference [`XorStreamCipher`].
    pub fn new(config: KeyRingConfig) -> Self {
        Self::with_cipher(config, Box::new(XorStreamCipher))
    }

    /// Create a keyring with a caller-supplied cipher.
    pub fn with_cipher(config: KeyRingConfig, cipher: Box<dyn Cipher>) -> Self {
        let ring = Self {
            config,
            cipher,
            keys: RwLock::new(BTreeMap::new()),
            current_generation: AtomicU64::new(0),
            shut_down: std::sync::atomic::AtomicBool::new(false),
        };
        ring.mint_key(0);
        ring
    }

    fn mint_key(&self, generation: u64) {
        let mut key = vec![0u8; self.cipher.key_len()];
        rand::thread_rng().fill_bytes(&mut key);
        self.keys.write().insert(
            generation,
            KeyMaterial {
                generation,
                key,
                created_at: SystemTime::now(),
            },
        );
    }

    /// Rotate to a new key generation, retaining old keys for
    /// `retired_key_grace`.
    pub fn rotate(&self) {
        self.assert_alive();
        let next = self.current_generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.mint_key(next);
        self.evict_expired();
    }

    fn evict_expired(&self) {
        let cutoff = SystemTime::now() - self.config.retired_key_grace;
        let current = self.current_generation.load(Ordering::Acquire);
        self.keys.write().retain(|gen, material| {
            *gen == current || material.created_at > cutoff
        });
    }

    /// Encrypt a payload under the current key generation.
    pub fn seal(&self, plaintext: &[u8]) -> SealedPayload {
        self.assert_alive();
        let generation = self.current_generation.load(Ordering::Acquire);
        let mut iv = vec![0u8; self.cipher.iv_len()];
        rand::thread_rng().fill_bytes(&mut iv);

        let keys = self.keys.read();
        let key = &keys
            .get(&generation)
            .expect("current generation key always present")
            .key;
        let data = self.cipher.encrypt(key, &iv, plaintext);

        SealedPayload {
            encrypted: true,
            data,
            iv,
            key_generation: generation,
        }
    }

    /// Decrypt a payload sealed by a (possibly retired) key generation.
    pub fn open(&self, sealed: &SealedPayload) -> Result<Vec<u8>, crate::error::FabricError> {
        self.assert_alive();
        let keys = self.keys.read();
        let material = keys.get(&sealed.key_generation).ok_or_else(|| {
            crate::error::FabricError::SerializationError(format!(
                "encryption key generation {} no longer available",
                sealed.key_generation
            ))
        })?;
        Ok(self.cipher.decrypt(&material.key, &sealed.iv, &sealed.data))
    }

    /// Interval configured for rotation (for schedulers to honor).
    pub fn rotation_interval(&self) -> Duration {
        self.config.key_rotation_interval
    }

    /// Clear all key material. Further `seal`/`open`/`rotate` calls panic:
    /// an unrecoverable key loss is a fatal condition per spec.md §7.
    pub fn shutdown(&self) {
        self.keys.write().clear();
        self.shut_down.store(true, Ordering::Release);
    }

    fn assert_alive(&self) {
        assert!(
            !self.shut_down.load(Ordering::Acquire),
            "KeyRing used after shutdown"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open_round_trips() {
        let ring = KeyRing::new(KeyRingConfig::default());
        let sealed = ring.seal(b"hello fabric");
        assert!(sealed.encrypted);
        let opened = ring.open(&sealed).unwrap();
        assert_eq!(opened, b"hello fabric");
    }

    #[test]
    fn old_key_still_decrypts_within_grace_window() {
        let ring = KeyRing::new(KeyRingConfig::default());
        let sealed = ring.seal(b"payload");
        ring.rotate();
        // Grace window defaults to 24h, so the old generation survives.
        let opened = ring.open(&sealed).unwrap();
        assert_eq!(opened, b"payload");
    }

    #[test]
    fn evicted_key_fails_to_decrypt() {
        let ring = KeyRing::new(KeyRingConfig {
            key_rotation_interval: Duration::from_millis(1),
            retired_key_grace: Duration::from_millis(0),
        });
        let sealed = ring.seal(b"payload");
        std::thread::sleep(Duration::from_millis(5));
        ring.rotate();
        assert!(ring.open(&sealed).is_err());
    }

    #[test]
    #[should_panic(expected = "used after shutdown")]
    fn shutdown_clears_keys_and_panics_on_use() {
        let ring = KeyRing::new(KeyRingConfig::default());
        ring.shutdown();
        ring.seal(b"x");
    }
}
