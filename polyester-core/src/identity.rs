//! Signing and encryption contract, plus an Ed25519 implementation.

use std::sync::Mutex;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};
use serde::Serialize;

use crate::codec;

const NONCE_LEN: usize = 24;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("invalid ciphertext encoding")]
    InvalidCiphertext,
}

/// The local node's key material as seen by the collection engine.
///
/// Keys, signatures, nonces and ciphertexts are opaque strings so the engine
/// never depends on a particular algorithm.
pub trait Identity: Send + Sync {
    fn public_key(&self) -> String;

    /// Signs canonical bytes.
    fn sign(&self, data: &[u8]) -> String;

    /// Searches for a nonce such that the signature over
    /// `{prefix, nonce, value}` has at least `complexity` leading zero bits.
    /// Returns `(signature, nonce)`.
    fn sign_with_proof(&self, data: &[u8], prefix: &str, complexity: u32) -> (String, String);

    fn verify(&self, data: &[u8], signature: &str, public_key: &str) -> bool;

    fn verify_proof(
        &self,
        data: &[u8],
        signature: &str,
        public_key: &str,
        prefix: &str,
        nonce: &str,
        complexity: u32,
    ) -> bool;

    fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError>;

    fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError>;
}

/// Counts leading zero bits of a byte string.
pub fn leading_zero_bits(bytes: &[u8]) -> u32 {
    let mut bits = 0;
    for byte in bytes {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

#[derive(Serialize)]
struct ProofMessage<'a> {
    prefix: &'a str,
    nonce: &'a str,
    value: &'a [u8],
}

fn proof_message(data: &[u8], prefix: &str, nonce: &str) -> Vec<u8> {
    // A struct of strings and bytes always encodes.
    codec::to_bytes(&ProofMessage {
        prefix,
        nonce,
        value: data,
    })
    .unwrap_or_default()
}

fn parse_signature(signature: &str) -> Option<Signature> {
    let bytes: [u8; 64] = hex::decode(signature).ok()?.try_into().ok()?;
    Some(Signature::from_bytes(&bytes))
}

fn parse_public_key(public_key: &str) -> Option<VerifyingKey> {
    let bytes: [u8; 32] = hex::decode(public_key).ok()?.try_into().ok()?;
    VerifyingKey::from_bytes(&bytes).ok()
}

/// Ed25519 signatures and XChaCha20-Poly1305 encryption.
///
/// The symmetric key is derived from the signing seed, so only the holder of
/// the signing key can read an encrypted collection. Encryption uses a
/// synthetic nonce (keyed hash of the plaintext): equal plaintexts produce
/// equal ciphertexts, which keeps encrypted ids stable across writes.
pub struct Ed25519Identity {
    signing_key: SigningKey,
    cipher_key: [u8; 32],
    rng: Mutex<StdRng>,
}

impl Ed25519Identity {
    /// Generates a random identity.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self::with_rng(signing_key, StdRng::from_entropy())
    }

    /// Creates an identity from a 32-byte seed. Proof-of-work nonces are
    /// drawn from an RNG seeded by the same material, so runs are repeatable.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let rng_seed = blake3::derive_key("polyester 2024 proof nonces", &seed);
        Self::with_rng(SigningKey::from_bytes(&seed), StdRng::from_seed(rng_seed))
    }

    fn with_rng(signing_key: SigningKey, rng: StdRng) -> Self {
        let cipher_key = blake3::derive_key("polyester 2024 collection cipher", &signing_key.to_bytes());
        Ed25519Identity {
            signing_key,
            cipher_key,
            rng: Mutex::new(rng),
        }
    }

    fn next_nonce(&self) -> String {
        let mut bytes = [0u8; 8];
        // A poisoned lock only means another signer panicked mid-draw.
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        rng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.cipher_key))
    }
}

impl std::fmt::Debug for Ed25519Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Identity")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

impl Identity for Ed25519Identity {
    fn public_key(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_bytes())
    }

    fn sign(&self, data: &[u8]) -> String {
        hex::encode(self.signing_key.sign(data).to_bytes())
    }

    fn sign_with_proof(&self, data: &[u8], prefix: &str, complexity: u32) -> (String, String) {
        loop {
            let nonce = self.next_nonce();
            let signature = self.signing_key.sign(&proof_message(data, prefix, &nonce)).to_bytes();
            if leading_zero_bits(&signature) >= complexity {
                return (hex::encode(signature), nonce);
            }
        }
    }

    fn verify(&self, data: &[u8], signature: &str, public_key: &str) -> bool {
        let (Some(key), Some(signature)) = (parse_public_key(public_key), parse_signature(signature)) else {
            return false;
        };
        key.verify(data, &signature).is_ok()
    }

    fn verify_proof(
        &self,
        data: &[u8],
        signature: &str,
        public_key: &str,
        prefix: &str,
        nonce: &str,
        complexity: u32,
    ) -> bool {
        let Some(parsed) = parse_signature(signature) else {
            return false;
        };
        if leading_zero_bits(&parsed.to_bytes()) < complexity {
            return false;
        }
        self.verify(&proof_message(data, prefix, nonce), signature, public_key)
    }

    fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let digest = blake3::keyed_hash(&self.cipher_key, plaintext.as_bytes());
        let nonce = &digest.as_bytes()[..NONCE_LEN];
        let ciphertext = self
            .cipher()
            .encrypt(XNonce::from_slice(nonce), plaintext.as_bytes())
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce);
        out.extend_from_slice(&ciphertext);
        Ok(hex::encode(out))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError> {
        let bytes = hex::decode(ciphertext).map_err(|_| CryptoError::InvalidCiphertext)?;
        if bytes.len() < NONCE_LEN {
            return Err(CryptoError::InvalidCiphertext);
        }
        let (nonce, body) = bytes.split_at(NONCE_LEN);
        let plaintext = self
            .cipher()
            .decrypt(XNonce::from_slice(nonce), body)
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;
        String::from_utf8(plaintext).map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(n: u8) -> Ed25519Identity {
        Ed25519Identity::from_seed([n; 32])
    }

    #[test]
    fn leading_zero_bits_counts_across_bytes() {
        assert_eq!(leading_zero_bits(&[0x00, 0x00, 0x10]), 19);
        assert_eq!(leading_zero_bits(&[0x80]), 0);
        assert_eq!(leading_zero_bits(&[0x01, 0x00]), 7);
        assert_eq!(leading_zero_bits(&[0x00]), 8);
    }

    #[test]
    fn sign_verify() {
        let id = identity(1);
        let sig = id.sign(b"message");
        assert!(id.verify(b"message", &sig, &id.public_key()));
        assert!(!id.verify(b"other", &sig, &id.public_key()));
        assert!(!id.verify(b"message", &sig, &identity(2).public_key()));
        assert!(!id.verify(b"message", "not hex", &id.public_key()));
    }

    #[test]
    fn proof_of_work_meets_complexity() {
        let id = identity(3);
        let (signature, nonce) = id.sign_with_proof(b"value", "addr", 6);
        let raw = hex::decode(&signature).unwrap();
        assert!(leading_zero_bits(&raw) >= 6);
        assert!(id.verify_proof(b"value", &signature, &id.public_key(), "addr", &nonce, 6));
        assert!(!id.verify_proof(b"value", &signature, &id.public_key(), "other", &nonce, 6));
        assert!(!id.verify_proof(b"changed", &signature, &id.public_key(), "addr", &nonce, 6));
    }

    #[test]
    fn proof_search_is_repeatable_per_seed() {
        let a = identity(4).sign_with_proof(b"v", "p", 2);
        let b = identity(4).sign_with_proof(b"v", "p", 2);
        assert_eq!(a, b);
    }

    #[test]
    fn encryption_roundtrip_and_stability() {
        let id = identity(5);
        let c1 = id.encrypt("secret id").unwrap();
        let c2 = id.encrypt("secret id").unwrap();
        assert_eq!(c1, c2);
        assert_ne!(c1, id.encrypt("other id").unwrap());
        assert_eq!(id.decrypt(&c1).unwrap(), "secret id");
    }

    #[test]
    fn foreign_key_cannot_decrypt() {
        let ciphertext = identity(6).encrypt("secret").unwrap();
        assert!(matches!(identity(7).decrypt(&ciphertext), Err(CryptoError::DecryptionFailed(_))));
        assert!(matches!(identity(6).decrypt("abc"), Err(CryptoError::InvalidCiphertext)));
    }
}
