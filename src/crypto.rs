//! The symmetric sealed-box primitive shared with the upstream relays.
//!
//! Every field and frame on the upstream wire is a self-contained
//! ciphertext: `nonce || body || tag`, ChaCha20-Poly1305 under a 32-byte
//! key derived by SHA-256 over a shared passphrase. Ciphertexts carry
//! their own nonce so the two directions and any number of concurrent
//! sessions can share one static key.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

/// Length of symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Fixed number of bytes a ciphertext adds on top of its plaintext.
pub const OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length")]
    InvalidKeyLength,

    #[error("encryption failed")]
    Encryption,

    #[error("decryption failed")]
    Decryption,
}

/// Derive the 32-byte wire key from a passphrase: SHA-256 over the
/// whitespace-trimmed UTF-8 bytes.
pub fn derive_key(passphrase: &str) -> [u8; KEY_LEN] {
    let digest = digest::digest(&digest::SHA256, passphrase.trim().as_bytes());
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(digest.as_ref());
    key
}

/// Seals and opens byte strings under one fixed key.
pub struct Cipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl Cipher {
    /// Create a new cipher from a 32-byte key
    pub fn new(key: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        let unbound_key =
            UnboundKey::new(&CHACHA20_POLY1305, key).map_err(|_| CryptoError::InvalidKeyLength)?;

        Ok(Self {
            key: LessSafeKey::new(unbound_key),
            rng: SystemRandom::new(),
        })
    }

    /// Seal `plaintext` under a fresh random nonce.
    ///
    /// Output layout: `nonce || ciphertext || tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CryptoError::Encryption)?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut body = Vec::with_capacity(plaintext.len() + TAG_LEN);
        body.extend_from_slice(plaintext);
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut body)
            .map_err(|_| CryptoError::Encryption)?;

        let mut out = Vec::with_capacity(NONCE_LEN + body.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Open a ciphertext produced by [`encrypt`](Self::encrypt), verifying
    /// the auth tag.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < OVERHEAD {
            return Err(CryptoError::Decryption);
        }

        let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_LEN);
        let nonce =
            Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| CryptoError::Decryption)?;

        let mut body = sealed.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut body)
            .map_err(|_| CryptoError::Decryption)?;

        Ok(plaintext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = [0x42u8; KEY_LEN];
        let cipher = Cipher::new(&key).unwrap();

        let plaintext = b"Hello, World!";
        let ciphertext = cipher.encrypt(plaintext).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len() + OVERHEAD);

        let decrypted = cipher.decrypt(&ciphertext).unwrap();
        assert_eq!(&decrypted, plaintext);
    }

    #[test]
    fn test_ciphertexts_differ_per_call() {
        let key = [0x42u8; KEY_LEN];
        let cipher = Cipher::new(&key).unwrap();

        let a = cipher.encrypt(b"same input").unwrap();
        let b = cipher.encrypt(b"same input").unwrap();
        assert_ne!(a, b);

        // Both still open under an independent instance of the same key.
        let other = Cipher::new(&key).unwrap();
        assert_eq!(other.decrypt(&a).unwrap(), b"same input");
        assert_eq!(other.decrypt(&b).unwrap(), b"same input");
    }

    #[test]
    fn test_tamper_detection() {
        let key = [0x42u8; KEY_LEN];
        let cipher = Cipher::new(&key).unwrap();

        let mut ciphertext = cipher.encrypt(b"Hello, World!").unwrap();
        ciphertext[NONCE_LEN] ^= 0xFF;

        assert!(cipher.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let cipher_a = Cipher::new(&[0x01u8; KEY_LEN]).unwrap();
        let cipher_b = Cipher::new(&[0x02u8; KEY_LEN]).unwrap();

        let ciphertext = cipher_a.encrypt(b"secret").unwrap();
        assert!(cipher_b.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn test_truncated_ciphertext_rejected() {
        let cipher = Cipher::new(&[0x42u8; KEY_LEN]).unwrap();
        assert!(cipher.decrypt(&[0u8; OVERHEAD - 1]).is_err());
    }

    #[test]
    fn test_derive_key_trims_whitespace() {
        let a = derive_key("my passphrase");
        let b = derive_key("  my passphrase \n");
        assert_eq!(a, b);

        let c = derive_key("another passphrase");
        assert_ne!(a, c);
    }

    #[test]
    fn test_max_chunk_fits_u16_frame() {
        let cipher = Cipher::new(&[0x42u8; KEY_LEN]).unwrap();
        let ciphertext = cipher.encrypt(&vec![0u8; crate::CHUNK_SIZE]).unwrap();
        assert!(ciphertext.len() <= u16::MAX as usize);
    }
}
