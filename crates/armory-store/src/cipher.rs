//! At-rest encryption for stored embeddings.
//!
//! AES-256-GCM with a key derived as SHA-256 of an operator passphrase and
//! a fresh random 96-bit nonce per write.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct TemplateCipher {
    aead: Aes256Gcm,
}

impl TemplateCipher {
    pub fn from_passphrase(passphrase: &str) -> Self {
        let key = Sha256::digest(passphrase.as_bytes());
        Self {
            aead: Aes256Gcm::new(&key),
        }
    }

    /// Encrypt, returning `(nonce, ciphertext)`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| Error::Cipher(format!("{e:?}")))?;
        Ok((nonce.to_vec(), ciphertext))
    }

    pub fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if nonce.len() != NONCE_LEN {
            return Err(Error::Cipher(format!("nonce length {}", nonce.len())));
        }
        self.aead
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Cipher("wrong key or tampered template".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_then_open() {
        let cipher = TemplateCipher::from_passphrase("armory");
        let (nonce, ct) = cipher.seal(b"embedding bytes").unwrap();
        assert_ne!(ct.as_slice(), b"embedding bytes");
        assert_eq!(cipher.open(&nonce, &ct).unwrap(), b"embedding bytes");
    }

    #[test]
    fn test_nonces_differ() {
        let cipher = TemplateCipher::from_passphrase("armory");
        let (a, _) = cipher.seal(b"x").unwrap();
        let (b, _) = cipher.seal(b"x").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let (nonce, ct) = TemplateCipher::from_passphrase("one").seal(b"x").unwrap();
        let err = TemplateCipher::from_passphrase("two").open(&nonce, &ct).unwrap_err();
        assert!(matches!(err, Error::Cipher(_)));
    }
}
