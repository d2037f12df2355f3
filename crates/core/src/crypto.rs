//! Vault value encryption: AES-256-GCM with a per-write random nonce.
//!
//! Ciphertext layout is `nonce(12) || ciphertext || tag`, hex-encoded for
//! key-value storage. The nonce is fresh per write, so identical plaintexts
//! produce distinct ciphertexts.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};

use crate::error::VeilError;

const NONCE_LEN: usize = 12;

pub struct Encryptor {
    cipher: Aes256Gcm,
}

impl Encryptor {
    /// The key must be exactly 32 bytes; anything else is a startup failure.
    pub fn new(key: &[u8]) -> Result<Self, VeilError> {
        if key.len() != 32 {
            return Err(VeilError::Config(format!(
                "encryption key must be 32 bytes, got {}",
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| VeilError::Config(format!("invalid encryption key: {e}")))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, VeilError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| VeilError::Vault(format!("encrypt failed: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(hex::encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, VeilError> {
        let raw = hex::decode(encoded)
            .map_err(|e| VeilError::Vault(format!("ciphertext is not hex: {e}")))?;
        if raw.len() <= NONCE_LEN {
            return Err(VeilError::Vault("ciphertext too short".into()));
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| VeilError::Vault(format!("decrypt failed: {e}")))?;
        String::from_utf8(plaintext)
            .map_err(|e| VeilError::Vault(format!("decrypted value is not UTF-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encryptor() -> Encryptor {
        Encryptor::new(&[7u8; 32]).unwrap()
    }

    #[test]
    fn test_key_length_enforced() {
        assert!(Encryptor::new(&[0u8; 16]).is_err());
        assert!(Encryptor::new(&[0u8; 31]).is_err());
        assert!(Encryptor::new(&[0u8; 32]).is_ok());
    }

    #[test]
    fn test_roundtrip() {
        let enc = encryptor();
        let ct = enc.encrypt("nguyen.van.a@example.com").unwrap();
        assert_eq!(enc.decrypt(&ct).unwrap(), "nguyen.van.a@example.com");
    }

    #[test]
    fn test_nonce_makes_ciphertexts_distinct() {
        let enc = encryptor();
        let a = enc.encrypt("same plaintext").unwrap();
        let b = enc.encrypt("same plaintext").unwrap();
        assert_ne!(a, b);
        assert_eq!(enc.decrypt(&a).unwrap(), enc.decrypt(&b).unwrap());
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let enc = encryptor();
        let mut ct = enc.encrypt("secret").unwrap();
        let flipped = if ct.ends_with('0') { '1' } else { '0' };
        ct.pop();
        ct.push(flipped);
        assert!(enc.decrypt(&ct).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let a = Encryptor::new(&[1u8; 32]).unwrap();
        let b = Encryptor::new(&[2u8; 32]).unwrap();
        let ct = a.encrypt("secret").unwrap();
        assert!(b.decrypt(&ct).is_err());
    }
}
