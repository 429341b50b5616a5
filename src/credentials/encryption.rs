//! AES-256-GCM sealing of token values.
//!
//! Every stored token value is sealed separately with a fresh random nonce.
//! The master key comes from an environment variable and never touches disk.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// Key size in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Nonce size in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// A sealed token value as it is stored: base64 ciphertext plus the base64
/// nonce it was sealed with.
#[derive(Debug, Clone)]
pub struct Sealed {
    pub ciphertext: String,
    pub nonce: String,
}

/// Master encryption key for the credential store.
#[derive(Clone)]
pub struct MasterKey {
    key: Vec<u8>,
}

impl MasterKey {
    /// Decodes and validates a base64-encoded 32-byte key.
    pub fn from_base64(key_base64: &str) -> Result<Self> {
        let key = BASE64
            .decode(key_base64)
            .context("Failed to decode base64 encryption key")?;

        if key.len() != KEY_SIZE {
            return Err(anyhow!(
                "Encryption key must be {} bytes (256 bits), got {} bytes",
                KEY_SIZE,
                key.len()
            ));
        }

        Ok(Self { key })
    }

    /// Seals a plaintext token value with a fresh random nonce.
    pub fn seal(&self, plaintext: &str) -> Result<Sealed> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("Encryption failed: {}", e))?;

        Ok(Sealed {
            ciphertext: BASE64.encode(&ciphertext),
            nonce: BASE64.encode(&nonce),
        })
    }

    /// Opens a sealed value. Fails on wrong key, corrupted data, or tampering.
    pub fn open(&self, sealed: &Sealed) -> Result<String> {
        let ciphertext = BASE64
            .decode(&sealed.ciphertext)
            .context("Failed to decode ciphertext")?;
        let nonce = BASE64.decode(&sealed.nonce).context("Failed to decode nonce")?;

        if nonce.len() != NONCE_SIZE {
            return Err(anyhow!(
                "Invalid nonce size: expected {}, got {}",
                NONCE_SIZE,
                nonce.len()
            ));
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|e| anyhow!("Decryption failed (wrong key or corrupted data): {}", e))?;

        String::from_utf8(plaintext).context("Decrypted data is not valid UTF-8")
    }

    /// Seals an optional token value into its (ciphertext, nonce) column pair.
    pub fn seal_opt(&self, value: Option<&str>) -> Result<(Option<String>, Option<String>)> {
        match value {
            Some(v) => {
                let sealed = self.seal(v)?;
                Ok((Some(sealed.ciphertext), Some(sealed.nonce)))
            }
            None => Ok((None, None)),
        }
    }

    /// Opens a (ciphertext, nonce) column pair read back from storage.
    pub fn open_opt(
        &self,
        ciphertext: Option<String>,
        nonce: Option<String>,
    ) -> Result<Option<String>> {
        match (ciphertext, nonce) {
            (Some(ciphertext), Some(nonce)) => Ok(Some(self.open(&Sealed { ciphertext, nonce })?)),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> MasterKey {
        MasterKey::from_base64(&BASE64.encode([0u8; 32])).unwrap()
    }

    #[test]
    fn test_key_validation() {
        assert!(MasterKey::from_base64(&BASE64.encode([0u8; 32])).is_ok());
        assert!(MasterKey::from_base64(&BASE64.encode([0u8; 16])).is_err());
        assert!(MasterKey::from_base64(&BASE64.encode([0u8; 64])).is_err());
        assert!(MasterKey::from_base64("not-valid-base64!@#$").is_err());
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = test_key();
        let plaintext = "ya29.a0-secret-access-token";

        let sealed = key.seal(plaintext).expect("seal failed");
        assert_ne!(sealed.ciphertext, plaintext);

        let opened = key.open(&sealed).expect("open failed");
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_fresh_nonce_per_seal() {
        let key = test_key();

        let first = key.seal("same-plaintext").unwrap();
        let second = key.seal("same-plaintext").unwrap();

        assert_ne!(first.nonce, second.nonce);
        assert_ne!(first.ciphertext, second.ciphertext);
        assert_eq!(key.open(&first).unwrap(), "same-plaintext");
        assert_eq!(key.open(&second).unwrap(), "same-plaintext");
    }

    #[test]
    fn test_wrong_key_fails() {
        let key = test_key();
        let other = MasterKey::from_base64(&BASE64.encode([1u8; 32])).unwrap();

        let sealed = key.seal("secret").unwrap();
        assert!(other.open(&sealed).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = test_key();
        let mut sealed = key.seal("secret").unwrap();
        sealed.ciphertext.push('X');
        assert!(key.open(&sealed).is_err());
    }

    #[test]
    fn test_optional_helpers() {
        let key = test_key();

        let (none_ct, none_nonce) = key.seal_opt(None).unwrap();
        assert!(none_ct.is_none() && none_nonce.is_none());
        assert_eq!(key.open_opt(None, None).unwrap(), None);

        let (ct, nonce) = key.seal_opt(Some("token")).unwrap();
        assert_eq!(key.open_opt(ct, nonce).unwrap(), Some("token".to_string()));
    }
}
