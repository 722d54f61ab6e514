use crate::crypto::Aes256GcmAead;
use crate::error::{Error, Result};
use crate::{Aead, KeyProvider};
use base64::{engine::general_purpose, Engine as _};
use std::sync::Arc;

/// Authenticated encryption over text values.
///
/// Plaintext goes in as a string and comes back as base64 text so the result
/// can live in the same column as unencrypted values. The key is fetched from
/// the provider on every operation, which defers key file creation until the
/// first value is actually encrypted or decrypted.
#[derive(Debug)]
pub struct Encryptor {
    /// The source of the symmetric key
    provider: Arc<dyn KeyProvider>,

    /// The AEAD implementation used for encryption operations
    aead: Arc<dyn Aead>,
}

impl Encryptor {
    /// Creates a new `Encryptor` using AES-256-GCM.
    pub fn new(provider: Arc<dyn KeyProvider>) -> Self {
        Self {
            provider,
            aead: Arc::new(Aes256GcmAead::new()),
        }
    }

    /// Creates a new `Encryptor` with a custom AEAD implementation.
    pub fn with_aead(provider: Arc<dyn KeyProvider>, aead: Arc<dyn Aead>) -> Self {
        Self { provider, aead }
    }

    /// Encrypts a plaintext string, returning base64-encoded ciphertext.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let key = self.provider.key()?;
        let ciphertext = self.aead.encrypt(plaintext.as_bytes(), key.bytes())?;

        Ok(general_purpose::STANDARD.encode(ciphertext))
    }

    /// Decrypts base64-encoded ciphertext back into the plaintext string.
    ///
    /// Fails with [`Error::Decryption`] when the input is not valid base64,
    /// when authentication fails (tampered bytes or a different key), or when
    /// the decrypted bytes are not valid UTF-8.
    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let key = self.provider.key()?;

        let ciphertext = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| Error::Decryption(format!("Ciphertext is not valid base64: {}", e)))?;

        let plaintext = self.aead.decrypt(&ciphertext, key.bytes())?;

        String::from_utf8(plaintext)
            .map_err(|e| Error::Decryption(format!("Decrypted data is not valid UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::StaticKeyProvider;

    fn encryptor(fill: u8) -> Encryptor {
        let provider = Arc::new(StaticKeyProvider::new(vec![fill; 32]).unwrap());
        Encryptor::new(provider)
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let encryptor = encryptor(7);

        let encoded = encryptor.encrypt("jane@example.com").unwrap();
        assert_ne!(encoded, "jane@example.com");

        let decoded = encryptor.decrypt(&encoded).unwrap();
        assert_eq!(decoded, "jane@example.com");
    }

    #[test]
    fn test_encrypt_output_is_base64() {
        let encryptor = encryptor(7);

        let encoded = encryptor.encrypt("value").unwrap();
        assert!(general_purpose::STANDARD.decode(&encoded).is_ok());
    }

    #[test]
    fn test_decrypt_rejects_invalid_base64() {
        let encryptor = encryptor(7);

        let result = encryptor.decrypt("not base64!!!");
        assert!(matches!(result, Err(Error::Decryption(_))));
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let encoded = encryptor(7).encrypt("value").unwrap();

        let result = encryptor(8).decrypt(&encoded);
        assert!(matches!(result, Err(Error::Decryption(_))));
    }
}
