//! Cryptographic implementations for the field encryption library

mod aes256gcm;
mod encryptor;

pub use aes256gcm::Aes256GcmAead;
pub use encryptor::Encryptor;

use rand::{rngs::OsRng, RngCore};

// Constants for GCM mode
const GCM_BLOCK_SIZE: usize = 16;
pub(crate) const GCM_NONCE_SIZE: usize = 12;
pub(crate) const GCM_TAG_SIZE: usize = 16;

// Maximum data size supported by GCM mode
pub(crate) const GCM_MAX_DATA_SIZE: usize = ((1 << 32) - 2) * GCM_BLOCK_SIZE;

/// Fills the given buffer with cryptographically secure random bytes.
pub fn fill_random(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}
