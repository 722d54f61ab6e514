use thiserror::Error;

/// Result type for fieldencryption operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the fieldencryption library
#[derive(Error, Debug)]
pub enum Error {
    /// Key file exists but could not be read, or holds corrupt key material
    #[error("Key I/O error: {0}")]
    KeyIo(String),

    /// Fresh key material was generated but could not be persisted
    #[error("Key write error: {0}")]
    KeyWrite(String),

    /// Errors raised while producing ciphertext
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Ciphertext failed authentication: tampered bytes, truncation, or a
    /// different key
    #[error("Decryption error: {0}")]
    Decryption(String),

    /// Errors related to the persistence layer (cursor, commit, rewrite)
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Errors related to schema metadata discovery
    #[error("Schema error: {0}")]
    Schema(String),

    /// Errors related to JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Errors related to I/O operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid argument error
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}
