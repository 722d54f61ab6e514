//! # Field Encryption Library
//!
//! A library for transparent at-rest encryption of selected text fields.
//!
//! `fieldencryption` encrypts individual field values rather than rows or
//! files. Encrypted and plaintext values share the same text column: a value
//! carries a trailing [`ENCRYPTION_MARKER`] when, and only when, it is
//! ciphertext. The [`EncryptedFieldCodec`] converts between logical values
//! and that stored form, [`FileKeyProvider`] loads or creates the symmetric
//! key backing the [`Encryptor`], and the [`migrate::MigrationEngine`]
//! converts whole datasets in either direction in batches.
//!
//! Because classification is per value, a dataset where only part of the
//! values have been converted stays fully readable. An interrupted migration
//! is therefore safe to re-run; it picks up where the previous run stopped
//! and leaves already-converted values untouched.
//!
//! ## Basic Usage
//!
//! ```rust
//! use fieldencryption::{
//!     EncryptedFieldCodec, Encryptor, StaticKeyProvider, ENCRYPTION_MARKER,
//! };
//! use std::sync::Arc;
//!
//! # fn example() -> fieldencryption::Result<()> {
//! let provider = Arc::new(StaticKeyProvider::random());
//! let encryptor = Arc::new(Encryptor::new(provider));
//! let codec = EncryptedFieldCodec::new(encryptor);
//!
//! // Logical value -> stored representation
//! let stored = codec.to_storage(Some("jane@example.com"))?.unwrap();
//! assert!(stored.ends_with(ENCRYPTION_MARKER));
//!
//! // Stored representation -> logical value
//! let logical = codec.from_storage(Some(&stored))?.unwrap();
//! assert_eq!(logical, "jane@example.com");
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```
//!
//! ## Migrating a Dataset
//!
//! ```rust,no_run
//! use fieldencryption::{
//!     EncryptedFieldCodec, Encryptor, EntityMetadata, FileKeyProvider,
//!     InMemoryRecordStore, InMemorySchemaRegistry, MigrationEngine,
//!     MigrationMode, MigrationOptions, ENCRYPTED_TEXT_TYPE,
//! };
//! use std::collections::HashMap;
//! use std::sync::Arc;
//!
//! # fn example() -> fieldencryption::Result<()> {
//! // Declare which entity types carry encrypted fields
//! let registry = Arc::new(
//!     InMemorySchemaRegistry::new().with_entity(
//!         EntityMetadata::new("customer").with_field("email", ENCRYPTED_TEXT_TYPE),
//!     ),
//! );
//!
//! // The store's codec mode is derived from the run's mode and dry-run flag
//! let options = MigrationOptions::new(MigrationMode::Encrypt);
//! let provider = Arc::new(FileKeyProvider::new("/etc/myapp/encryption.key"));
//! let encryptor = Arc::new(Encryptor::new(provider));
//! let codec = Arc::new(EncryptedFieldCodec::with_mode(
//!     encryptor,
//!     options.mode.codec_mode(options.dry_run),
//! ));
//!
//! let store = Arc::new(InMemoryRecordStore::new(codec, registry.as_ref())?);
//! store.insert(
//!     "customer",
//!     HashMap::from([("email".to_string(), Some("jane@example.com".to_string()))]),
//! )?;
//!
//! let report = MigrationEngine::new(store, registry, options).run()?;
//! assert_eq!(report.records_processed(), 1);
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod crypto;
pub mod error;
pub mod key;
pub mod migrate;
pub mod schema;
pub mod store;

// Re-export key types
pub use crate::codec::{CodecMode, EncryptedFieldCodec, ENCRYPTION_MARKER};
pub use crate::crypto::{Aes256GcmAead, Encryptor};
pub use crate::error::{Error, Result};
pub use crate::key::{EncryptionKey, FileKeyProvider, StaticKeyProvider};
pub use crate::migrate::{
    MigrationEngine, MigrationMode, MigrationObserver, MigrationOptions, MigrationReport,
    NoopObserver,
};
pub use crate::schema::{
    eligible_entities, EligibleEntity, EntityMetadata, FieldMetadata, InMemorySchemaRegistry,
    ENCRYPTED_TEXT_TYPE,
};
pub use crate::store::{FieldValues, InMemoryRecordStore, Record, RecordId};

/// Size of AES-256 key in bytes
pub const AES256_KEY_SIZE: usize = 32;

use std::fmt;
use std::sync::Arc;

/// AEAD (Authenticated Encryption with Associated Data) interface
pub trait Aead: Send + Sync + fmt::Debug {
    /// Encrypts data using the provided key
    fn encrypt(&self, data: &[u8], key: &[u8]) -> Result<Vec<u8>>;

    /// Decrypts data using the provided key
    fn decrypt(&self, data: &[u8], key: &[u8]) -> Result<Vec<u8>>;
}

/// Source of the symmetric key used for field encryption
pub trait KeyProvider: Send + Sync + fmt::Debug {
    /// Returns the key, materializing it on first use
    fn key(&self) -> Result<Arc<EncryptionKey>>;
}

/// Schema service listing entity types and their field declarations
pub trait SchemaRegistry: Send + Sync + fmt::Debug {
    /// Returns metadata for every known entity type, abstract base types
    /// included
    fn all_metadata(&self) -> Result<Vec<EntityMetadata>>;
}

/// Streaming cursor over the records of one entity type
///
/// Implementations must not materialize the full record set; the migration
/// engine iterates datasets too large to hold in memory.
pub trait RecordCursor {
    /// Returns the next record, or `None` once the entity type is exhausted
    fn next_record(&mut self) -> Result<Option<Record>>;
}

/// Scoped suspension of side-effect channels
///
/// Dropping the value restores every channel it suspended, on success and
/// error paths alike.
pub trait SideEffectSuspension {
    /// Names of the channels that were actually suspended
    fn suspended(&self) -> &[String];
}

/// Persistence layer interface consumed by the migration engine
pub trait RecordStore: Send + Sync + fmt::Debug {
    /// Returns the number of records of the given entity type
    fn count(&self, entity_type: &str) -> Result<u64>;

    /// Opens a cursor over every record of the entity type
    fn stream(&self, entity_type: &str) -> Result<Box<dyn RecordCursor>>;

    /// Queues an unconditional rewrite of one field's stored value
    ///
    /// The rewrite runs the field codec over the raw stored value at commit
    /// time even though the logical value did not change.
    fn queue_rewrite(&self, entity_type: &str, id: RecordId, field: &str) -> Result<()>;

    /// Returns the number of queued rewrites not yet committed
    fn pending_rewrites(&self) -> usize;

    /// Commits queued rewrites and returns how many fields were written
    fn commit(&self) -> Result<usize>;

    /// Drops queued rewrites without writing anything
    fn discard_pending(&self);

    /// Suspends the named side-effect channels until the returned guard is
    /// dropped
    ///
    /// Channels unknown to the store are ignored; the guard reports the ones
    /// actually suspended.
    fn suspend_side_effects(&self, channels: &[&str]) -> Result<Box<dyn SideEffectSuspension>>;
}
