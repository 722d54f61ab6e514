//! Key material loading, generation, and per-path caching

use crate::crypto::fill_random;
use crate::error::{Error, Result};
use crate::{KeyProvider, AES256_KEY_SIZE};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use zeroize::Zeroize;

/// Symmetric key material loaded from, or persisted to, a key file.
///
/// The raw bytes are zeroized when the last reference is dropped and never
/// appear in `Debug` output.
pub struct EncryptionKey {
    bytes: Vec<u8>,
}

impl EncryptionKey {
    /// Creates a key from raw material, which must be exactly
    /// [`AES256_KEY_SIZE`] bytes. Material of the wrong length is wiped
    /// before the error is returned.
    pub fn from_bytes(mut bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != AES256_KEY_SIZE {
            let len = bytes.len();
            bytes.zeroize();

            return Err(Error::InvalidArgument(format!(
                "key material must be {} bytes, got {}",
                AES256_KEY_SIZE, len
            )));
        }

        Ok(Self { bytes })
    }

    /// Generates fresh random key material.
    pub fn generate() -> Self {
        let mut bytes = vec![0_u8; AES256_KEY_SIZE];
        fill_random(&mut bytes);

        Self { bytes }
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"<hidden>")
            .finish()
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

// One key per file path for the lifetime of the process
static KEY_REGISTRY: RwLock<Option<HashMap<PathBuf, Arc<EncryptionKey>>>> = RwLock::new(None);

/// Key provider backed by an on-disk key file.
///
/// The first request for a given path loads the key material from the file,
/// or generates fresh material and persists it when the file does not exist.
/// Later requests for the same path within the process return the cached key
/// without touching the filesystem, regardless of which provider instance
/// asks, so the file is created at most once.
#[derive(Debug, Clone)]
pub struct FileKeyProvider {
    path: PathBuf,
}

impl FileKeyProvider {
    /// Creates a provider for the given key file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the key file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyProvider for FileKeyProvider {
    fn key(&self) -> Result<Arc<EncryptionKey>> {
        if let Some(key) = cached_key(&self.path) {
            return Ok(key);
        }

        let mut registry = KEY_REGISTRY.write().unwrap();
        let keys = registry.get_or_insert_with(HashMap::new);

        // Re-check under the write lock; another caller may have won the race
        if let Some(key) = keys.get(&self.path) {
            return Ok(Arc::clone(key));
        }

        let key = Arc::new(load_or_create(&self.path)?);
        keys.insert(self.path.clone(), Arc::clone(&key));

        Ok(key)
    }
}

fn cached_key(path: &Path) -> Option<Arc<EncryptionKey>> {
    let registry = KEY_REGISTRY.read().unwrap();

    registry.as_ref().and_then(|keys| keys.get(path).cloned())
}

fn load_or_create(path: &Path) -> Result<EncryptionKey> {
    match fs::read(path) {
        Ok(bytes) => {
            let len = bytes.len();

            // from_bytes wipes rejected material
            let key = EncryptionKey::from_bytes(bytes).map_err(|_| {
                Error::KeyIo(format!(
                    "key file {} holds {} bytes, expected {}",
                    path.display(),
                    len,
                    AES256_KEY_SIZE
                ))
            })?;

            log::debug!("loaded encryption key from {}", path.display());

            Ok(key)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let key = EncryptionKey::generate();
            persist(path, key.bytes())?;

            log::info!("generated new encryption key at {}", path.display());

            Ok(key)
        }
        Err(e) => Err(Error::KeyIo(format!(
            "unable to read key file {}: {}",
            path.display(),
            e
        ))),
    }
}

fn persist(path: &Path, bytes: &[u8]) -> Result<()> {
    fs::write(path, bytes).map_err(|e| {
        Error::KeyWrite(format!("unable to write key file {}: {}", path.display(), e))
    })?;

    // Key material must not be world-readable
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| {
            Error::KeyWrite(format!(
                "unable to restrict key file {}: {}",
                path.display(),
                e
            ))
        })?;
    }

    Ok(())
}

/// Key provider with fixed in-memory key material.
///
/// Useful in tests; deployments load keys from a file via
/// [`FileKeyProvider`].
#[derive(Debug, Clone)]
pub struct StaticKeyProvider {
    key: Arc<EncryptionKey>,
}

impl StaticKeyProvider {
    /// Creates a provider around the given key material.
    pub fn new(bytes: Vec<u8>) -> Result<Self> {
        Ok(Self {
            key: Arc::new(EncryptionKey::from_bytes(bytes)?),
        })
    }

    /// Creates a provider with freshly generated key material.
    pub fn random() -> Self {
        Self {
            key: Arc::new(EncryptionKey::generate()),
        }
    }
}

impl KeyProvider for StaticKeyProvider {
    fn key(&self) -> Result<Arc<EncryptionKey>> {
        Ok(Arc::clone(&self.key))
    }
}
