//! Encryption key lookup, creation, and caching.
//!
//! # Lifecycle
//!
//! 1. The first call to [`KeyStore::get_encryption_key`] reads KeyMaterial from
//!    the configured [`KeyMaterialStorage`] under a fixed name.
//! 2. If nothing is stored, a fresh 256-bit key is generated and written back
//!    as base64. If another process stored a key in the meantime, that key is
//!    read back and used instead.
//! 3. The decoded key is cached for the lifetime of the process. There is no
//!    rotation and no teardown.
//!
//! Concurrent first calls share a single in-flight initialisation, and storage
//! writes are create-only, so only one key is ever persisted and used.
//!
//! # Security invariants
//!
//! - Key material is never logged or included in traces; only a short
//!   SHA-256 fingerprint is exposed.
//! - Stored material that does not decode to exactly 32 bytes is a hard
//!   error. It is never silently replaced, since that would orphan every
//!   envelope written under the original key.

pub mod storage;

pub use storage::{FileKeyStorage, KeyMaterialStorage, MemoryKeyStorage};

use std::{io, sync::Arc};

use aes_gcm::aead::{rand_core::RngCore, OsRng};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::crypto::KEY_LEN;

/// Errors produced by the key store.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    /// Stored key material exists but cannot be decoded into a key.
    #[error("stored key material is corrupt: {reason}")]
    Corrupt {
        /// What was wrong with the stored text.
        reason: String,
    },

    /// The backing storage could not be read or written.
    #[error("key storage unavailable: {0}")]
    Storage(#[from] io::Error),
}

/// Fixed-size key buffer that holds exactly [`KEY_LEN`] bytes.
///
/// When this type is dropped, the memory is overwritten with zeroes to
/// minimise the window during which plaintext key material lives in RAM.
#[derive(Clone)]
pub struct KeyBytes(pub Box<[u8; KEY_LEN]>);

impl KeyBytes {
    fn generate() -> Self {
        let mut buf = Box::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut buf[..]);
        Self(buf)
    }

    /// Decode persisted KeyMaterial text.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::Corrupt`] on invalid base64 or a length other
    /// than [`KEY_LEN`].
    pub fn from_material(text: &str) -> Result<Self, KeyStoreError> {
        let raw = STANDARD
            .decode(text.trim())
            .map_err(|e| KeyStoreError::Corrupt {
                reason: format!("invalid base64: {e}"),
            })?;
        if raw.len() != KEY_LEN {
            return Err(KeyStoreError::Corrupt {
                reason: format!("expected {KEY_LEN} bytes, got {}", raw.len()),
            });
        }
        let mut buf = Box::new([0u8; KEY_LEN]);
        buf.copy_from_slice(&raw);
        Ok(Self(buf))
    }

    /// Text form written to storage.
    pub fn to_material(&self) -> String {
        STANDARD.encode(&self.0[..])
    }

    /// Hex of the first 8 bytes of SHA-256 over the key.
    pub fn fingerprint(&self) -> String {
        Sha256::digest(&self.0[..])[..8]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

impl Drop for KeyBytes {
    fn drop(&mut self) {
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

impl std::fmt::Debug for KeyBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyBytes([REDACTED])")
    }
}

/// Get-or-create accessor for the single symmetric key of a deployment.
///
/// Cheap to clone; clones share the cached key.
#[derive(Clone)]
pub struct KeyStore {
    storage: Arc<dyn KeyMaterialStorage>,
    name: Arc<str>,
    key: Arc<OnceCell<KeyBytes>>,
}

impl KeyStore {
    /// Create a store that keeps its KeyMaterial in `storage` under `name`.
    pub fn new(storage: Arc<dyn KeyMaterialStorage>, name: impl Into<Arc<str>>) -> Self {
        Self {
            storage,
            name: name.into(),
            key: Arc::new(OnceCell::new()),
        }
    }

    /// Returns `true` once a key has been loaded or created.
    pub fn is_ready(&self) -> bool {
        self.key.initialized()
    }

    /// Return the deployment key, loading or creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::Corrupt`] if stored material is undecodable and
    /// [`KeyStoreError::Storage`] if the storage cannot be read or written. A
    /// failed attempt is not cached; the next call tries again.
    pub async fn get_encryption_key(&self) -> Result<KeyBytes, KeyStoreError> {
        self.key
            .get_or_try_init(|| async { self.load_or_create() })
            .await
            .cloned()
    }

    /// Fingerprint of the deployment key, loading or creating it if needed.
    pub async fn fingerprint(&self) -> Result<String, KeyStoreError> {
        Ok(self.get_encryption_key().await?.fingerprint())
    }

    fn load_or_create(&self) -> Result<KeyBytes, KeyStoreError> {
        if let Some(key) = self.load()? {
            return Ok(key);
        }

        let key = KeyBytes::generate();
        match self.storage.set(&self.name, &key.to_material()) {
            Ok(()) => {
                info!(key_name = %self.name, fingerprint = %key.fingerprint(), "generated new encryption key");
                Ok(key)
            }
            // Another instance stored a key between our read and write; theirs wins.
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                info!(key_name = %self.name, "key created concurrently elsewhere; adopting it");
                self.load()?.ok_or_else(|| {
                    KeyStoreError::Storage(io::Error::new(
                        io::ErrorKind::NotFound,
                        "key material vanished after a concurrent create",
                    ))
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn load(&self) -> Result<Option<KeyBytes>, KeyStoreError> {
        let Some(text) = self.storage.get(&self.name)? else {
            return Ok(None);
        };
        let key = KeyBytes::from_material(&text).inspect_err(|e| {
            warn!(key_name = %self.name, error = %e, "refusing to use stored key material");
        })?;
        info!(key_name = %self.name, fingerprint = %key.fingerprint(), "encryption key loaded");
        Ok(Some(key))
    }
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("name", &self.name)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl Default for KeyStore {
    /// A store over fresh [`MemoryKeyStorage`], suitable for tests.
    fn default() -> Self {
        Self::new(Arc::new(MemoryKeyStorage::new()), "journal-vault.encryption-key")
    }
}

#[cfg(test)]
mod tests {
    use super::storage::MockKeyMaterialStorage;
    use super::*;
    use crate::crypto::{decrypt_data, encrypt_data};
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Barrier,
    };

    #[tokio::test]
    async fn initially_not_ready() {
        let store = KeyStore::default();
        assert!(!store.is_ready());
        store.get_encryption_key().await.unwrap();
        assert!(store.is_ready());
    }

    #[tokio::test]
    async fn repeated_calls_return_same_key() {
        let store = KeyStore::default();
        let k1 = store.get_encryption_key().await.unwrap();
        let k2 = store.get_encryption_key().await.unwrap();
        assert_eq!(k1.0, k2.0);
    }

    #[tokio::test]
    async fn key_survives_a_new_store_over_same_storage() {
        let storage: Arc<dyn KeyMaterialStorage> = Arc::new(MemoryKeyStorage::new());
        let first = KeyStore::new(storage.clone(), "k");
        let env = encrypt_data("written last session", &first.get_encryption_key().await.unwrap().0[..])
            .unwrap();

        let second = KeyStore::new(storage, "k");
        let key = second.get_encryption_key().await.unwrap();
        assert_eq!(decrypt_data(&env, &key.0[..]).unwrap(), "written last session");
    }

    #[tokio::test]
    async fn file_backed_key_persists_across_stores() {
        let dir = tempfile::tempdir().unwrap();
        let a = KeyStore::new(Arc::new(FileKeyStorage::new(dir.path())), "k");
        let fp_a = a.fingerprint().await.unwrap();
        let b = KeyStore::new(Arc::new(FileKeyStorage::new(dir.path())), "k");
        assert_eq!(b.fingerprint().await.unwrap(), fp_a);
    }

    #[tokio::test]
    async fn corrupt_material_is_an_error_and_never_replaced() {
        let mut storage = MockKeyMaterialStorage::new();
        storage
            .expect_get()
            .returning(|_| Ok(Some("%%% not base64 %%%".into())));
        storage.expect_set().never();

        let store = KeyStore::new(Arc::new(storage), "k");
        assert!(matches!(
            store.get_encryption_key().await,
            Err(KeyStoreError::Corrupt { .. })
        ));
        assert!(!store.is_ready());
    }

    #[tokio::test]
    async fn wrong_length_material_is_corrupt() {
        let mut storage = MockKeyMaterialStorage::new();
        storage
            .expect_get()
            .returning(|_| Ok(Some(STANDARD.encode([7u8; 16]))));
        storage.expect_set().never();

        let store = KeyStore::new(Arc::new(storage), "k");
        let err = store.get_encryption_key().await.unwrap_err();
        assert!(err.to_string().contains("expected 32 bytes, got 16"));
    }

    #[tokio::test]
    async fn storage_failure_is_not_cached() {
        let mut storage = MockKeyMaterialStorage::new();
        let mut calls = 0;
        storage.expect_get().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(io::Error::other("disk unavailable"))
            } else {
                Ok(None)
            }
        });
        storage.expect_set().times(1).returning(|_, _| Ok(()));

        let store = KeyStore::new(Arc::new(storage), "k");
        assert!(matches!(
            store.get_encryption_key().await,
            Err(KeyStoreError::Storage(_))
        ));
        assert!(store.get_encryption_key().await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_calls_create_one_key() {
        let mut storage = MockKeyMaterialStorage::new();
        storage.expect_get().times(1).returning(|_| Ok(None));
        storage.expect_set().times(1).returning(|_, _| Ok(()));
        let store = KeyStore::new(Arc::new(storage), "k");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.fingerprint().await.unwrap() })
            })
            .collect();

        let mut fingerprints = Vec::new();
        for h in handles {
            fingerprints.push(h.await.unwrap());
        }
        fingerprints.dedup();
        assert_eq!(fingerprints.len(), 1);
    }

    #[tokio::test]
    async fn lost_create_race_adopts_stored_key() {
        let mut storage = MockKeyMaterialStorage::new();
        let mut reads = 0;
        storage.expect_get().times(2).returning(move |_| {
            reads += 1;
            if reads == 1 {
                Ok(None)
            } else {
                Ok(Some(STANDARD.encode([9u8; KEY_LEN])))
            }
        });
        storage
            .expect_set()
            .times(1)
            .returning(|_, _| Err(io::Error::from(io::ErrorKind::AlreadyExists)));

        let store = KeyStore::new(Arc::new(storage), "k");
        let key = store.get_encryption_key().await.unwrap();
        assert_eq!(*key.0, [9u8; KEY_LEN]);
    }

    /// Lets every instance read "absent" before any of them writes.
    struct ReadThenWait {
        inner: FileKeyStorage,
        barrier: Arc<Barrier>,
        waited: AtomicBool,
    }

    impl KeyMaterialStorage for ReadThenWait {
        fn get(&self, name: &str) -> io::Result<Option<String>> {
            let value = self.inner.get(name)?;
            if !self.waited.swap(true, Ordering::SeqCst) {
                self.barrier.wait();
            }
            Ok(value)
        }

        fn set(&self, name: &str, value: &str) -> io::Result<()> {
            self.inner.set(name, value)
        }
    }

    #[test]
    fn instances_cold_starting_on_one_dir_share_one_key() {
        const INSTANCES: usize = 3;

        for _ in 0..20 {
            let dir = tempfile::tempdir().unwrap();
            let barrier = Arc::new(Barrier::new(INSTANCES));

            let handles: Vec<_> = (0..INSTANCES)
                .map(|_| {
                    let storage = ReadThenWait {
                        inner: FileKeyStorage::new(dir.path()),
                        barrier: barrier.clone(),
                        waited: AtomicBool::new(false),
                    };
                    let store = KeyStore::new(Arc::new(storage), "k");
                    std::thread::spawn(move || {
                        tokio::runtime::Builder::new_current_thread()
                            .build()
                            .unwrap()
                            .block_on(store.fingerprint())
                            .unwrap()
                    })
                })
                .collect();
            let mut fingerprints: Vec<String> =
                handles.into_iter().map(|h| h.join().unwrap()).collect();
            fingerprints.dedup();
            assert_eq!(fingerprints.len(), 1);

            // A restart sees the same key.
            let restarted = KeyStore::new(Arc::new(FileKeyStorage::new(dir.path())), "k");
            let fp = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap()
                .block_on(restarted.fingerprint())
                .unwrap();
            assert_eq!(fp, fingerprints[0]);
        }
    }

    #[test]
    fn material_round_trips_through_text() {
        let key = KeyBytes::generate();
        let decoded = KeyBytes::from_material(&key.to_material()).unwrap();
        assert_eq!(key.0, decoded.0);
        assert_eq!(key.fingerprint().len(), 16);
    }

    #[test]
    fn key_bytes_redacted_in_debug() {
        let key = KeyBytes::generate();
        assert!(format!("{key:?}").contains("REDACTED"));
        assert!(!format!("{:?}", KeyStore::default()).contains("REDACTED"));
    }
}
