//! Backends for persisting KeyMaterial under a well-known name.

use std::{
    collections::{hash_map::Entry, HashMap},
    fs,
    io::{self, Write},
    path::PathBuf,
    sync::Mutex,
};

use tempfile::NamedTempFile;

/// A small persistent key/value store holding text-encoded key material.
///
/// Values are write-once: `set` never replaces an existing value, so two
/// processes racing to create a key cannot both win. Implementations are
/// scoped to one deployment; two [`super::KeyStore`]s over the same storage
/// see the same key.
#[cfg_attr(test, mockall::automock)]
pub trait KeyMaterialStorage: Send + Sync {
    /// Read the value stored under `name`, or `None` if nothing is stored.
    fn get(&self, name: &str) -> io::Result<Option<String>>;

    /// Store `value` under `name`.
    ///
    /// Fails with [`io::ErrorKind::AlreadyExists`] if `name` already holds a value.
    fn set(&self, name: &str, value: &str) -> io::Result<()>;
}

/// Stores each name as a file inside a directory.
///
/// Writes go through a randomly named temporary file in the same directory
/// which is then linked into place without clobbering, so a crash mid-write
/// never leaves a truncated key file and a concurrent writer never loses its
/// race silently. On unix the file is readable by the owner only.
#[derive(Debug, Clone)]
pub struct FileKeyStorage {
    dir: PathBuf,
}

impl FileKeyStorage {
    /// Create a storage rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, name: &str) -> io::Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid key name: {name:?}"),
            ));
        }
        Ok(self.dir.join(name))
    }
}

impl KeyMaterialStorage for FileKeyStorage {
    fn get(&self, name: &str) -> io::Result<Option<String>> {
        match fs::read_to_string(self.path_for(name)?) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn set(&self, name: &str, value: &str) -> io::Result<()> {
        let path = self.path_for(name)?;
        fs::create_dir_all(&self.dir)?;

        // Random name, created with O_EXCL.
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(fs::Permissions::from_mode(0o600))?;
        }
        tmp.as_file_mut().write_all(value.as_bytes())?;
        tmp.as_file().sync_all()?;

        tmp.persist_noclobber(&path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Process-local storage; the key is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryKeyStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKeyStorage {
    /// Create an empty storage.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyMaterialStorage for MemoryKeyStorage {
    fn get(&self, name: &str) -> io::Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| io::Error::other("key storage lock poisoned"))?;
        Ok(entries.get(name).cloned())
    }

    fn set(&self, name: &str, value: &str) -> io::Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| io::Error::other("key storage lock poisoned"))?;
        match entries.entry(name.to_owned()) {
            Entry::Occupied(_) => Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("key material {name:?} already stored"),
            )),
            Entry::Vacant(slot) => {
                slot.insert(value.to_owned());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_storage_missing_name_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileKeyStorage::new(dir.path());
        assert!(storage.get("absent").unwrap().is_none());
    }

    #[test]
    fn file_storage_set_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        let storage = FileKeyStorage::new(&nested);
        storage.set("key", "abc").unwrap();
        assert_eq!(storage.get("key").unwrap().as_deref(), Some("abc"));
        // only the key file is left behind
        assert_eq!(fs::read_dir(&nested).unwrap().count(), 1);
    }

    #[test]
    fn file_storage_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let first = FileKeyStorage::new(dir.path());
        let second = FileKeyStorage::new(dir.path());
        first.set("key", "abc").unwrap();
        let err = second.set("key", "def").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(first.get("key").unwrap().as_deref(), Some("abc"));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn file_storage_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let storage = FileKeyStorage::new(dir.path());
        storage.set("key", "abc").unwrap();
        let mode = fs::metadata(dir.path().join("key")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn file_storage_rejects_path_like_names() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileKeyStorage::new(dir.path());
        assert!(storage.set("../escape", "x").is_err());
        assert!(storage.get("").is_err());
        assert!(storage.get(".hidden").is_err());
    }

    #[test]
    fn memory_storage_set_then_get() {
        let storage = MemoryKeyStorage::new();
        assert!(storage.get("k").unwrap().is_none());
        storage.set("k", "v").unwrap();
        assert_eq!(storage.get("k").unwrap().as_deref(), Some("v"));
        let err = storage.set("k", "w").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(storage.get("k").unwrap().as_deref(), Some("v"));
    }
}
