//! Persistence of published model versions.

use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{anyhow, bail, Context};

use crate::{
    common::{lock, Version},
    registry::SignedPackage,
};

/// The error type for storage operations that are not directly related to application domain.
/// These include, for example IO errors like broken pipe, file not found, out-of-memory, etc.
pub type StorageError = anyhow::Error;

/// The result of the storage operation.
pub type StorageResult<T> = Result<T, StorageError>;

/// An append-only store of signed model versions with an active pointer.
pub trait ModelStorage: Send + Sync {
    /// Persists a new version.
    ///
    /// # Behavior
    ///
    /// - If the version does not exist yet, store it and return `StorageResult::Ok(())`.
    /// - If the version already exists, return an error and leave the stored version untouched.
    fn put(&self, package: &SignedPackage) -> StorageResult<()>;

    /// Returns a stored version.
    ///
    /// # Behavior
    ///
    /// - If the version does not exist, return `StorageResult::Ok(Option::None)`.
    /// - If the version exists, return `StorageResult::Ok(Some(SignedPackage))`.
    fn get(&self, version: Version) -> StorageResult<Option<SignedPackage>>;

    /// Returns the numbers of all stored versions in ascending order.
    fn versions(&self) -> StorageResult<Vec<Version>>;

    /// Atomically replaces the active pointer.
    fn set_active(&self, version: Version) -> StorageResult<()>;

    /// Returns the active pointer, `None` if it was never set.
    fn active(&self) -> StorageResult<Option<Version>>;
}

#[derive(Debug, Default)]
struct MemoryState {
    versions: BTreeMap<Version, SignedPackage>,
    active: Option<Version>,
}

/// A [`ModelStorage`] that only lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ModelStorage for MemoryStore {
    fn put(&self, package: &SignedPackage) -> StorageResult<()> {
        let mut state = lock(&self.state);
        if state.versions.contains_key(&package.version) {
            bail!("version {} already exists", package.version);
        }
        state.versions.insert(package.version, package.clone());
        Ok(())
    }

    fn get(&self, version: Version) -> StorageResult<Option<SignedPackage>> {
        Ok(lock(&self.state).versions.get(&version).cloned())
    }

    fn versions(&self) -> StorageResult<Vec<Version>> {
        Ok(lock(&self.state).versions.keys().copied().collect())
    }

    fn set_active(&self, version: Version) -> StorageResult<()> {
        let mut state = lock(&self.state);
        if !state.versions.contains_key(&version) {
            bail!("cannot activate unknown version {}", version);
        }
        state.active = Some(version);
        Ok(())
    }

    fn active(&self) -> StorageResult<Option<Version>> {
        Ok(lock(&self.state).active)
    }
}

const VERSION_PREFIX: &str = "model_v";
const VERSION_SUFFIX: &str = ".json";
const ACTIVE_FILE: &str = "ACTIVE";

/// A [`ModelStorage`] backed by a directory.
///
/// Every version is one JSON file `model_v{version}.json` that is never rewritten. The active
/// pointer is the file `ACTIVE`, replaced through a rename so that readers never observe a
/// partially written pointer.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Opens a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create model directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn version_path(&self, version: Version) -> PathBuf {
        self.root
            .join(format!("{}{}{}", VERSION_PREFIX, version, VERSION_SUFFIX))
    }

    /// Writes `contents` to a temporary file and moves it to `path`.
    fn write_atomically(&self, path: &Path, contents: &[u8]) -> StorageResult<()> {
        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
            .with_context(|| format!("failed to move {} to {}", tmp.display(), path.display()))?;
        Ok(())
    }
}

impl ModelStorage for FileStore {
    fn put(&self, package: &SignedPackage) -> StorageResult<()> {
        let path = self.version_path(package.version);
        if path.exists() {
            bail!("version {} already exists in {}", package.version, path.display());
        }
        let json = package.to_json()?;
        self.write_atomically(&path, json.as_bytes())
    }

    fn get(&self, version: Version) -> StorageResult<Option<SignedPackage>> {
        let path = self.version_path(version);
        if !path.exists() {
            return Ok(None);
        }
        let package = SignedPackage::import(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if package.version != version {
            bail!(
                "{} holds version {} instead of {}",
                path.display(),
                package.version,
                version
            );
        }
        Ok(Some(package))
    }

    fn versions(&self) -> StorageResult<Vec<Version>> {
        let mut versions = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let name = entry?.file_name();
            let version = name
                .to_str()
                .and_then(|name| name.strip_prefix(VERSION_PREFIX))
                .and_then(|name| name.strip_suffix(VERSION_SUFFIX))
                .and_then(|number| number.parse::<Version>().ok());
            if let Some(version) = version {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    fn set_active(&self, version: Version) -> StorageResult<()> {
        if !self.version_path(version).exists() {
            bail!("cannot activate unknown version {}", version);
        }
        self.write_atomically(&self.root.join(ACTIVE_FILE), version.to_string().as_bytes())
    }

    fn active(&self) -> StorageResult<Option<Version>> {
        let path = self.root.join(ACTIVE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        contents
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("invalid active pointer {:?}", contents))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::Utc;

    use super::*;
    use crate::{crypto::SigningKeyPair, registry::ModelVersion};

    /// A fresh directory under the system temp dir.
    pub(crate) fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "fedagg-{}-{}-{}",
            name,
            std::process::id(),
            rand::random::<u64>()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn package(version: Version) -> SignedPackage {
        ModelVersion::sign(
            version,
            vec![1.0, 2.0],
            "1.0".to_string(),
            None,
            Utc::now(),
            None,
            &SigningKeyPair::generate().secret,
        )
        .into()
    }

    fn check_store(store: &dyn ModelStorage) {
        assert_eq!(store.versions().unwrap(), Vec::<Version>::new());
        assert_eq!(store.active().unwrap(), None);
        assert!(store.get(0).unwrap().is_none());
        assert!(store.set_active(0).is_err());

        let v0 = package(0);
        let v1 = package(1);
        store.put(&v1).unwrap();
        store.put(&v0).unwrap();
        assert!(store.put(&package(1)).is_err());
        assert_eq!(store.get(1).unwrap(), Some(v1));
        assert_eq!(store.versions().unwrap(), vec![0, 1]);

        store.set_active(0).unwrap();
        assert_eq!(store.active().unwrap(), Some(0));
        store.set_active(1).unwrap();
        assert_eq!(store.active().unwrap(), Some(1));
    }

    #[test]
    fn test_memory_store() {
        check_store(&MemoryStore::new());
    }

    #[test]
    fn test_file_store() {
        let dir = scratch_dir("file-store");
        check_store(&FileStore::open(&dir).unwrap());

        // a reopened store sees the same state
        let store = FileStore::open(&dir).unwrap();
        assert_eq!(store.versions().unwrap(), vec![0, 1]);
        assert_eq!(store.active().unwrap(), Some(1));

        // stray files are ignored
        fs::write(dir.join("notes.txt"), "hello").unwrap();
        assert_eq!(store.versions().unwrap(), vec![0, 1]);

        fs::write(dir.join(ACTIVE_FILE), "garbage").unwrap();
        assert!(store.active().is_err());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_file_store_detects_misplaced_version() {
        let dir = scratch_dir("misplaced");
        let store = FileStore::open(&dir).unwrap();
        store.put(&package(2)).unwrap();
        fs::rename(store.version_path(2), store.version_path(3)).unwrap();
        assert!(store.get(3).is_err());
        fs::remove_dir_all(&dir).unwrap();
    }
}
