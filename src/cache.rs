use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(test)]
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{trace, warn};

use crate::errors::{AppError, AppResult};

const MAX_VERBATIM_KEY_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    CellSearch,
    EntityDetail,
}

impl Namespace {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Namespace::CellSearch => "grid",
            Namespace::EntityDetail => "details",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub key: String,
    pub fetched_at: DateTime<Utc>,
    pub payload: T,
}

impl<T> CacheEntry<T> {
    /// `None` means the entry never expires.
    pub fn is_fresh(&self, validity: Option<Duration>) -> bool {
        match validity {
            Some(window) => Utc::now() - self.fetched_at <= window,
            None => true,
        }
    }
}

/// One JSON file per key under `<root>/grid` and `<root>/details`.
///
/// Writes go to a temp file in the target directory and are renamed over the
/// destination after `fsync`, so a reader never observes a half-written key.
/// Entries that fail to read or parse are reported as absent.
#[derive(Clone)]
pub struct CacheStore {
    root: PathBuf,
    #[cfg(test)]
    fault_injector: Option<Arc<TestFaultInjector>>,
}

impl CacheStore {
    pub fn open<P: AsRef<Path>>(root: P) -> AppResult<Self> {
        let root = root.as_ref().to_path_buf();
        for namespace in [Namespace::CellSearch, Namespace::EntityDetail] {
            fs::create_dir_all(root.join(namespace.dir_name()))?;
        }
        Ok(Self {
            root,
            #[cfg(test)]
            fault_injector: None,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn namespace_dir(&self, namespace: Namespace) -> PathBuf {
        self.root.join(namespace.dir_name())
    }

    pub fn path_for(&self, namespace: Namespace, key: &str) -> PathBuf {
        self.namespace_dir(namespace).join(file_name(key))
    }

    pub fn get<T: DeserializeOwned>(&self, namespace: Namespace, key: &str) -> Option<CacheEntry<T>> {
        let path = self.path_for(namespace, key);
        let entry = read_entry::<T>(&path)?;
        if entry.key != key {
            warn!(
                path = %path.display(),
                expected = key,
                found = %entry.key,
                "cache entry key mismatch; treating as absent"
            );
            return None;
        }
        Some(entry)
    }

    pub fn exists(&self, namespace: Namespace, key: &str) -> bool {
        self.path_for(namespace, key).is_file()
    }

    pub fn put<T: Serialize>(
        &self,
        namespace: Namespace,
        key: &str,
        payload: &T,
    ) -> AppResult<DateTime<Utc>> {
        self.put_at(namespace, key, payload, Utc::now())
    }

    pub fn put_at<T: Serialize>(
        &self,
        namespace: Namespace,
        key: &str,
        payload: &T,
        fetched_at: DateTime<Utc>,
    ) -> AppResult<DateTime<Utc>> {
        let entry = CacheEntry {
            key: key.to_string(),
            fetched_at,
            payload,
        };
        let bytes = serde_json::to_vec_pretty(&entry)?;
        let dir = self.namespace_dir(namespace);
        let path = dir.join(file_name(key));

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(&bytes)?;
        #[cfg(test)]
        if self
            .fault_injector
            .as_ref()
            .map(|hooks| hooks.take_write_failure())
            .unwrap_or(false)
        {
            return Err(AppError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                "simulated disk full",
            )));
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&path)
            .map_err(|err| AppError::Cache(format!("{}: {}", path.display(), err.error)))?;

        trace!(namespace = namespace.dir_name(), key, "cache entry written");
        Ok(fetched_at)
    }

    pub fn remove(&self, namespace: Namespace, key: &str) -> AppResult<bool> {
        match fs::remove_file(self.path_for(namespace, key)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(AppError::Io(err)),
        }
    }

    pub fn keys(&self, namespace: Namespace) -> AppResult<Vec<String>> {
        Ok(self
            .entries::<serde::de::IgnoredAny>(namespace)?
            .into_iter()
            .map(|entry| entry.key)
            .collect())
    }

    /// Every readable entry in the namespace, sorted by key. Corrupt files and
    /// stray temp files are skipped.
    pub fn entries<T: DeserializeOwned>(&self, namespace: Namespace) -> AppResult<Vec<CacheEntry<T>>> {
        let dir = self.namespace_dir(namespace);
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(&dir)? {
            let path = dir_entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(entry) = read_entry::<T>(&path) {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }
}

fn read_entry<T: DeserializeOwned>(path: &Path) -> Option<CacheEntry<T>> {
    let contents = match fs::read(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "unreadable cache entry; treating as absent");
            return None;
        }
    };
    match serde_json::from_slice::<CacheEntry<T>>(&contents) {
        Ok(entry) => Some(entry),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "corrupt cache entry; treating as absent");
            None
        }
    }
}

/// Plain ids are used as file names; anything else is hashed so arbitrary
/// keys cannot escape the namespace directory.
fn file_name(key: &str) -> String {
    let verbatim = !key.is_empty()
        && key.len() <= MAX_VERBATIM_KEY_LEN
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if verbatim {
        format!("{key}.json")
    } else {
        let digest = Sha256::digest(key.as_bytes());
        format!("h_{}.json", URL_SAFE_NO_PAD.encode(digest))
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct TestFaultInjector {
    write_failure: AtomicBool,
}

#[cfg(test)]
impl TestFaultInjector {
    pub fn fail_next_write(&self) {
        self.write_failure.store(true, Ordering::SeqCst);
    }

    fn take_write_failure(&self) -> bool {
        self.write_failure.swap(false, Ordering::SeqCst)
    }
}

#[cfg(test)]
impl CacheStore {
    pub fn enable_test_hooks(&mut self) -> Arc<TestFaultInjector> {
        let hooks = Arc::new(TestFaultInjector::default());
        self.fault_injector = Some(hooks.clone());
        hooks
    }
}
