//! Credential cache file.
//!
//! The cache maps profile names to the bare credential lines produced by the
//! last successful run for that profile:
//!
//! ```text
//! [prod]
//! CLUSTERID_PROFILE="prod"
//! VAULT_TOKEN="hvs.CAES..."
//! VAULT_TTL="2031-02-03 04:05:06"
//! VAULT_ADDR="https://vault.prod:8200"
//! ```
//!
//! Sections are written sorted by profile name. A profile with no lines is
//! never written, so an empty block cannot shadow the blocks after it.
//!
//! [`CacheFile`] wraps the read-modify-write cycle: it holds an exclusive
//! advisory lock on `<path>.lock` for its whole lifetime and replaces the
//! cache file atomically on [`commit`](CacheFile::commit).

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;

/// Error type for cache file operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// I/O error reading or writing the cache.
    #[error("cache I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The exclusive lock could not be taken.
    #[error("failed to lock cache {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CacheError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// In-memory credential cache: profile name to ordered credential lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialCache {
    entries: BTreeMap<String, Vec<String>>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the cache text format.
    pub fn parse(content: &str) -> Self {
        let mut entries = BTreeMap::new();
        let mut name: Option<String> = None;
        let mut lines: Vec<String> = Vec::new();

        for raw in content.lines() {
            let line = raw.trim_end_matches('\r');
            if let Some(header) = section_name(line) {
                if let Some(previous) = name.take() {
                    if !lines.is_empty() {
                        entries.insert(previous, std::mem::take(&mut lines));
                    }
                }
                lines.clear();
                name = Some(header.to_string());
            } else if !line.trim().is_empty() && name.is_some() {
                lines.push(line.to_string());
            }
        }
        if let Some(last) = name {
            if !lines.is_empty() {
                entries.insert(last, lines);
            }
        }

        Self { entries }
    }

    /// Render the cache text format.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for (name, lines) in self.entries.iter().filter(|(_, lines)| !lines.is_empty()) {
            out.push('[');
            out.push_str(name);
            out.push_str("]\n");
            for line in lines {
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }

    /// Cached lines for a profile, if any.
    pub fn lines(&self, profile: &str) -> Option<&[String]> {
        self.entries.get(profile).map(Vec::as_slice)
    }

    pub fn contains(&self, profile: &str) -> bool {
        self.entries.contains_key(profile)
    }

    /// Replace the whole entry for a profile.
    ///
    /// An empty line set removes the entry.
    pub fn replace(&mut self, profile: impl Into<String>, lines: Vec<String>) {
        let profile = profile.into();
        if lines.is_empty() {
            self.entries.remove(&profile);
        } else {
            self.entries.insert(profile, lines);
        }
    }

    /// Remove the entry for a profile, returning its lines.
    pub fn remove(&mut self, profile: &str) -> Option<Vec<String>> {
        self.entries.remove(profile)
    }

    /// Profile names with cached entries, sorted.
    pub fn profiles(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn section_name(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .filter(|name| !name.is_empty())
}

/// Exclusive handle on the cache file for one run.
///
/// The lock is held until the handle is dropped.
pub struct CacheFile {
    path: PathBuf,
    cache: CredentialCache,
    _lock: File,
}

impl CacheFile {
    /// Lock and load the cache at `path`.
    ///
    /// A missing cache file (and its parent directory) is created empty so
    /// that permission problems surface here rather than at commit time.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let path = path.into();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
        }

        let lock_path = lock_path(&path);
        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| CacheError::io(&lock_path, e))?;
        lock.lock_exclusive().map_err(|source| CacheError::Lock {
            path: lock_path.clone(),
            source,
        })?;

        let cache = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| CacheError::io(&path, e))?;
            CredentialCache::parse(&content)
        } else {
            tracing::debug!("Creating empty credential cache at {:?}", path);
            create_private(&path).map_err(|e| CacheError::io(&path, e))?;
            CredentialCache::new()
        };

        Ok(Self {
            path,
            cache,
            _lock: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cache(&self) -> &CredentialCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut CredentialCache {
        &mut self.cache
    }

    /// Atomically replace the cache file with the current contents.
    pub fn commit(&self) -> Result<(), CacheError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut staged =
            tempfile::NamedTempFile::new_in(dir).map_err(|e| CacheError::io(dir, e))?;
        staged
            .write_all(self.cache.serialize().as_bytes())
            .and_then(|_| staged.as_file().sync_all())
            .map_err(|e| CacheError::io(staged.path(), e))?;
        staged
            .persist(&self.path)
            .map_err(|e| CacheError::io(&self.path, e.error))?;

        tracing::debug!("Wrote {} cached profiles to {:?}", self.cache.len(), self.path);
        Ok(())
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

#[cfg(unix)]
fn create_private(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .mode(0o600)
        .open(path)
        .map(|_| ())
}

#[cfg(not(unix))]
fn create_private(path: &Path) -> std::io::Result<()> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map(|_| ())
}
