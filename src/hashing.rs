//! Content fingerprints and the cache hit/miss gate.

use memmap2::Mmap;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::path::{Component, Path, PathBuf};

use crate::cache::ImageRecord;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    pub hash: String,
    pub size_bytes: u64,
}

/// Hashes the full content of `path` with SHA-256.
pub fn fingerprint(path: &Path) -> std::io::Result<Fingerprint> {
    let file = File::open(path)?;
    let size_bytes = file.metadata()?.len();

    let mut hasher = Sha256::new();
    if size_bytes > 0 {
        // SAFETY: The file is opened read-only and outlives the mapping, which is
        // dropped at the end of this block.
        let mmap = unsafe { Mmap::map(&file)? };
        hasher.update(&mmap[..]);
    }

    Ok(Fingerprint {
        hash: hex::encode(hasher.finalize()),
        size_bytes,
    })
}

pub fn hash_bytes(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Absolute, lexically cleaned form of `path`. Symlinks are not resolved.
pub fn normalize_path(path: &Path) -> Result<PathBuf> {
    if path.as_os_str().is_empty() {
        return Err(Error::validation("image path is empty"));
    }

    let absolute = std::path::absolute(path).map_err(|e| Error::io(path, e))?;
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}

pub fn cache_key(path: &Path) -> Result<String> {
    Ok(normalize_path(path)?.to_string_lossy().to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MissReason {
    NotCached,
    ContentChanged,
    Forced,
    PreviousFailure,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheDecision {
    Hit(ImageRecord),
    Miss(MissReason),
}

/// A stored record is reused only when the caller does not force a rerun, the
/// previous attempt succeeded and the content digest is unchanged.
pub fn decide(stored: Option<ImageRecord>, current: &Fingerprint, force: bool) -> CacheDecision {
    let Some(record) = stored else {
        return CacheDecision::Miss(MissReason::NotCached);
    };
    if force {
        return CacheDecision::Miss(MissReason::Forced);
    }
    if record.file_hash != current.hash {
        return CacheDecision::Miss(MissReason::ContentChanged);
    }
    if !record.success {
        return CacheDecision::Miss(MissReason::PreviousFailure);
    }
    CacheDecision::Hit(record)
}
