//! Single-image pipeline: fingerprint, cache gate, recognition, fusion, store.
//!
//! Failures that belong to one image (unreadable file, recognizer error,
//! timeout) are written to the cache as `success = false` records and returned
//! as such. Only input errors and store failures come back as `Err`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::cache::{CacheStats, CachedImage, ImageRecord, ProcessingCache};
use crate::error::{Error, Result};
use crate::fusion::fuse;
use crate::hashing::{CacheDecision, Fingerprint, MissReason, cache_key, decide, fingerprint};
use crate::recognition::{Recognizer, recognize_with_timeout};
use crate::rules::FieldRules;

pub const DEFAULT_RECOGNITION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct ProcessorConfig {
    pub recognition_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            recognition_timeout: DEFAULT_RECOGNITION_TIMEOUT,
        }
    }
}

/// How a single image was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    CacheHit(ImageRecord),
    Processed {
        record: ImageRecord,
        reason: MissReason,
    },
    Failed {
        record: ImageRecord,
        reason: Option<MissReason>,
    },
}

impl ProcessOutcome {
    pub fn record(&self) -> &ImageRecord {
        match self {
            Self::CacheHit(record) => record,
            Self::Processed { record, .. } | Self::Failed { record, .. } => record,
        }
    }

    pub fn into_record(self) -> ImageRecord {
        match self {
            Self::CacheHit(record) => record,
            Self::Processed { record, .. } | Self::Failed { record, .. } => record,
        }
    }
}

pub struct ImageProcessor<'a> {
    cache: &'a ProcessingCache,
    recognizer: Arc<dyn Recognizer>,
    rules: FieldRules,
    config: ProcessorConfig,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<'a> ImageProcessor<'a> {
    pub fn new(
        cache: &'a ProcessingCache,
        recognizer: Arc<dyn Recognizer>,
        config: ProcessorConfig,
    ) -> Result<Self> {
        Ok(Self::with_rules(cache, recognizer, FieldRules::builtin()?, config))
    }

    pub fn with_rules(
        cache: &'a ProcessingCache,
        recognizer: Arc<dyn Recognizer>,
        rules: FieldRules,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            cache,
            recognizer,
            rules,
            config,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &'a ProcessingCache {
        self.cache
    }

    pub fn config(&self) -> ProcessorConfig {
        self.config
    }

    pub fn rules(&self) -> &FieldRules {
        &self.rules
    }

    /// Returns the cached record when the file content is unchanged, otherwise
    /// runs recognition and stores a fresh record.
    ///
    /// A path that does not exist at all is an error and leaves the cache
    /// untouched. An existing file that cannot be read yields a failed record.
    pub fn process_image(&self, path: &Path, force: bool) -> Result<ImageRecord> {
        std::fs::symlink_metadata(path).map_err(|e| Error::io(path, e))?;
        let current = fingerprint(path);
        Ok(self.process_fingerprinted(path, current, force)?.into_record())
    }

    /// Same as [`ImageProcessor::process_image`] but with the fingerprint
    /// already computed, so callers can hash many files in parallel.
    pub(crate) fn process_fingerprinted(
        &self,
        path: &Path,
        current: std::io::Result<Fingerprint>,
        force: bool,
    ) -> Result<ProcessOutcome> {
        let key = cache_key(path)?;
        let lock = self.key_lock(&key);
        let outcome = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.process_locked(&key, path, current, force)
        };
        self.release_key_lock(&key, lock);
        outcome
    }

    fn process_locked(
        &self,
        key: &str,
        path: &Path,
        current: std::io::Result<Fingerprint>,
        force: bool,
    ) -> Result<ProcessOutcome> {
        let filename = file_name(path);
        let current = match current {
            Ok(fp) => fp,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to read image");
                let record = ImageRecord::failed(filename, 0, format!("failed to read image: {err}"));
                self.cache.put_by_key(key, &record)?;
                return Ok(ProcessOutcome::Failed {
                    record,
                    reason: None,
                });
            }
        };

        let reason = match decide(self.cache.get_by_key(key)?, &current, force) {
            CacheDecision::Hit(record) => {
                tracing::debug!(path = %path.display(), hash = %current.hash, "cache hit");
                return Ok(ProcessOutcome::CacheHit(record));
            }
            CacheDecision::Miss(reason) => reason,
        };
        tracing::debug!(path = %path.display(), hash = %current.hash, ?reason, "cache miss");

        match recognize_with_timeout(&self.recognizer, path, self.config.recognition_timeout) {
            Ok(raw) => {
                let extraction = fuse(&raw, &self.rules);
                let record = ImageRecord::from_extraction(filename, &current, extraction);
                self.cache.put_by_key(key, &record)?;
                tracing::info!(
                    path = %path.display(),
                    barcodes = record.barcodes.len(),
                    attributes = record.product_info.len(),
                    "processed image"
                );
                Ok(ProcessOutcome::Processed { record, reason })
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "recognition failed");
                let mut record = ImageRecord::failed(filename, current.size_bytes, err.to_string());
                record.file_hash = current.hash;
                self.cache.put_by_key(key, &record)?;
                Ok(ProcessOutcome::Failed {
                    record,
                    reason: Some(reason),
                })
            }
        }
    }

    /// Removes one image's record, or every record when `path` is `None`.
    /// Returns the number of records removed.
    pub fn clear_cache(&self, path: Option<&Path>) -> Result<u64> {
        match path {
            Some(path) => Ok(u64::from(self.cache.remove(path)?)),
            None => self.cache.remove_all(),
        }
    }

    pub fn cache_statistics(&self) -> Result<CacheStats> {
        self.cache.stats()
    }

    pub fn list_processed(&self) -> Result<Vec<CachedImage>> {
        self.cache.entries()
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// Drops the map entry for `key` once no other caller holds its lock.
    fn release_key_lock(&self, key: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one here.
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.key_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}
