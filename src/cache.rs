//! Persistent cache of per-image processing results.
//!
//! Uses LMDB (via heed). Every mutation runs in its own write transaction that
//! is committed before the call returns, so the store on disk is never behind
//! the last completed call. A transaction that is dropped without commit is
//! aborted, which keeps half-written entries out of the store on every error
//! path.
//!
//! Records are stored as JSON under the normalized absolute image path:
//! `{file_hash, processed_at, file_size, filename, barcodes_found,
//! product_info, success, error_message, sources}`.

use chrono::{DateTime, Utc};
use heed::types::Str;
use heed::{Database, Env, EnvFlags, EnvOpenOptions, MdbError, RoTxn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::fusion::{Extraction, Provenance};
use crate::hashing::{Fingerprint, cache_key};

pub const IMAGES_DB: &str = "images";
pub const BARCODES_SEEN_DB: &str = "barcodes_seen";
pub const INVENTORY_DB: &str = "inventory";

const DEFAULT_MAP_SIZE: usize = 1024 * 1024 * 1024;
const DEFAULT_MAX_DBS: u32 = 8;

pub(crate) type StrDb = Database<Str, Str>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub file_hash: String,
    pub processed_at: DateTime<Utc>,
    #[serde(rename = "file_size")]
    pub file_size_bytes: u64,
    pub filename: String,
    #[serde(rename = "barcodes_found")]
    pub barcodes: BTreeSet<String>,
    pub product_info: BTreeMap<String, String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub sources: Provenance,
}

impl ImageRecord {
    pub fn from_extraction(
        filename: impl Into<String>,
        fingerprint: &Fingerprint,
        extraction: Extraction,
    ) -> Self {
        Self {
            file_hash: fingerprint.hash.clone(),
            processed_at: Utc::now(),
            file_size_bytes: fingerprint.size_bytes,
            filename: filename.into(),
            barcodes: extraction.barcodes,
            product_info: extraction.product_info,
            success: true,
            error_message: None,
            sources: extraction.provenance,
        }
    }

    /// Record for an image that could not be hashed or recognized. The hash is
    /// empty until the caller knows the content digest.
    pub fn failed(
        filename: impl Into<String>,
        file_size_bytes: u64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            file_hash: String::new(),
            processed_at: Utc::now(),
            file_size_bytes,
            filename: filename.into(),
            barcodes: BTreeSet::new(),
            product_info: BTreeMap::new(),
            success: false,
            error_message: Some(message.into()),
            sources: Provenance::default(),
        }
    }
}

/// Set when the store could not be opened and was replaced by an empty one.
#[derive(Debug, Clone, Serialize)]
pub struct CacheRecovery {
    pub quarantined_to: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CachedImage {
    pub path: String,
    #[serde(flatten)]
    pub record: ImageRecord,
}

#[derive(Debug)]
pub struct ProcessingCache {
    env: Arc<Env>,
    db_path: PathBuf,
    images: StrDb,
    barcodes_seen: StrDb,
    recovery: Option<CacheRecovery>,
}

impl ProcessingCache {
    /// Opens or creates the store. A file that LMDB rejects as invalid or
    /// corrupted is moved aside and replaced by an empty store; see
    /// [`ProcessingCache::recovery`].
    pub fn open(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }

        let (store, recovery) = match open_store(&db_path) {
            Ok(store) => (store, None),
            Err(err) if is_corruption(&err) => {
                let recovery = quarantine(&db_path, &err)?;
                tracing::warn!(
                    db = %db_path.display(),
                    quarantined_to = %recovery.quarantined_to.display(),
                    reason = %recovery.reason,
                    "cache store unreadable, starting with an empty cache"
                );
                (open_store(&db_path)?, Some(recovery))
            }
            Err(err) => return Err(err.into()),
        };
        let (env, images, barcodes_seen) = store;

        Ok(Self {
            env: Arc::new(env),
            db_path,
            images,
            barcodes_seen,
            recovery,
        })
    }

    pub fn db(&self) -> Arc<Env> {
        Arc::clone(&self.env)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn recovery(&self) -> Option<&CacheRecovery> {
        self.recovery.as_ref()
    }

    pub fn get(&self, image: &Path) -> Result<Option<ImageRecord>> {
        let key = cache_key(image)?;
        self.get_by_key(&key)
    }

    pub(crate) fn get_by_key(&self, key: &str) -> Result<Option<ImageRecord>> {
        let rtxn = self.env.read_txn()?;
        let Some(raw) = self.images.get(&rtxn, key)? else {
            return Ok(None);
        };
        match serde_json::from_str::<ImageRecord>(raw) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                tracing::warn!(path = key, error = %err, "ignoring undecodable cache entry");
                Ok(None)
            }
        }
    }

    /// Replaces the whole record for `image`.
    pub fn put(&self, image: &Path, record: &ImageRecord) -> Result<()> {
        let key = cache_key(image)?;
        self.put_by_key(&key, record)
    }

    pub(crate) fn put_by_key(&self, key: &str, record: &ImageRecord) -> Result<()> {
        let payload = serde_json::to_string(record)?;
        let mut wtxn = self.env.write_txn()?;
        self.images.put(&mut wtxn, key, &payload)?;
        for code in &record.barcodes {
            if self.barcodes_seen.get(&wtxn, code)?.is_none() {
                self.barcodes_seen.put(&mut wtxn, code, key)?;
            }
        }
        wtxn.commit()?;
        Ok(())
    }

    pub fn remove(&self, image: &Path) -> Result<bool> {
        let key = cache_key(image)?;
        let mut wtxn = self.env.write_txn()?;
        let removed = self.images.delete(&mut wtxn, &key)?;
        wtxn.commit()?;
        Ok(removed)
    }

    /// Drops every record and the seen-barcode history. Returns how many image
    /// records were removed.
    pub fn remove_all(&self) -> Result<u64> {
        let mut wtxn = self.env.write_txn()?;
        let count = self.images.len(&wtxn)?;
        self.images.clear(&mut wtxn)?;
        self.barcodes_seen.clear(&mut wtxn)?;
        wtxn.commit()?;
        Ok(count)
    }

    pub fn seen_barcodes(&self) -> Result<BTreeSet<String>> {
        let rtxn = self.env.read_txn()?;
        let mut seen = BTreeSet::new();
        for item in self.barcodes_seen.iter(&rtxn)? {
            let (code, _) = item?;
            seen.insert(code.to_string());
        }
        Ok(seen)
    }

    pub fn entries(&self) -> Result<Vec<CachedImage>> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for_each_record(&self.images, &rtxn, |path, record| {
            out.push(CachedImage {
                path: path.to_string(),
                record,
            });
        })?;
        Ok(out)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let rtxn = self.env.read_txn()?;

        let total_entries = self.images.len(&rtxn)?;
        let mut total_images = 0u64;
        let mut successful = 0u64;
        let mut total_barcodes_found = 0u64;
        let mut distinct = BTreeSet::new();
        let mut last_processed_at: Option<DateTime<Utc>> = None;

        for_each_record(&self.images, &rtxn, |_, record| {
            total_images += 1;
            if record.success {
                successful += 1;
            }
            total_barcodes_found += record.barcodes.len() as u64;
            distinct.extend(record.barcodes);
            if last_processed_at.is_none_or(|t| record.processed_at > t) {
                last_processed_at = Some(record.processed_at);
            }
        })?;

        let success_rate = if total_images == 0 {
            0.0
        } else {
            successful as f64 / total_images as f64
        };

        Ok(CacheStats {
            db_path: self.db_path.to_string_lossy().to_string(),
            total_images,
            successful,
            failed: total_images - successful,
            success_rate,
            total_barcodes_found,
            distinct_barcodes: distinct.len() as u64,
            barcodes_seen: self.barcodes_seen.len(&rtxn)?,
            undecodable_entries: total_entries - total_images,
            last_processed_at,
        })
    }
}

fn for_each_record(
    db: &StrDb,
    rtxn: &RoTxn<'_>,
    mut f: impl FnMut(&str, ImageRecord),
) -> Result<()> {
    for item in db.iter(rtxn)? {
        let (path, raw) = item?;
        let Ok(record) = serde_json::from_str::<ImageRecord>(raw) else {
            continue;
        };
        f(path, record);
    }
    Ok(())
}

fn open_env(db_path: &Path) -> heed::Result<Env> {
    let mut options = EnvOpenOptions::new();
    options.map_size(DEFAULT_MAP_SIZE);
    options.max_dbs(DEFAULT_MAX_DBS);
    // SAFETY: We do not use NO_LOCK and keep default LMDB locking guarantees.
    // NO_SUB_DIR keeps the store as a single file at the configured path.
    unsafe {
        options.flags(EnvFlags::NO_SUB_DIR);
        options.open(db_path)
    }
}

fn open_store(db_path: &Path) -> heed::Result<(Env, StrDb, StrDb)> {
    let env = open_env(db_path)?;
    let mut wtxn = env.write_txn()?;
    let images = env.create_database::<Str, Str>(&mut wtxn, Some(IMAGES_DB))?;
    let barcodes_seen = env.create_database::<Str, Str>(&mut wtxn, Some(BARCODES_SEEN_DB))?;
    let _inventory = env.create_database::<Str, Str>(&mut wtxn, Some(INVENTORY_DB))?;
    wtxn.commit()?;
    Ok((env, images, barcodes_seen))
}

fn is_corruption(err: &heed::Error) -> bool {
    matches!(
        err,
        heed::Error::Mdb(
            MdbError::Invalid
                | MdbError::Corrupted
                | MdbError::VersionMismatch
                | MdbError::PageNotFound
                | MdbError::Incompatible
        )
    )
}

fn quarantine(db_path: &Path, err: &heed::Error) -> Result<CacheRecovery> {
    let stamp = Utc::now().timestamp();
    let mut target = db_path.as_os_str().to_os_string();
    target.push(format!(".corrupt-{stamp}"));
    let target = PathBuf::from(target);

    std::fs::rename(db_path, &target).map_err(|e| Error::CacheCorrupted {
        path: db_path.to_path_buf(),
        reason: format!("{err}; moving it aside failed: {e}"),
    })?;
    let lock = lock_path(db_path);
    if lock.exists() {
        std::fs::remove_file(&lock).map_err(|e| Error::io(&lock, e))?;
    }

    Ok(CacheRecovery {
        quarantined_to: target,
        reason: err.to_string(),
    })
}

pub(crate) fn lock_path(db_path: &Path) -> PathBuf {
    let mut os = db_path.as_os_str().to_os_string();
    os.push("-lock");
    PathBuf::from(os)
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub db_path: String,
    pub total_images: u64,
    pub successful: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub total_barcodes_found: u64,
    pub distinct_barcodes: u64,
    pub barcodes_seen: u64,
    pub undecodable_entries: u64,
    pub last_processed_at: Option<DateTime<Utc>>,
}
