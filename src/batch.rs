//! Directory batch runs.
//!
//! Files are hashed in parallel, then gated, recognized and stored one at a
//! time in path order. Each finished file is committed before the next one
//! starts, so stopping a run never loses completed work.

use ignore::WalkBuilder;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::hashing::{MissReason, cache_key, fingerprint};
use crate::inventory::{Inventory, InventorySync};
use crate::processor::{ImageProcessor, ProcessOutcome};

pub const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tiff", "gif"];

/// Shared flag checked between files.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub force_reprocess: bool,
    pub extensions: Vec<String>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            force_reprocess: false,
            extensions: SUPPORTED_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Processed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchEntry {
    pub path: String,
    pub status: EntryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub miss_reason: Option<MissReason>,
    pub barcodes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub directory: String,
    pub total_files: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub new_barcodes: Vec<String>,
    pub entries: Vec<BatchEntry>,
    pub cancelled: bool,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inventory: Option<InventorySync>,
}

/// Image files directly inside `dir` whose extension is in `extensions`
/// (case-insensitive), sorted by path. Subdirectories are not entered.
pub fn collect_images(dir: &Path, extensions: &[String]) -> Vec<PathBuf> {
    let (tx, rx) = mpsc::channel();

    let walker = WalkBuilder::new(dir)
        .max_depth(Some(1))
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .ignore(false)
        .parents(false)
        .build_parallel();

    walker.run(|| {
        let tx = tx.clone();
        Box::new(move |entry| {
            if let Ok(entry) = entry
                && entry.depth() == 1
                && entry.file_type().is_some_and(|t| !t.is_dir())
                && has_extension(entry.path(), extensions)
            {
                let _ = tx.send(entry.path().to_path_buf());
            }
            ignore::WalkState::Continue
        })
    });

    drop(tx);
    let mut files: Vec<PathBuf> = rx.iter().collect();
    files.sort();
    files
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .is_some_and(|e| extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(&e)))
}

pub fn batch_process_directory(
    processor: &ImageProcessor<'_>,
    dir: &Path,
    options: &BatchOptions,
    stop: &StopSignal,
    inventory: Option<&Inventory>,
) -> Result<BatchReport> {
    let started = Instant::now();
    let meta = std::fs::metadata(dir).map_err(|e| Error::io(dir, e))?;
    if !meta.is_dir() {
        return Err(Error::validation(format!(
            "not a directory: {}",
            dir.display()
        )));
    }

    let seen_before = processor.cache().seen_barcodes()?;
    let files = collect_images(dir, &options.extensions);
    tracing::info!(dir = %dir.display(), files = files.len(), "batch started");

    let fingerprints: Vec<_> = files.par_iter().map(|p| fingerprint(p)).collect();

    let mut report = BatchReport {
        directory: dir.to_string_lossy().to_string(),
        total_files: files.len(),
        processed: 0,
        skipped: 0,
        failed: 0,
        new_barcodes: Vec::new(),
        entries: Vec::with_capacity(files.len()),
        cancelled: false,
        elapsed_ms: 0,
        inventory: inventory.map(|_| InventorySync::default()),
    };
    let mut found = BTreeSet::new();

    for (path, current) in files.iter().zip(fingerprints) {
        if stop.is_stopped() {
            report.cancelled = true;
            tracing::info!(dir = %dir.display(), "batch stopped");
            break;
        }

        let outcome = processor.process_fingerprinted(path, current, options.force_reprocess)?;
        let record = outcome.record();
        found.extend(record.barcodes.iter().cloned());

        let (status, miss_reason) = match &outcome {
            ProcessOutcome::CacheHit(_) => {
                report.skipped += 1;
                (EntryStatus::Skipped, None)
            }
            ProcessOutcome::Processed { reason, .. } => {
                report.processed += 1;
                (EntryStatus::Processed, Some(*reason))
            }
            ProcessOutcome::Failed { reason, .. } => {
                report.failed += 1;
                (EntryStatus::Failed, *reason)
            }
        };

        if let (Some(inventory), Some(sync), ProcessOutcome::Processed { record, .. }) =
            (inventory, report.inventory.as_mut(), &outcome)
        {
            let applied = inventory.record_extraction(&cache_key(path)?, record)?;
            sync.created.extend(applied.created);
            sync.updated.extend(applied.updated);
        }

        report.entries.push(BatchEntry {
            path: path.to_string_lossy().to_string(),
            status,
            miss_reason,
            barcodes: record.barcodes.iter().cloned().collect(),
            error: record.error_message.clone(),
        });
    }

    report.new_barcodes = found.difference(&seen_before).cloned().collect();
    report.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    tracing::info!(
        dir = %dir.display(),
        processed = report.processed,
        skipped = report.skipped,
        failed = report.failed,
        new_barcodes = report.new_barcodes.len(),
        cancelled = report.cancelled,
        "batch finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ProcessingCache, lock_path};
    use crate::processor::ProcessorConfig;
    use crate::recognition::{FakeRecognizer, RawRecognition, RecognitionError, Recognizer};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "shelfcheck_batch_{}_{}_{}",
            std::process::id(),
            nanos,
            name
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn temp_db_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "shelfcheck_test_{}_{}_{}.lmdb",
            std::process::id(),
            nanos,
            name
        ))
    }

    fn cleanup(dir: &Path, db_path: &Path) {
        let _ = std::fs::remove_file(db_path);
        let _ = std::fs::remove_file(lock_path(db_path));
        let _ = std::fs::remove_dir_all(dir);
    }

    struct StopAfterFirst {
        stop: StopSignal,
    }

    impl Recognizer for StopAfterFirst {
        fn recognize(&self, _image: &Path) -> std::result::Result<RawRecognition, RecognitionError> {
            self.stop.stop();
            Ok(RawRecognition {
                text_blocks: vec!["8885007027531".to_string()],
                barcode_decodes: Vec::new(),
            })
        }
    }

    #[test]
    fn collects_only_top_level_images_sorted() -> anyhow::Result<()> {
        let dir = temp_dir("collect");
        std::fs::create_dir_all(dir.join("nested"))?;
        for name in ["b.PNG", "a.jpg", "notes.txt", "c.jpeg", "nested/d.jpg"] {
            std::fs::write(dir.join(name), b"x")?;
        }

        let files = collect_images(&dir, &BatchOptions::default().extensions);
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.jpg", "b.PNG", "c.jpeg"]);

        let _ = std::fs::remove_dir_all(dir);
        Ok(())
    }

    #[test]
    fn missing_directory_is_an_error() -> anyhow::Result<()> {
        let db_path = temp_db_path("missing_db");
        let cache = ProcessingCache::open(db_path.clone())?;
        let processor =
            ImageProcessor::new(&cache, Arc::new(FakeRecognizer::new()), ProcessorConfig::default())?;

        let missing = std::env::temp_dir().join("shelfcheck_no_such_dir_for_batch");
        let err = batch_process_directory(
            &processor,
            &missing,
            &BatchOptions::default(),
            &StopSignal::new(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Io { .. }));

        drop(processor);
        drop(cache);
        let _ = std::fs::remove_file(&db_path);
        let _ = std::fs::remove_file(lock_path(&db_path));
        Ok(())
    }

    #[test]
    fn stop_between_files_keeps_finished_work() -> anyhow::Result<()> {
        let dir = temp_dir("stop");
        let db_path = temp_db_path("stop_db");
        for name in ["1.jpg", "2.jpg", "3.jpg"] {
            std::fs::write(dir.join(name), name.as_bytes())?;
        }

        let stop = StopSignal::new();
        let cache = ProcessingCache::open(db_path.clone())?;
        let processor = ImageProcessor::new(
            &cache,
            Arc::new(StopAfterFirst { stop: stop.clone() }),
            ProcessorConfig::default(),
        )?;

        let report =
            batch_process_directory(&processor, &dir, &BatchOptions::default(), &stop, None)?;
        assert!(report.cancelled);
        assert_eq!(report.total_files, 3);
        assert_eq!(report.processed, 1);
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.new_barcodes, vec!["8885007027531".to_string()]);

        let stored = cache.get(&dir.join("1.jpg"))?.expect("first file committed");
        assert!(stored.success);
        assert!(cache.get(&dir.join("2.jpg"))?.is_none());

        drop(processor);
        drop(cache);
        cleanup(&dir, &db_path);
        Ok(())
    }

    #[test]
    fn new_barcodes_exclude_previously_seen() -> anyhow::Result<()> {
        let dir = temp_dir("seen");
        let db_path = temp_db_path("seen_db");
        std::fs::write(dir.join("a.jpg"), b"a")?;
        std::fs::write(dir.join("b.jpg"), b"b")?;

        let cache = ProcessingCache::open(db_path.clone())?;
        let fake = Arc::new(
            FakeRecognizer::new()
                .with_output("a.jpg", &["8885007027531"], &[])
                .with_output("b.jpg", &["8885007027531 96385074"], &[]),
        );
        let processor = ImageProcessor::new(&cache, fake, ProcessorConfig::default())?;
        processor.process_image(&dir.join("a.jpg"), false)?;

        let report = batch_process_directory(
            &processor,
            &dir,
            &BatchOptions::default(),
            &StopSignal::new(),
            None,
        )?;
        assert_eq!(report.skipped, 1);
        assert_eq!(report.processed, 1);
        assert_eq!(report.new_barcodes, vec!["96385074".to_string()]);
        assert!(!report.cancelled);

        drop(processor);
        drop(cache);
        cleanup(&dir, &db_path);
        Ok(())
    }
}
