use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::lock_path;
use crate::cli::Cli;
use crate::processor::ProcessorConfig;
use crate::recognition::CommandRecognizer;
use crate::verify::VerificationPolicy;

pub const DB_ENV: &str = "SHELFCHECK_DB";
pub const RECOGNIZER_ENV: &str = "SHELFCHECK_RECOGNIZER";
pub const LOG_ENV: &str = "SHELFCHECK_LOG";
pub const DEFAULT_RECOGNIZER: &str = "shelfcheck-recognize";

pub fn resolve_db_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(p) = cli.db.clone() {
        return Ok(p);
    }

    if let Some(p) = env::var_os(DB_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(p));
    }

    Ok(shelfcheck_home()?.join("cache.lmdb"))
}

pub fn resolve_recognizer(cli: &Cli) -> CommandRecognizer {
    let program = cli
        .recognizer
        .clone()
        .or_else(|| env::var_os(RECOGNIZER_ENV).filter(|v| !v.is_empty()).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RECOGNIZER));
    CommandRecognizer::new(program, cli.recognizer_args.clone())
        .with_timeout(Duration::from_secs(cli.timeout_secs))
}

pub fn processor_config(cli: &Cli) -> Result<ProcessorConfig> {
    if cli.timeout_secs == 0 {
        anyhow::bail!("--timeout-secs must be at least 1");
    }
    Ok(ProcessorConfig {
        recognition_timeout: Duration::from_secs(cli.timeout_secs),
    })
}

pub fn verification_policy(cli: &Cli) -> Result<VerificationPolicy> {
    let policy = VerificationPolicy {
        verification_threshold: cli.threshold,
        fuzzy_cutoff: cli.fuzzy_cutoff,
        mismatch_penalty: cli.mismatch_penalty,
    };
    policy.validate()?;
    Ok(policy)
}

/// Deletes the store file and its lock file. Quarantined copies are kept.
pub fn clear_db(db_path: &Path) -> Result<()> {
    remove_file_if_exists(db_path, "db")?;
    remove_file_if_exists(&lock_path(db_path), "db lock")?;
    Ok(())
}

fn shelfcheck_home() -> Result<PathBuf> {
    let base = dirs::data_local_dir()
        .or_else(dirs::cache_dir)
        .or_else(dirs::home_dir)
        .ok_or_else(|| anyhow::anyhow!("Failed to resolve data directory"))?;
    Ok(base.join("shelfcheck"))
}

fn remove_file_if_exists(path: &Path, kind: &str) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove {kind} file: {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use crate::processor::DEFAULT_RECOGNITION_TIMEOUT;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("shelfcheck").chain(args.iter().copied()))
    }

    #[test]
    fn explicit_db_flag_wins() -> Result<()> {
        let cli = parse(&["--db", "/tmp/explicit.lmdb", "stats"]);
        assert_eq!(resolve_db_path(&cli)?, PathBuf::from("/tmp/explicit.lmdb"));
        Ok(())
    }

    #[test]
    fn defaults_match_documented_values() -> Result<()> {
        let cli = parse(&["stats"]);
        let config = processor_config(&cli)?;
        assert_eq!(config.recognition_timeout, Duration::from_secs(30));
        assert_eq!(verification_policy(&cli)?, VerificationPolicy::default());
        Ok(())
    }

    #[test]
    fn rejects_zero_timeout_and_bad_threshold() {
        assert!(processor_config(&parse(&["--timeout-secs", "0", "stats"])).is_err());
        assert!(verification_policy(&parse(&["--threshold", "2", "stats"])).is_err());
    }

    #[test]
    fn recognizer_flag_and_args_are_passed_through() {
        let cli = parse(&[
            "--recognizer",
            "/opt/ocr",
            "--recognizer-arg",
            "--json",
            "--recognizer-arg",
            "{image}",
            "stats",
        ]);
        let recognizer = resolve_recognizer(&cli);
        assert_eq!(recognizer.program(), Path::new("/opt/ocr"));
        assert_eq!(recognizer.timeout(), Some(DEFAULT_RECOGNITION_TIMEOUT));
    }

    #[test]
    fn clear_db_removes_store_and_lock() -> Result<()> {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos();
        let db = std::env::temp_dir().join(format!(
            "shelfcheck_config_{}_{}.lmdb",
            std::process::id(),
            nanos
        ));
        std::fs::write(&db, b"x")?;
        std::fs::write(lock_path(&db), b"x")?;

        clear_db(&db)?;
        assert!(!db.exists());
        assert!(!lock_path(&db).exists());
        clear_db(&db)?;
        Ok(())
    }
}
