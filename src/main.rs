use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use shelfcheck::batch::{BatchOptions, StopSignal, batch_process_directory};
use shelfcheck::cache::{CacheRecovery, ImageRecord, ProcessingCache};
use shelfcheck::cli::{Cli, Commands, InventoryCommand};
use shelfcheck::config::{
    LOG_ENV, clear_db, processor_config, resolve_db_path, resolve_recognizer, verification_policy,
};
use shelfcheck::hashing::cache_key;
use shelfcheck::inventory::{Inventory, InventorySync};
use shelfcheck::processor::ImageProcessor;
use shelfcheck::verify::Verifier;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command.clone() {
        Commands::Clear { image: None, purge: true } => {
            let db_path = resolve_db_path(&cli)?;
            clear_db(&db_path)?;
            print_json(&ClearOutput {
                removed: None,
                purged: true,
                db_path: db_path.to_string_lossy().to_string(),
            })?;
        }
        Commands::Clear { image, .. } => {
            let cache = open_cache(&cli)?;
            let processor = build_processor(&cli, &cache)?;
            let removed = processor.clear_cache(image.as_deref())?;
            print_json(&ClearOutput {
                removed: Some(removed),
                purged: false,
                db_path: cache.db_path().to_string_lossy().to_string(),
            })?;
        }
        Commands::Stats => {
            let cache = open_cache(&cli)?;
            let inventory = Inventory::new(cache.db())?;
            print_json(&StatsOutput {
                cache: cache.stats()?,
                inventory: inventory.summary()?,
                recovery: cache.recovery(),
            })?;
        }
        Commands::List => {
            let cache = open_cache(&cli)?;
            print_json(&cache.entries()?)?;
        }
        Commands::Process {
            image,
            force,
            update_inventory,
        } => {
            let cache = open_cache(&cli)?;
            let processor = build_processor(&cli, &cache)?;
            let record = processor
                .process_image(&image, force)
                .with_context(|| format!("Failed to process {}", image.display()))?;
            let inventory = if update_inventory {
                Some(sync_inventory(&cache, &image, &record)?)
            } else {
                None
            };
            print_json(&ProcessOutput {
                path: cache_key(&image)?,
                record,
                inventory,
                recovery: cache.recovery(),
            })?;
        }
        Commands::Verify { barcode, image } => {
            let cache = open_cache(&cli)?;
            let processor = build_processor(&cli, &cache)?;
            let inventory = Inventory::new(cache.db())?;
            let verifier = Verifier::new(&processor, &inventory, verification_policy(&cli)?);
            let result = verifier
                .verify(&barcode, &image)
                .with_context(|| format!("Failed to verify {barcode} against {}", image.display()))?;
            print_json(&result)?;
        }
        Commands::Batch {
            dir,
            force,
            update_inventory,
            output,
        } => {
            let cache = open_cache(&cli)?;
            let processor = build_processor(&cli, &cache)?;
            let inventory = Inventory::new(cache.db())?;
            let options = BatchOptions {
                force_reprocess: force,
                ..BatchOptions::default()
            };
            let report = batch_process_directory(
                &processor,
                &dir,
                &options,
                &StopSignal::new(),
                update_inventory.then_some(&inventory),
            )
            .with_context(|| format!("Failed to process directory {}", dir.display()))?;
            if let Some(output) = output {
                write_json(&output, &report)?;
            }
            print_json(&report)?;
        }
        Commands::Inventory(command) => {
            let cache = open_cache(&cli)?;
            let inventory = Inventory::new(cache.db())?;
            run_inventory(&inventory, command)?;
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_cache(cli: &Cli) -> Result<ProcessingCache> {
    let db_path = resolve_db_path(cli)?;
    ProcessingCache::open(db_path.clone())
        .with_context(|| format!("Failed to open cache at {}", db_path.display()))
}

fn build_processor<'a>(cli: &Cli, cache: &'a ProcessingCache) -> Result<ImageProcessor<'a>> {
    let config = processor_config(cli)?;
    let recognizer = Arc::new(resolve_recognizer(cli));
    Ok(ImageProcessor::new(cache, recognizer, config)?)
}

fn sync_inventory(cache: &ProcessingCache, image: &Path, record: &ImageRecord) -> Result<InventorySync> {
    let inventory = Inventory::new(cache.db())?;
    Ok(inventory.record_extraction(&cache_key(image)?, record)?)
}

fn run_inventory(inventory: &Inventory, command: InventoryCommand) -> Result<()> {
    match command {
        InventoryCommand::List => print_json(&inventory.list()?),
        InventoryCommand::Add { barcode } => print_json(&inventory.add(&barcode)?),
        InventoryCommand::Remove { barcode } => print_json(&inventory.remove(&barcode)?),
        InventoryCommand::Show { barcode } => {
            let item = inventory
                .get(barcode.trim())?
                .with_context(|| format!("No inventory item for barcode {}", barcode.trim()))?;
            print_json(&item)
        }
        InventoryCommand::Reset => print_json(&ResetOutput {
            removed: inventory.reset()?,
        }),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_string_pretty(value)?;
    std::fs::write(path, body).with_context(|| format!("Failed to write {}", path.display()))?;
    tracing::info!(path = %path.display(), "saved report");
    Ok(())
}

#[derive(Debug, Serialize)]
struct ProcessOutput<'a> {
    path: String,
    #[serde(flatten)]
    record: ImageRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    inventory: Option<InventorySync>,
    #[serde(skip_serializing_if = "Option::is_none")]
    recovery: Option<&'a CacheRecovery>,
}

#[derive(Debug, Serialize)]
struct StatsOutput<'a> {
    cache: shelfcheck::cache::CacheStats,
    inventory: shelfcheck::inventory::InventorySummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    recovery: Option<&'a CacheRecovery>,
}

#[derive(Debug, Serialize)]
struct ResetOutput {
    removed: u64,
}

#[derive(Debug, Serialize)]
struct ClearOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    removed: Option<u64>,
    purged: bool,
    db_path: String,
}
