use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::processor::DEFAULT_RECOGNITION_TIMEOUT;
use crate::verify::{DEFAULT_FUZZY_CUTOFF, DEFAULT_MISMATCH_PENALTY, DEFAULT_VERIFICATION_THRESHOLD};

#[derive(Debug, Clone, Parser)]
#[command(name = "shelfcheck")]
#[command(about = "Extract barcodes from product photos and verify inventory claims against them")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, value_name = "FILE", global = true)]
    pub db: Option<PathBuf>,

    /// Recognition program; `{image}` in its arguments is replaced by the image path
    #[arg(long, value_name = "PROGRAM", global = true)]
    pub recognizer: Option<PathBuf>,

    #[arg(long = "recognizer-arg", value_name = "ARG", global = true, allow_hyphen_values = true)]
    pub recognizer_args: Vec<String>,

    #[arg(long, value_name = "SECS", global = true, default_value_t = DEFAULT_RECOGNITION_TIMEOUT.as_secs())]
    pub timeout_secs: u64,

    #[arg(long, value_name = "SCORE", global = true, default_value_t = DEFAULT_VERIFICATION_THRESHOLD)]
    pub threshold: f64,

    #[arg(long, value_name = "SCORE", global = true, default_value_t = DEFAULT_FUZZY_CUTOFF)]
    pub fuzzy_cutoff: f64,

    #[arg(long, value_name = "SCORE", global = true, default_value_t = DEFAULT_MISMATCH_PENALTY)]
    pub mismatch_penalty: f64,

    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Extract barcodes and attributes from one image
    Process {
        image: PathBuf,

        #[arg(long)]
        force: bool,

        #[arg(long)]
        update_inventory: bool,
    },
    /// Check whether a barcode matches the product in an image
    Verify { barcode: String, image: PathBuf },
    /// Process every image directly inside a directory
    Batch {
        #[arg(value_name = "DIR", default_value = "images")]
        dir: PathBuf,

        #[arg(long)]
        force: bool,

        #[arg(long)]
        update_inventory: bool,

        /// Also write the report as JSON to this file
        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Forget one image, or every cached record when no path is given
    Clear {
        image: Option<PathBuf>,

        /// Delete the database files instead of emptying them
        #[arg(long, conflicts_with = "image")]
        purge: bool,
    },
    Stats,
    List,
    #[command(subcommand)]
    Inventory(InventoryCommand),
}

#[derive(Debug, Clone, Subcommand)]
pub enum InventoryCommand {
    List,
    Add { barcode: String },
    Remove { barcode: String },
    Show { barcode: String },
    /// Remove every inventory item
    Reset,
}
