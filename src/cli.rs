use clap::{Parser, Subcommand};
use std::path::PathBuf;
use transcriptforge::orchestrator::Role;
use transcriptforge_common::Phase;

#[derive(Parser)]
#[command(name = "transcriptforge")]
#[command(author, version, about = "Resumable transcript and content extraction pipeline")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Drive collections through download, transcription and extraction
    Run {
        /// Collection name, or "all"
        #[arg(default_value = "all")]
        collection: String,

        /// Maximum number of items to process in this invocation
        #[arg(long)]
        limit: Option<usize>,

        /// Which stages this worker drives
        #[arg(long, value_enum, default_value_t = Role::All)]
        role: Role,

        /// Delete intermediate audio after a passing verification
        #[arg(long)]
        confirm: bool,
    },

    /// Check that a collection is complete on disk
    Verify {
        /// Collection name, or "all"
        #[arg(default_value = "all")]
        collection: String,
    },

    /// Verify and then delete intermediate audio (dry run unless --confirm)
    Cleanup {
        /// Collection name, or "all"
        #[arg(default_value = "all")]
        collection: String,

        /// Actually delete files
        #[arg(long)]
        confirm: bool,
    },

    /// Show processing progress
    Status {
        /// Collection name, or "all"
        #[arg(default_value = "all")]
        collection: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,

        /// Refresh every SECS seconds until interrupted
        #[arg(long, value_name = "SECS")]
        watch: Option<u64>,
    },

    /// Put a unit back to an earlier phase so it is processed again
    Reset {
        /// Collection name
        collection: String,

        /// Item index within the collection
        #[arg(long)]
        index: u32,

        /// Phase to return the unit to
        #[arg(long, default_value = "not_started")]
        to: Phase,
    },

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        #[arg(value_name = "CONFIG")]
        file: Option<PathBuf>,
    },

    /// Display version information
    Version,
}
