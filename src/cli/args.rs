//! Command-line argument parsing for atelier
//!
//! Provides clap-based CLI with subcommands and verbosity control.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// atelier - Background tasks and trend-aware fashion recommendations
#[derive(Parser, Debug)]
#[command(name = "atelier")]
#[command(version)]
#[command(about = "Run fashion recommendations directly or through a background worker pool", long_about = None)]
pub struct Args {
    /// Configuration file path (default: ~/.atelier/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbosity level: default (configured), -v (debug), -vv (trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Get personalized recommendations for a query
    Recommend {
        /// What the user is looking for
        #[arg(value_name = "QUERY")]
        query: String,

        /// Submit as a background task and poll for the result
        #[arg(long)]
        queued: bool,

        /// Maximum number of trends to retrieve
        #[arg(long)]
        limit: Option<usize>,

        /// Minimum cosine similarity for a trend to be used
        #[arg(long)]
        threshold: Option<f32>,
    },

    /// Submit hello_task and wait for it
    Hello {
        #[arg(default_value = "World")]
        name: String,
    },

    /// Display effective configuration (secrets masked)
    Config,

    /// Embed a JSON list of trend documents into the vector store
    Ingest {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

impl Args {
    /// Log filter implied by -v flags, if any
    pub fn log_level_override(&self) -> Option<&'static str> {
        match self.verbose {
            0 => None,
            1 => Some("debug"),
            _ => Some("trace"),
        }
    }
}
