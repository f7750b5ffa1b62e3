//! Command line interface of the `quillforge` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Operator tooling for the quillforge generation core.
#[derive(Debug, Parser)]
#[command(name = "quillforge", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Load and validate configuration, then print it as TOML.
    CheckConfig {
        /// TOML configuration file; defaults and QUILLFORGE__* variables apply without one
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// List persisted job records and checkpoints.
    Inspect {
        /// Directory of a file-backed checkpoint store
        #[arg(long)]
        store: PathBuf,
    },

    /// Run a batch end to end against the simulated generator and ledger.
    Simulate {
        /// JSON file holding an array of generation requests
        #[arg(long)]
        requests: PathBuf,

        #[arg(long)]
        config: Option<PathBuf>,

        /// Persist checkpoints here and recover from it before submitting
        #[arg(long)]
        store: Option<PathBuf>,

        /// Generation calls that fail transiently before the generator recovers
        #[arg(long, default_value_t = 0)]
        transient_failures: u32,

        /// Monthly budget of every user, in cents
        #[arg(long, default_value_t = 10_000)]
        budget: u64,

        /// Hide the progress bar
        #[arg(long, default_value_t = false)]
        quiet: bool,
    },
}
