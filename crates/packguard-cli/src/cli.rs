//! CLI argument definitions for packguard.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// packguard -- validate, inspect and run sandboxed packs.
#[derive(Parser)]
#[command(
    name = "packguard",
    version,
    about = "packguard -- sandbox for third-party packs",
    long_about = "Validates pack binaries, loads them into an isolated WebAssembly \
                  sandbox, and runs their operations under permission and resource limits."
)]
pub struct Cli {
    /// Sandbox configuration file (TOML).
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Default log level when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check whether a pack binary is trusted.
    Validate {
        /// Path to the pack binary.
        path: PathBuf,
    },

    /// Load a pack and print its capability table.
    Inspect {
        /// Path to the pack binary.
        path: PathBuf,
    },

    /// Load a pack, run one operation, print the JSON result, and unload.
    Run {
        /// Path to the pack binary.
        path: PathBuf,

        /// Operation to invoke.
        method: String,

        /// JSON arguments passed to the operation.
        #[arg(long, default_value = "null")]
        args: String,

        /// Override the maximum execution time (milliseconds).
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Grant UI access.
        #[arg(long, conflicts_with = "deny_ui")]
        allow_ui: bool,

        /// Revoke UI access.
        #[arg(long)]
        deny_ui: bool,
    },

    /// Load every pack in a directory and print the loaded set as JSON.
    Scan {
        /// Directory containing pack binaries.
        dir: PathBuf,
    },
}
