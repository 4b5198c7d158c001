//! CLI entry point for packguard.
//!
//! This binary provides the `packguard` command with subcommands for
//! validating, inspecting, running and scanning packs.

mod cli;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use packguard_sandbox::{
    PermissionSet, SandboxConfig, SandboxError, SandboxRuntime, SignatureValidator,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Validate { path } => cmd_validate(config, &path),
        Commands::Inspect { path } => cmd_inspect(config, &path).await,
        Commands::Run {
            path,
            method,
            args,
            timeout_ms,
            allow_ui,
            deny_ui,
        } => {
            let ui = if allow_ui {
                Some(true)
            } else if deny_ui {
                Some(false)
            } else {
                None
            };
            cmd_run(config, &path, &method, &args, timeout_ms, ui).await
        }
        Commands::Scan { dir } => cmd_scan(config, &dir).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<SandboxConfig> {
    match path {
        Some(path) => SandboxConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(SandboxConfig::default()),
    }
}

// ---------------------------------------------------------------------------
// Subcommand: validate
// ---------------------------------------------------------------------------

fn cmd_validate(config: SandboxConfig, path: &Path) -> Result<()> {
    let validator = SignatureValidator::new(&config).context("invalid trust configuration")?;
    match validator.check(path) {
        Ok(()) => {
            println!("trusted: {}", path.display());
            Ok(())
        }
        Err(reason) => {
            println!("untrusted: {} ({reason})", path.display());
            std::process::exit(1);
        }
    }
}

// ---------------------------------------------------------------------------
// Subcommand: inspect
// ---------------------------------------------------------------------------

async fn cmd_inspect(config: SandboxConfig, path: &Path) -> Result<()> {
    let runtime = SandboxRuntime::new(config).context("failed to start sandbox")?;
    let identity = runtime
        .load_pack_securely(path, None)
        .await
        .context("failed to load pack")?;

    let info = runtime
        .loaded_packs()
        .into_iter()
        .find(|p| p.name == identity.name)
        .context("pack disappeared after loading")?;

    println!("pack: {}", info.name);
    println!("operations:");
    for op in &info.operations {
        println!("  {op}");
    }

    runtime.unload_pack(&identity.name).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: run
// ---------------------------------------------------------------------------

async fn cmd_run(
    config: SandboxConfig,
    path: &Path,
    method: &str,
    args: &str,
    timeout_ms: Option<u64>,
    allow_ui: Option<bool>,
) -> Result<()> {
    let args: serde_json::Value =
        serde_json::from_str(args).context("--args must be valid JSON")?;

    let mut permissions: PermissionSet = config.default_permissions.clone();
    if let Some(ms) = timeout_ms {
        permissions = permissions.with_max_execution_time(Duration::from_millis(ms));
    }
    if let Some(ui) = allow_ui {
        permissions = permissions.with_ui(ui);
    }

    let runtime = SandboxRuntime::new(config).context("failed to start sandbox")?;
    let identity = runtime
        .load_pack_securely(path, Some(permissions))
        .await
        .context("failed to load pack")?;
    info!(pack = %identity.name, method, "running pack operation");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling");
                cancel.cancel();
            }
        });
    }

    let outcome = runtime
        .execute_pack_method(&identity.name, method, args, &cancel)
        .await;
    runtime.unload_pack(&identity.name).await?;

    match outcome {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(SandboxError::Cancelled { .. }) => bail!("cancelled"),
        Err(err) => Err(err).context("pack operation failed"),
    }
}

// ---------------------------------------------------------------------------
// Subcommand: scan
// ---------------------------------------------------------------------------

async fn cmd_scan(config: SandboxConfig, dir: &Path) -> Result<()> {
    let runtime = SandboxRuntime::new(config).context("failed to start sandbox")?;
    let loaded = runtime
        .load_directory(dir)
        .await
        .with_context(|| format!("failed to scan {}", dir.display()))?;
    info!(count = loaded.len(), "packs loaded");

    println!("{}", serde_json::to_string_pretty(&runtime.loaded_packs())?);

    for identity in loaded {
        runtime.unload_pack(&identity.name).await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Initialize the global tracing subscriber.
fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_arguments_parse() {
        let cli = Cli::try_parse_from([
            "packguard",
            "--log-level",
            "debug",
            "run",
            "packs/sample.wasm",
            "ping",
            "--args",
            r#"{"x":1}"#,
            "--timeout-ms",
            "250",
            "--deny-ui",
        ])
        .unwrap();
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Run {
                method,
                timeout_ms,
                deny_ui,
                allow_ui,
                ..
            } => {
                assert_eq!(method, "ping");
                assert_eq!(timeout_ms, Some(250));
                assert!(deny_ui);
                assert!(!allow_ui);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn conflicting_ui_flags_are_rejected() {
        assert!(
            Cli::try_parse_from(["packguard", "run", "a.wasm", "ping", "--allow-ui", "--deny-ui"])
                .is_err()
        );
    }

    #[test]
    fn missing_config_file_is_an_error() {
        assert!(load_config(Some(Path::new("/definitely/missing.toml"))).is_err());
        assert!(load_config(None).is_ok());
    }
}
