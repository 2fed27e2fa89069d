//! Warden CLI entry point.
//!
//! Provides `scan`, `match`, `verify-audit`, and `health` subcommands for
//! one-shot analysis, grant checks, audit log verification, and backend
//! checks.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{debug, info};

use warden::analysis::{Analyzer, SecurityError};
use warden::ast::Program;
use warden::audit::{verify_chain, JsonlAuditStore};
use warden::capability::{normalize_resource, Grant};
use warden::config::WardenConfig;
use warden::sandbox::{BackendKind, DockerBackend, IsolationBackend, ProcessBackend};

/// Exit code for a program rejected by static analysis.
const EXIT_BLOCKED: u8 = 2;

/// Capability-gated sandbox for generated programs.
#[derive(Parser)]
#[command(name = "warden", version, about)]
struct Cli {
    /// Also write JSON logs with daily rotation to DIR (default `~/.warden/logs`).
    #[arg(long, value_name = "DIR", num_args = 0..=1, require_equals = true, global = true)]
    log_dir: Option<Option<PathBuf>>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Statically analyze a program given as AST JSON.
    Scan {
        /// Path to the program's AST JSON.
        ast: PathBuf,
    },
    /// Check whether a grant covers a resource.
    Match {
        /// Grant string, e.g. `file.read:/data/**`.
        grant: String,
        /// Resource path or URL.
        resource: String,
    },
    /// Verify the hash chain of an audit log.
    VerifyAudit {
        /// Path to the JSON lines audit log.
        log: PathBuf,
    },
    /// Check that the configured isolation backend is usable.
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = WardenConfig::load().context("failed to load configuration")?;
    let _log_guard = match &cli.log_dir {
        Some(dir) => {
            let dir = match dir {
                Some(dir) => dir.clone(),
                None => warden::config::state_dir()?.join("logs"),
            };
            Some(warden::logging::init_production(&dir, &config.log_level.0)?)
        }
        None => {
            warden::logging::init_cli(&config.log_level.0);
            None
        }
    };

    match cli.command {
        Command::Scan { ast } => handle_scan(&config, &ast).await,
        Command::Match { grant, resource } => handle_match(&grant, &resource),
        Command::VerifyAudit { log } => handle_verify(&log).await,
        Command::Health => handle_health(&config).await,
    }
}

/// Print findings as JSON; exit 2 when the program is blocked.
async fn handle_scan(config: &WardenConfig, path: &Path) -> anyhow::Result<ExitCode> {
    let source = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let program = Program::from_json(&source)
        .with_context(|| format!("invalid program AST in {}", path.display()))?;
    debug!(program = %program.name, "scanning");

    let analyzer = Analyzer::new(&config.analysis, &config.taint);
    match analyzer.analyze(&program) {
        Ok(report) => {
            let out = json!({
                "program": report.program,
                "blocked": false,
                "findings": report.findings,
                "flows": report.flows,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(SecurityError::Blocked {
            program,
            threshold,
            blocking,
            findings,
        }) => {
            let out = json!({
                "program": program,
                "blocked": true,
                "threshold": threshold,
                "blocking": blocking,
                "findings": findings,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(ExitCode::from(EXIT_BLOCKED))
        }
    }
}

/// Print whether the grant covers the resource; exit 1 when it does not.
fn handle_match(grant: &str, resource: &str) -> anyhow::Result<ExitCode> {
    let grant = Grant::parse(grant).context("invalid grant")?;
    let normalized = normalize_resource(resource);
    let matched = grant.pattern.matches(resource);
    let out = json!({
        "grant": grant.to_string(),
        "resource": resource,
        "normalized": normalized.as_ref().ok(),
        "matches": matched,
        "reason": normalized.err().map(|e| e.to_string()),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(if matched {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Verify an audit log's hash chain.
async fn handle_verify(log: &Path) -> anyhow::Result<ExitCode> {
    let events = JsonlAuditStore::read_all(log)
        .await
        .with_context(|| format!("failed to read audit log {}", log.display()))?;
    match verify_chain(&events) {
        Ok(()) => {
            info!(events = events.len(), "audit chain verified");
            println!("ok: {} events, chain intact", events.len());
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            println!("tampered: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Report backend health.
async fn handle_health(config: &WardenConfig) -> anyhow::Result<ExitCode> {
    let status = match config.sandbox.backend {
        BackendKind::Process => ProcessBackend::new().health_check().await?,
        BackendKind::Docker => {
            DockerBackend::connect(config.sandbox.docker_image.clone())?
                .health_check()
                .await?
        }
    };
    println!("{}: {}", status.kind, status.details);
    Ok(if status.is_healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
