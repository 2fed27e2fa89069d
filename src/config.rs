//! Configuration loading.
//!
//! Loads `./warden.toml` (or `$WARDEN_CONFIG_PATH`). Environment variables
//! override file values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::analysis::taint::{SinkKind, SourceKind};
use crate::analysis::Severity;
use crate::sandbox::{BackendKind, SandboxPolicy};

// ── Top-level config ────────────────────────────────────────────

/// Top-level configuration loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    /// Tracing filter used when `RUST_LOG` is unset.
    pub log_level: LogLevel,
    /// Static analysis settings (`[analysis]`).
    pub analysis: AnalysisConfig,
    /// Taint tracking rules (`[taint]`).
    pub taint: TaintConfig,
    /// Token store settings (`[capability]`).
    pub capability: CapabilityConfig,
    /// Executor and default policy (`[sandbox]`).
    pub sandbox: SandboxConfig,
    /// Audit pipeline settings (`[audit]`).
    pub audit: AuditConfig,
}

/// Log filter directive, `info` by default.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct LogLevel(pub String);

impl Default for LogLevel {
    fn default() -> Self {
        Self("info".to_string())
    }
}

impl WardenConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// If the file does not exist, returns defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
                    .with_context(|| format!("invalid config at {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config file {}: {e}",
                path.display()
            )),
        }
    }

    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env("WARDEN_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("warden.toml"))
    }

    /// Apply environment variable overrides using the given resolver.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("WARDEN_LOG_LEVEL") {
            self.log_level = LogLevel(v);
        }
        if let Some(v) = env("WARDEN_AUDIT_LOG") {
            self.audit.log_path = PathBuf::from(v);
        }
        if let Some(v) = env("WARDEN_DOCKER_IMAGE") {
            self.sandbox.docker_image = v;
        }
        if let Some(v) = env("WARDEN_BACKEND") {
            match v.parse() {
                Ok(kind) => self.sandbox.backend = kind,
                Err(_) => tracing::warn!(
                    var = "WARDEN_BACKEND",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("WARDEN_BLOCK_THRESHOLD") {
            match v.parse() {
                Ok(severity) => self.analysis.block_threshold = severity,
                Err(_) => tracing::warn!(
                    var = "WARDEN_BLOCK_THRESHOLD",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
    }

    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error when the TOML is malformed or the default policy is invalid.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: WardenConfig = toml::from_str(toml_str).context("failed to parse config TOML")?;
        config
            .sandbox
            .policy
            .validate()
            .context("invalid [sandbox.policy]")?;
        Ok(config)
    }
}

// ── Analysis ────────────────────────────────────────────────────

/// Detector settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Findings at or above this severity block execution.
    pub block_threshold: Severity,
    /// Modules whose import is a finding.
    pub denied_modules: Vec<String>,
    /// Denied modules the caller has explicitly granted.
    pub granted_modules: Vec<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            block_threshold: Severity::High,
            denied_modules: [
                "os",
                "subprocess",
                "socket",
                "ctypes",
                "pickle",
                "marshal",
                "shutil",
                "sys",
                "importlib",
                "builtins",
                "pty",
                "multiprocessing",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            granted_modules: Vec::new(),
        }
    }
}

// ── Taint ───────────────────────────────────────────────────────

/// A call that introduces untrusted data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRule {
    /// Dotted call name, matched on `.` boundaries.
    pub call: String,
    /// Source category.
    pub kind: SourceKind,
}

/// A call that must not receive untrusted data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkRule {
    /// Dotted call name, matched on `.` boundaries.
    pub call: String,
    /// Sink category.
    pub kind: SinkKind,
}

/// Taint tracking rules.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TaintConfig {
    /// Source calls.
    pub sources: Vec<SourceRule>,
    /// Sink calls.
    pub sinks: Vec<SinkRule>,
    /// Calls whose result is considered clean.
    pub sanitizers: Vec<String>,
    /// Functions whose parameters are external input.
    pub entry_points: Vec<String>,
}

fn sources(kind: SourceKind, calls: &'static [&'static str]) -> impl Iterator<Item = SourceRule> {
    calls.iter().map(move |c| SourceRule {
        call: (*c).to_string(),
        kind,
    })
}

fn sinks(kind: SinkKind, calls: &'static [&'static str]) -> impl Iterator<Item = SinkRule> {
    calls.iter().map(move |c| SinkRule {
        call: (*c).to_string(),
        kind,
    })
}

impl Default for TaintConfig {
    fn default() -> Self {
        let sources = sources(
            SourceKind::UserInput,
            &[
                "input",
                "sys.stdin.read",
                "sys.stdin.readline",
                "request.args.get",
                "request.form.get",
                "request.get_json",
                "request.cookies.get",
            ],
        )
        .chain(sources(
            SourceKind::NetworkRead,
            &[
                "requests.get",
                "requests.post",
                "urllib.request.urlopen",
                "socket.recv",
            ],
        ))
        .chain(sources(SourceKind::FileRead, &["open", "json.load"]))
        .chain(sources(
            SourceKind::Environment,
            &["os.getenv", "os.environ.get"],
        ))
        .collect();

        let sinks = sinks(
            SinkKind::SqlQuery,
            &["cursor.execute", "cursor.executemany", "db.execute"],
        )
        .chain(sinks(
            SinkKind::ShellCommand,
            &[
                "os.system",
                "os.popen",
                "subprocess.run",
                "subprocess.call",
                "subprocess.Popen",
                "subprocess.check_output",
            ],
        ))
        .chain(sinks(SinkKind::CodeEvaluation, &["eval", "exec", "compile"]))
        .chain(sinks(
            SinkKind::FilePath,
            &["os.remove", "os.unlink", "os.rmdir", "shutil.rmtree"],
        ))
        .chain(sinks(
            SinkKind::NetworkRequest,
            &["urllib.request.Request", "http.client.HTTPConnection"],
        ))
        .collect();

        Self {
            sources,
            sinks,
            sanitizers: [
                "shlex.quote",
                "html.escape",
                "int",
                "float",
                "bool",
                "os.path.basename",
                "re.escape",
                "urllib.parse.quote",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            entry_points: vec!["main".to_string(), "handler".to_string()],
        }
    }
}

// ── Capability ──────────────────────────────────────────────────

/// Token store settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    /// Lifetime of tokens acquired without an explicit TTL.
    pub default_ttl_seconds: u64,
    /// Maximum nesting depth of contexts below a root.
    pub max_depth: usize,
    /// Seconds between sweeps of expired and revoked tokens.
    pub purge_interval_seconds: u64,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 3600,
            max_depth: 32,
            purge_interval_seconds: 300,
        }
    }
}

// ── Sandbox ─────────────────────────────────────────────────────

/// Executor settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Isolation backend for spawned programs.
    pub backend: BackendKind,
    /// Image used by the Docker backend.
    pub docker_image: String,
    /// End the whole run on the first capability denial.
    pub abort_on_denial: bool,
    /// Policy applied when a submission does not carry one.
    pub policy: SandboxPolicy,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Process,
            docker_image: "python:3.12-slim".to_string(),
            abort_on_denial: false,
            policy: SandboxPolicy::default(),
        }
    }
}

// ── Audit ───────────────────────────────────────────────────────

/// Audit pipeline settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Append-only JSON lines log.
    pub log_path: PathBuf,
    /// Ingestion queue capacity; producers wait when it is full.
    pub buffer_capacity: usize,
    /// Maximum events committed per write.
    pub batch_size: usize,
    /// Upper bound on the retry backoff for failed writes.
    pub max_backoff_ms: u64,
    /// Denials from one identity that open an incident.
    pub denial_threshold: usize,
    /// Window over which denials are counted.
    pub denial_window_seconds: u64,
    /// Environment variables whose values are redacted from payloads.
    pub redact_env: Vec<String>,
    /// Rate anomaly detection.
    pub anomaly: AnomalyConfig,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("warden-audit.jsonl"),
            buffer_capacity: 1024,
            batch_size: 64,
            max_backoff_ms: 2000,
            denial_threshold: 5,
            denial_window_seconds: 60,
            redact_env: Vec::new(),
            anomaly: AnomalyConfig::default(),
        }
    }
}

/// Rolling baseline parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Width of one counting window.
    pub window_seconds: u64,
    /// Completed windows kept in the baseline.
    pub history: usize,
    /// Windows of history required before anything is flagged.
    pub min_windows: usize,
    /// Standard deviations above the mean that count as anomalous.
    pub threshold_sigma: f64,
    /// Minimum events in a window before it can be flagged.
    pub min_count: u64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            window_seconds: 60,
            history: 30,
            min_windows: 5,
            threshold_sigma: 3.0,
            min_count: 10,
        }
    }
}

/// Resolve the per-user state directory (`~/.warden/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn state_dir() -> Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".warden"))
}
