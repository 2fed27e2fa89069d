//! Sandboxed execution of units of work under a resource policy.
//!
//! A run moves `Created → Running → {Completed, TimedOut, Terminated, Crashed}`.
//! The unit only touches the outside world through a [`SandboxHost`], which
//! checks, in order: is the run still live, does the policy ceiling allow the
//! operation, does the context hold a capability for it. Programs are launched
//! through an [`IsolationBackend`] (separate process or container).

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::analysis::Severity;
use crate::capability::{CapabilityContext, CapabilityError};

pub mod docker;
pub mod executor;
pub mod host;
pub mod process;

pub use docker::DockerBackend;
pub use executor::{ProgramUnit, RunRegistry, SandboxExecutor, UnitOfWork};
pub use host::SandboxHost;
pub use process::ProcessBackend;

// ── Policy ──────────────────────────────────────────────────────

/// Filesystem exposure allowed by a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilesystemAccess {
    /// No file access at all.
    None,
    /// Reads wherever capabilities allow; no writes.
    #[default]
    ReadOnly,
    /// Reads and writes only under `restricted_roots`.
    Restricted,
    /// Defers entirely to capabilities.
    Full,
}

/// Immutable resource ceiling for a run.
///
/// The policy is a hard ceiling: exceeding it is a violation no matter what
/// capabilities the context holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxPolicy {
    /// Share of one CPU, 1..=100.
    pub cpu_limit_pct: u8,
    /// Memory ceiling in bytes.
    pub memory_limit_bytes: u64,
    /// Wall-clock limit.
    pub timeout_seconds: f64,
    /// Whether any network access is allowed.
    pub network_access: bool,
    /// Filesystem exposure.
    pub filesystem_access: FilesystemAccess,
    /// Roots usable under [`FilesystemAccess::Restricted`].
    pub restricted_roots: Vec<PathBuf>,
    /// Whether the unit may launch programs.
    pub process_spawn: bool,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            cpu_limit_pct: 50,
            memory_limit_bytes: 256 * 1024 * 1024,
            timeout_seconds: 30.0,
            network_access: false,
            filesystem_access: FilesystemAccess::ReadOnly,
            restricted_roots: Vec::new(),
            process_spawn: false,
        }
    }
}

/// Invalid policy values.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolicyError {
    /// Timeout must be positive and finite.
    #[error("timeout_seconds must be a positive finite number, got {0}")]
    Timeout(f64),
    /// Memory limit must be non-zero.
    #[error("memory_limit_bytes must be greater than zero")]
    Memory,
    /// CPU share must be within 1..=100.
    #[error("cpu_limit_pct must be within 1..=100, got {0}")]
    Cpu(u8),
}

impl SandboxPolicy {
    /// Reject nonsensical limits.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if !self.timeout_seconds.is_finite() || self.timeout_seconds <= 0.0 {
            return Err(PolicyError::Timeout(self.timeout_seconds));
        }
        if self.memory_limit_bytes == 0 {
            return Err(PolicyError::Memory);
        }
        if !(1..=100).contains(&self.cpu_limit_pct) {
            return Err(PolicyError::Cpu(self.cpu_limit_pct));
        }
        Ok(())
    }

    /// Wall-clock limit as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_seconds).unwrap_or(Duration::MAX)
    }

    /// CPU time a spawned program may use: `timeout × cpu_limit_pct`.
    pub fn cpu_time_budget(&self) -> Duration {
        self.timeout()
            .mul_f64(f64::from(self.cpu_limit_pct) / 100.0)
    }
}

// ── Errors ──────────────────────────────────────────────────────

/// Attempt to exceed the policy ceiling. Always fatal and CRITICAL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SandboxViolation {
    /// Network use under a policy without network access.
    #[error("network access to '{resource}' is outside the policy")]
    NetworkDisabled {
        /// Requested URL.
        resource: String,
    },
    /// File access under `NONE`.
    #[error("file access to '{path}' is outside the policy")]
    FilesystemDisabled {
        /// Requested path.
        path: String,
    },
    /// Write under `READ_ONLY`.
    #[error("write to '{path}' under a read-only policy")]
    ReadOnlyFilesystem {
        /// Requested path.
        path: String,
    },
    /// Access outside `restricted_roots`.
    #[error("'{path}' is outside the restricted roots")]
    OutsideRestrictedRoots {
        /// Requested path.
        path: String,
    },
    /// Path with an unresolvable traversal.
    #[error("unresolvable path '{path}'")]
    UnresolvablePath {
        /// Requested path.
        path: String,
    },
    /// Program launch under a policy without process spawning.
    #[error("launching '{program}' is outside the policy")]
    ProcessSpawnDisabled {
        /// Requested program.
        program: String,
    },
    /// Spawn under a policy the backend cannot enforce on a program.
    #[error("the {backend} backend cannot confine a program to this policy: {reason}")]
    Unconfinable {
        /// Backend that refused.
        backend: BackendKind,
        /// Which part of the policy it cannot enforce.
        reason: String,
    },
    /// Isolation boundary failure reported by a backend.
    #[error("isolation breach: {detail}")]
    IsolationBreach {
        /// Backend detail.
        detail: String,
    },
}

/// A resource ceiling was reached without a breach. Recoverable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceExhausted {
    /// Memory ceiling.
    #[error("memory limit of {limit_bytes} bytes exceeded ({requested_bytes} requested)")]
    Memory {
        /// Policy limit.
        limit_bytes: u64,
        /// Total that was requested or observed.
        requested_bytes: u64,
    },
    /// CPU-time budget.
    #[error("cpu time budget of {budget_ms}ms exceeded ({used_ms}ms used)")]
    CpuTime {
        /// Budget.
        budget_ms: u64,
        /// Observed usage.
        used_ms: u64,
    },
}

/// Failure of an isolation backend itself.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// Backend cannot be reached.
    #[error("isolation backend unavailable: {0}")]
    Unavailable(String),
    /// Backend operation failed.
    #[error("isolation backend failure: {0}")]
    Infrastructure(String),
}

/// Failure of a single gated operation.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    /// Context lacks the capability.
    #[error(transparent)]
    Denied(#[from] CapabilityError),
    /// Policy ceiling exceeded; the run is terminated.
    #[error(transparent)]
    Violation(#[from] SandboxViolation),
    /// Resource ceiling reached; the run is terminated.
    #[error(transparent)]
    Exhausted(#[from] ResourceExhausted),
    /// The run has already been stopped.
    #[error("run has been terminated")]
    Terminated,
    /// A spawned program ran past the policy timeout.
    #[error("spawned program timed out")]
    TimedOut,
    /// Local I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// HTTP failure.
    #[error("http error: {0}")]
    Http(String),
    /// Backend failure.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

// ── Run state ───────────────────────────────────────────────────

/// Why a run was force-terminated.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "cause", content = "detail", rename_all = "snake_case")]
pub enum TerminationCause {
    /// Policy ceiling exceeded.
    Violation(SandboxViolation),
    /// Memory or CPU ceiling reached.
    ResourceExhausted(ResourceExhausted),
    /// Capability denied with `abort_on_denial` set.
    CapabilityDenied(CapabilityError),
    /// Stopped from outside (incident response).
    External(String),
}

impl TerminationCause {
    /// Short label used in audit payloads.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Violation(_) => "violation",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::CapabilityDenied(_) => "capability_denied",
            Self::External(_) => "external",
        }
    }

    /// Audit severity of a run ending this way.
    pub fn severity(&self) -> Severity {
        match self {
            Self::Violation(_) | Self::ResourceExhausted(_) => Severity::Critical,
            Self::CapabilityDenied(_) | Self::External(_) => Severity::High,
        }
    }
}

impl fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Violation(v) => write!(f, "violation: {v}"),
            Self::ResourceExhausted(e) => write!(f, "resource exhausted: {e}"),
            Self::CapabilityDenied(e) => write!(f, "capability denied: {e}"),
            Self::External(reason) => write!(f, "terminated externally: {reason}"),
        }
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum RunState {
    /// Not started.
    Created,
    /// Unit executing.
    Running,
    /// Unit returned normally.
    Completed,
    /// Wall-clock limit reached; the unit was force-stopped.
    TimedOut,
    /// Force-terminated.
    Terminated(TerminationCause),
    /// Unit failed or panicked.
    Crashed(String),
}

impl RunState {
    /// Whether the state is final.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Created | Self::Running)
    }
}

/// Record of one execution.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxRun {
    /// Run id.
    pub id: Uuid,
    /// Unit name.
    pub unit: String,
    /// Context the run executed in.
    pub context_id: Uuid,
    /// Context name.
    pub context_name: String,
    /// Identity owning the context.
    pub identity: String,
    /// Policy applied.
    pub policy: SandboxPolicy,
    /// Current state; retained once terminal.
    pub state: RunState,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the unit started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal state.
    pub ended_at: Option<DateTime<Utc>>,
    /// Value returned by the unit.
    pub output: Option<serde_json::Value>,
}

impl SandboxRun {
    pub(crate) fn new(unit: &str, context: &CapabilityContext, policy: SandboxPolicy) -> Self {
        Self {
            id: Uuid::new_v4(),
            unit: unit.to_owned(),
            context_id: context.id(),
            context_name: context.name().to_owned(),
            identity: context.identity().to_owned(),
            policy,
            state: RunState::Created,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            output: None,
        }
    }

    /// The violation that ended the run, if any.
    pub fn violation(&self) -> Option<&SandboxViolation> {
        match &self.state {
            RunState::Terminated(TerminationCause::Violation(v)) => Some(v),
            _ => None,
        }
    }

    /// Whether the unit completed normally.
    pub fn is_completed(&self) -> bool {
        self.state == RunState::Completed
    }
}

// ── Run control ─────────────────────────────────────────────────

/// Shared stop switch for one run.
///
/// Stopping is idempotent: the first cause wins. Once stopped, the host
/// refuses new operations and discards results of in-flight ones.
#[derive(Debug)]
pub struct RunControl {
    run_id: Uuid,
    context_id: Uuid,
    cause: Mutex<Option<TerminationCause>>,
    stopped: watch::Sender<bool>,
}

impl RunControl {
    /// Control for a new run.
    pub fn new(run_id: Uuid, context_id: Uuid) -> Self {
        let (stopped, _) = watch::channel(false);
        Self {
            run_id,
            context_id,
            cause: Mutex::new(None),
            stopped,
        }
    }

    /// Run id.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Context of the run.
    pub fn context_id(&self) -> Uuid {
        self.context_id
    }

    /// Terminate with `cause`. Returns `false` if already stopped.
    pub fn terminate(&self, cause: TerminationCause) -> bool {
        let mut slot = self.cause.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() || *self.stopped.borrow() {
            return false;
        }
        *slot = Some(cause);
        self.stopped.send_replace(true);
        true
    }

    /// Stop without a termination cause (wall-clock timeout).
    pub(crate) fn halt(&self) {
        self.stopped.send_replace(true);
    }

    /// Whether the run has been stopped.
    pub fn is_stopped(&self) -> bool {
        *self.stopped.borrow()
    }

    /// Termination cause, if terminated.
    pub fn cause(&self) -> Option<TerminationCause> {
        self.cause
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Resolves once the run is stopped.
    pub async fn stopped(&self) {
        let mut rx = self.stopped.subscribe();
        // Sender lives in `self`, so this only returns once the flag is set.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

// ── Isolation backends ──────────────────────────────────────────

/// Isolation backend implementation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Child OS process.
    #[default]
    Process,
    /// Docker container.
    Docker,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Process => "process",
            Self::Docker => "docker",
        })
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" => Ok(Self::Process),
            "docker" => Ok(Self::Docker),
            other => Err(format!("unknown backend: {other}")),
        }
    }
}

/// Health of a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthStatus {
    /// Whether the backend can run programs.
    pub is_healthy: bool,
    /// Backend kind.
    pub kind: BackendKind,
    /// Human-readable diagnostics.
    pub details: String,
}

/// A program launch request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnRequest {
    /// Program path or name.
    pub program: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Text written to stdin.
    #[serde(default)]
    pub stdin: Option<String>,
    /// Working directory.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl SpawnRequest {
    /// Request to run `program` with `args`.
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| (*a).to_owned()).collect(),
            stdin: None,
            working_dir: None,
        }
    }
}

/// Captured result of a launched program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutput {
    /// Exit code, `None` when killed by a signal.
    pub exit_code: Option<i32>,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl ProcessOutput {
    /// Exit code 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs programs in an isolated process or container.
#[async_trait]
pub trait IsolationBackend: Send + Sync + fmt::Debug {
    /// Backend kind.
    fn kind(&self) -> BackendKind;

    /// Check that the backend can run programs.
    async fn health_check(&self) -> Result<HealthStatus, BackendError>;

    /// Check that a program launched under `policy` would stay inside its
    /// network and filesystem ceiling.
    ///
    /// # Errors
    ///
    /// The violation a launch would amount to when the backend cannot
    /// enforce the policy.
    fn confine(&self, policy: &SandboxPolicy) -> Result<(), SandboxViolation>;

    /// Run a program to completion under `policy`, force-killing it on
    /// timeout, when `control` stops, or when it exceeds its budgets.
    async fn execute(
        &self,
        request: &SpawnRequest,
        policy: &SandboxPolicy,
        control: &RunControl,
    ) -> Result<ProcessOutput, OperationError>;
}
