//! Run orchestration: lifecycle, forced termination, and the live-run registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::analysis::Severity;
use crate::audit::{AuditEventType, AuditHandle, NewEvent};
use crate::capability::{CapabilityContext, TokenStore};

use super::host::{HostParts, SandboxHost};
use super::{
    IsolationBackend, OperationError, PolicyError, RunControl, RunState, SandboxPolicy,
    SandboxRun, SpawnRequest, TerminationCause,
};

/// A unit of work executed inside the sandbox.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    /// Name recorded in the run and its audit events.
    fn name(&self) -> &str;

    /// Execute using only the gated operations on `host`.
    async fn run(&self, host: SandboxHost) -> Result<Value, OperationError>;
}

/// Built-in unit that launches one program and returns its captured output.
#[derive(Debug, Clone)]
pub struct ProgramUnit {
    name: String,
    request: SpawnRequest,
}

impl ProgramUnit {
    /// Unit running `request`.
    pub fn new(name: impl Into<String>, request: SpawnRequest) -> Self {
        Self {
            name: name.into(),
            request,
        }
    }
}

#[async_trait]
impl UnitOfWork for ProgramUnit {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, host: SandboxHost) -> Result<Value, OperationError> {
        let output = host.spawn(self.request.clone()).await?;
        Ok(json!({
            "exit_code": output.exit_code,
            "stdout": output.stdout,
            "stderr": output.stderr,
            "duration_ms": output.duration_ms,
        }))
    }
}

/// Client for gated HTTP. Redirects are left to the host, which checks
/// every hop. `None` when no client can be built; gated HTTP then fails.
fn http_client() -> Option<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| warn!(error = %e, "failed to build HTTP client, gated HTTP disabled"))
        .ok()
}

/// Live runs indexed by run id.
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<Uuid, Arc<RunControl>>>,
}

impl RunRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, control: Arc<RunControl>) {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(control.run_id(), control);
    }

    fn deregister(&self, run_id: Uuid) {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&run_id);
    }

    /// Ids of live runs in `context_id`.
    pub fn live_runs(&self, context_id: Uuid) -> Vec<Uuid> {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|c| c.context_id() == context_id)
            .map(|c| c.run_id())
            .collect()
    }

    /// Number of live runs.
    pub fn len(&self) -> usize {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no runs are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Force-terminate every live run in `context_id`. Idempotent; returns
    /// how many runs were newly terminated.
    pub fn terminate_context(&self, context_id: Uuid, reason: &str) -> usize {
        let targets: Vec<Arc<RunControl>> = self
            .runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|c| c.context_id() == context_id)
            .cloned()
            .collect();
        let terminated = targets
            .iter()
            .filter(|c| c.terminate(TerminationCause::External(reason.to_owned())))
            .count();
        if terminated > 0 {
            info!(context = %context_id, terminated, reason, "runs terminated");
        }
        terminated
    }
}

/// Executes units under a policy with forced termination.
#[derive(Clone)]
pub struct SandboxExecutor {
    store: Arc<TokenStore>,
    backend: Arc<dyn IsolationBackend>,
    registry: Arc<RunRegistry>,
    audit: AuditHandle,
    http: Option<reqwest::Client>,
    abort_on_denial: bool,
}

impl std::fmt::Debug for SandboxExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxExecutor")
            .field("backend", &self.backend.kind())
            .field("abort_on_denial", &self.abort_on_denial)
            .finish_non_exhaustive()
    }
}

enum Outcome {
    Finished(Result<Value, OperationError>),
    Panicked(tokio::task::JoinError),
    TimedOut,
    Stopped,
}

impl SandboxExecutor {
    /// Create an executor.
    pub fn new(
        store: Arc<TokenStore>,
        backend: Arc<dyn IsolationBackend>,
        registry: Arc<RunRegistry>,
        audit: AuditHandle,
    ) -> Self {
        Self {
            store,
            backend,
            registry,
            audit,
            http: http_client(),
            abort_on_denial: false,
        }
    }

    /// End the whole run on the first capability denial.
    #[must_use]
    pub fn with_abort_on_denial(mut self, abort: bool) -> Self {
        self.abort_on_denial = abort;
        self
    }

    /// Registry of live runs.
    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    /// Execute `unit` in `context` under `policy`.
    ///
    /// The unit runs on a blocking-pool thread of its own, so a unit that
    /// blocks its thread cannot hold up the controller. At the policy timeout
    /// or as soon as the run is terminated the run is finalized and the
    /// caller gets it back; the unit's future is dropped (killing any child
    /// it owns) the next time its thread gets to poll, and every gated
    /// operation it attempts meanwhile fails.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError`] before anything starts if the policy is invalid.
    pub async fn run(
        &self,
        unit: Arc<dyn UnitOfWork>,
        policy: SandboxPolicy,
        context: Arc<CapabilityContext>,
    ) -> Result<SandboxRun, PolicyError> {
        policy.validate()?;
        let mut run = SandboxRun::new(unit.name(), &context, policy.clone());
        let control = Arc::new(RunControl::new(run.id, context.id()));
        self.registry.register(Arc::clone(&control));

        run.state = RunState::Running;
        run.started_at = Some(Utc::now());
        info!(run = %run.id, unit = %run.unit, context = %run.context_name, "run started");
        self.audit(
            NewEvent::new(AuditEventType::RunStarted, Severity::Info)
                .context(&context)
                .data("run_id", run.id)
                .data("unit", &run.unit)
                .data("policy", &policy),
        )
        .await;

        let host = SandboxHost::new(HostParts {
            policy: policy.clone(),
            context: Arc::clone(&context),
            store: Arc::clone(&self.store),
            control: Arc::clone(&control),
            audit: self.audit.clone(),
            backend: Arc::clone(&self.backend),
            http: self.http.clone(),
            abort_on_denial: self.abort_on_denial,
        });
        let started = Instant::now();
        let runtime = tokio::runtime::Handle::current();
        let task_unit = Arc::clone(&unit);
        let task_control = Arc::clone(&control);
        let mut task = tokio::task::spawn_blocking(move || {
            runtime.block_on(async move {
                tokio::select! {
                    result = task_unit.run(host) => Some(result),
                    () = task_control.stopped() => None,
                }
            })
        });

        let outcome = tokio::select! {
            biased;
            joined = &mut task => match joined {
                Ok(Some(result)) => Outcome::Finished(result),
                Ok(None) => Outcome::Stopped,
                Err(join) => Outcome::Panicked(join),
            },
            () = control.stopped() => Outcome::Stopped,
            () = tokio::time::sleep(policy.timeout()) => Outcome::TimedOut,
        };
        // A unit that ignored the deadline does not get to complete.
        let outcome = match outcome {
            Outcome::Finished(_) if started.elapsed() > policy.timeout() => Outcome::TimedOut,
            other => other,
        };

        run.state = match (control.cause(), outcome) {
            (Some(cause), _) => RunState::Terminated(cause),
            (None, Outcome::TimedOut) => {
                control.halt();
                RunState::TimedOut
            }
            (None, Outcome::Stopped) => {
                RunState::Terminated(TerminationCause::External("stopped".to_owned()))
            }
            (None, Outcome::Finished(Ok(value))) => {
                run.output = Some(value);
                RunState::Completed
            }
            (None, Outcome::Finished(Err(e))) => RunState::Crashed(e.to_string()),
            (None, Outcome::Panicked(join)) => RunState::Crashed(format!("unit panicked: {join}")),
        };
        // Late operations must see the run as stopped.
        control.halt();
        run.ended_at = Some(Utc::now());
        self.registry.deregister(run.id);

        self.record_terminal(&run, &context).await;
        Ok(run)
    }

    async fn record_terminal(&self, run: &SandboxRun, context: &CapabilityContext) {
        let (event_type, severity) = match &run.state {
            RunState::Completed => (AuditEventType::RunCompleted, Severity::Info),
            RunState::TimedOut => (AuditEventType::RunTimedOut, Severity::High),
            RunState::Terminated(cause) => (AuditEventType::RunTerminated, cause.severity()),
            RunState::Crashed(_) | RunState::Created | RunState::Running => {
                (AuditEventType::RunCrashed, Severity::High)
            }
        };

        let mut event = NewEvent::new(event_type, severity)
            .context(context)
            .data("run_id", run.id)
            .data("unit", &run.unit)
            .data("state", &run.state);
        if let RunState::Terminated(cause) = &run.state {
            event = event.data("cause", cause.label());
            warn!(run = %run.id, %cause, "run terminated");
        } else {
            info!(run = %run.id, state = ?run.state, "run finished");
        }
        self.audit(event).await;
    }

    async fn audit(&self, event: NewEvent) {
        if let Err(e) = self.audit.record(event).await {
            warn!(error = %e, "failed to record audit event");
        }
    }
}
