//! End-to-end submission: static analysis, audit, then sandboxed execution.
//!
//! [`Warden`] wires the subsystems together around one [`TokenStore`]. A
//! submission is analyzed first; findings are audited whether or not they
//! block. Only programs that pass reach the [`SandboxExecutor`].

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::analysis::{AnalysisReport, Analyzer, SecurityError, Severity, ThreatFinding};
use crate::ast::Program;
use crate::audit::{
    AuditError, AuditEventType, AuditHandle, AuditPipeline, AuditStore, DefaultResponder,
    JsonlAuditStore, LogNotifier, NewEvent,
};
use crate::capability::{
    run_purger, CapabilityContext, CapabilityToken, Grant, IssueError, TokenStore,
};
use crate::config::WardenConfig;
use crate::sandbox::{
    BackendKind, DockerBackend, IsolationBackend, PolicyError, ProcessBackend, RunRegistry,
    SandboxExecutor, SandboxPolicy, SandboxRun, UnitOfWork,
};

/// A program and the unit that carries it out.
pub struct Submission {
    /// Program scanned before anything runs.
    pub program: Program,
    /// Work executed if the program passes.
    pub unit: Arc<dyn UnitOfWork>,
    /// Policy override; the configured default applies when `None`.
    pub policy: Option<SandboxPolicy>,
    /// Context whose capabilities the run uses.
    pub context: Arc<CapabilityContext>,
}

/// Why a submission did not run.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// Static analysis rejected the program.
    #[error(transparent)]
    Blocked(#[from] SecurityError),
    /// The policy is invalid.
    #[error("invalid sandbox policy: {0}")]
    Policy(#[from] PolicyError),
    /// The audit trail is unavailable.
    #[error(transparent)]
    Audit(#[from] AuditError),
}

/// Owns the analyzer, token store, executor, and audit pipeline.
pub struct Warden {
    analyzer: Analyzer,
    store: Arc<TokenStore>,
    executor: SandboxExecutor,
    audit: AuditHandle,
    audit_task: Mutex<Option<JoinHandle<()>>>,
    purge_shutdown: watch::Sender<bool>,
    purge_task: Mutex<Option<JoinHandle<()>>>,
    default_policy: SandboxPolicy,
}

impl std::fmt::Debug for Warden {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Warden")
            .field("executor", &self.executor)
            .field("block_threshold", &self.analyzer.block_threshold())
            .finish_non_exhaustive()
    }
}

impl Warden {
    /// Assemble from explicit collaborators.
    ///
    /// # Errors
    ///
    /// Fails if the audit store's chain head cannot be read.
    pub async fn new(
        config: &WardenConfig,
        audit_store: Arc<dyn AuditStore>,
        backend: Arc<dyn IsolationBackend>,
    ) -> Result<Self, AuditError> {
        let store = Arc::new(TokenStore::new(&config.capability));
        let registry = Arc::new(RunRegistry::new());
        let responder = DefaultResponder::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::new(LogNotifier),
        );
        let (audit, audit_task) = AuditPipeline::new(audit_store, &config.audit)
            .with_responder(Arc::new(responder))
            .start()
            .await?;

        let executor = SandboxExecutor::new(Arc::clone(&store), backend, registry, audit.clone())
            .with_abort_on_denial(config.sandbox.abort_on_denial);

        let (purge_shutdown, purge_rx) = watch::channel(false);
        let purge_task = tokio::spawn(run_purger(
            Arc::clone(&store),
            Duration::from_secs(config.capability.purge_interval_seconds),
            purge_rx,
        ));

        Ok(Self {
            analyzer: Analyzer::new(&config.analysis, &config.taint),
            store,
            executor,
            audit,
            audit_task: Mutex::new(Some(audit_task)),
            purge_shutdown,
            purge_task: Mutex::new(Some(purge_task)),
            default_policy: config.sandbox.policy.clone(),
        })
    }

    /// Assemble from configuration: JSON-lines audit log and the configured backend.
    ///
    /// # Errors
    ///
    /// Fails if the audit log cannot be opened or the backend is unavailable.
    pub async fn from_config(config: &WardenConfig) -> anyhow::Result<Self> {
        let audit_store = JsonlAuditStore::open(&config.audit.log_path)
            .await
            .with_context(|| {
                format!("failed to open audit log {}", config.audit.log_path.display())
            })?;
        let backend: Arc<dyn IsolationBackend> = match config.sandbox.backend {
            BackendKind::Process => Arc::new(ProcessBackend::new()),
            BackendKind::Docker => Arc::new(
                DockerBackend::connect(config.sandbox.docker_image.clone())
                    .context("docker backend unavailable")?,
            ),
        };
        info!(backend = %config.sandbox.backend, "warden starting");
        Ok(Self::new(config, Arc::new(audit_store), backend).await?)
    }

    /// Shared token store.
    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    /// Audit producer handle.
    pub fn audit(&self) -> &AuditHandle {
        &self.audit
    }

    /// Executor used for runs.
    pub fn executor(&self) -> &SandboxExecutor {
        &self.executor
    }

    /// Issue a token for a grant string and audit it.
    ///
    /// # Errors
    ///
    /// Fails on a malformed grant or a non-positive `ttl`.
    pub async fn grant(
        &self,
        context: &CapabilityContext,
        grant: &str,
        ttl: chrono::Duration,
    ) -> Result<Arc<CapabilityToken>, IssueError> {
        let parsed = Grant::parse(grant)?;
        let token = self.store.issue_grant(context, &parsed, ttl)?;
        self.record(
            NewEvent::new(AuditEventType::TokenIssued, Severity::Info)
                .context(context)
                .resource(parsed.pattern.to_string())
                .data("grant", grant)
                .data("token", token.summary()),
        )
        .await;
        Ok(token)
    }

    /// Revoke a token and audit it. Returns whether it was newly revoked.
    pub async fn revoke(&self, token_id: Uuid) -> bool {
        let revoked = self.store.revoke(token_id);
        if revoked {
            self.record(
                NewEvent::new(AuditEventType::TokenRevoked, Severity::Info)
                    .data("token_id", token_id),
            )
            .await;
        }
        revoked
    }

    /// Analyze a program on behalf of `context` and audit the outcome.
    ///
    /// # Errors
    ///
    /// [`SubmitError::Blocked`] when a finding reaches the threshold, or
    /// [`SubmitError::Audit`] when the outcome cannot be recorded.
    pub async fn analyze(
        &self,
        program: &Program,
        context: &CapabilityContext,
    ) -> Result<AnalysisReport, SubmitError> {
        match self.analyzer.analyze(program) {
            Ok(report) => {
                for finding in &report.findings {
                    self.audit.record(finding_event(finding, program, context)).await?;
                }
                for flow in &report.flows {
                    self.audit
                        .record(
                            NewEvent::new(AuditEventType::DataFlowPath, Severity::High)
                                .context(context)
                                .data("program", &program.name)
                                .data("path", flow),
                        )
                        .await?;
                }
                Ok(report)
            }
            Err(blocked) => {
                for finding in blocked.findings() {
                    self.audit.record(finding_event(finding, program, context)).await?;
                }
                let SecurityError::Blocked {
                    threshold,
                    blocking,
                    ..
                } = &blocked;
                let highest = blocking.iter().map(|f| f.severity).max().unwrap_or_default();
                self.audit
                    .record(
                        NewEvent::new(AuditEventType::AnalysisBlocked, highest)
                            .context(context)
                            .data("program", &program.name)
                            .data("threshold", threshold)
                            .data("blocking", blocking.len()),
                    )
                    .await?;
                warn!(program = %program.name, %highest, "submission blocked");
                Err(blocked.into())
            }
        }
    }

    /// Analyze, then run the unit if the program passes.
    ///
    /// # Errors
    ///
    /// [`SubmitError::Blocked`] before any side effect,
    /// [`SubmitError::Policy`] if the effective policy is invalid, or
    /// [`SubmitError::Audit`] if the analysis cannot be recorded. Nothing
    /// runs without its audit trail.
    pub async fn submit(&self, submission: Submission) -> Result<SandboxRun, SubmitError> {
        let Submission {
            program,
            unit,
            policy,
            context,
        } = submission;
        let policy = policy.unwrap_or_else(|| self.default_policy.clone());
        policy.validate()?;

        self.analyze(&program, &context).await?;
        // Findings are committed before the unit can cause any side effect.
        self.audit.flush().await?;
        Ok(self.executor.run(unit, policy, context).await?)
    }

    /// Revoke every token, stop the token purger, drain the audit pipeline,
    /// and stop it.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Closed`] if the pipeline was already stopped.
    pub async fn shutdown(&self) -> Result<(), AuditError> {
        self.store.shutdown();
        self.purge_shutdown.send_replace(true);
        let purger = self
            .purge_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(purger) = purger {
            if let Err(e) = purger.await {
                warn!(error = %e, "token purger ended abnormally");
            }
        }
        self.audit.shutdown().await?;
        let task = self
            .audit_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "audit committer ended abnormally");
            }
        }
        info!("warden stopped");
        Ok(())
    }

    async fn record(&self, event: NewEvent) {
        if let Err(e) = self.audit.record(event).await {
            warn!(error = %e, "failed to record audit event");
        }
    }
}

fn finding_event(finding: &ThreatFinding, program: &Program, context: &CapabilityContext) -> NewEvent {
    NewEvent::new(AuditEventType::ThreatFinding, finding.severity)
        .context(context)
        .data("program", &program.name)
        .data("finding", finding)
}
