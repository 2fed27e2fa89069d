//! Gated operations available to a running unit.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use url::Url;

use crate::analysis::Severity;
use crate::audit::{AuditEventType, AuditHandle, NewEvent};
use crate::capability::{
    normalize_resource, CapabilityContext, CapabilityError, TokenStore, FILE_READ, FILE_WRITE,
    HTTP_GET, PROCESS_SPAWN,
};

use super::{
    FilesystemAccess, IsolationBackend, OperationError, ProcessOutput, ResourceExhausted,
    RunControl, SandboxPolicy, SandboxViolation, SpawnRequest, TerminationCause,
};

/// Redirects followed by [`SandboxHost::http_get`] before giving up.
pub const MAX_REDIRECT_HOPS: usize = 10;

/// Everything a host needs from the executor.
pub(crate) struct HostParts {
    pub policy: SandboxPolicy,
    pub context: Arc<CapabilityContext>,
    pub store: Arc<TokenStore>,
    pub control: Arc<RunControl>,
    pub audit: AuditHandle,
    pub backend: Arc<dyn IsolationBackend>,
    pub http: Option<reqwest::Client>,
    pub abort_on_denial: bool,
}

/// Handle through which a unit performs gated operations.
///
/// Every operation checks, in order: run still live, policy ceiling,
/// capability. Results that arrive after the run was stopped are discarded.
#[derive(Clone)]
pub struct SandboxHost {
    inner: Arc<HostInner>,
}

struct HostInner {
    parts: HostParts,
    reserved: AtomicU64,
}

impl std::fmt::Debug for SandboxHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxHost")
            .field("run", &self.inner.parts.control.run_id())
            .field("context", &self.inner.parts.context.name())
            .finish_non_exhaustive()
    }
}

impl SandboxHost {
    pub(crate) fn new(parts: HostParts) -> Self {
        Self {
            inner: Arc::new(HostInner {
                parts,
                reserved: AtomicU64::new(0),
            }),
        }
    }

    /// Context the unit runs in.
    pub fn context(&self) -> &Arc<CapabilityContext> {
        &self.inner.parts.context
    }

    /// Policy in force.
    pub fn policy(&self) -> &SandboxPolicy {
        &self.inner.parts.policy
    }

    /// Whether the run has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.inner.parts.control.is_stopped()
    }

    /// Bytes currently reserved.
    pub fn memory_reserved(&self) -> u64 {
        self.inner.reserved.load(Ordering::Acquire)
    }

    /// Read a UTF-8 file.
    ///
    /// Symlinks are resolved first; the policy and capability checks apply
    /// to the file actually opened.
    ///
    /// # Errors
    ///
    /// Fails with a violation outside the filesystem ceiling, a denial
    /// without `file.read`, or the underlying I/O error.
    pub async fn read_file(&self, path: &str) -> Result<String, OperationError> {
        self.ensure_live()?;
        let resolved = self.gate_path(path, FILE_READ, false).await?;
        let contents = tokio::fs::read_to_string(&resolved).await?;
        self.ensure_live()?;
        Ok(contents)
    }

    /// Create or overwrite a file.
    ///
    /// # Errors
    ///
    /// Fails with a violation outside the filesystem ceiling, a denial
    /// without `file.write`, or the underlying I/O error.
    pub async fn write_file(&self, path: &str, contents: &str) -> Result<(), OperationError> {
        self.ensure_live()?;
        let resolved = self.gate_path(path, FILE_WRITE, true).await?;
        self.ensure_live()?;
        let mut file = tokio::fs::File::create(&resolved).await?;
        file.write_all(contents.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Fetch a URL and return the body text.
    ///
    /// Redirects are followed by hand, at most [`MAX_REDIRECT_HOPS`] of them,
    /// and every hop needs its own `http.get` capability.
    ///
    /// # Errors
    ///
    /// Fails with a violation when the policy forbids networking, a denial
    /// without `http.get` on the URL or any redirect target, or the HTTP error.
    pub async fn http_get(&self, url: &str) -> Result<String, OperationError> {
        self.ensure_live()?;
        if !self.policy().network_access {
            return Err(self.violation(SandboxViolation::NetworkDisabled {
                resource: url.to_owned(),
            }));
        }
        self.authorize(HTTP_GET, url).await?;
        let start = Url::parse(url).map_err(|e| OperationError::Http(format!("invalid URL: {e}")))?;

        let body = tokio::select! {
            body = self.fetch(start) => body?,
            () = self.inner.parts.control.stopped() => return Err(OperationError::Terminated),
        };
        self.ensure_live()?;
        Ok(body)
    }

    async fn fetch(&self, mut current: Url) -> Result<String, OperationError> {
        let http_error = |e: reqwest::Error| OperationError::Http(e.to_string());
        let client = self
            .inner
            .parts
            .http
            .as_ref()
            .ok_or_else(|| OperationError::Http("no HTTP client available".to_owned()))?;
        for hop in 0..MAX_REDIRECT_HOPS {
            debug!(url = %current, hop, "http_get request");
            let response = client
                .get(current.clone())
                .send()
                .await
                .map_err(http_error)?;

            if response.status().is_redirection() {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        OperationError::Http("redirect response missing Location header".to_owned())
                    })?;
                current = current
                    .join(location)
                    .map_err(|e| OperationError::Http(format!("invalid redirect URL: {e}")))?;
                self.ensure_live()?;
                self.authorize(HTTP_GET, current.as_str()).await?;
                continue;
            }

            let response = response.error_for_status().map_err(http_error)?;
            return response.text().await.map_err(http_error);
        }
        Err(OperationError::Http(format!(
            "gave up after {MAX_REDIRECT_HOPS} redirects"
        )))
    }

    /// Launch a program through the isolation backend.
    ///
    /// # Errors
    ///
    /// Fails with a violation when the policy forbids spawning, a denial
    /// without `process.spawn` on the program, or the backend's error.
    pub async fn spawn(&self, request: SpawnRequest) -> Result<ProcessOutput, OperationError> {
        self.ensure_live()?;
        if !self.policy().process_spawn {
            return Err(self.violation(SandboxViolation::ProcessSpawnDisabled {
                program: request.program.clone(),
            }));
        }
        let parts = &self.inner.parts;
        if let Err(violation) = parts.backend.confine(&parts.policy) {
            return Err(self.violation(violation));
        }
        self.authorize(PROCESS_SPAWN, &request.program).await?;

        let result = parts
            .backend
            .execute(&request, &parts.policy, &parts.control)
            .await;
        match result {
            Ok(output) => {
                self.ensure_live()?;
                Ok(output)
            }
            Err(OperationError::Exhausted(exhausted)) => Err(self.exhausted(exhausted)),
            Err(OperationError::Violation(violation)) => Err(self.violation(violation)),
            Err(other) => Err(other),
        }
    }

    /// Account for `bytes` of memory against the policy ceiling.
    ///
    /// # Errors
    ///
    /// Exceeding `memory_limit_bytes` terminates the run with
    /// [`ResourceExhausted::Memory`].
    pub fn reserve_memory(&self, bytes: u64) -> Result<(), OperationError> {
        self.ensure_live()?;
        let limit = self.policy().memory_limit_bytes;
        let reserved = self
            .inner
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(bytes).filter(|total| *total <= limit)
            });
        match reserved {
            Ok(_) => Ok(()),
            Err(current) => Err(self.exhausted(ResourceExhausted::Memory {
                limit_bytes: limit,
                requested_bytes: current.saturating_add(bytes),
            })),
        }
    }

    /// Return previously reserved memory.
    pub fn release_memory(&self, bytes: u64) {
        let _ = self
            .inner
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    fn ensure_live(&self) -> Result<(), OperationError> {
        if self.is_stopped() {
            return Err(OperationError::Terminated);
        }
        Ok(())
    }

    fn violation(&self, violation: SandboxViolation) -> OperationError {
        let control = &self.inner.parts.control;
        if control.terminate(TerminationCause::Violation(violation.clone())) {
            warn!(run = %control.run_id(), %violation, "sandbox violation, terminating run");
        }
        OperationError::Violation(violation)
    }

    fn exhausted(&self, exhausted: ResourceExhausted) -> OperationError {
        let control = &self.inner.parts.control;
        if control.terminate(TerminationCause::ResourceExhausted(exhausted.clone())) {
            warn!(run = %control.run_id(), %exhausted, "resource ceiling reached, terminating run");
        }
        OperationError::Exhausted(exhausted)
    }

    /// Policy ceiling, symlink resolution, then capability for a file path.
    async fn gate_path(
        &self,
        path: &str,
        permission: &str,
        write: bool,
    ) -> Result<PathBuf, OperationError> {
        let policy = self.policy();
        match policy.filesystem_access {
            FilesystemAccess::None => {
                return Err(self.violation(SandboxViolation::FilesystemDisabled {
                    path: path.to_owned(),
                }))
            }
            FilesystemAccess::ReadOnly if write => {
                return Err(self.violation(SandboxViolation::ReadOnlyFilesystem {
                    path: path.to_owned(),
                }))
            }
            FilesystemAccess::ReadOnly | FilesystemAccess::Restricted | FilesystemAccess::Full => {}
        }

        let unresolvable = || SandboxViolation::UnresolvablePath {
            path: path.to_owned(),
        };
        let Ok(normalized) = normalize_resource(path) else {
            return Err(self.violation(unresolvable()));
        };
        let resolved = match resolve_symlinks(Path::new(&normalized)).await {
            Ok(resolved) => resolved,
            Err(Unresolved::DanglingLink) => return Err(self.violation(unresolvable())),
            Err(Unresolved::Io(e)) => return Err(e.into()),
        };
        let Some(resource) = resolved.to_str() else {
            return Err(self.violation(unresolvable()));
        };

        if policy.filesystem_access == FilesystemAccess::Restricted {
            let mut inside = false;
            for root in &policy.restricted_roots {
                let root = tokio::fs::canonicalize(root)
                    .await
                    .unwrap_or_else(|_| root.clone());
                if is_within(&root, resource) {
                    inside = true;
                    break;
                }
            }
            if !inside {
                return Err(self.violation(SandboxViolation::OutsideRestrictedRoots {
                    path: path.to_owned(),
                }));
            }
        }

        if resource != normalized {
            debug!(path, resolved = resource, "path resolved through symlinks");
        }
        self.authorize(permission, resource).await?;
        Ok(resolved)
    }

    async fn authorize(&self, permission: &str, resource: &str) -> Result<(), OperationError> {
        let parts = &self.inner.parts;
        let decision = parts
            .store
            .has_permission(&parts.context, resource, permission);

        if decision.granted {
            debug!(permission, resource, source = ?decision.source_context, "capability granted");
            self.audit(
                NewEvent::new(AuditEventType::CapabilityGranted, Severity::Info)
                    .context(&parts.context)
                    .resource(resource)
                    .data("permission", permission)
                    .data("run_id", parts.control.run_id())
                    .data("source_context", decision.source_context)
                    .data("token", decision.token),
            )
            .await;
            return Ok(());
        }

        let error = CapabilityError::denied(permission, resource, &parts.context);
        warn!(permission, resource, context = %parts.context.name(), "capability denied");
        self.audit(
            NewEvent::new(AuditEventType::CapabilityDenied, Severity::Medium)
                .context(&parts.context)
                .resource(resource)
                .data("permission", permission)
                .data("run_id", parts.control.run_id())
                .data("minimal_grant", &error.minimal_grant),
        )
        .await;

        if parts.abort_on_denial {
            parts
                .control
                .terminate(TerminationCause::CapabilityDenied(error.clone()));
        }
        Err(OperationError::Denied(error))
    }

    async fn audit(&self, event: NewEvent) {
        if let Err(e) = self.inner.parts.audit.record(event).await {
            warn!(error = %e, "failed to record audit event");
        }
    }
}

enum Unresolved {
    DanglingLink,
    Io(std::io::Error),
}

/// Canonicalize the longest existing prefix of an absolute or relative
/// `path` and append the missing tail. A dangling symlink anywhere on the
/// way is refused, since creating through it would land at its target.
async fn resolve_symlinks(path: &Path) -> Result<PathBuf, Unresolved> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().map_err(Unresolved::Io)?.join(path)
    };
    let mut missing: Vec<OsString> = Vec::new();
    let mut base = absolute.as_path();
    loop {
        match tokio::fs::canonicalize(base).await {
            Ok(mut real) => {
                real.extend(missing.iter().rev());
                return Ok(real);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if tokio::fs::symlink_metadata(base).await.is_ok() {
                    return Err(Unresolved::DanglingLink);
                }
                let (Some(parent), Some(name)) = (base.parent(), base.file_name()) else {
                    return Err(Unresolved::Io(e));
                };
                missing.push(name.to_os_string());
                base = parent;
            }
            Err(e) => return Err(Unresolved::Io(e)),
        }
    }
}

/// Whether normalized `path` lies at or under `root`.
fn is_within(root: &Path, path: &str) -> bool {
    let Some(root) = root.to_str().and_then(|r| normalize_resource(r).ok()) else {
        return false;
    };
    if root == "/" {
        return path.starts_with('/');
    }
    path == root
        || path
            .strip_prefix(root.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
}
