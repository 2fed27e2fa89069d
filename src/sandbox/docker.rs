//! Docker isolation backend with hardening defaults.
//!
//! Each spawn gets a fresh container: read-only rootfs, all capabilities
//! dropped, no network unless the policy allows it, memory capped with swap
//! disabled, and CPU limited to the policy share. The container is killed
//! with SIGKILL on timeout or termination and always force-removed.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    KillContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::models::HostConfig;
use bollard::Docker;
use tokio_stream::StreamExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    BackendError, BackendKind, FilesystemAccess, HealthStatus, IsolationBackend, OperationError,
    ProcessOutput, ResourceExhausted, RunControl, SandboxPolicy, SandboxViolation, SpawnRequest,
};

const PIDS_LIMIT: i64 = 64;
const TMPFS_OPTIONS: &str = "rw,noexec,nosuid,size=64m";

/// Runs each program in a throwaway hardened container.
#[derive(Debug, Clone)]
pub struct DockerBackend {
    docker: Docker,
    image: String,
}

impl DockerBackend {
    /// Connect to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Unavailable`] when the daemon cannot be reached.
    pub fn connect(image: impl Into<String>) -> Result<Self, BackendError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Ok(Self {
            docker,
            image: image.into(),
        })
    }

    async fn wait_exit(&self, name: &str) -> Result<(), BackendError> {
        let waits = self
            .docker
            .wait_container(name, None::<WaitContainerOptions<String>>);
        tokio::pin!(waits);
        match waits.next().await {
            Some(Ok(_)) | None => Ok(()),
            // Non-zero exits surface as errors; the code is read from inspect.
            Some(Err(BollardError::DockerContainerWaitError { .. })) => Ok(()),
            Some(Err(e)) => Err(BackendError::Infrastructure(e.to_string())),
        }
    }

    async fn collect_logs(&self, name: &str, max: usize) -> (String, String) {
        let logs = self.docker.logs(
            name,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        tokio::pin!(logs);
        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    push_capped(&mut stdout, &message, max);
                }
                Ok(LogOutput::StdErr { message }) => push_capped(&mut stderr, &message, max),
                Ok(_) => {}
                Err(e) => {
                    warn!(container = name, error = %e, "log stream failed");
                    break;
                }
            }
        }
        (stdout, stderr)
    }

    async fn force_kill(&self, name: &str) {
        let killed = self
            .docker
            .kill_container(name, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await;
        if let Err(e) = killed {
            debug!(container = name, error = %e, "kill failed, container already stopped");
        }
    }
}

/// Append `bytes` while keeping `target` within `max` bytes, cutting on a
/// char boundary.
fn push_capped(target: &mut String, bytes: &[u8], max: usize) {
    let room = max.saturating_sub(target.len());
    if room == 0 {
        return;
    }
    let text = String::from_utf8_lossy(bytes);
    let mut end = text.len().min(room);
    while !text.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    target.push_str(text.get(..end).unwrap_or_default());
}

/// Removes the container when dropped, including when the run is aborted.
struct ContainerGuard {
    docker: Docker,
    name: String,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(container = %self.name, "no runtime to remove container");
            return;
        };
        let docker = self.docker.clone();
        let name = std::mem::take(&mut self.name);
        runtime.spawn(async move {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = docker.remove_container(&name, Some(options)).await {
                debug!(container = %name, error = %e, "container removal failed");
            }
        });
    }
}

#[async_trait]
impl IsolationBackend for DockerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    fn confine(&self, _policy: &SandboxPolicy) -> Result<(), SandboxViolation> {
        // Containers see only their image plus the binds derived from the
        // policy, and get network `none` unless it is allowed.
        Ok(())
    }

    async fn health_check(&self) -> Result<HealthStatus, BackendError> {
        self.docker
            .ping()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        let image = self.docker.inspect_image(&self.image).await;
        Ok(HealthStatus {
            is_healthy: image.is_ok(),
            kind: BackendKind::Docker,
            details: match image {
                Ok(_) => format!("docker daemon reachable, image {} present", self.image),
                Err(e) => format!("image {} not available: {e}", self.image),
            },
        })
    }

    async fn execute(
        &self,
        request: &SpawnRequest,
        policy: &SandboxPolicy,
        control: &RunControl,
    ) -> Result<ProcessOutput, OperationError> {
        let started = Instant::now();
        let name = format!("warden-{}-{}", control.run_id(), Uuid::new_v4().simple());
        let config = build_container_config(&self.image, request, policy);

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| BackendError::Infrastructure(e.to_string()))?;
        let _guard = ContainerGuard {
            docker: self.docker.clone(),
            name: name.clone(),
        };

        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| BackendError::Infrastructure(e.to_string()))?;
        debug!(container = %name, image = %self.image, "sandbox container started");

        tokio::select! {
            exited = self.wait_exit(&name) => exited?,
            () = tokio::time::sleep(policy.timeout()) => {
                self.force_kill(&name).await;
                return Err(OperationError::TimedOut);
            }
            () = control.stopped() => {
                self.force_kill(&name).await;
                return Err(OperationError::Terminated);
            }
        }

        let state = self
            .docker
            .inspect_container(&name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| BackendError::Infrastructure(e.to_string()))?
            .state
            .unwrap_or_default();
        if state.oom_killed == Some(true) {
            return Err(OperationError::Exhausted(ResourceExhausted::Memory {
                limit_bytes: policy.memory_limit_bytes,
                requested_bytes: policy.memory_limit_bytes,
            }));
        }

        let (stdout, stderr) = self.collect_logs(&name, 1024 * 1024).await;
        Ok(ProcessOutput {
            exit_code: state.exit_code.and_then(|c| i32::try_from(c).ok()),
            stdout,
            stderr,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
    }
}

fn build_container_config(
    image: &str,
    request: &SpawnRequest,
    policy: &SandboxPolicy,
) -> ContainerConfig<String> {
    let memory = i64::try_from(policy.memory_limit_bytes).unwrap_or(i64::MAX);
    // One full CPU is 1e9 nano-CPUs.
    let nano_cpus = i64::from(policy.cpu_limit_pct).saturating_mul(10_000_000);

    let binds = match policy.filesystem_access {
        FilesystemAccess::Restricted => policy
            .restricted_roots
            .iter()
            .map(|root| format!("{0}:{0}:rw", root.display()))
            .collect(),
        FilesystemAccess::ReadOnly => policy
            .restricted_roots
            .iter()
            .map(|root| format!("{0}:{0}:ro", root.display()))
            .collect(),
        FilesystemAccess::None | FilesystemAccess::Full => Vec::new(),
    };

    let mut tmpfs = HashMap::new();
    tmpfs.insert("/tmp".to_owned(), TMPFS_OPTIONS.to_owned());

    let host_config = HostConfig {
        network_mode: Some(if policy.network_access { "bridge" } else { "none" }.to_owned()),
        readonly_rootfs: Some(true),
        cap_drop: Some(vec!["ALL".to_owned()]),
        security_opt: Some(vec!["no-new-privileges".to_owned()]),
        pids_limit: Some(PIDS_LIMIT),
        memory: Some(memory),
        memory_swap: Some(memory),
        nano_cpus: Some(nano_cpus),
        binds: Some(binds),
        tmpfs: Some(tmpfs),
        ..Default::default()
    };

    let mut cmd = vec![request.program.clone()];
    cmd.extend(request.args.iter().cloned());

    ContainerConfig {
        image: Some(image.to_owned()),
        cmd: Some(cmd),
        env: Some(Vec::new()),
        working_dir: request
            .working_dir
            .as_ref()
            .map(|d| d.display().to_string()),
        network_disabled: Some(!policy.network_access),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        host_config: Some(host_config),
        ..Default::default()
    }
}
