//! Child-process isolation backend.
//!
//! Programs run as separate OS processes with a cleared environment, each
//! leading its own process group. The controller polls `/proc/<pid>` for
//! resident memory and CPU time and kills the whole group with SIGKILL when
//! the program exceeds its budget, times out, or the run is stopped.
//! `kill_on_drop` covers the case where the controlling task itself is
//! aborted.
//!
//! A plain child process sees the host's filesystem and network, so this
//! backend only accepts policies with `FULL` filesystem access and network
//! access. Anything stricter needs the Docker backend.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::{
    BackendKind, BackendError, FilesystemAccess, HealthStatus, IsolationBackend, OperationError,
    ProcessOutput, ResourceExhausted, RunControl, SandboxPolicy, SandboxViolation, SpawnRequest,
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;
/// Kernel clock ticks per second assumed for `/proc/<pid>/stat`.
const CLOCK_TICKS_PER_SEC: u64 = 100;
const SAFE_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Runs programs as child processes of the controller.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    poll_interval: Duration,
    max_output_bytes: usize,
}

impl Default for ProcessBackend {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl ProcessBackend {
    /// Backend with default polling and output caps.
    pub fn new() -> Self {
        Self::default()
    }

    /// How often the watchdog samples the child.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Cap on captured bytes per stream; the rest is drained and dropped.
    #[must_use]
    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    fn command(request: &SpawnRequest) -> Command {
        let mut command = Command::new(&request.program);
        command
            .args(&request.args)
            .env_clear()
            .env("PATH", SAFE_PATH)
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        if let Some(dir) = &request.working_dir {
            command.current_dir(dir);
        }
        command
    }
}

#[async_trait]
impl IsolationBackend for ProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Process
    }

    async fn health_check(&self) -> Result<HealthStatus, BackendError> {
        let watchdog = cfg!(target_os = "linux");
        Ok(HealthStatus {
            is_healthy: true,
            kind: BackendKind::Process,
            details: if watchdog {
                "child-process backend with /proc watchdog; FULL filesystem and network policies only"
                    .to_owned()
            } else {
                "child-process backend without resource watchdog; FULL filesystem and network policies only"
                    .to_owned()
            },
        })
    }

    fn confine(&self, policy: &SandboxPolicy) -> Result<(), SandboxViolation> {
        let unconfinable = |reason: &str| SandboxViolation::Unconfinable {
            backend: BackendKind::Process,
            reason: reason.to_owned(),
        };
        if policy.filesystem_access != FilesystemAccess::Full {
            return Err(unconfinable(
                "a child process sees the host filesystem; use the docker backend",
            ));
        }
        if !policy.network_access {
            return Err(unconfinable(
                "a child process shares the host network; use the docker backend",
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        request: &SpawnRequest,
        policy: &SandboxPolicy,
        control: &RunControl,
    ) -> Result<ProcessOutput, OperationError> {
        self.confine(policy)?;
        let started = Instant::now();
        let mut child = Self::command(request).spawn()?;
        let pid = child.id();
        debug!(program = %request.program, pid, "child process spawned");

        let stdout = tokio::spawn(read_capped(child.stdout.take(), self.max_output_bytes));
        let stderr = tokio::spawn(read_capped(child.stderr.take(), self.max_output_bytes));
        if let (Some(input), Some(mut stdin)) = (&request.stdin, child.stdin.take()) {
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                debug!(pid, error = %e, "child closed stdin early");
            }
            drop(stdin);
        }

        let cpu_budget = policy.cpu_time_budget();
        let deadline = tokio::time::sleep(policy.timeout());
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(self.poll_interval);

        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                () = &mut deadline => {
                    kill(&mut child, pid).await;
                    return Err(OperationError::TimedOut);
                }
                () = control.stopped() => {
                    kill(&mut child, pid).await;
                    return Err(OperationError::Terminated);
                }
                _ = ticker.tick() => {
                    let Some(pid) = pid else { continue };
                    if let Some(exceeded) = check_budgets(pid, policy.memory_limit_bytes, cpu_budget).await {
                        warn!(pid, %exceeded, "child exceeded its budget, killing");
                        kill(&mut child, Some(pid)).await;
                        return Err(OperationError::Exhausted(exceeded));
                    }
                }
            }
        };

        // Background processes left by the program would hold the pipes open.
        kill_group(pid).await;
        let output = async { (stdout.await.unwrap_or_default(), stderr.await.unwrap_or_default()) };
        let (stdout, stderr) = tokio::select! {
            output = output => output,
            () = &mut deadline => return Err(OperationError::TimedOut),
            () = control.stopped() => return Err(OperationError::Terminated),
        };
        Ok(ProcessOutput {
            exit_code: status.code(),
            stdout,
            stderr,
            duration_ms: millis(started.elapsed()),
        })
    }
}

/// SIGKILL the program's process group, then reap the program itself.
async fn kill(child: &mut Child, pid: Option<u32>) {
    kill_group(pid).await;
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "kill failed, child already exited");
    }
    match child.wait().await {
        Ok(status) => debug!(?status, "child reaped"),
        Err(e) => warn!(error = %e, "failed to reap killed child"),
    }
}

/// SIGKILL every process in the group led by `pid`.
///
/// Signalling a group needs `kill(2)` with a negative pid, which the
/// standard library does not expose; the `kill` utility does.
async fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    if !cfg!(unix) {
        return;
    }
    let killed = Command::new("kill")
        .args(["-KILL", "--", &format!("-{pid}")])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match killed {
        Ok(status) if status.success() => debug!(pgid = pid, "process group killed"),
        // Exit status 1 means the group is already gone.
        Ok(status) => debug!(pgid = pid, ?status, "no process group left to kill"),
        Err(e) => warn!(pgid = pid, error = %e, "failed to run kill for process group"),
    }
}

async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>, max: usize) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = max.saturating_sub(kept.len());
                kept.extend_from_slice(chunk.get(..n.min(room)).unwrap_or_default());
            }
        }
    }
    String::from_utf8_lossy(&kept).into_owned()
}

async fn check_budgets(pid: u32, memory_limit: u64, cpu_budget: Duration) -> Option<ResourceExhausted> {
    if let Some(rss) = resident_bytes(pid).await {
        if rss > memory_limit {
            return Some(ResourceExhausted::Memory {
                limit_bytes: memory_limit,
                requested_bytes: rss,
            });
        }
    }
    if let Some(used) = cpu_time(pid).await {
        if used > cpu_budget {
            return Some(ResourceExhausted::CpuTime {
                budget_ms: millis(cpu_budget),
                used_ms: millis(used),
            });
        }
    }
    None
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

async fn resident_bytes(pid: u32) -> Option<u64> {
    let status = tokio::fs::read_to_string(format!("/proc/{pid}/status"))
        .await
        .ok()?;
    parse_vm_rss(&status)
}

async fn cpu_time(pid: u32) -> Option<Duration> {
    let stat = tokio::fs::read_to_string(format!("/proc/{pid}/stat"))
        .await
        .ok()?;
    parse_cpu_ticks(&stat).map(|ticks| {
        Duration::from_millis(
            ticks
                .saturating_mul(1000)
                .checked_div(CLOCK_TICKS_PER_SEC)
                .unwrap_or_default(),
        )
    })
}

/// `VmRSS:` from `/proc/<pid>/status`, in bytes.
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib.saturating_mul(1024))
}

/// utime + stime from `/proc/<pid>/stat`, in clock ticks.
fn parse_cpu_ticks(stat: &str) -> Option<u64> {
    // The command name may contain spaces; fields resume after the last ')'.
    let rest = stat.get(stat.rfind(')')?.saturating_add(1)..)?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime.saturating_add(stime))
}
