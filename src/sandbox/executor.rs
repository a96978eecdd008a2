//! Runs generated guest code in a supervised subprocess.
//!
//! One `execute` call:
//! 1. narrows the capability context (network removed unless allowed),
//!    signs a runtime descriptor for it and builds the filtered environment,
//! 2. writes the code into a fresh scratch directory,
//! 3. spawns the interpreter there in its own process group with OS limits,
//! 4. races the wall-clock deadline, the process exit and the resource
//!    monitor, killing the whole process group on timeout or violation,
//! 5. collects capped stdout/stderr and reports a [`SandboxResult`].
//!
//! Dropping the `execute` future before it completes (Ctrl-C in the CLI)
//! also kills the process group, not just the interpreter.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::config::{SandboxConfig, SandboxResult};
use super::descriptor::{DescriptorSigner, RuntimeDescriptor};
use super::env::SandboxEnvironment;
use super::error::{ExecutionFailure, ExecutionTimeoutError, ResourceLimitError, SandboxError};
use super::monitor::{ProcProbe, ResourceMonitor, ResourceProbe};
use crate::capability::audit::{AuditEvent, ExecutionPhase};
use crate::capability::{CapabilityContext, Category, Restrictions};

/// How long to wait for the pipes to drain after the process is gone.
const READER_GRACE: Duration = Duration::from_secs(2);
/// How long to wait for a killed process to be reaped.
const KILL_GRACE: Duration = Duration::from_secs(5);
/// Reported when a killed process could not be reaped (128 + SIGKILL).
const KILLED_EXIT_CODE: i32 = 137;

const READ_CHUNK: usize = 8192;

enum Outcome {
    Exited(ExitStatus),
    TimedOut,
    LimitExceeded(ResourceLimitError),
}

#[derive(Debug)]
pub struct SandboxExecutor {
    signer: DescriptorSigner,
    probe: Arc<dyn ResourceProbe>,
}

impl Default for SandboxExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxExecutor {
    /// Executor with a fresh signing key and the procfs probe.
    pub fn new() -> Self {
        Self::with_probe(Arc::new(ProcProbe))
    }

    pub fn with_probe(probe: Arc<dyn ResourceProbe>) -> Self {
        Self {
            signer: DescriptorSigner::new(),
            probe,
        }
    }

    /// Verifies descriptors handed back by guest code.
    pub fn signer(&self) -> &DescriptorSigner {
        &self.signer
    }

    /// Runs `code` under `config`, with the capabilities of `context`.
    ///
    /// A non-zero exit, a timeout and a limit violation are all `Ok` results
    /// with `success == false`. `Err` means the run could not take place.
    pub async fn execute(
        &self,
        code: &str,
        config: &SandboxConfig,
        context: &Arc<CapabilityContext>,
    ) -> Result<SandboxResult, SandboxError> {
        let scope = if config.allow_network {
            Arc::clone(context)
        } else {
            context.create_child(Restrictions::new().deny_category(Category::Network))?
        };

        let descriptor = RuntimeDescriptor::from_context(&scope, config, Utc::now());
        let token = self.signer.sign(&descriptor)?;

        let work_dir = tempfile::Builder::new()
            .prefix("capguard-")
            .tempdir()
            .map_err(|e| infrastructure_failure(&scope, "create scratch directory", e))?;
        let script = work_dir
            .path()
            .join(format!("main.{}", config.script_extension));
        tokio::fs::write(&script, code)
            .await
            .map_err(|e| infrastructure_failure(&scope, "write script", e))?;

        let env = SandboxEnvironment::build(config, work_dir.path(), &token);
        for key in env.rejected() {
            warn!("Dropping unsafe environment variable '{key}' from sandbox");
        }

        let mut cmd = Command::new(&config.interpreter);
        cmd.args(&config.interpreter_args)
            .arg(&script)
            .current_dir(work_dir.path())
            .env_clear()
            .envs(env.vars().iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            let limits = OsLimits::from_config(config);
            // SAFETY: only async-signal-safe calls (setpgid, setrlimit).
            unsafe {
                cmd.pre_exec(move || limits.apply());
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| infrastructure_failure(&scope, "spawn interpreter", e))?;
        let pid = child.id();
        let mut group = GroupGuard { pgid: pid };

        info!(
            "Sandbox started: {} (pid {}, context {})",
            config.interpreter,
            pid.map_or_else(|| "?".to_string(), |p| p.to_string()),
            scope.id()
        );
        scope.audit().record(AuditEvent::Execution {
            context_id: scope.id(),
            phase: ExecutionPhase::Started,
            detail: Some(config.interpreter.clone()),
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Infrastructure("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Infrastructure("stderr not captured".to_string()))?;
        let stdout_reader = tokio::spawn(read_capped(stdout, config.max_output_bytes));
        let stderr_reader = tokio::spawn(read_capped(stderr, config.max_output_bytes));

        let started = Instant::now();
        let deadline = tokio::time::sleep(config.wall_time());
        tokio::pin!(deadline);
        let mut monitor = ResourceMonitor::new(config);
        let mut ticker = tokio::time::interval(config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = &mut deadline => break Outcome::TimedOut,
                status = child.wait() => match status {
                    Ok(status) => break Outcome::Exited(status),
                    Err(e) => {
                        terminate(&mut child, pid);
                        return Err(infrastructure_failure(&scope, "wait for interpreter", e));
                    }
                },
                _ = ticker.tick() => {
                    if let Some(usage) = pid.and_then(|pid| self.probe.sample(pid)) {
                        monitor.record(usage);
                    }
                    match monitor.check_limits() {
                        Ok(()) => {}
                        // The deadline owns wall-clock enforcement.
                        Err(ResourceLimitError::WallTime { .. }) => break Outcome::TimedOut,
                        Err(violation) => break Outcome::LimitExceeded(violation),
                    }
                }
            }
        };

        let (status, failure) = match outcome {
            Outcome::Exited(status) => {
                monitor.finish();
                // Stray background processes would keep the pipes open.
                terminate(&mut child, pid);
                let failure = signal_failure(&status, config).map(ExecutionFailure::from);
                (Some(status), failure)
            }
            Outcome::TimedOut => {
                terminate(&mut child, pid);
                let failure = ExecutionFailure::from(ExecutionTimeoutError {
                    limit: config.wall_time(),
                });
                (reap(&mut child).await, Some(failure))
            }
            Outcome::LimitExceeded(violation) => {
                terminate(&mut child, pid);
                (reap(&mut child).await, Some(ExecutionFailure::from(violation)))
            }
        };
        group.disarm();
        let execution_time = started.elapsed();

        let (stdout, stdout_truncated) = collect(stdout_reader, "stdout").await;
        let (stderr, stderr_truncated) = collect(stderr_reader, "stderr").await;

        let exit_code = status.as_ref().map_or(KILLED_EXIT_CODE, exit_code_of);
        let error = failure.as_ref().map(ToString::to_string);
        let success = exit_code == 0 && failure.is_none();

        let phase = match &failure {
            None => ExecutionPhase::Finished,
            Some(ExecutionFailure::Timeout(_)) => ExecutionPhase::TimedOut,
            Some(ExecutionFailure::ResourceLimit(_)) => ExecutionPhase::LimitExceeded,
        };
        match &error {
            Some(reason) => warn!("Sandbox {} killed: {reason}", scope.id()),
            None => info!(
                "Sandbox {} exited with code {exit_code} in {:.3}s",
                scope.id(),
                execution_time.as_secs_f64()
            ),
        }
        scope.audit().record(AuditEvent::Execution {
            context_id: scope.id(),
            phase,
            detail: Some(error.clone().unwrap_or_else(|| format!("exit code {exit_code}"))),
        });

        Ok(SandboxResult {
            success,
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            exit_code,
            execution_time,
            memory_usage: monitor.peak().memory_bytes,
            error,
            failure,
        })
    }
}

fn infrastructure_failure(
    scope: &CapabilityContext,
    what: &str,
    err: std::io::Error,
) -> SandboxError {
    error!("Sandbox infrastructure failure ({what}): {err}");
    scope.audit().record(AuditEvent::Execution {
        context_id: scope.id(),
        phase: ExecutionPhase::Failed,
        detail: Some(format!("{what}: {err}")),
    });
    SandboxError::infrastructure(what, err)
}

/// Reads to EOF, keeping at most `cap` bytes. Keeps draining past the cap so
/// the writer never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(
    mut reader: R,
    cap: usize,
) -> std::io::Result<(Vec<u8>, bool)> {
    let mut captured = Vec::new();
    let mut truncated = false;
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = cap.saturating_sub(captured.len());
        if n > room {
            truncated = true;
        }
        captured.extend_from_slice(&chunk[..n.min(room)]);
    }

    Ok((captured, truncated))
}

async fn collect(
    mut reader: JoinHandle<std::io::Result<(Vec<u8>, bool)>>,
    stream: &str,
) -> (Vec<u8>, bool) {
    match tokio::time::timeout(READER_GRACE, &mut reader).await {
        Ok(Ok(Ok(captured))) => captured,
        Ok(Ok(Err(e))) => {
            warn!("Failed to read sandbox {stream}: {e}");
            (Vec::new(), false)
        }
        Ok(Err(e)) => {
            warn!("Sandbox {stream} reader panicked: {e}");
            (Vec::new(), false)
        }
        Err(_) => {
            warn!("Sandbox {stream} still open after exit, discarding capture");
            reader.abort();
            (Vec::new(), true)
        }
    }
}

/// Kills the process group (or just the child off Unix). Safe to call on a
/// process that already exited.
fn terminate(child: &mut Child, pid: Option<u32>) {
    if let Some(pgid) = pid {
        kill_group(pgid);
    }

    if let Err(e) = child.start_kill() {
        debug!("start_kill on finished sandbox process: {e}");
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    if let Ok(pgid) = libc::pid_t::try_from(pgid) {
        // SAFETY: plain syscall; ESRCH for an empty group is expected.
        unsafe {
            libc::killpg(pgid, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

/// Kills the sandbox process group when dropped while still armed.
/// `kill_on_drop` only reaches the interpreter itself.
struct GroupGuard {
    pgid: Option<u32>,
}

impl GroupGuard {
    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            debug!("Sandbox execution cancelled, killing process group {pgid}");
            kill_group(pgid);
        }
    }
}

async fn reap(child: &mut Child) -> Option<ExitStatus> {
    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            warn!("Failed to reap killed sandbox process: {e}");
            None
        }
        Err(_) => {
            warn!("Killed sandbox process not reaped after {KILL_GRACE:?}");
            None
        }
    }
}

fn exit_code_of(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Maps deaths by the rlimit signals to the limit that caused them.
#[cfg(unix)]
fn signal_failure(status: &ExitStatus, config: &SandboxConfig) -> Option<ResourceLimitError> {
    use std::os::unix::process::ExitStatusExt;
    match status.signal()? {
        libc::SIGXCPU => Some(ResourceLimitError::CpuTime {
            limit_secs: config.max_cpu_time_seconds,
        }),
        libc::SIGXFSZ => Some(ResourceLimitError::FileSize {
            limit_bytes: config.max_file_size_bytes(),
        }),
        _ => None,
    }
}

#[cfg(not(unix))]
fn signal_failure(_status: &ExitStatus, _config: &SandboxConfig) -> Option<ResourceLimitError> {
    None
}

/// Kernel limits applied in the child between fork and exec. Zero disables
/// a limit.
#[cfg(unix)]
#[derive(Debug, Clone, Copy)]
struct OsLimits {
    cpu_secs: u64,
    file_size_bytes: u64,
    open_files: u64,
}

#[cfg(unix)]
impl OsLimits {
    fn from_config(config: &SandboxConfig) -> Self {
        Self {
            cpu_secs: config.max_cpu_time_seconds,
            file_size_bytes: config.max_file_size_bytes(),
            open_files: config.max_open_files,
        }
    }

    fn apply(&self) -> std::io::Result<()> {
        // SAFETY: setpgid/setrlimit are async-signal-safe.
        unsafe {
            if libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }

            if self.cpu_secs > 0 {
                // Soft limit delivers SIGXCPU; the hard limit one second
                // later is SIGKILL.
                let cpu = libc::rlimit {
                    rlim_cur: self.cpu_secs as libc::rlim_t,
                    rlim_max: self.cpu_secs.saturating_add(1) as libc::rlim_t,
                };
                if libc::setrlimit(libc::RLIMIT_CPU, &cpu) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }

            if self.file_size_bytes > 0 {
                let fsize = libc::rlimit {
                    rlim_cur: self.file_size_bytes as libc::rlim_t,
                    rlim_max: self.file_size_bytes as libc::rlim_t,
                };
                if libc::setrlimit(libc::RLIMIT_FSIZE, &fsize) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }

            if self.open_files > 0 {
                let nofile = libc::rlimit {
                    rlim_cur: self.open_files as libc::rlim_t,
                    rlim_max: self.open_files as libc::rlim_t,
                };
                if libc::setrlimit(libc::RLIMIT_NOFILE, &nofile) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }

            let core = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            if libc::setrlimit(libc::RLIMIT_CORE, &core) != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::capability::{AuditLog, GrantOptions};
    use crate::sandbox::monitor::ResourceUsage;
    use uuid::Uuid;

    fn sh_config() -> SandboxConfig {
        SandboxConfig {
            interpreter: "sh".to_string(),
            interpreter_args: Vec::new(),
            script_extension: "sh".to_string(),
            max_wall_time_seconds: 10,
            ..SandboxConfig::default()
        }
    }

    fn new_root() -> Arc<CapabilityContext> {
        let root = CapabilityContext::root(Arc::new(AuditLog::new(Uuid::new_v4())));
        root.grant_capability("file.read:/data/**", GrantOptions::new())
            .unwrap();
        root.grant_capability("network.https:*.example.com", GrantOptions::new())
            .unwrap();
        root
    }

    #[derive(Debug)]
    struct FixedProbe(ResourceUsage);

    impl ResourceProbe for FixedProbe {
        fn sample(&self, _pid: u32) -> Option<ResourceUsage> {
            Some(self.0)
        }
    }

    // ── Normal completion ───────────────────────────────

    #[tokio::test]
    async fn test_successful_run() {
        let executor = SandboxExecutor::new();
        let result = executor
            .execute("echo hello", &sh_config(), &new_root())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout_lossy(), "hello\n");
        assert!(result.error.is_none());
        assert!(!result.stdout_truncated);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_a_normal_result() {
        let executor = SandboxExecutor::new();
        let result = executor
            .execute("echo out; echo err >&2; exit 3", &sh_config(), &new_root())
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.exit_code, 3);
        assert!(result.error.is_none());
        assert!(result.failure.is_none());
        assert_eq!(result.stdout_lossy(), "out\n");
        assert_eq!(result.stderr_lossy(), "err\n");
    }

    // ── Limits ──────────────────────────────────────────

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let executor = SandboxExecutor::new();
        let config = SandboxConfig {
            max_wall_time_seconds: 1,
            ..sh_config()
        };

        let started = Instant::now();
        let result = executor
            .execute("echo $$; sleep 10", &config, &new_root())
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert!(elapsed < Duration::from_secs(4), "took {elapsed:?}");
        assert!(!result.success);
        assert!(result.timed_out());
        assert_eq!(
            result.error.as_deref(),
            Some("execution timed out after 1.000s")
        );

        let pid: libc::pid_t = result.stdout_lossy().trim().parse().unwrap();
        let alive = unsafe { libc::kill(pid, 0) } == 0;
        assert!(!alive, "sandbox process {pid} still running");
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let executor = SandboxExecutor::new();
        let config = SandboxConfig {
            max_output_bytes: 4096,
            ..sh_config()
        };

        let result = executor
            .execute("head -c 2000000 /dev/zero", &config, &new_root())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.stdout.len(), 4096);
        assert!(result.stdout_truncated);
        assert!(!result.stderr_truncated);
    }

    #[tokio::test]
    async fn test_memory_violation_from_monitor() {
        let executor = SandboxExecutor::with_probe(Arc::new(FixedProbe(ResourceUsage {
            memory_bytes: 4 * 1024 * 1024 * 1024,
            open_files: 3,
        })));
        let config = SandboxConfig {
            max_memory_mb: 64,
            ..sh_config()
        };

        let started = Instant::now();
        let result = executor
            .execute("sleep 5", &config, &new_root())
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(!result.success);
        assert!(matches!(
            result.failure,
            Some(ExecutionFailure::ResourceLimit(ResourceLimitError::Memory { .. }))
        ));
        assert!(result.error.unwrap().starts_with("memory limit exceeded"));
        assert_eq!(result.memory_usage, 4 * 1024 * 1024 * 1024);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_memory_of_grandchild_counts() {
        let executor = SandboxExecutor::new();
        let config = SandboxConfig {
            max_memory_mb: 32,
            max_wall_time_seconds: 20,
            ..sh_config()
        };
        // The interpreter stays small; a nested shell holds 64 MiB.
        let script = r#"sh -c 'x=$(head -c 67108864 /dev/zero | tr "\000" a); sleep 10' &
wait
"#;

        let result = executor
            .execute(script, &config, &new_root())
            .await
            .unwrap();

        assert!(!result.success);
        assert!(matches!(
            result.failure,
            Some(ExecutionFailure::ResourceLimit(ResourceLimitError::Memory { .. }))
        ));
        assert!(result.memory_usage > 32 * 1024 * 1024);
        assert!(
            result.execution_time < Duration::from_secs(9),
            "took {:?}",
            result.execution_time
        );
    }

    #[tokio::test]
    async fn test_cpu_limit_reported() {
        let executor = SandboxExecutor::new();
        let config = SandboxConfig {
            max_cpu_time_seconds: 1,
            ..sh_config()
        };

        let result = executor
            .execute("while :; do :; done", &config, &new_root())
            .await
            .unwrap();

        assert!(!result.success);
        assert!(matches!(
            result.failure,
            Some(ExecutionFailure::ResourceLimit(ResourceLimitError::CpuTime {
                limit_secs: 1
            }))
        ));
    }

    // ── Cancellation ────────────────────────────────────

    /// Running means present in procfs and not a zombie.
    #[cfg(target_os = "linux")]
    fn running(pid: libc::pid_t) -> bool {
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .ok()
            .and_then(|stat| {
                let (_, rest) = stat.rsplit_once(')')?;
                rest.split_whitespace().next().map(|state| state != "Z")
            })
            .unwrap_or(false)
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_dropped_execution_kills_background_children() {
        let executor = SandboxExecutor::new();
        let root = new_root();
        let scratch = tempfile::tempdir().unwrap();
        let pid_file = scratch.path().join("pid");
        let config = SandboxConfig {
            max_wall_time_seconds: 60,
            ..sh_config()
        };
        let script = format!("sleep 30 &\necho $! > '{}'\nwait\n", pid_file.display());

        let cancelled = tokio::time::timeout(
            Duration::from_millis(1500),
            executor.execute(&script, &config, &root),
        )
        .await;
        assert!(cancelled.is_err());

        let pid: libc::pid_t = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let mut alive = running(pid);
        for _ in 0..40 {
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            alive = running(pid);
        }
        assert!(!alive, "background process {pid} survived cancellation");
    }

    // ── Environment and descriptor ──────────────────────

    #[tokio::test]
    async fn test_environment_is_filtered() {
        let executor = SandboxExecutor::new();
        let mut config = sh_config();
        config
            .environment_vars
            .insert("APP_MODE".to_string(), "test".to_string());
        config
            .environment_vars
            .insert("BAD".to_string(), "a;b".to_string());

        let script = r#"echo "$APP_MODE"
echo "${BAD:-unset}"
echo "$CAPGUARD_ALLOW_NETWORK"
echo "$HOME"
pwd
"#;
        let result = executor
            .execute(script, &config, &new_root())
            .await
            .unwrap();
        let stdout = result.stdout_lossy();
        let lines: Vec<&str> = stdout.lines().collect();

        assert_eq!(lines[0], "test");
        assert_eq!(lines[1], "unset");
        assert_eq!(lines[2], "0");
        assert!(lines[3].contains("capguard-"));
        assert!(lines[4].contains("capguard-"));
    }

    #[tokio::test]
    async fn test_descriptor_token_without_network() {
        let executor = SandboxExecutor::new();
        let root = new_root();
        let result = executor
            .execute(
                "printf '%s' \"$CAPGUARD_CAPABILITY_TOKEN\"",
                &sh_config(),
                &root,
            )
            .await
            .unwrap();

        let descriptor = executor.signer().verify(&result.stdout_lossy()).unwrap();
        let now = Utc::now();
        assert!(descriptor.allows("/data/reports/q1.csv", "read", now));
        assert!(!descriptor.allows("api.example.com", "https", now));
        assert!(!descriptor.allow_network);
        assert_eq!(descriptor.context_path[0], root.id());
        assert_eq!(descriptor.context_path.len(), 2);

        // The root itself keeps its network grant.
        assert!(root.check("api.example.com", "https"));
    }

    #[tokio::test]
    async fn test_descriptor_token_with_network() {
        let executor = SandboxExecutor::new();
        let root = new_root();
        let config = SandboxConfig {
            allow_network: true,
            ..sh_config()
        };
        let result = executor
            .execute("printf '%s' \"$CAPGUARD_CAPABILITY_TOKEN\"", &config, &root)
            .await
            .unwrap();

        let descriptor = executor.signer().verify(&result.stdout_lossy()).unwrap();
        assert!(descriptor.allows("api.example.com", "https", Utc::now()));
        assert_eq!(descriptor.context_id, root.id());
    }

    // ── Failures and audit ──────────────────────────────

    #[tokio::test]
    async fn test_spawn_failure_is_infrastructure_error() {
        let executor = SandboxExecutor::new();
        let root = new_root();
        let config = SandboxConfig {
            interpreter: "/nonexistent/interpreter".to_string(),
            ..sh_config()
        };

        let err = executor.execute("true", &config, &root).await.unwrap_err();
        assert!(matches!(err, SandboxError::Infrastructure(_)));

        let failed = root.audit().entries().into_iter().any(|entry| {
            matches!(
                entry.event,
                AuditEvent::Execution {
                    phase: ExecutionPhase::Failed,
                    ..
                }
            )
        });
        assert!(failed);
    }

    #[tokio::test]
    async fn test_execution_is_audited() {
        let executor = SandboxExecutor::new();
        let root = new_root();
        executor
            .execute("exit 0", &sh_config(), &root)
            .await
            .unwrap();

        let phases: Vec<ExecutionPhase> = root
            .audit()
            .entries()
            .into_iter()
            .filter_map(|entry| match entry.event {
                AuditEvent::Execution { phase, .. } => Some(phase),
                _ => None,
            })
            .collect();
        assert_eq!(phases, vec![ExecutionPhase::Started, ExecutionPhase::Finished]);
    }
}
