//! Child process execution
//!
//! Every agent invocation, version probe and PATH lookup goes through
//! [`ProcessRunner`]. Failures never escape as errors from [`ProcessRunner::run`]:
//! spawn failures, non-zero exits and timeouts all resolve to a
//! [`ProcessResult`] with `success = false`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{AgentRunnerError, Result};

/// Time a child gets to exit after SIGTERM before it is killed outright
const KILL_GRACE: Duration = Duration::from_secs(3);

/// Bound on draining pipes after a forced stop (grandchildren may hold them open)
const DRAIN_AFTER_SIGNAL: Duration = Duration::from_secs(1);

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Output stream type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Raw bytes read from one of the child's pipes
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub data: Bytes,
}

/// Options for spawning a process
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// None or zero means no timeout
    pub timeout: Option<Duration>,
    /// Written to the child's stdin, which is then closed
    pub stdin: Option<String>,
}

impl RunOptions {
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Outcome of a finished (or failed-to-start) process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessResult {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub timed_out: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ProcessResult {
    /// Result for a process that never started
    pub fn spawn_failure(message: impl Into<String>) -> Self {
        Self {
            exit_code: None,
            signal: None,
            stdout: String::new(),
            stderr: String::new(),
            success: false,
            timed_out: false,
            error: Some(message.into()),
            duration_ms: 0,
        }
    }
}

/// Spawns external commands
pub struct ProcessRunner;

impl ProcessRunner {
    /// Run a command to completion, buffering its output
    pub async fn run(command: &str, args: &[String], options: RunOptions) -> ProcessResult {
        let mut process = match Self::spawn(command, args, options) {
            Ok(process) => process,
            Err(e) => return ProcessResult::spawn_failure(e.to_string()),
        };
        // Output is collected by the supervisor; chunks only need draining
        while process.next_chunk().await.is_some() {}
        process.wait().await
    }

    /// Spawn a command and stream its output as it arrives
    pub fn spawn(command: &str, args: &[String], options: RunOptions) -> Result<StreamingProcess> {
        let mut cmd = if cfg!(target_os = "windows") && command.ends_with(".cmd") {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(command).args(args);
            c
        } else {
            let mut c = Command::new(command);
            c.args(args);
            c
        };

        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(&options.env)
            .stdin(if options.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Spawning {} {:?} in {:?}", command, args, options.cwd);

        let mut child = cmd.spawn().map_err(|e| {
            AgentRunnerError::spawn_failed_with_source(format!("Failed to spawn {}: {}", command, e), e)
        })?;
        let pid = child.id();

        if let Some(input) = options.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                tokio::spawn(async move {
                    if let Err(e) = stdin.write_all(input.as_bytes()).await {
                        warn!("Failed to write stdin: {}", e);
                    }
                    // Dropping stdin closes the pipe so the child sees EOF
                    let _ = stdin.shutdown().await;
                });
            }
        }

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let stdout_task = child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(pump(pipe, OutputStream::Stdout, chunk_tx.clone())));
        let stderr_task = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(pump(pipe, OutputStream::Stderr, chunk_tx.clone())));
        drop(chunk_tx);

        let (terminate_tx, terminate_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel();
        let label = command.to_string();
        let timeout = options.timeout.filter(|t| !t.is_zero());

        tokio::spawn(async move {
            let result = supervise(
                child,
                label,
                timeout,
                terminate_rx,
                stdout_task,
                stderr_task,
            )
            .await;
            let _ = result_tx.send(result);
        });

        Ok(StreamingProcess {
            pid,
            chunks: chunk_rx,
            terminate_tx: Some(terminate_tx),
            result_rx,
        })
    }
}

/// A running child whose output is delivered incrementally
#[derive(Debug)]
pub struct StreamingProcess {
    pid: Option<u32>,
    chunks: mpsc::UnboundedReceiver<OutputChunk>,
    terminate_tx: Option<oneshot::Sender<()>>,
    result_rx: oneshot::Receiver<ProcessResult>,
}

impl StreamingProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Next chunk of output; `None` once both pipes are closed
    pub async fn next_chunk(&mut self) -> Option<OutputChunk> {
        self.chunks.recv().await
    }

    /// Ask the child to stop (SIGTERM, then a hard kill after a grace period)
    pub fn terminate(&mut self) {
        if let Some(tx) = self.terminate_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Wait for the child to exit
    pub async fn wait(self) -> ProcessResult {
        self.result_rx
            .await
            .unwrap_or_else(|_| ProcessResult::spawn_failure("process supervisor exited unexpectedly"))
    }
}

/// Copy one pipe into the chunk channel, keeping a full copy for the result
async fn pump<R>(mut pipe: R, stream: OutputStream, tx: mpsc::UnboundedSender<OutputChunk>) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut collected = Vec::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                collected.extend_from_slice(&buf[..n]);
                // Receiver may be gone; keep collecting for the result anyway
                let _ = tx.send(OutputChunk {
                    stream,
                    data: Bytes::copy_from_slice(&buf[..n]),
                });
            }
            Err(e) => {
                debug!("Read from {:?} failed: {}", stream, e);
                break;
            }
        }
    }
    collected
}

enum Exit {
    Status(std::io::Result<ExitStatus>),
    Deadline,
    Terminate,
}

async fn supervise(
    mut child: Child,
    label: String,
    timeout: Option<Duration>,
    mut terminate_rx: oneshot::Receiver<()>,
    stdout_task: Option<JoinHandle<Vec<u8>>>,
    stderr_task: Option<JoinHandle<Vec<u8>>>,
) -> ProcessResult {
    let started = Instant::now();
    let deadline = async move {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);
    let mut terminate_open = true;

    let exit = loop {
        tokio::select! {
            status = child.wait() => break Exit::Status(status),
            _ = &mut deadline => break Exit::Deadline,
            request = &mut terminate_rx, if terminate_open => match request {
                Ok(()) => break Exit::Terminate,
                // Handle dropped without asking; keep waiting
                Err(_) => terminate_open = false,
            },
        }
    };

    let (status, timed_out, terminated) = match exit {
        Exit::Status(status) => (status, false, false),
        Exit::Deadline => {
            info!("{} exceeded its timeout, sending SIGTERM", label);
            (stop_child(&mut child).await, true, false)
        }
        Exit::Terminate => {
            info!("Terminating {}", label);
            (stop_child(&mut child).await, false, true)
        }
    };

    let forced = timed_out || terminated;
    let stdout = drain(stdout_task, forced).await;
    let stderr = drain(stderr_task, forced).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    let (exit_code, mut signal, wait_error) = match &status {
        Ok(status) => (status.code(), signal_name(status), None),
        Err(e) => (None, None, Some(format!("Failed to wait for {}: {}", label, e))),
    };
    if forced {
        signal = Some("SIGTERM".to_string());
    }

    let exited_ok = matches!(&status, Ok(s) if s.success());
    let success = exited_ok && !forced;
    let error = if success {
        None
    } else if timed_out {
        Some(format!(
            "{} timed out after {} ms",
            label,
            timeout.map(|t| t.as_millis()).unwrap_or_default()
        ))
    } else if terminated {
        Some(format!("{} was terminated", label))
    } else if let Some(e) = wait_error {
        Some(e)
    } else if let Some(sig) = &signal {
        Some(format!("{} was killed by {}", label, sig))
    } else {
        Some(format!(
            "{} exited with code {}",
            label,
            exit_code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".into())
        ))
    };

    ProcessResult {
        exit_code,
        signal,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        success,
        timed_out,
        error,
        duration_ms,
    }
}

/// Send SIGTERM, escalate to a hard kill if the child lingers
async fn stop_child(child: &mut Child) -> std::io::Result<ExitStatus> {
    send_sigterm(child);
    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!("Child ignored SIGTERM, killing");
            let _ = child.start_kill();
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn send_sigterm(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: pid belongs to a child we spawned and have not reaped yet
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc == 0 {
            return;
        }
    }
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn signal_name(status: &ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|sig| match sig {
        libc::SIGTERM => "SIGTERM".to_string(),
        libc::SIGKILL => "SIGKILL".to_string(),
        libc::SIGINT => "SIGINT".to_string(),
        libc::SIGHUP => "SIGHUP".to_string(),
        other => format!("SIG{}", other),
    })
}

#[cfg(not(unix))]
fn signal_name(_status: &ExitStatus) -> Option<String> {
    None
}

async fn drain(task: Option<JoinHandle<Vec<u8>>>, forced: bool) -> Vec<u8> {
    let Some(mut task) = task else {
        return Vec::new();
    };
    if !forced {
        return task.await.unwrap_or_default();
    }
    match tokio::time::timeout(DRAIN_AFTER_SIGNAL, &mut task).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            task.abort();
            Vec::new()
        }
    }
}

/// Resolve `name` on PATH, giving up after `timeout`
pub async fn command_exists(name: &str, timeout: Duration) -> Option<PathBuf> {
    let candidate = PathBuf::from(name);
    if candidate.components().count() > 1 {
        return candidate.is_file().then_some(candidate);
    }

    let probe = if cfg!(target_os = "windows") { "where" } else { "which" };
    let result = ProcessRunner::run(
        probe,
        &[name.to_string()],
        RunOptions::default().with_timeout(timeout),
    )
    .await;

    if !result.success {
        debug!("{} not found on PATH ({:?})", name, result.error);
        return None;
    }

    result
        .stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(PathBuf::from)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_run_success() {
        let result = ProcessRunner::run("echo", &args(&["hello"]), RunOptions::default()).await;
        assert!(result.success);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, "hello\n");
        assert!(result.error.is_none());
        assert!(result.signal.is_none());
    }

    #[tokio::test]
    async fn test_run_nonzero_exit() {
        let result = ProcessRunner::run("sh", &args(&["-c", "echo oops >&2; exit 3"]), RunOptions::default()).await;
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stderr, "oops\n");
        assert!(result.error.unwrap().contains("code 3"));
    }

    #[tokio::test]
    async fn test_run_spawn_failure_resolves() {
        let result = ProcessRunner::run(
            "definitely-not-a-real-binary-4242",
            &[],
            RunOptions::default(),
        )
        .await;
        assert!(!result.success);
        assert!(result.exit_code.is_none());
        assert!(result.error.unwrap().contains("Failed to spawn"));
    }

    #[tokio::test]
    async fn test_run_timeout_sends_sigterm() {
        let started = Instant::now();
        let result = ProcessRunner::run(
            "sleep",
            &args(&["5"]),
            RunOptions::default().with_timeout(Duration::from_millis(200)),
        )
        .await;
        assert!(!result.success);
        assert!(result.timed_out);
        assert_eq!(result.signal.as_deref(), Some("SIGTERM"));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_zero_timeout_means_none() {
        let result = ProcessRunner::run(
            "sh",
            &args(&["-c", "sleep 0.1; echo done"]),
            RunOptions::default().with_timeout(Duration::ZERO),
        )
        .await;
        assert!(result.success);
        assert_eq!(result.stdout, "done\n");
    }

    #[tokio::test]
    async fn test_stdin_and_env() {
        let result = ProcessRunner::run(
            "sh",
            &args(&["-c", "cat; printf \"$SWARM_TEST_VAR\""]),
            RunOptions::default()
                .with_stdin("from stdin\n")
                .with_env("SWARM_TEST_VAR", "from env"),
        )
        .await;
        assert!(result.success);
        assert_eq!(result.stdout, "from stdin\nfrom env");
    }

    #[tokio::test]
    async fn test_streaming_chunks_and_terminate() {
        let mut process = ProcessRunner::spawn(
            "sh",
            &args(&["-c", "echo ready; exec sleep 5"]),
            RunOptions::default(),
        )
        .unwrap();
        assert!(process.pid().is_some());

        let chunk = process.next_chunk().await.unwrap();
        assert_eq!(chunk.stream, OutputStream::Stdout);
        assert_eq!(&chunk.data[..], b"ready\n");

        process.terminate();
        let result = process.wait().await;
        assert!(!result.success);
        assert!(!result.timed_out);
        assert_eq!(result.signal.as_deref(), Some("SIGTERM"));
        assert_eq!(result.stdout, "ready\n");
    }

    #[tokio::test]
    async fn test_command_exists() {
        let timeout = Duration::from_secs(2);
        assert!(command_exists("sh", timeout).await.is_some());
        assert!(command_exists("definitely-not-a-real-binary-4242", timeout)
            .await
            .is_none());
    }
}
