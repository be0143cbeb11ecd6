//! Spawning worker processes and signalling them
//!
//! The supervisor only talks to workers through [`ProcessLauncher`] and
//! [`WorkerHandle`], so tests can substitute in-process fakes.

use crate::error::LaunchError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

/// How a worker exited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode {
    pub code: Option<i32>,
    /// Terminating signal, on unix
    pub signal: Option<i32>,
}

/// `None` while the worker runs, then its exit status
pub type ExitWatch = watch::Receiver<Option<ExitCode>>;

/// What to do with a worker's stdout and stderr
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdioMode {
    Null,
    /// Forward each line to the log at debug level
    Capture,
    /// Redirect both streams to `<prefix>_<timestamp>_<pid>.log`
    LogFile { prefix: PathBuf },
}

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub app: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
    pub stdio: StdioMode,
}

/// A spawned worker
pub trait WorkerHandle: Send + Sync {
    fn pid(&self) -> u32;

    fn exit_watch(&self) -> ExitWatch;

    fn has_exited(&self) -> bool {
        self.exit_watch().borrow().is_some()
    }

    /// Deliver an interrupt to the worker's process group
    fn interrupt_group(&self) -> std::io::Result<()>;

    /// Forcibly terminate the worker, its group, and `children`
    fn kill_tree(&self, children: &[u32]);
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn spawn(&self, spec: LaunchSpec) -> Result<Box<dyn WorkerHandle>, LaunchError>;
}

/// Launches workers as real OS processes, each leading its own process group
#[derive(Debug, Default, Clone)]
pub struct TokioLauncher;

#[async_trait]
impl ProcessLauncher for TokioLauncher {
    async fn spawn(&self, spec: LaunchSpec) -> Result<Box<dyn WorkerHandle>, LaunchError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        cmd.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);

        if let Some(ref dir) = spec.working_dir {
            cmd.current_dir(dir);
        }

        #[cfg(unix)]
        cmd.process_group(0);

        match &spec.stdio {
            StdioMode::Null => {
                cmd.stdout(Stdio::null());
                cmd.stderr(Stdio::null());
            }
            StdioMode::Capture => {
                cmd.stdout(Stdio::piped());
                cmd.stderr(Stdio::piped());
            }
            StdioMode::LogFile { prefix } => {
                let (stdout, stderr) = open_stdout_log(prefix)?;
                cmd.stdout(stdout);
                cmd.stderr(stderr);
            }
        }

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            path: spec.program.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or(0);
        info!(app = %spec.app, pid, program = %spec.program, "Worker process spawned");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(spec.app.clone(), "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(spec.app.clone(), "stderr", stderr));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = Arc::new(Notify::new());
        let kill_signal = Arc::clone(&kill);
        let app = spec.app;

        // Owns the child: reaps it and publishes the exit status
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_signal.notified() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let exit = match status {
                Ok(status) => exit_code(status),
                Err(e) => {
                    warn!(app = %app, pid, error = %e, "Failed to wait for worker");
                    ExitCode { code: None, signal: None }
                }
            };
            debug!(app = %app, pid, code = ?exit.code, signal = ?exit.signal, "Worker exited");
            let _ = exit_tx.send(Some(exit));
        });

        Ok(Box::new(OsWorker { pid, exit: exit_rx, kill }))
    }
}

fn exit_code(status: std::process::ExitStatus) -> ExitCode {
    #[cfg(unix)]
    let signal = std::os::unix::process::ExitStatusExt::signal(&status);
    #[cfg(not(unix))]
    let signal = None;
    ExitCode {
        code: status.code(),
        signal,
    }
}

fn open_stdout_log(prefix: &std::path::Path) -> Result<(Stdio, Stdio), LaunchError> {
    let path = stdout_log_path(prefix, chrono::Local::now(), std::process::id());
    let log_error = |source| LaunchError::StdoutLog {
        path: path.display().to_string(),
        source,
    };

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(log_error)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(log_error)?;
    let stderr = file.try_clone().map_err(log_error)?;
    Ok((Stdio::from(file), Stdio::from(stderr)))
}

/// `<prefix>_<yyyyMMddHHmmss>_<pid>.log`
pub fn stdout_log_path(
    prefix: &std::path::Path,
    now: chrono::DateTime<chrono::Local>,
    pid: u32,
) -> PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push(format!("_{}_{}.log", now.format("%Y%m%d%H%M%S"), pid));
    PathBuf::from(name)
}

async fn forward_lines<R>(app: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(app = %app, stream, "{}", line);
    }
}

struct OsWorker {
    pid: u32,
    exit: ExitWatch,
    kill: Arc<Notify>,
}

impl OsWorker {
    #[cfg(unix)]
    fn signal_group(&self, signal: libc::c_int) -> std::io::Result<()> {
        if self.pid <= 1 {
            return Ok(());
        }
        // SAFETY: kill(2) has no memory-safety preconditions
        let rc = unsafe { libc::kill(-(self.pid as libc::pid_t), signal) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }
}

impl WorkerHandle for OsWorker {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn exit_watch(&self) -> ExitWatch {
        self.exit.clone()
    }

    #[cfg(unix)]
    fn interrupt_group(&self) -> std::io::Result<()> {
        self.signal_group(libc::SIGINT)
    }

    #[cfg(not(unix))]
    fn interrupt_group(&self) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "process group signals are not supported on this platform",
        ))
    }

    fn kill_tree(&self, children: &[u32]) {
        #[cfg(unix)]
        {
            if !self.has_exited() {
                if let Err(e) = self.signal_group(libc::SIGKILL) {
                    debug!(pid = self.pid, error = %e, "Failed to kill worker group");
                }
            }
            for &child in children.iter().filter(|&&c| c > 1 && c != self.pid) {
                // SAFETY: kill(2) has no memory-safety preconditions
                unsafe {
                    libc::kill(child as libc::pid_t, libc::SIGKILL);
                }
            }
        }
        #[cfg(not(unix))]
        let _ = children;

        self.kill.notify_one();
    }
}

impl Drop for OsWorker {
    fn drop(&mut self) {
        if !self.has_exited() {
            self.kill_tree(&[]);
        }
    }
}
