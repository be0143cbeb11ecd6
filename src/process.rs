use crate::error::{LaunchError, ProbeError};
use crate::launcher::{ExitCode, LaunchSpec, ProcessLauncher, WorkerHandle};
use crate::port::PortLease;
use crate::probe::ReadinessProbe;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{watch, OnceCell};
use tracing::{debug, info, warn};

/// Environment variable carrying the worker's listen port
pub const PORT_ENV: &str = "ASPNETCORE_PORT";
/// Environment variable carrying the application base path
pub const APP_PATH_ENV: &str = "ASPNETCORE_APPL_PATH";
/// Environment variable carrying the shutdown token
pub const TOKEN_ENV: &str = "ASPNETCORE_TOKEN";

/// How long to wait for the process to disappear after a hard kill
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Lifecycle of a worker process. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// Spawned, waiting for the listener
    Starting,
    /// Listening and accepting traffic
    Ready,
    /// Shutdown in progress
    ShuttingDown,
    /// Exited after a requested shutdown
    Stopped,
    /// Never became ready, or exited unexpectedly
    Failed,
}

impl ProcessState {
    fn rank(self) -> u8 {
        match self {
            ProcessState::Starting => 0,
            ProcessState::Ready => 1,
            ProcessState::ShuttingDown => 2,
            ProcessState::Stopped | ProcessState::Failed => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 3
    }
}

/// Which shutdown tier brought the worker down
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownOutcome {
    /// The worker had already exited
    AlreadyExited,
    /// The worker accepted the shutdown call and exited
    Graceful,
    /// The worker exited on the group interrupt
    Interrupted,
    /// The worker had to be killed
    Killed,
}

/// Immutable view of a worker taken when a request borrows it
#[derive(Debug, Clone)]
pub struct ProcessSnapshot {
    pub app: String,
    pub pid: u32,
    pub port: u16,
    pub token: Arc<str>,
}

/// One worker OS process.
///
/// Owned by a supervisor slot. Requests borrow it through a
/// [`ProcessLease`]; shutdown after a recycle waits for outstanding leases
/// with [`BackendProcess::wait_drained`].
pub struct BackendProcess {
    app: String,
    port: PortLease,
    token: Arc<str>,
    app_path: String,
    handle: Box<dyn WorkerHandle>,
    pid: u32,
    /// Pid that owns the listening socket, when it is not `pid`
    listening_pid: AtomicU32,
    children: Mutex<Vec<u32>>,
    state: Mutex<ProcessState>,
    started_at: Instant,
    stopping: AtomicBool,
    shutdown_outcome: OnceCell<ShutdownOutcome>,
    recycle_requested: AtomicBool,
    exit_registered: AtomicBool,
    leases: watch::Sender<usize>,
}

impl std::fmt::Debug for BackendProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendProcess")
            .field("app", &self.app)
            .field("pid", &self.pid)
            .field("port", &self.port.port())
            .field("state", &self.state())
            .finish()
    }
}

impl BackendProcess {
    /// Spawn a worker on `port`. The port, base path and a fresh shutdown
    /// token are injected into the environment, replacing any values of the
    /// same names in `spec.env`.
    pub async fn start(
        launcher: &dyn ProcessLauncher,
        mut spec: LaunchSpec,
        port: PortLease,
        app_path: &str,
    ) -> Result<Arc<Self>, LaunchError> {
        let token: Arc<str> = uuid::Uuid::new_v4().to_string().into();
        spec.env = worker_environment(
            std::mem::take(&mut spec.env),
            port.port(),
            app_path,
            &token,
        );
        let app = spec.app.clone();

        let handle = launcher.spawn(spec).await?;
        let pid = handle.pid();
        info!(app = %app, pid, port = port.port(), "Worker starting");

        Ok(Arc::new(Self {
            app,
            port,
            token,
            app_path: app_path.to_string(),
            handle,
            pid,
            listening_pid: AtomicU32::new(0),
            children: Mutex::new(Vec::new()),
            state: Mutex::new(ProcessState::Starting),
            started_at: Instant::now(),
            stopping: AtomicBool::new(false),
            shutdown_outcome: OnceCell::new(),
            recycle_requested: AtomicBool::new(false),
            exit_registered: AtomicBool::new(false),
            leases: watch::Sender::new(0),
        }))
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn port(&self) -> u16 {
        self.port.port()
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Pid of the process that owns the listening socket
    pub fn listening_pid(&self) -> u32 {
        match self.listening_pid.load(Ordering::SeqCst) {
            0 => self.pid,
            pid => pid,
        }
    }

    pub fn children(&self) -> Vec<u32> {
        self.children.lock().clone()
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ProcessState::Ready
    }

    pub fn has_exited(&self) -> bool {
        self.handle.has_exited()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn outstanding_leases(&self) -> usize {
        *self.leases.borrow()
    }

    /// Move to `next` if it is later in the lifecycle. Returns whether the
    /// state changed.
    fn advance(&self, next: ProcessState) -> bool {
        let mut state = self.state.lock();
        if next.rank() <= state.rank() {
            return false;
        }
        debug!(app = %self.app, pid = self.pid, from = ?*state, to = ?next, "Worker state change");
        *state = next;
        true
    }

    /// Wait for the worker to listen on its port. On failure the worker is
    /// killed and marked failed.
    pub async fn wait_ready(&self, probe: &ReadinessProbe, timeout: Duration) -> Result<(), ProbeError> {
        let result = probe
            .wait_until_ready(self.port(), self.pid, self.handle.exit_watch(), timeout, true)
            .await;

        match result {
            Ok(listener) => {
                if listener.pid != self.pid {
                    self.listening_pid.store(listener.pid, Ordering::SeqCst);
                    let mut children = self.children.lock();
                    if !children.contains(&listener.pid) {
                        children.push(listener.pid);
                    }
                }
                if self.advance(ProcessState::Ready) {
                    info!(
                        app = %self.app,
                        pid = self.pid,
                        port = self.port(),
                        startup_ms = self.started_at.elapsed().as_millis() as u64,
                        "Worker is ready"
                    );
                }
                Ok(())
            }
            Err(e) => {
                warn!(app = %self.app, pid = self.pid, error = %e, "Worker failed to become ready");
                self.advance(ProcessState::Failed);
                self.handle.kill_tree(&self.children());
                Err(e)
            }
        }
    }

    /// Stop the worker, escalating from the shutdown call to a group
    /// interrupt to a hard kill. Each tier gets `timeout`, or no limit when
    /// a debugger is attached.
    ///
    /// Concurrent and repeated calls wait on the first call's sequence and
    /// return its outcome.
    pub async fn shutdown(&self, timeout: Duration, debugger_attached: bool) -> ShutdownOutcome {
        self.stopping.store(true, Ordering::SeqCst);
        *self
            .shutdown_outcome
            .get_or_init(|| self.run_shutdown(timeout, debugger_attached))
            .await
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    async fn run_shutdown(&self, timeout: Duration, debugger_attached: bool) -> ShutdownOutcome {
        let limit = (!debugger_attached).then_some(timeout);
        self.advance(ProcessState::ShuttingDown);
        info!(app = %self.app, pid = self.pid, ?limit, "Shutting down worker");

        let outcome = self.escalate(limit).await;

        // A crashed or never-ready worker stays Failed
        self.advance(ProcessState::Stopped);
        info!(app = %self.app, pid = self.pid, ?outcome, "Worker stopped");
        outcome
    }

    async fn escalate(&self, limit: Option<Duration>) -> ShutdownOutcome {
        if self.has_exited() {
            return ShutdownOutcome::AlreadyExited;
        }

        match within(limit, request_shutdown(self.port(), &self.app_path, &self.token)).await {
            Some(Ok(202)) => {
                if self.wait_exit(limit).await {
                    return ShutdownOutcome::Graceful;
                }
                debug!(app = %self.app, pid = self.pid, "Worker accepted shutdown but did not exit");
            }
            Some(Ok(status)) => {
                debug!(app = %self.app, pid = self.pid, status, "Worker rejected shutdown call");
            }
            Some(Err(e)) => {
                debug!(app = %self.app, pid = self.pid, error = %e, "Shutdown call failed");
            }
            None => debug!(app = %self.app, pid = self.pid, "Shutdown call timed out"),
        }

        match self.handle.interrupt_group() {
            Ok(()) => {
                if self.wait_exit(limit).await {
                    return ShutdownOutcome::Interrupted;
                }
                warn!(app = %self.app, pid = self.pid, "Worker ignored interrupt, killing");
            }
            Err(e) => debug!(app = %self.app, pid = self.pid, error = %e, "Group interrupt failed"),
        }

        self.handle.kill_tree(&self.children());
        if !self.wait_exit(Some(KILL_WAIT)).await {
            warn!(app = %self.app, pid = self.pid, "Worker still running after kill");
        }
        ShutdownOutcome::Killed
    }

    async fn wait_exit(&self, limit: Option<Duration>) -> bool {
        let mut exit = self.handle.exit_watch();
        let exited = within(limit, exit.wait_for(|e| e.is_some()))
            .await
            .is_some_and(|r| r.is_ok());
        exited
    }

    /// Borrow the worker for one request
    pub fn lease(self: &Arc<Self>) -> ProcessLease {
        self.leases.send_modify(|n| *n += 1);
        ProcessLease {
            snapshot: ProcessSnapshot {
                app: self.app.clone(),
                pid: self.pid,
                port: self.port(),
                token: Arc::clone(&self.token),
            },
            process: Arc::clone(self),
        }
    }

    /// Resolves once no [`ProcessLease`] is outstanding
    pub async fn wait_drained(&self) {
        let mut leases = self.leases.subscribe();
        let _ = leases.wait_for(|n| *n == 0).await;
    }

    /// Register `callback` to run if the worker exits without a shutdown
    /// having been requested. Only the first registration per process takes
    /// effect; later ones return `false`.
    pub fn on_unexpected_exit<F>(self: &Arc<Self>, callback: F) -> bool
    where
        F: FnOnce(Arc<BackendProcess>, ExitCode) + Send + 'static,
    {
        if self.exit_registered.swap(true, Ordering::SeqCst) {
            return false;
        }

        let process: Weak<Self> = Arc::downgrade(self);
        let mut exit = self.handle.exit_watch();
        tokio::spawn(async move {
            let code = match exit.wait_for(|e| e.is_some()).await {
                Ok(code) => *code,
                Err(_) => return,
            };
            let (Some(code), Some(process)) = (code, process.upgrade()) else {
                return;
            };
            if process.is_stopping() {
                return;
            }
            process.advance(ProcessState::Failed);
            warn!(
                app = %process.app,
                pid = process.pid,
                code = ?code.code,
                signal = ?code.signal,
                "Worker exited unexpectedly"
            );
            callback(process, code);
        });
        true
    }

    /// Flag this instance for replacement. Returns `true` only for the first
    /// caller.
    pub fn mark_recycle(&self) -> bool {
        !self.recycle_requested.swap(true, Ordering::SeqCst)
    }

    pub fn recycle_requested(&self) -> bool {
        self.recycle_requested.load(Ordering::SeqCst)
    }
}

/// A request's borrowed reference to a worker
#[derive(Debug)]
pub struct ProcessLease {
    process: Arc<BackendProcess>,
    snapshot: ProcessSnapshot,
}

impl ProcessLease {
    pub fn snapshot(&self) -> &ProcessSnapshot {
        &self.snapshot
    }

    pub fn process(&self) -> &Arc<BackendProcess> {
        &self.process
    }
}

impl Drop for ProcessLease {
    fn drop(&mut self) {
        self.process.leases.send_modify(|n| *n = n.saturating_sub(1));
    }
}

async fn within<F: std::future::Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Build the worker environment: `user` minus any reserved names (compared
/// ignoring ASCII case), then the port, base path and token.
pub fn worker_environment(
    user: Vec<(String, String)>,
    port: u16,
    app_path: &str,
    token: &str,
) -> Vec<(String, String)> {
    let reserved = [PORT_ENV, APP_PATH_ENV, TOKEN_ENV];
    let mut env: Vec<(String, String)> = user
        .into_iter()
        .filter(|(name, _)| !reserved.iter().any(|r| r.eq_ignore_ascii_case(name)))
        .collect();
    env.push((PORT_ENV.to_string(), port.to_string()));
    env.push((APP_PATH_ENV.to_string(), app_path.to_string()));
    env.push((TOKEN_ENV.to_string(), token.to_string()));
    env
}

/// Request path of the shutdown call for an application rooted at `app_path`
pub fn shutdown_path(app_path: &str) -> String {
    let base = app_path.trim_end_matches('/');
    if base.is_empty() {
        "/iisintegration".to_string()
    } else if base.starts_with('/') {
        format!("{}/iisintegration", base)
    } else {
        format!("/{}/iisintegration", base)
    }
}

/// Send the out-of-band shutdown call and return the response status
async fn request_shutdown(port: u16, app_path: &str, token: &str) -> std::io::Result<u16> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let request = format!(
        "POST {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nX-Shutdown-Event: shutdown\r\nX-Shutdown-Token: {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        shutdown_path(app_path),
        port,
        token
    );
    stream.write_all(request.as_bytes()).await?;

    let mut reader = BufReader::new(stream);
    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;

    // Format: "HTTP/1.1 202 Accepted\r\n"
    status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("malformed status line: {:?}", status_line.trim_end()),
            )
        })
}
