//! In-process fake workers for unit tests
//!
//! A fake worker binds `ASPNETCORE_PORT` from its launch environment inside
//! the test process and serves connections with a pluggable handler. Pids are
//! synthetic, so the readiness probe must run in connect mode.

use crate::error::LaunchError;
use crate::host::{DisconnectCallback, DuplexStream, HostContext};
use crate::launcher::{ExitCode, ExitWatch, LaunchSpec, ProcessLauncher, WorkerHandle};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub type ConnHandler = Arc<dyn Fn(TcpStream, Arc<FakeWorker>) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
pub enum Behavior {
    /// Listen on the assigned port and serve with the handler
    Listen(ConnHandler),
    /// Exit with this code right after spawning
    Exit(i32),
    /// Run but never listen
    Hang,
    /// Fail the spawn itself
    FailSpawn,
}

pub struct FakeWorker {
    pub pid: u32,
    pub port: u16,
    pub env: Vec<(String, String)>,
    exit_tx: watch::Sender<Option<ExitCode>>,
    server: Mutex<Option<JoinHandle<()>>>,
    pub interrupts: AtomicUsize,
    pub kills: AtomicUsize,
    honors_interrupt: bool,
}

impl FakeWorker {
    pub fn exit(&self, code: Option<i32>, signal: Option<i32>) {
        if let Some(server) = self.server.lock().take() {
            server.abort();
        }
        self.exit_tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(ExitCode { code, signal });
            true
        });
    }

    /// Simulate a crash
    pub fn crash(&self) {
        self.exit(Some(1), None);
    }

    pub fn env_var(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

struct FakeHandle(Arc<FakeWorker>);

impl WorkerHandle for FakeHandle {
    fn pid(&self) -> u32 {
        self.0.pid
    }

    fn exit_watch(&self) -> ExitWatch {
        self.0.exit_tx.subscribe()
    }

    fn interrupt_group(&self) -> std::io::Result<()> {
        self.0.interrupts.fetch_add(1, Ordering::SeqCst);
        if self.0.honors_interrupt {
            self.0.exit(None, Some(2));
        }
        Ok(())
    }

    fn kill_tree(&self, _children: &[u32]) {
        self.0.kills.fetch_add(1, Ordering::SeqCst);
        self.0.exit(None, Some(9));
    }
}

impl Drop for FakeHandle {
    fn drop(&mut self) {
        self.0.exit(None, Some(9));
    }
}

pub struct FakeLauncher {
    behavior: Mutex<Behavior>,
    pub spawns: AtomicUsize,
    spawn_delay: Duration,
    honors_interrupt: bool,
    next_pid: AtomicU32,
    pub workers: Mutex<Vec<Arc<FakeWorker>>>,
}

impl FakeLauncher {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Self::build(behavior, Duration::ZERO, true)
    }

    pub fn with_spawn_delay(behavior: Behavior, delay: Duration) -> Arc<Self> {
        Self::build(behavior, delay, true)
    }

    pub fn ignoring_interrupts(behavior: Behavior) -> Arc<Self> {
        Self::build(behavior, Duration::ZERO, false)
    }

    fn build(behavior: Behavior, spawn_delay: Duration, honors_interrupt: bool) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            spawns: AtomicUsize::new(0),
            spawn_delay,
            honors_interrupt,
            next_pid: AtomicU32::new(4_000_000),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn last_worker(&self) -> Option<Arc<FakeWorker>> {
        self.workers.lock().last().cloned()
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn spawn(&self, spec: LaunchSpec) -> Result<Box<dyn WorkerHandle>, LaunchError> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        if !self.spawn_delay.is_zero() {
            tokio::time::sleep(self.spawn_delay).await;
        }

        let behavior = self.behavior.lock().clone();
        if let Behavior::FailSpawn = behavior {
            return Err(LaunchError::Spawn {
                path: spec.program,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such program"),
            });
        }

        let port = spec
            .env
            .iter()
            .find(|(k, _)| k == "ASPNETCORE_PORT")
            .and_then(|(_, v)| v.parse().ok())
            .unwrap_or(0);
        let (exit_tx, _) = watch::channel(None);
        let worker = Arc::new(FakeWorker {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            port,
            env: spec.env,
            exit_tx,
            server: Mutex::new(None),
            interrupts: AtomicUsize::new(0),
            kills: AtomicUsize::new(0),
            honors_interrupt: self.honors_interrupt,
        });

        match behavior {
            Behavior::Listen(handler) => {
                let listener = TcpListener::bind(("127.0.0.1", port)).await.map_err(|source| {
                    LaunchError::Spawn {
                        path: spec.program.clone(),
                        source,
                    }
                })?;
                let serving = Arc::clone(&worker);
                let server = tokio::spawn(async move {
                    while let Ok((stream, _)) = listener.accept().await {
                        tokio::spawn(handler(stream, Arc::clone(&serving)));
                    }
                });
                *worker.server.lock() = Some(server);
            }
            Behavior::Exit(code) => worker.exit(Some(code), None),
            Behavior::Hang | Behavior::FailSpawn => {}
        }

        self.workers.lock().push(Arc::clone(&worker));
        Ok(Box::new(FakeHandle(worker)))
    }
}

/// Read a request head (through the blank line) plus whatever body bytes
/// arrived with it
pub async fn read_head(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(end + 4);
            return (String::from_utf8_lossy(&buf).to_string(), rest);
        }
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return (String::from_utf8_lossy(&buf).to_string(), Vec::new()),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

/// Answers the shutdown call with 202 (then exits) and anything else with
/// `200 ok`
pub fn default_handler() -> ConnHandler {
    Arc::new(|mut stream, worker| {
        Box::pin(async move {
            let (head, _) = read_head(&mut stream).await;
            if head.starts_with("POST ") && head.contains("/iisintegration") {
                let _ = stream
                    .write_all(b"HTTP/1.1 202 Accepted\r\nContent-Length: 0\r\n\r\n")
                    .await;
                worker.exit(Some(0), None);
                return;
            }
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await;
        })
    })
}

/// Serves every connection with a fixed raw response
pub fn canned_handler(response: &'static [u8]) -> ConnHandler {
    Arc::new(move |mut stream, _| {
        Box::pin(async move {
            let _ = read_head(&mut stream).await;
            let _ = stream.write_all(response).await;
        })
    })
}

/// Something the session did to the host response, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    SetStatus(u16),
    Write(usize),
    Flush,
    Upgrade,
    Reset,
    Complete,
}

#[derive(Debug, Clone, Default)]
pub struct Recorded {
    pub status: Option<(u16, String)>,
    pub headers: Vec<(String, String)>,
    pub deleted: Vec<String>,
    pub body: Vec<u8>,
    pub events: Vec<HostEvent>,
    pub completions: usize,
    pub registers: usize,
    pub unregisters: usize,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn count(&self, event: &HostEvent) -> usize {
        self.events.iter().filter(|e| *e == event).count()
    }
}

/// In-memory [`HostContext`] that records every response call
pub struct RecordingHost {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    auth_token: Option<u64>,
    body: Mutex<std::collections::VecDeque<std::io::Result<Vec<u8>>>>,
    connected: std::sync::atomic::AtomicBool,
    callback: Mutex<Option<DisconnectCallback>>,
    recorded: Mutex<Recorded>,
    completed: tokio::sync::Notify,
    upgraded_peer: Mutex<Option<tokio::io::DuplexStream>>,
}

impl RecordingHost {
    pub fn new(method: &str, path: &str, headers: &[(&str, &str)]) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            headers: headers
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
            auth_token: None,
            body: Mutex::new(std::collections::VecDeque::new()),
            connected: std::sync::atomic::AtomicBool::new(true),
            callback: Mutex::new(None),
            recorded: Mutex::new(Recorded::default()),
            completed: tokio::sync::Notify::new(),
            upgraded_peer: Mutex::new(None),
        }
    }

    pub fn with_auth_token(mut self, handle: u64) -> Self {
        self.auth_token = Some(handle);
        self
    }

    /// Request body, delivered one read per piece
    pub fn with_body(self, pieces: &[&[u8]]) -> Self {
        self.body
            .lock()
            .extend(pieces.iter().map(|p| Ok(p.to_vec())));
        self
    }

    pub fn with_body_error(self, kind: std::io::ErrorKind) -> Self {
        self.body
            .lock()
            .push_back(Err(std::io::Error::new(kind, "client body failed")));
        self
    }

    pub fn recorded(&self) -> Recorded {
        self.recorded.lock().clone()
    }

    /// Simulate the client going away
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// The client's end of an upgraded connection
    pub fn take_upgraded_peer(&self) -> Option<tokio::io::DuplexStream> {
        self.upgraded_peer.lock().take()
    }

    pub async fn wait_complete(&self) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let notified = self.completed.notified();
                if self.recorded.lock().completions > 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .expect("session did not complete");
    }

    fn record(&self, event: HostEvent) {
        self.recorded.lock().events.push(event);
    }
}

#[async_trait]
impl HostContext for RecordingHost {
    fn method(&self) -> &str {
        &self.method
    }

    fn path_and_query(&self) -> &str {
        &self.path
    }

    fn request_headers(&self) -> Vec<(String, String)> {
        self.headers.clone()
    }

    fn remote_addr(&self) -> Option<std::net::SocketAddr> {
        Some(std::net::SocketAddr::from(([127, 0, 0, 1], 50000)))
    }

    fn is_secure(&self) -> bool {
        false
    }

    fn auth_token_handle(&self) -> Option<u64> {
        self.auth_token
    }

    async fn read_body(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let next = self.body.lock().pop_front();
        match next {
            None => Ok(0),
            Some(Err(e)) => Err(e),
            Some(Ok(piece)) => {
                let n = piece.len().min(buf.len());
                buf[..n].copy_from_slice(&piece[..n]);
                Ok(n)
            }
        }
    }

    fn set_status(&self, code: u16, reason: &str) {
        let mut recorded = self.recorded.lock();
        recorded.status = Some((code, reason.to_string()));
        recorded.events.push(HostEvent::SetStatus(code));
    }

    fn set_response_header(&self, name: &str, value: &str, replace: bool) {
        let mut recorded = self.recorded.lock();
        if replace {
            recorded.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        }
        recorded.headers.push((name.to_string(), value.to_string()));
    }

    fn delete_response_header(&self, name: &str) {
        let mut recorded = self.recorded.lock();
        recorded.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        recorded.deleted.push(name.to_string());
    }

    async fn write_chunk(&self, data: hyper::body::Bytes) -> std::io::Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(std::io::ErrorKind::BrokenPipe.into());
        }
        let mut recorded = self.recorded.lock();
        recorded.body.extend_from_slice(&data);
        recorded.events.push(HostEvent::Write(data.len()));
        Ok(())
    }

    async fn flush(&self) -> std::io::Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(std::io::ErrorKind::BrokenPipe.into());
        }
        self.record(HostEvent::Flush);
        Ok(())
    }

    async fn upgrade(&self) -> std::io::Result<Box<dyn DuplexStream>> {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        *self.upgraded_peer.lock() = Some(theirs);
        self.record(HostEvent::Upgrade);
        Ok(Box::new(ours))
    }

    fn reset_connection(&self) {
        self.record(HostEvent::Reset);
    }

    fn is_client_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn register_disconnect_callback(&self, callback: DisconnectCallback) {
        *self.callback.lock() = Some(callback);
        self.recorded.lock().registers += 1;
    }

    fn unregister_disconnect_callback(&self) {
        *self.callback.lock() = None;
        self.recorded.lock().unregisters += 1;
    }

    fn post_completion(&self) {
        {
            let mut recorded = self.recorded.lock();
            recorded.completions += 1;
            recorded.events.push(HostEvent::Complete);
        }
        self.completed.notify_waiters();
    }
}
