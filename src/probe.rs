//! Readiness probing for worker processes
//!
//! A worker is ready once something is listening on its assigned port. On
//! Linux the kernel listener table also tells us which process owns the
//! socket, which lets us reject a port squatted by an unrelated process and
//! recognise workers that hand the listening socket to a child. Elsewhere
//! (or when `/proc` is unreadable) a plain TCP connect is used and the owner
//! is unknown.

use crate::error::ProbeError;
use crate::launcher::ExitWatch;
use crate::procfs;
use std::io;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Interval between readiness polls
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Timeout for a single connect attempt in [`ProbeMode::Connect`]
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMode {
    /// Read the kernel listener table
    ListenerTable,
    /// Connect to 127.0.0.1:port
    Connect,
}

/// Result of a single listener check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Listening {
    pub listening: bool,
    /// Known only in [`ProbeMode::ListenerTable`], and only when the owning
    /// process is visible to us
    pub owner_pid: Option<u32>,
}

impl Listening {
    const NOT_LISTENING: Listening = Listening {
        listening: false,
        owner_pid: None,
    };
}

/// The process found listening once a worker is ready
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyListener {
    pub port: u16,
    /// The worker itself, or the descendant that owns the socket
    pub pid: u32,
}

#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    mode: ProbeMode,
    poll_interval: Duration,
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessProbe {
    /// Uses the listener table when available
    pub fn new() -> Self {
        let mode = if procfs::listener_table_available() {
            ProbeMode::ListenerTable
        } else {
            ProbeMode::Connect
        };
        Self {
            mode,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn connect_only() -> Self {
        Self {
            mode: ProbeMode::Connect,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn mode(&self) -> ProbeMode {
        self.mode
    }

    /// Check whether `port` has a listener. A refused connection is
    /// "not listening", never an error.
    pub async fn is_listening(&self, port: u16) -> io::Result<Listening> {
        match self.mode {
            ProbeMode::ListenerTable => {
                let table = tokio::task::spawn_blocking(move || {
                    procfs::listening_inodes(port).map(|inodes| {
                        let owner = procfs::socket_owner(&inodes);
                        (!inodes.is_empty(), owner)
                    })
                })
                .await
                .map_err(io::Error::other)?;

                match table {
                    Some((listening, owner_pid)) => Ok(Listening {
                        listening,
                        owner_pid,
                    }),
                    None => connect_check(port).await,
                }
            }
            ProbeMode::Connect => connect_check(port).await,
        }
    }

    /// Poll until `port` is listening, the worker exits, or `timeout`
    /// elapses. When `infinite_if_debugging` is set and a debugger is
    /// attached to the worker, the timeout is not enforced.
    ///
    /// A listener owned by a descendant of `expected_pid` is accepted, but
    /// the descendant can exit between discovery and the re-check made
    /// here; in that window the worker is reported as not yet ready and
    /// polling continues.
    pub async fn wait_until_ready(
        &self,
        port: u16,
        expected_pid: u32,
        mut exit: ExitWatch,
        timeout: Duration,
        infinite_if_debugging: bool,
    ) -> Result<ReadyListener, ProbeError> {
        let started = Instant::now();

        loop {
            if let Some(exited) = *exit.borrow() {
                return Err(ProbeError::ProcessExited {
                    port,
                    code: exited.code,
                });
            }

            match self.is_listening(port).await {
                Ok(found) if found.listening => {
                    if let Some(ready) = self.match_owner(port, expected_pid, found).await? {
                        debug!(port, pid = ready.pid, waited_ms = started.elapsed().as_millis() as u64, "Worker is listening");
                        return Ok(ready);
                    }
                }
                Ok(_) => {}
                Err(e) => debug!(port, error = %e, "Listener check failed"),
            }

            let unbounded = infinite_if_debugging && procfs::is_traced(expected_pid);
            if !unbounded && started.elapsed() >= timeout {
                return Err(ProbeError::NotReady {
                    port,
                    waited: started.elapsed(),
                });
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = exit.changed() => {}
            }
        }
    }

    async fn match_owner(
        &self,
        port: u16,
        expected_pid: u32,
        found: Listening,
    ) -> Result<Option<ReadyListener>, ProbeError> {
        let owner = match found.owner_pid {
            None => {
                return Ok(Some(ReadyListener {
                    port,
                    pid: expected_pid,
                }))
            }
            Some(owner) if owner == expected_pid => {
                return Ok(Some(ReadyListener { port, pid: owner }))
            }
            Some(owner) => owner,
        };

        let descendants = tokio::task::spawn_blocking(move || procfs::descendants(expected_pid))
            .await
            .unwrap_or_default();
        if !descendants.contains(&owner) {
            warn!(port, owner, expected_pid, "Port is held by an unrelated process");
            return Err(ProbeError::WrongListener { port, owner });
        }

        match self.is_listening(port).await {
            Ok(again) if again.listening && again.owner_pid == Some(owner) => {
                debug!(port, pid = owner, parent = expected_pid, "Worker child owns the listener");
                Ok(Some(ReadyListener { port, pid: owner }))
            }
            _ => Ok(None),
        }
    }
}

async fn connect_check(port: u16) -> io::Result<Listening> {
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await {
        Ok(Ok(_)) => Ok(Listening {
            listening: true,
            owner_pid: None,
        }),
        Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => Ok(Listening::NOT_LISTENING),
        Ok(Err(e)) => Err(e),
        Err(_) => Ok(Listening::NOT_LISTENING),
    }
}
