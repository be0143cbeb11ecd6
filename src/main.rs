use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use workergate::config::Config;
use workergate::launcher::{ProcessLauncher, TokioLauncher};
use workergate::probe::ReadinessProbe;
use workergate::proxy::ProxyServer;
use workergate::supervisor::ProcessSupervisor;
use workergate::{PKG_NAME, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("workergate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = write_pid_file(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let probe = ReadinessProbe::new();
    info!(mode = ?probe.mode(), "Readiness probe configured");

    let supervisor = ProcessSupervisor::new(
        config.applications.clone(),
        config.defaults.clone(),
        Arc::new(TokioLauncher) as Arc<dyn ProcessLauncher>,
        probe,
    );

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let proxy = ProxyServer::new(bind_addr, Arc::clone(&supervisor), shutdown_rx.clone());
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Wait for shutdown (Ctrl+C or SIGTERM), reload (SIGHUP) or a status dump (SIGUSR1)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigusr1 = signal(SignalKind::user_defined1())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, reloading configuration...");
                    match supervisor.reload_config(&config_path) {
                        Ok(result) => {
                            if !result.added.is_empty() {
                                info!(applications = ?result.added, "New applications available");
                            }
                            if !result.removed.is_empty() {
                                info!(applications = ?result.removed, "Applications removed");
                            }
                            if !result.updated.is_empty() {
                                info!(applications = ?result.updated, "Applications updated");
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to reload configuration");
                        }
                    }
                }
                _ = sigusr1.recv() => {
                    match serde_json::to_string(&supervisor.status()) {
                        Ok(status) => info!(%status, "Worker status"),
                        Err(e) => warn!(error = %e, "Failed to serialize worker status"),
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Stop accepting, then stop every worker
    let _ = shutdown_tx.send(true);

    info!("Stopping all workers...");
    supervisor.shutdown_all().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), proxy_handle).await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let pid = std::process::id();
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        writeln!(file, "{}", pid)?;
        Ok(Self)
    }
}

fn write_pid_file(path: &Path) -> anyhow::Result<PidFile> {
    PidFile::create(path)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        "Server configuration"
    );
    info!(
        startup_time_limit_ms = config.defaults.startup_time_limit_ms,
        shutdown_time_limit_ms = config.defaults.shutdown_time_limit_ms,
        rapid_fails_per_minute = config.defaults.rapid_fails_per_minute,
        "Worker defaults"
    );
    info!(
        request_timeout_ms = config.defaults.request_timeout_ms,
        min_response_buffer = config.defaults.min_response_buffer,
        websocket_enabled = config.defaults.websocket_enabled,
        "Forwarding defaults"
    );
    info!(
        application_count = config.applications.len(),
        applications = ?config.applications.keys().collect::<Vec<_>>(),
        "Configured applications"
    );
}
