use crate::config::{normalize_app_keys, AppConfig, AppDefaults, Config, ForwardOptions};
use crate::error::{LaunchError, SupervisorError};
use crate::launcher::{LaunchSpec, ProcessLauncher, StdioMode};
use crate::port::PortAllocator;
use crate::probe::ReadinessProbe;
use crate::process::{BackendProcess, ProcessLease, ProcessState};
use crate::procfs;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Window over which crashes count toward the rapid-fail threshold
const CRASH_WINDOW: Duration = Duration::from_secs(60);

type StartResult = Result<Arc<BackendProcess>, SupervisorError>;
type StartFuture = Shared<BoxFuture<'static, StartResult>>;

/// Why a worker is being replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecycleReason {
    Crash,
    ConfigChange,
    AppOffline,
    Operator,
}

/// Crash timestamps inside the rolling window
#[derive(Debug, Default)]
struct CrashWindow {
    times: VecDeque<Instant>,
}

impl CrashWindow {
    /// Record a crash at `now` and return the count within the window
    fn record(&mut self, now: Instant) -> usize {
        self.times.push_back(now);
        self.count(now)
    }

    fn count(&mut self, now: Instant) -> usize {
        while let Some(&oldest) = self.times.front() {
            if now.duration_since(oldest) >= CRASH_WINDOW {
                self.times.pop_front();
            } else {
                break;
            }
        }
        self.times.len()
    }
}

/// Per-application state
struct AppSlot {
    app: String,
    current: RwLock<Option<Arc<BackendProcess>>>,
    /// The in-flight start, shared by every caller that needs it
    starting: Mutex<Option<StartFuture>>,
    crashes: Mutex<CrashWindow>,
    circuit_open: AtomicBool,
    /// Recycled workers still draining or shutting down
    retired: Mutex<Vec<Arc<BackendProcess>>>,
    last_port: AtomicU16,
}

impl AppSlot {
    fn new(app: &str) -> Arc<Self> {
        Arc::new(Self {
            app: app.to_string(),
            current: RwLock::new(None),
            starting: Mutex::new(None),
            crashes: Mutex::new(CrashWindow::default()),
            circuit_open: AtomicBool::new(false),
            retired: Mutex::new(Vec::new()),
            last_port: AtomicU16::new(0),
        })
    }

    fn ready(&self) -> Option<Arc<BackendProcess>> {
        self.current
            .read()
            .as_ref()
            .filter(|p| p.is_ready() && !p.recycle_requested())
            .cloned()
    }
}

/// Clears the slot's in-flight start when the start task ends, including
/// by panic
struct StartGuard(Arc<AppSlot>);

impl Drop for StartGuard {
    fn drop(&mut self) {
        *self.0.starting.lock() = None;
    }
}

/// Owns the worker for every configured application.
///
/// Like the other long-lived services it is constructed behind an `Arc`;
/// methods that spawn background work take `self: &Arc<Self>`.
/// Application configs and the defaults they resolve against. Kept under
/// one lock so a reload swaps both at once.
struct Settings {
    configs: HashMap<String, AppConfig>,
    defaults: AppDefaults,
}

pub struct ProcessSupervisor {
    apps: DashMap<String, Arc<AppSlot>>,
    settings: RwLock<Settings>,
    launcher: Arc<dyn ProcessLauncher>,
    probe: ReadinessProbe,
    ports: PortAllocator,
    shutting_down: AtomicBool,
}

impl ProcessSupervisor {
    pub fn new(
        configs: HashMap<String, AppConfig>,
        defaults: AppDefaults,
        launcher: Arc<dyn ProcessLauncher>,
        probe: ReadinessProbe,
    ) -> Arc<Self> {
        let configs = normalize_app_keys(configs);
        let apps = DashMap::new();
        for app in configs.keys() {
            apps.insert(app.clone(), AppSlot::new(app));
        }
        Arc::new(Self {
            apps,
            settings: RwLock::new(Settings { configs, defaults }),
            launcher,
            ports: PortAllocator::new(Some(probe.clone())),
            probe,
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn has_application(&self, app: &str) -> bool {
        self.apps.contains_key(app)
    }

    pub fn get_config(&self, app: &str) -> Option<AppConfig> {
        self.settings.read().configs.get(app).cloned()
    }

    pub fn get_defaults(&self) -> AppDefaults {
        self.settings.read().defaults.clone()
    }

    /// Per-request forwarding options for `app`
    pub fn forward_options(&self, app: &str) -> Option<ForwardOptions> {
        let settings = self.settings.read();
        settings
            .configs
            .get(app)
            .map(|c| c.forward_options(&settings.defaults))
    }

    fn slot(&self, app: &str) -> Option<Arc<AppSlot>> {
        self.apps.get(app).map(|s| Arc::clone(s.value()))
    }

    /// Current worker for `app`, in whatever state
    pub fn current(&self, app: &str) -> Option<Arc<BackendProcess>> {
        self.slot(app).and_then(|s| s.current.read().clone())
    }

    pub fn is_circuit_open(&self, app: &str) -> bool {
        self.slot(app)
            .is_some_and(|s| s.circuit_open.load(Ordering::SeqCst))
    }

    /// Borrow the ready worker for `app`, starting one if needed.
    ///
    /// Concurrent callers for an idle application share one start. A failed
    /// start is retried by the next caller, unless the rapid-fail circuit
    /// has opened.
    pub async fn get_or_start(self: &Arc<Self>, app: &str) -> Result<ProcessLease, SupervisorError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SupervisorError::ShuttingDown);
        }
        let slot = self
            .slot(app)
            .ok_or_else(|| SupervisorError::UnknownApplication(app.to_string()))?;

        if slot.circuit_open.load(Ordering::SeqCst) {
            return Err(SupervisorError::RapidFailExceeded(app.to_string()));
        }
        if let Some(process) = slot.ready() {
            return Ok(process.lease());
        }

        let start = {
            let mut starting = slot.starting.lock();
            if let Some(process) = slot.ready() {
                return Ok(process.lease());
            }
            match starting.as_ref() {
                Some(in_flight) => {
                    debug!(app, "Joining in-flight worker start");
                    in_flight.clone()
                }
                None => {
                    let start = self.spawn_start(&slot);
                    *starting = Some(start.clone());
                    start
                }
            }
        };

        let process = start.await?;
        Ok(process.lease())
    }

    fn spawn_start(self: &Arc<Self>, slot: &Arc<AppSlot>) -> StartFuture {
        let supervisor = Arc::clone(self);
        let guard = StartGuard(Arc::clone(slot));
        let task = tokio::spawn(async move {
            let guard = guard;
            supervisor.start_worker(&guard.0).await
        });

        let supervisor = Arc::downgrade(self);
        let app = slot.app.clone();
        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => {
                    error!(app = %app, error = %e, "Worker start task failed");
                    if let Some(supervisor) = supervisor.upgrade() {
                        supervisor.report_crash(&app);
                    }
                    if e.is_panic() {
                        Err(SupervisorError::Panicked(app))
                    } else {
                        Err(SupervisorError::Start {
                            app,
                            reason: "start was cancelled".to_string(),
                        })
                    }
                }
            }
        }
        .boxed()
        .shared()
    }

    async fn start_worker(self: &Arc<Self>, slot: &Arc<AppSlot>) -> StartResult {
        let app = slot.app.as_str();
        let (config, defaults) = {
            let settings = self.settings.read();
            let config = settings
                .configs
                .get(app)
                .cloned()
                .ok_or_else(|| SupervisorError::UnknownApplication(app.to_string()))?;
            (config, settings.defaults.clone())
        };

        let failed = |reason: String| {
            self.report_crash(app);
            SupervisorError::Start {
                app: app.to_string(),
                reason,
            }
        };

        let port = self
            .ports
            .allocate(slot.last_port.load(Ordering::SeqCst))
            .await
            .map_err(|e| failed(e.to_string()))?;
        slot.last_port.store(port.port(), Ordering::SeqCst);

        let spec = launch_spec(app, &config).map_err(|e| failed(e.to_string()))?;
        let process = BackendProcess::start(self.launcher.as_ref(), spec, port, &config.app_path)
            .await
            .map_err(|e| failed(e.to_string()))?;

        process
            .wait_ready(&self.probe, config.startup_time_limit(&defaults))
            .await
            .map_err(|e| failed(e.to_string()))?;

        *slot.current.write() = Some(Arc::clone(&process));

        // Registered after install so a crash always finds the process current
        let supervisor: Weak<Self> = Arc::downgrade(self);
        process.on_unexpected_exit(move |process, _exit| {
            if let Some(supervisor) = supervisor.upgrade() {
                supervisor.report_crash(process.app());
                supervisor.recycle_instance(&process, RecycleReason::Crash);
            }
        });

        if self.shutting_down.load(Ordering::SeqCst) {
            process
                .shutdown(config.shutdown_time_limit(&defaults), false)
                .await;
            return Err(SupervisorError::ShuttingDown);
        }

        Ok(process)
    }

    /// Record a crash for `app`. Returns `true` if this crash opened the
    /// circuit.
    pub fn report_crash(&self, app: &str) -> bool {
        let Some(slot) = self.slot(app) else {
            return false;
        };
        let threshold = {
            let settings = self.settings.read();
            settings
                .configs
                .get(app)
                .map(|c| c.rapid_fails_per_minute(&settings.defaults))
                .unwrap_or(0) as usize
        };

        let recent = slot.crashes.lock().record(Instant::now());
        warn!(app, recent, threshold, "Worker crash recorded");

        if recent > threshold && !slot.circuit_open.swap(true, Ordering::SeqCst) {
            error!(
                app,
                recent,
                threshold,
                "Rapid-fail threshold exceeded, no further workers will be started"
            );
            return true;
        }
        false
    }

    /// Close the rapid-fail circuit and forget recorded crashes
    pub fn reset_circuit(&self, app: &str) -> bool {
        let Some(slot) = self.slot(app) else {
            return false;
        };
        slot.crashes.lock().times.clear();
        let was_open = slot.circuit_open.swap(false, Ordering::SeqCst);
        if was_open {
            info!(app, "Rapid-fail circuit reset");
        }
        was_open
    }

    /// Replace the current worker for `app`. In-flight requests keep their
    /// lease; the old worker is shut down once they finish. Returns `false`
    /// if there was nothing to recycle or a recycle is already under way.
    pub fn recycle(self: &Arc<Self>, app: &str, reason: RecycleReason) -> bool {
        match self.current(app) {
            Some(process) => self.recycle_instance(&process, reason),
            None => false,
        }
    }

    fn recycle_instance(self: &Arc<Self>, process: &Arc<BackendProcess>, reason: RecycleReason) -> bool {
        if !process.mark_recycle() {
            return false;
        }
        let app = process.app().to_string();
        let slot = self.slot(&app);

        if let Some(ref slot) = slot {
            let mut current = slot.current.write();
            if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, process)) {
                *current = None;
            }
            slot.retired.lock().push(Arc::clone(process));
        }
        info!(app = %app, pid = process.pid(), ?reason, leases = process.outstanding_leases(), "Recycling worker");

        let limit = self.shutdown_limit(&app);
        let process = Arc::clone(process);
        tokio::spawn(async move {
            if !process.has_exited() {
                process.wait_drained().await;
            }
            let debugger = procfs::is_traced(process.pid());
            process.shutdown(limit, debugger).await;
            if let Some(slot) = slot {
                slot.retired.lock().retain(|p| !Arc::ptr_eq(p, &process));
            }
        });
        true
    }

    fn shutdown_limit(&self, app: &str) -> Duration {
        let settings = self.settings.read();
        settings
            .configs
            .get(app)
            .map(|c| c.shutdown_time_limit(&settings.defaults))
            .unwrap_or_else(|| Duration::from_millis(settings.defaults.shutdown_time_limit_ms))
    }

    /// Snapshot of every application's worker
    pub fn status(&self) -> Vec<AppStatus> {
        let mut status: Vec<AppStatus> = self
            .apps
            .iter()
            .map(|entry| {
                let slot = entry.value();
                let current = slot.current.read().clone();
                let recent_crashes = slot.crashes.lock().count(Instant::now());
                AppStatus {
                    app: slot.app.clone(),
                    state: current.as_ref().map(|p| p.state()),
                    pid: current.as_ref().map(|p| p.pid()),
                    port: current.as_ref().map(|p| p.port()),
                    uptime_secs: current.as_ref().map(|p| p.uptime().as_secs()),
                    leases: current.as_ref().map(|p| p.outstanding_leases()).unwrap_or(0),
                    circuit_open: slot.circuit_open.load(Ordering::SeqCst),
                    recent_crashes,
                    retired: slot.retired.lock().len(),
                }
            })
            .collect();
        status.sort_by(|a, b| a.app.cmp(&b.app));
        status
    }

    /// Reload configuration from disk
    pub fn reload_config<P: AsRef<Path>>(self: &Arc<Self>, path: P) -> anyhow::Result<ReloadResult> {
        let config = Config::load(path)?;
        Ok(self.apply_config(config.applications, config.defaults))
    }

    /// Apply a new configuration. Removed applications and applications
    /// whose effective settings changed have their worker recycled; the
    /// replacement starts on the next request.
    pub fn apply_config(
        self: &Arc<Self>,
        new_apps: HashMap<String, AppConfig>,
        new_defaults: AppDefaults,
    ) -> ReloadResult {
        let mut result = ReloadResult::default();
        let new_apps = normalize_app_keys(new_apps);

        let (old_apps, old_defaults) = {
            let mut settings = self.settings.write();
            (
                std::mem::replace(&mut settings.configs, new_apps.clone()),
                std::mem::replace(&mut settings.defaults, new_defaults.clone()),
            )
        };
        let defaults_changed = old_defaults != new_defaults;

        for (app, old) in &old_apps {
            match new_apps.get(app) {
                None => {
                    info!(app, "Removing application (config reload)");
                    self.recycle(app, RecycleReason::ConfigChange);
                    self.apps.remove(app);
                    result.removed.push(app.clone());
                }
                Some(new) if new != old || defaults_changed => {
                    info!(app, "Application changed (config reload)");
                    self.recycle(app, RecycleReason::ConfigChange);
                    result.updated.push(app.clone());
                }
                Some(_) => {}
            }
        }

        for app in new_apps.keys() {
            if !old_apps.contains_key(app) {
                info!(app, "Adding application (config reload)");
                self.apps.insert(app.clone(), AppSlot::new(app));
                result.added.push(app.clone());
            }
        }

        result.added.sort();
        result.removed.sort();
        result.updated.sort();
        info!(
            added = result.added.len(),
            removed = result.removed.len(),
            updated = result.updated.len(),
            "Configuration reloaded"
        );
        result
    }

    /// Stop every worker, current and retired, without waiting for
    /// outstanding requests. New requests fail with
    /// [`SupervisorError::ShuttingDown`].
    pub async fn shutdown_all(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let mut stops = Vec::new();
        for entry in self.apps.iter() {
            let slot = entry.value();
            let limit = self.shutdown_limit(&slot.app);
            let mut processes: Vec<Arc<BackendProcess>> = slot.retired.lock().clone();
            processes.extend(slot.current.write().take());

            for process in processes {
                stops.push(async move {
                    let debugger = procfs::is_traced(process.pid());
                    process.shutdown(limit, debugger).await
                });
            }
        }

        info!(workers = stops.len(), "Stopping all workers");
        futures::future::join_all(stops).await;
    }
}

fn launch_spec(app: &str, config: &AppConfig) -> Result<LaunchSpec, LaunchError> {
    let args = config.argument_list().map_err(LaunchError::Arguments)?;
    let mut env: Vec<(String, String)> = config
        .env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    env.sort();

    let stdio = if config.stdout_log_enabled {
        StdioMode::LogFile {
            prefix: PathBuf::from(&config.stdout_log_file),
        }
    } else {
        StdioMode::Capture
    };

    Ok(LaunchSpec {
        app: app.to_string(),
        program: config.process_path.clone(),
        args,
        env,
        working_dir: config.working_dir.as_ref().map(PathBuf::from),
        stdio,
    })
}

/// Result of a configuration reload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadResult {
    pub added: Vec<String>,
    /// Removed applications (worker recycled)
    pub removed: Vec<String>,
    /// Changed applications (worker recycled)
    pub updated: Vec<String>,
}

/// Status of one application
#[derive(Debug, Clone, serde::Serialize)]
pub struct AppStatus {
    pub app: String,
    pub state: Option<ProcessState>,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub uptime_secs: Option<u64>,
    pub leases: usize,
    pub circuit_open: bool,
    pub recent_crashes: usize,
    pub retired: usize,
}
