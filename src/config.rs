use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Upper bound for `rapid_fails_per_minute`
pub const MAX_RAPID_FAILS_PER_MINUTE: u32 = 100;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Global default settings for applications
    #[serde(default)]
    pub defaults: AppDefaults,

    /// Applications keyed by hostname
    #[serde(default)]
    pub applications: HashMap<String, AppConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 80)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct AppDefaults {
    /// Time allowed for a worker to start listening, in milliseconds
    #[serde(default = "default_startup_time_limit")]
    pub startup_time_limit_ms: u64,

    /// Time allowed for each shutdown tier, in milliseconds
    #[serde(default = "default_shutdown_time_limit")]
    pub shutdown_time_limit_ms: u64,

    /// Crashes tolerated within a rolling minute before the circuit opens
    #[serde(default = "default_rapid_fails_per_minute")]
    pub rapid_fails_per_minute: u32,

    /// Response bytes accumulated before flushing to the client (0 flushes every read)
    #[serde(default)]
    pub min_response_buffer: usize,

    /// Bound on each backend operation, in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Forward the host's authenticated user token handle
    #[serde(default)]
    pub forward_windows_auth_token: bool,

    /// Rewrite backend addresses in Location, Content-Location and Set-Cookie
    #[serde(default)]
    pub reverse_rewrite_headers: bool,

    /// Keep the backend's Connection response header
    #[serde(default)]
    pub forward_response_connection_header: bool,

    /// Return a bare 502 instead of the startup failure page
    #[serde(default)]
    pub disable_startup_error_page: bool,

    /// Relay WebSocket upgrades
    #[serde(default = "default_true")]
    pub websocket_enabled: bool,

    /// Client address header; empty disables it
    #[serde(default = "default_forwarded_for_header")]
    pub forwarded_for_header: String,

    /// Inbound scheme header; empty disables it
    #[serde(default = "default_protocol_header")]
    pub protocol_header: String,

    /// Append ":port" to the forwarded client address
    #[serde(default)]
    pub include_port_in_forwarded_for: bool,
}

impl Default for AppDefaults {
    fn default() -> Self {
        Self {
            startup_time_limit_ms: default_startup_time_limit(),
            shutdown_time_limit_ms: default_shutdown_time_limit(),
            rapid_fails_per_minute: default_rapid_fails_per_minute(),
            min_response_buffer: 0,
            request_timeout_ms: default_request_timeout(),
            forward_windows_auth_token: false,
            reverse_rewrite_headers: false,
            forward_response_connection_header: false,
            disable_startup_error_page: false,
            websocket_enabled: true,
            forwarded_for_header: default_forwarded_for_header(),
            protocol_header: default_protocol_header(),
            include_port_in_forwarded_for: false,
        }
    }
}

/// Configuration for a single application
///
/// # Security Warning
///
/// `process_path` and `arguments` are executed directly. Configuration files
/// must be protected with appropriate file permissions.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct AppConfig {
    /// Executable that runs the worker
    pub process_path: String,

    /// Argument string, split with shell quoting rules
    #[serde(default)]
    pub arguments: String,

    /// Working directory for the worker
    pub working_dir: Option<String>,

    /// Application base path (default: "/")
    #[serde(default = "default_app_path")]
    pub app_path: String,

    /// Environment variables for the worker
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Redirect worker stdout/stderr to a log file
    #[serde(default)]
    pub stdout_log_enabled: bool,

    /// Log file prefix; a timestamp and pid are appended
    #[serde(default = "default_stdout_log_file")]
    pub stdout_log_file: String,

    pub startup_time_limit_ms: Option<u64>,
    pub shutdown_time_limit_ms: Option<u64>,
    pub rapid_fails_per_minute: Option<u32>,
    pub min_response_buffer: Option<usize>,
    pub request_timeout_ms: Option<u64>,
    pub forward_windows_auth_token: Option<bool>,
    pub reverse_rewrite_headers: Option<bool>,
    pub forward_response_connection_header: Option<bool>,
    pub disable_startup_error_page: Option<bool>,
    pub websocket_enabled: Option<bool>,
    pub forwarded_for_header: Option<String>,
    pub protocol_header: Option<String>,
    pub include_port_in_forwarded_for: Option<bool>,
}

/// Per-request forwarding behaviour, resolved from an application and the defaults
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardOptions {
    pub min_response_buffer: usize,
    pub request_timeout: Duration,
    pub forward_windows_auth_token: bool,
    pub reverse_rewrite_headers: bool,
    pub forward_response_connection_header: bool,
    pub disable_startup_error_page: bool,
    pub websocket_enabled: bool,
    pub forwarded_for_header: Option<String>,
    pub protocol_header: Option<String>,
    pub include_port_in_forwarded_for: bool,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        AppConfig::new("").forward_options(&AppDefaults::default())
    }
}

impl AppConfig {
    /// Create a new application config with defaults
    pub fn new(process_path: &str) -> Self {
        Self {
            process_path: process_path.to_string(),
            arguments: String::new(),
            working_dir: None,
            app_path: default_app_path(),
            env: HashMap::new(),
            stdout_log_enabled: false,
            stdout_log_file: default_stdout_log_file(),
            startup_time_limit_ms: None,
            shutdown_time_limit_ms: None,
            rapid_fails_per_minute: None,
            min_response_buffer: None,
            request_timeout_ms: None,
            forward_windows_auth_token: None,
            reverse_rewrite_headers: None,
            forward_response_connection_header: None,
            disable_startup_error_page: None,
            websocket_enabled: None,
            forwarded_for_header: None,
            protocol_header: None,
            include_port_in_forwarded_for: None,
        }
    }

    /// Set the argument string (builder pattern)
    pub fn with_arguments(mut self, arguments: &str) -> Self {
        self.arguments = arguments.to_string();
        self
    }

    /// Set environment variables (builder pattern)
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Set working directory (builder pattern)
    pub fn with_working_dir(mut self, dir: &str) -> Self {
        self.working_dir = Some(dir.to_string());
        self
    }

    /// Split `arguments` into argv entries
    pub fn argument_list(&self) -> Result<Vec<String>, String> {
        shell_words::split(&self.arguments).map_err(|e| e.to_string())
    }

    pub fn startup_time_limit(&self, defaults: &AppDefaults) -> Duration {
        Duration::from_millis(
            self.startup_time_limit_ms
                .unwrap_or(defaults.startup_time_limit_ms),
        )
    }

    pub fn shutdown_time_limit(&self, defaults: &AppDefaults) -> Duration {
        Duration::from_millis(
            self.shutdown_time_limit_ms
                .unwrap_or(defaults.shutdown_time_limit_ms),
        )
    }

    /// Rapid-fail threshold, capped at [`MAX_RAPID_FAILS_PER_MINUTE`]
    pub fn rapid_fails_per_minute(&self, defaults: &AppDefaults) -> u32 {
        self.rapid_fails_per_minute
            .unwrap_or(defaults.rapid_fails_per_minute)
            .min(MAX_RAPID_FAILS_PER_MINUTE)
    }

    pub fn forward_options(&self, defaults: &AppDefaults) -> ForwardOptions {
        let header_name = |name: &Option<String>, default: &str| {
            let name = name.as_deref().unwrap_or(default).trim();
            (!name.is_empty()).then(|| name.to_string())
        };

        ForwardOptions {
            min_response_buffer: self
                .min_response_buffer
                .unwrap_or(defaults.min_response_buffer),
            request_timeout: Duration::from_millis(
                self.request_timeout_ms.unwrap_or(defaults.request_timeout_ms),
            ),
            forward_windows_auth_token: self
                .forward_windows_auth_token
                .unwrap_or(defaults.forward_windows_auth_token),
            reverse_rewrite_headers: self
                .reverse_rewrite_headers
                .unwrap_or(defaults.reverse_rewrite_headers),
            forward_response_connection_header: self
                .forward_response_connection_header
                .unwrap_or(defaults.forward_response_connection_header),
            disable_startup_error_page: self
                .disable_startup_error_page
                .unwrap_or(defaults.disable_startup_error_page),
            websocket_enabled: self.websocket_enabled.unwrap_or(defaults.websocket_enabled),
            forwarded_for_header: header_name(
                &self.forwarded_for_header,
                &defaults.forwarded_for_header,
            ),
            protocol_header: header_name(&self.protocol_header, &defaults.protocol_header),
            include_port_in_forwarded_for: self
                .include_port_in_forwarded_for
                .unwrap_or(defaults.include_port_in_forwarded_for),
        }
    }

    /// Validate the application configuration
    pub fn validate(&self, hostname: &str, defaults: &AppDefaults) -> Result<(), String> {
        if self.process_path.trim().is_empty() {
            return Err(format!(
                "Application '{}': 'process_path' must not be empty",
                hostname
            ));
        }

        if let Err(e) = self.argument_list() {
            return Err(format!(
                "Application '{}': invalid 'arguments': {}",
                hostname, e
            ));
        }

        if !self.app_path.starts_with('/') {
            return Err(format!(
                "Application '{}': 'app_path' must start with '/'",
                hostname
            ));
        }

        let rapid_fails = self
            .rapid_fails_per_minute
            .unwrap_or(defaults.rapid_fails_per_minute);
        if rapid_fails > MAX_RAPID_FAILS_PER_MINUTE {
            return Err(format!(
                "Application '{}': 'rapid_fails_per_minute' must be at most {}",
                hostname, MAX_RAPID_FAILS_PER_MINUTE
            ));
        }

        Ok(())
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    80
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_startup_time_limit() -> u64 {
    120_000 // 2 minutes
}

fn default_shutdown_time_limit() -> u64 {
    10_000 // 10 seconds per shutdown tier
}

fn default_rapid_fails_per_minute() -> u32 {
    10
}

fn default_request_timeout() -> u64 {
    120_000 // 2 minutes
}

fn default_true() -> bool {
    true
}

fn default_forwarded_for_header() -> String {
    "X-Forwarded-For".to_string()
}

fn default_protocol_header() -> String {
    "X-Forwarded-Proto".to_string()
}

fn default_app_path() -> String {
    "/".to_string()
}

fn default_stdout_log_file() -> String {
    "./logs/stdout".to_string()
}

/// Lower-case application keys to match the hostnames the front end routes on
pub fn normalize_app_keys(apps: HashMap<String, AppConfig>) -> HashMap<String, AppConfig> {
    apps.into_iter()
        .map(|(key, app)| (key.to_ascii_lowercase(), app))
        .collect()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.validate()?;
        config.applications = normalize_app_keys(config.applications);
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.defaults.rapid_fails_per_minute > MAX_RAPID_FAILS_PER_MINUTE {
            errors.push(format!(
                "Defaults: 'rapid_fails_per_minute' must be at most {}",
                MAX_RAPID_FAILS_PER_MINUTE
            ));
        }

        let mut seen: HashMap<String, &str> = HashMap::new();
        for (hostname, app) in &self.applications {
            if let Err(e) = app.validate(hostname, &self.defaults) {
                errors.push(e);
            }
            if let Some(other) = seen.insert(hostname.to_ascii_lowercase(), hostname.as_str()) {
                let (first, second) = if other < hostname.as_str() {
                    (other, hostname.as_str())
                } else {
                    (hostname.as_str(), other)
                };
                errors.push(format!(
                    "Applications '{}' and '{}' differ only in case",
                    first, second
                ));
            }
        }

        if !errors.is_empty() {
            errors.sort();
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
