//! Error types for the supervisor and forwarding paths, plus the JSON
//! error responses the front end returns before a request is forwarded

use crate::proxy::ProxyBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Port allocation failures
#[derive(Debug, Error)]
pub enum PortError {
    #[error("no free port found in {attempts} attempts")]
    PortExhausted { attempts: u32 },
}

/// Readiness probe failures
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("worker was not listening on port {port} after {waited:?}")]
    NotReady { port: u16, waited: Duration },

    #[error("worker process exited before listening on port {port} (exit code {code:?})")]
    ProcessExited { port: u16, code: Option<i32> },

    #[error("port {port} is held by pid {owner}, which is not the worker or one of its children")]
    WrongListener { port: u16, owner: u32 },
}

/// Process launch failures
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("invalid arguments template: {0}")]
    Arguments(String),

    #[error("failed to open stdout log {path}: {source}")]
    StdoutLog {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Supervisor failures.
///
/// Cloneable so that every caller joined on one in-flight start observes
/// the same error value.
#[derive(Debug, Clone, Error)]
pub enum SupervisorError {
    #[error("application '{0}' is not configured")]
    UnknownApplication(String),

    #[error("application '{0}' exceeded its rapid-fail threshold")]
    RapidFailExceeded(String),

    #[error("failed to start worker for '{app}': {reason}")]
    Start { app: String, reason: String },

    #[error("worker start for '{0}' panicked")]
    Panicked(String),

    #[error("supervisor is shutting down")]
    ShuttingDown,
}

/// Errors on the connection to a worker
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to connect to backend on port {port}: {source}")]
    Connect {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("backend i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid response from backend: {0}")]
    InvalidResponse(String),

    #[error("backend did not respond within {0:?}")]
    Timeout(Duration),

    #[error("backend closed the connection before responding")]
    Closed,
}

/// Per-request failure taxonomy, resolved into a host status by the session
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Malformed or aborted inbound request
    #[error("client error: {0}")]
    Client(String),

    /// The client went away; the host already knows
    #[error("client disconnected")]
    ClientDisconnected,

    /// Backend unreachable, reset, timed out or sent an invalid response
    #[error("gateway error: {0}")]
    Gateway(#[from] ChannelError),

    /// The worker could not be started or made ready
    #[error("worker startup failed: {0}")]
    Startup(SupervisorError),

    /// Circuit breaker open, no start attempted
    #[error("rapid-fail threshold exceeded for '{0}'")]
    RapidFailExceeded(String),

    /// The supervisor is tearing down
    #[error("service unavailable")]
    Unavailable,
}

impl From<SupervisorError> for ForwardError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::RapidFailExceeded(app) => ForwardError::RapidFailExceeded(app),
            SupervisorError::ShuttingDown => ForwardError::Unavailable,
            other => ForwardError::Startup(other),
        }
    }
}

impl ForwardError {
    /// Status code and reason phrase reported to the host, or `None` when
    /// no status should be set at all
    pub fn status(&self) -> Option<(u16, &'static str)> {
        match self {
            ForwardError::Client(_) => Some((400, "Bad Request")),
            ForwardError::ClientDisconnected => None,
            ForwardError::Gateway(_) | ForwardError::Startup(_) => Some((502, "Bad Gateway")),
            ForwardError::RapidFailExceeded(_) | ForwardError::Unavailable => {
                Some((503, "Service Unavailable"))
            }
        }
    }

    /// Client-side failures never surface as gateway errors
    pub fn is_client_side(&self) -> bool {
        matches!(self, ForwardError::Client(_) | ForwardError::ClientDisconnected)
    }
}

/// Body of the page shown when a worker fails to start
pub fn startup_error_page(app: &str, reason: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>502 Bad Gateway - Worker Startup Failure</title></head>\n\
         <body>\n<h1>502 Bad Gateway</h1>\n<h2>Worker startup failure</h2>\n\
         <p>The worker process for <b>{}</b> failed to start or did not begin listening on its assigned port.</p>\n\
         <p>{}</p>\n\
         <p>Enable the stdout log for this application and check it for errors.</p>\n</body>\n</html>\n",
        escape_html(app),
        escape_html(reason)
    )
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Error codes for errors raised by the front end itself
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// Unknown or unconfigured application
    UnknownHost,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::UnknownHost => "UNKNOWN_HOST",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<ProxyBody> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
