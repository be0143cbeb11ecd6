//! Header handling on both legs of a forwarded request

use crate::channel::ResponseHead;
use crate::config::ForwardOptions;
use crate::host::HostContext;
use std::collections::HashSet;
use std::net::SocketAddr;

pub const FORWARD_TOKEN_HEADER: &str = "X-Forward-Token";
pub const FORWARD_AUTH_TOKEN_HEADER: &str = "X-Forward-AuthToken";

/// Headers used for signalling between the proxy and its workers. Never
/// accepted from clients.
const RESERVED_REQUEST_HEADERS: [&str; 4] = [
    "x-forward-token",
    "x-forward-authtoken",
    "x-shutdown-event",
    "x-shutdown-token",
];

/// Whether the inbound request asks for a WebSocket upgrade
pub fn is_websocket_request(headers: &[(String, String)]) -> bool {
    headers.iter().any(|(name, value)| {
        name.eq_ignore_ascii_case("upgrade")
            && value
                .split(',')
                .any(|p| p.trim().eq_ignore_ascii_case("websocket"))
    })
}

/// Build the header block sent to the worker.
///
/// Inbound headers are copied in order, including `Host`, except the
/// reserved signalling headers and, unless this is a WebSocket upgrade,
/// `Connection` and `Upgrade`. The forwarded-for and protocol headers are
/// moved to the end with this hop appended.
pub fn forward_request_headers(
    ctx: &dyn HostContext,
    options: &ForwardOptions,
    token: &str,
    websocket: bool,
) -> Vec<(String, String)> {
    let forwarded_for = options.forwarded_for_header.as_deref();
    let protocol = options.protocol_header.as_deref();
    let is_named = |name: &str, configured: Option<&str>| {
        configured.is_some_and(|c| c.eq_ignore_ascii_case(name))
    };

    let mut prior_forwarded_for = None;
    let mut prior_protocol = None;
    let mut headers = Vec::new();

    for (name, value) in ctx.request_headers() {
        let lower = name.to_ascii_lowercase();
        if RESERVED_REQUEST_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        if !websocket && (lower == "connection" || lower == "upgrade") {
            continue;
        }
        if is_named(&lower, forwarded_for) {
            append_value(&mut prior_forwarded_for, value);
            continue;
        }
        if is_named(&lower, protocol) {
            append_value(&mut prior_protocol, value);
            continue;
        }
        headers.push((name, value));
    }

    headers.push((FORWARD_TOKEN_HEADER.to_string(), token.to_string()));

    if options.forward_windows_auth_token {
        if let Some(handle) = ctx.auth_token_handle() {
            headers.push((FORWARD_AUTH_TOKEN_HEADER.to_string(), format!("{:x}", handle)));
        }
    }

    if let Some(name) = forwarded_for {
        if let Some(addr) = ctx.remote_addr() {
            let hop = forwarded_for_value(addr, options.include_port_in_forwarded_for);
            append_value(&mut prior_forwarded_for, hop);
        }
        if let Some(value) = prior_forwarded_for {
            headers.push((name.to_string(), value));
        }
    }

    if let Some(name) = protocol {
        let scheme = if ctx.is_secure() { "https" } else { "http" };
        append_value(&mut prior_protocol, scheme.to_string());
        if let Some(value) = prior_protocol {
            headers.push((name.to_string(), value));
        }
    }

    headers
}

fn append_value(existing: &mut Option<String>, value: String) {
    match existing {
        Some(current) if !current.is_empty() => {
            current.push_str(", ");
            current.push_str(&value);
        }
        _ => *existing = Some(value),
    }
}

/// The client address as it appears in `X-Forwarded-For`. IPv6 addresses
/// are bracketed only when a port follows.
pub fn forwarded_for_value(addr: SocketAddr, include_port: bool) -> String {
    match (addr, include_port) {
        (SocketAddr::V4(v4), true) => format!("{}:{}", v4.ip(), v4.port()),
        (SocketAddr::V6(v6), true) => format!("[{}]:{}", v6.ip(), v6.port()),
        (addr, false) => addr.ip().to_string(),
    }
}

/// Apply the worker's status line and headers to the host response
pub fn apply_response_head(
    ctx: &dyn HostContext,
    head: &ResponseHead,
    options: &ForwardOptions,
    inbound_host: Option<&str>,
) {
    if head.status != 200 {
        ctx.set_status(head.status, &head.reason);
    }

    let upgrading = head.status == 101;
    let rewrite_host = inbound_host.filter(|_| options.reverse_rewrite_headers);
    let mut seen: HashSet<String> = HashSet::new();
    let mut has_server = false;

    for (name, value) in &head.headers {
        let lower = name.to_ascii_lowercase();
        match lower.as_str() {
            "date" => continue,
            "transfer-encoding" if !value.trim().eq_ignore_ascii_case("chunked") => continue,
            "connection"
                if !(options.forward_response_connection_header || upgrading) =>
            {
                continue
            }
            "server" => has_server = true,
            _ => {}
        }

        let value = match (lower.as_str(), rewrite_host) {
            ("location" | "content-location", Some(host)) => {
                rewrite_location(value, host, ctx.is_secure())
            }
            ("set-cookie", Some(host)) => rewrite_cookie_domain(value, host),
            _ => value.clone(),
        };

        let first = seen.insert(lower);
        ctx.set_response_header(name, &value, first);
    }

    if !has_server {
        ctx.delete_response_header("Server");
    }
}

/// Point an absolute URL at the public host instead of the worker.
/// Relative values are returned unchanged.
pub fn rewrite_location(value: &str, host: &str, secure: bool) -> String {
    let lower = value.to_ascii_lowercase();
    let after_scheme = if lower.starts_with("http://") {
        &value[7..]
    } else if lower.starts_with("https://") {
        &value[8..]
    } else {
        return value.to_string();
    };

    let path_start = after_scheme
        .find(['/', '?', '#'])
        .unwrap_or(after_scheme.len());
    let scheme = if secure { "https" } else { "http" };
    format!("{}://{}{}", scheme, host, &after_scheme[path_start..])
}

/// Replace the `Domain` attribute of a `Set-Cookie` value with the public
/// host (port stripped). A leading `.` on the original domain is kept.
pub fn rewrite_cookie_domain(value: &str, host: &str) -> String {
    let host = strip_port(host);
    value
        .split(';')
        .map(|part| {
            let Some((name, domain)) = part.split_once('=') else {
                return part.to_string();
            };
            if !name.trim().eq_ignore_ascii_case("domain") {
                return part.to_string();
            }
            let leading = &part[..part.len() - part.trim_start().len()];
            let dot = if domain.trim().starts_with('.') { "." } else { "" };
            format!("{}{}={}{}", leading, name.trim(), dot, host)
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// `host[:port]` or `[v6][:port]` without the port
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}
