//! Mock worker for integration testing
//!
//! Environment variables:
//! - ASPNETCORE_PORT: Port to listen on (required)
//! - ASPNETCORE_TOKEN: Token expected in X-Forward-Token and X-Shutdown-Token
//! - ASPNETCORE_APPL_PATH: Application base path (default: /)
//! - STARTUP_DELAY_MS: Delay before listening (default: 0)
//! - IGNORE_SHUTDOWN: Answer the shutdown call but keep running

use base64::Engine;
use sha1::{Digest, Sha1};
use std::env;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// WebSocket magic GUID for handshake
const WS_MAGIC_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

static SETTINGS: OnceLock<Settings> = OnceLock::new();

struct Settings {
    port: u16,
    token: Option<String>,
    app_path: String,
    ignore_shutdown: bool,
}

fn settings() -> &'static Settings {
    SETTINGS.get().expect("settings initialised in main")
}

#[tokio::main]
async fn main() {
    let port: u16 = env::var("ASPNETCORE_PORT")
        .expect("ASPNETCORE_PORT environment variable required")
        .parse()
        .expect("ASPNETCORE_PORT must be a valid port number");

    let startup_delay: u64 = env::var("STARTUP_DELAY_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    SETTINGS
        .set(Settings {
            port,
            token: env::var("ASPNETCORE_TOKEN").ok(),
            app_path: env::var("ASPNETCORE_APPL_PATH").unwrap_or_else(|_| "/".to_string()),
            ignore_shutdown: env::var("IGNORE_SHUTDOWN").is_ok(),
        })
        .ok();

    if startup_delay > 0 {
        eprintln!("Mock worker: sleeping for {}ms before starting", startup_delay);
        tokio::time::sleep(Duration::from_millis(startup_delay)).await;
    }

    let listener = TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to bind");

    println!("Mock worker: listening on port {}", port);

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(handle_connection(stream));
            }
            Err(e) => {
                eprintln!("Mock worker: accept error: {}", e);
            }
        }
    }
}

struct Request {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Request {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

async fn read_request(stream: &mut TcpStream) -> Option<Request> {
    let mut buf = Vec::new();
    let mut temp = [0u8; 1024];

    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if buf.len() > 16384 {
            return None;
        }
        match stream.read(&mut temp).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => buf.extend_from_slice(&temp[..n]),
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut body = buf[head_end + 4..].to_vec();

    let mut lines = head.split("\r\n");
    let mut parts = lines.next()?.split(' ');
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
        .collect();

    let mut request = Request {
        method,
        path,
        headers,
        body: Vec::new(),
    };

    if let Some(length) = request.header("content-length").and_then(|v| v.parse::<usize>().ok()) {
        while body.len() < length {
            match stream.read(&mut temp).await {
                Ok(0) | Err(_) => return None,
                Ok(n) => body.extend_from_slice(&temp[..n]),
            }
        }
        body.truncate(length);
    } else if request
        .header("transfer-encoding")
        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
    {
        body = read_chunked(stream, body).await?;
    }

    request.body = body;
    Some(request)
}

async fn read_chunked(stream: &mut TcpStream, mut raw: Vec<u8>) -> Option<Vec<u8>> {
    let mut temp = [0u8; 1024];
    let mut decoded = Vec::new();
    let mut pos = 0;

    loop {
        let line_end = loop {
            if let Some(i) = raw[pos..].windows(2).position(|w| w == b"\r\n") {
                break pos + i;
            }
            match stream.read(&mut temp).await {
                Ok(0) | Err(_) => return None,
                Ok(n) => raw.extend_from_slice(&temp[..n]),
            }
        };
        let size_line = String::from_utf8_lossy(&raw[pos..line_end]).to_string();
        let size = usize::from_str_radix(size_line.split(';').next()?.trim(), 16).ok()?;
        pos = line_end + 2;

        while raw.len() < pos + size + 2 {
            match stream.read(&mut temp).await {
                Ok(0) | Err(_) => return None,
                Ok(n) => raw.extend_from_slice(&temp[..n]),
            }
        }
        if size == 0 {
            return Some(decoded);
        }
        decoded.extend_from_slice(&raw[pos..pos + size]);
        pos += size + 2;
    }
}

async fn handle_connection(mut stream: TcpStream) {
    let Some(request) = read_request(&mut stream).await else {
        return;
    };
    let settings = settings();

    println!("Mock worker: {} {}", request.method, request.path);

    let base = settings.app_path.trim_end_matches('/');
    if request.method == "POST" && request.path == format!("{}/iisintegration", base) {
        handle_shutdown(stream, &request).await;
        return;
    }

    if let Some(expected) = &settings.token {
        if request.header("x-forward-token") != Some(expected.as_str()) {
            respond(&mut stream, "400 Bad Request", "text/plain", b"token mismatch", &[]).await;
            return;
        }
    }

    let is_websocket = request
        .header("upgrade")
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));

    match request.path.as_str() {
        "/ws" if is_websocket => handle_upgrade(stream, &request).await,
        "/headers" => {
            let mut json = String::from("{");
            for (i, (name, value)) in request.headers.iter().enumerate() {
                if i > 0 {
                    json.push(',');
                }
                json.push_str(&format!(
                    "\"{}\":\"{}\"",
                    name.to_lowercase(),
                    value.replace('"', "\\\"")
                ));
            }
            json.push('}');
            respond(&mut stream, "200 OK", "application/json", json.as_bytes(), &[]).await;
        }
        "/echo-body" => {
            respond(&mut stream, "200 OK", "application/octet-stream", &request.body, &[]).await;
        }
        "/chunked" => {
            let mut response = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n".to_vec();
            for piece in ["first,", "second,", "third"] {
                response.extend_from_slice(format!("{:x}\r\n{}\r\n", piece.len(), piece).as_bytes());
            }
            response.extend_from_slice(b"0\r\n\r\n");
            let _ = stream.write_all(&response).await;
        }
        "/redirect" => {
            let location = format!("Location: http://127.0.0.1:{}/target", settings.port);
            respond(&mut stream, "302 Found", "text/plain", b"", &[&location]).await;
        }
        "/slow" => {
            tokio::time::sleep(Duration::from_secs(2)).await;
            respond(&mut stream, "200 OK", "text/plain", b"slow response", &[]).await;
        }
        "/exit" => {
            println!("Mock worker: exiting on request");
            std::process::exit(3);
        }
        "/pid" => {
            let pid = std::process::id().to_string();
            respond(&mut stream, "200 OK", "text/plain", pid.as_bytes(), &[]).await;
        }
        _ => {
            respond(&mut stream, "200 OK", "text/plain", b"echo response", &[]).await;
        }
    }
}

async fn handle_shutdown(mut stream: TcpStream, request: &Request) {
    let settings = settings();
    let authorised = request
        .header("x-shutdown-event")
        .is_some_and(|v| v.eq_ignore_ascii_case("shutdown"))
        && settings.token.as_deref() == request.header("x-shutdown-token");

    if !authorised {
        respond(&mut stream, "400 Bad Request", "text/plain", b"bad shutdown request", &[]).await;
        return;
    }

    respond(&mut stream, "202 Accepted", "text/plain", b"", &[]).await;
    if settings.ignore_shutdown {
        println!("Mock worker: ignoring shutdown request");
        return;
    }
    println!("Mock worker: shutting down");
    let _ = stream.shutdown().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    std::process::exit(0);
}

async fn respond(stream: &mut TcpStream, status: &str, content_type: &str, body: &[u8], extra: &[&str]) {
    let mut response = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\nX-Mock-Worker: true\r\n",
        status,
        content_type,
        body.len()
    );
    for header in extra {
        response.push_str(header);
        response.push_str("\r\n");
    }
    response.push_str("\r\n");

    let mut bytes = response.into_bytes();
    bytes.extend_from_slice(body);
    let _ = stream.write_all(&bytes).await;
}

async fn handle_upgrade(mut stream: TcpStream, request: &Request) {
    let Some(key) = request.header("sec-websocket-key") else {
        respond(&mut stream, "400 Bad Request", "text/plain", b"missing key", &[]).await;
        return;
    };

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        compute_ws_accept(key)
    );
    if stream.write_all(response.as_bytes()).await.is_err() {
        return;
    }
    handle_websocket(stream).await;
}

/// Compute the Sec-WebSocket-Accept header value
fn compute_ws_accept(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_MAGIC_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}

fn frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0x80 | opcode];
    if payload.len() < 126 {
        out.push(payload.len() as u8);
    } else if payload.len() < 65536 {
        out.push(126);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        out.push(127);
        out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }
    out.extend_from_slice(payload);
    out
}

/// Echo text frames, answer pings, close on close
async fn handle_websocket(mut stream: TcpStream) {
    loop {
        let mut header = [0u8; 2];
        if stream.read_exact(&mut header).await.is_err() {
            break;
        }

        let opcode = header[0] & 0x0F;
        let masked = (header[1] & 0x80) != 0;
        let mut payload_len = (header[1] & 0x7F) as u64;

        if payload_len == 126 {
            let mut ext = [0u8; 2];
            if stream.read_exact(&mut ext).await.is_err() {
                break;
            }
            payload_len = u16::from_be_bytes(ext) as u64;
        } else if payload_len == 127 {
            let mut ext = [0u8; 8];
            if stream.read_exact(&mut ext).await.is_err() {
                break;
            }
            payload_len = u64::from_be_bytes(ext);
        }

        let mask = if masked {
            let mut m = [0u8; 4];
            if stream.read_exact(&mut m).await.is_err() {
                break;
            }
            Some(m)
        } else {
            None
        };

        let mut payload = vec![0u8; payload_len as usize];
        if !payload.is_empty() && stream.read_exact(&mut payload).await.is_err() {
            break;
        }
        if let Some(mask) = mask {
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= mask[i % 4];
            }
        }

        let reply = match opcode {
            0x1 => frame(0x1, &payload),
            0x9 => frame(0xA, &payload),
            0x8 => {
                let _ = stream.write_all(&frame(0x8, &[])).await;
                break;
            }
            _ => continue,
        };
        if stream.write_all(&reply).await.is_err() {
            break;
        }
    }
}
