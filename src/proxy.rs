//! Inbound HTTP server. Routes by Host header to a configured application
//! and hands each request to a [`ProxySession`] through [`HyperHost`].

use crate::error::{json_error_response, ProxyErrorCode};
use crate::host::{DisconnectCallback, DuplexStream, HostContext};
use crate::session::ProxySession;
use crate::supervisor::ProcessSupervisor;
use async_trait::async_trait;
use futures::Stream;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, StreamBody};
use hyper::body::{Body, Bytes, Frame, Incoming};
use hyper::ext::ReasonPhrase;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, Version};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

pub type ProxyBody = BoxBody<Bytes, std::io::Error>;

/// Response frames queued ahead of the client
const RESPONSE_QUEUE: usize = 16;

/// The main reverse proxy server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    supervisor: Arc<ProcessSupervisor>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        supervisor: Arc<ProcessSupervisor>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            supervisor,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");
        self.serve(listener).await;
        Ok(())
    }

    /// Accept connections on `listener` until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let supervisor = Arc::clone(&self.supervisor);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, supervisor, false).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    supervisor: Arc<ProcessSupervisor>,
    is_tls: bool,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let supervisor = Arc::clone(&supervisor);
        async move { handle_request(req, supervisor, addr, is_tls).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    supervisor: Arc<ProcessSupervisor>,
    client_addr: SocketAddr,
    is_tls: bool,
) -> Result<Response<ProxyBody>, Infallible> {
    let hostname = match extract_hostname(&req) {
        Some(h) => h,
        None => {
            return Ok(json_error_response(
                ProxyErrorCode::MissingHostHeader,
                "Missing or invalid Host header",
            ));
        }
    };

    if !supervisor.has_application(&hostname) {
        // Don't reveal whether host exists - use generic message
        return Ok(json_error_response(
            ProxyErrorCode::UnknownHost,
            "Unknown or unconfigured host",
        ));
    }

    debug!(hostname, method = %req.method(), uri = %req.uri(), "Incoming request");

    let (host, head_rx) = HyperHost::new(req, client_addr, is_tls);
    let session = ProxySession::new(&hostname, Arc::clone(&host) as Arc<dyn HostContext>, supervisor);
    let mut gone = ClientGone(Some(Arc::clone(&host)));
    session.begin();

    let response = head_rx.await;
    gone.0 = None;

    match response {
        Ok(response) => Ok(response),
        Err(_) => {
            error!(hostname, request_id = session.request_id(), "Session ended without a response");
            Ok(json_error_response(
                ProxyErrorCode::InternalError,
                "Internal proxy error",
            ))
        }
    }
}

/// Signals a disconnect when hyper drops the request future before the
/// response head was produced
struct ClientGone(Option<Arc<HyperHost>>);

impl Drop for ClientGone {
    fn drop(&mut self) {
        if let Some(host) = self.0.take() {
            host.signal_disconnect();
        }
    }
}

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Hostname from the Host header, or the request authority for HTTP/2
fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
        .and_then(|h| {
            // Strip port if present
            let hostname = h.split(':').next()?;

            if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
                return None;
            }

            // Validate characters: alphanumeric, hyphen, and dot only
            // This prevents log injection and other attacks
            if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
                return None;
            }

            Some(hostname.to_lowercase())
        })
}

struct RequestBody {
    incoming: Incoming,
    leftover: Bytes,
    done: bool,
}

struct ResponseState {
    status: StatusCode,
    reason: Option<ReasonPhrase>,
    headers: HeaderMap,
    head_tx: Option<oneshot::Sender<Response<ProxyBody>>>,
    body_rx: Option<mpsc::Receiver<std::io::Result<Frame<Bytes>>>>,
    body_tx: Option<mpsc::Sender<std::io::Result<Frame<Bytes>>>>,
}

/// Response body frames. Once the queue is drained after a reset the
/// stream ends with an error instead of a clean end of body.
struct ResponseStream {
    rx: mpsc::Receiver<std::io::Result<Frame<Bytes>>>,
    reset: Arc<AtomicBool>,
}

impl Stream for ResponseStream {
    type Item = std::io::Result<Frame<Bytes>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Ready(None) if self.reset.swap(false, Ordering::SeqCst) => {
                Poll::Ready(Some(Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "backend response aborted",
                ))))
            }
            other => other,
        }
    }
}

/// [`HostContext`] over one hyper request. The response head is handed
/// back to the service future on the first write or flush, and body
/// chunks follow through a bounded queue.
pub struct HyperHost {
    method: String,
    path_and_query: String,
    headers: Vec<(String, String)>,
    remote_addr: SocketAddr,
    secure: bool,
    body: tokio::sync::Mutex<RequestBody>,
    on_upgrade: Mutex<Option<OnUpgrade>>,
    response: Mutex<ResponseState>,
    reset: Arc<AtomicBool>,
    connected: AtomicBool,
    disconnect_callback: Mutex<Option<DisconnectCallback>>,
}

impl HyperHost {
    pub fn new(
        mut req: Request<Incoming>,
        remote_addr: SocketAddr,
        secure: bool,
    ) -> (Arc<Self>, oneshot::Receiver<Response<ProxyBody>>) {
        let on_upgrade = hyper::upgrade::on(&mut req);
        let (parts, incoming) = req.into_parts();

        let mut headers: Vec<(String, String)> = parts
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        if parts.version == Version::HTTP_2 {
            if !parts.headers.contains_key(hyper::header::HOST) {
                if let Some(authority) = parts.uri.authority() {
                    headers.insert(0, ("host".to_string(), authority.to_string()));
                }
            }
            // HTTP/2 bodies carry no framing header of their own
            if !parts.headers.contains_key(hyper::header::CONTENT_LENGTH) && !incoming.is_end_stream() {
                headers.push(("transfer-encoding".to_string(), "chunked".to_string()));
            }
        }

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();

        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(RESPONSE_QUEUE);

        let host = Arc::new(Self {
            method: parts.method.as_str().to_string(),
            path_and_query,
            headers,
            remote_addr,
            secure,
            body: tokio::sync::Mutex::new(RequestBody {
                incoming,
                leftover: Bytes::new(),
                done: false,
            }),
            on_upgrade: Mutex::new(Some(on_upgrade)),
            response: Mutex::new(ResponseState {
                status: StatusCode::OK,
                reason: None,
                headers: HeaderMap::new(),
                head_tx: Some(head_tx),
                body_rx: Some(body_rx),
                body_tx: Some(body_tx),
            }),
            reset: Arc::new(AtomicBool::new(false)),
            connected: AtomicBool::new(true),
            disconnect_callback: Mutex::new(None),
        });
        (host, head_rx)
    }

    fn signal_disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let callback = self.disconnect_callback.lock().clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Hand the response head to hyper if it has not gone yet
    fn send_head(&self, state: &mut ResponseState) {
        let Some(head_tx) = state.head_tx.take() else {
            return;
        };

        let body = match state.body_rx.take() {
            Some(rx) if state.status != StatusCode::SWITCHING_PROTOCOLS => {
                StreamBody::new(ResponseStream {
                    rx,
                    reset: Arc::clone(&self.reset),
                })
                .boxed()
            }
            _ => Empty::<Bytes>::new().map_err(|never| match never {}).boxed(),
        };

        let mut response = Response::new(body);
        *response.status_mut() = state.status;
        *response.headers_mut() = std::mem::take(&mut state.headers);
        if let Some(reason) = state.reason.take() {
            response.extensions_mut().insert(reason);
        }
        let _ = head_tx.send(response);
    }
}

fn broken_pipe(message: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::BrokenPipe, message.to_string())
}

#[async_trait]
impl HostContext for HyperHost {
    fn method(&self) -> &str {
        &self.method
    }

    fn path_and_query(&self) -> &str {
        &self.path_and_query
    }

    fn request_headers(&self) -> Vec<(String, String)> {
        self.headers.clone()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote_addr)
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    async fn read_body(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut guard = self.body.lock().await;
        let body = &mut *guard;
        loop {
            if !body.leftover.is_empty() {
                let n = body.leftover.len().min(buf.len());
                buf[..n].copy_from_slice(&body.leftover.split_to(n));
                return Ok(n);
            }
            if body.done {
                return Ok(0);
            }
            match body.incoming.frame().await {
                None => body.done = true,
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        body.leftover = data;
                    }
                }
                Some(Err(e)) if e.is_incomplete_message() => {
                    body.done = true;
                    return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, e));
                }
                Some(Err(e)) => return Err(std::io::Error::new(std::io::ErrorKind::Other, e)),
            }
        }
    }

    fn set_status(&self, code: u16, reason: &str) {
        let Ok(status) = StatusCode::from_u16(code) else {
            warn!(code, "Ignoring invalid status code");
            return;
        };
        let mut state = self.response.lock();
        state.status = status;
        state.reason = match status.canonical_reason() {
            Some(canonical) if canonical == reason => None,
            _ if reason.is_empty() => None,
            _ => ReasonPhrase::try_from(reason.as_bytes().to_vec()).ok(),
        };
    }

    fn set_response_header(&self, name: &str, value: &str, replace: bool) {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            debug!(name, "Skipping invalid response header");
            return;
        };
        let mut state = self.response.lock();
        if replace {
            state.headers.insert(name, value);
        } else {
            state.headers.append(name, value);
        }
    }

    fn delete_response_header(&self, name: &str) {
        self.response.lock().headers.remove(name);
    }

    async fn write_chunk(&self, data: Bytes) -> std::io::Result<()> {
        let tx = {
            let mut state = self.response.lock();
            self.send_head(&mut state);
            state.body_tx.clone()
        };
        let Some(tx) = tx else {
            return Err(broken_pipe("response already finished"));
        };
        if tx.send(Ok(Frame::data(data))).await.is_err() {
            self.signal_disconnect();
            return Err(broken_pipe("client went away"));
        }
        Ok(())
    }

    async fn flush(&self) -> std::io::Result<()> {
        self.send_head(&mut self.response.lock());
        if !self.connected.load(Ordering::SeqCst) {
            return Err(broken_pipe("client went away"));
        }
        Ok(())
    }

    async fn upgrade(&self) -> std::io::Result<Box<dyn DuplexStream>> {
        self.send_head(&mut self.response.lock());
        let on_upgrade = self
            .on_upgrade
            .lock()
            .take()
            .ok_or_else(|| broken_pipe("connection already upgraded"))?;
        let upgraded = on_upgrade
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        Ok(Box::new(TokioIo::new(upgraded)))
    }

    fn reset_connection(&self) {
        let mut state = self.response.lock();
        self.send_head(&mut state);
        self.reset.store(true, Ordering::SeqCst);
        state.body_tx = None;
    }

    fn is_client_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn register_disconnect_callback(&self, callback: DisconnectCallback) {
        *self.disconnect_callback.lock() = Some(callback);
    }

    fn unregister_disconnect_callback(&self) {
        *self.disconnect_callback.lock() = None;
    }

    fn post_completion(&self) {
        let mut state = self.response.lock();
        self.send_head(&mut state);
        state.body_tx = None;
    }
}
