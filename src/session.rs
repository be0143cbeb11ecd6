//! Per-request forwarding state machine.
//!
//! A session moves `Start -> SendingRequest -> ReceivingResponse -> Done`,
//! or through `ReceivedWebSocketResponse` when the worker accepts an
//! upgrade. Completion is posted to the host exactly once, after the
//! session reaches `Done` and both its HTTP and WebSocket handles are
//! closed. A client disconnect aborts whichever backend operation is in
//! flight.

use crate::channel::{BackendConnectionChannel, RequestHead};
use crate::config::ForwardOptions;
use crate::error::{startup_error_page, ForwardError};
use crate::headers::{apply_response_head, forward_request_headers, is_websocket_request};
use crate::host::HostContext;
use crate::process::ProcessLease;
use crate::supervisor::ProcessSupervisor;
use crate::websocket::relay;
use hyper::body::Bytes;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Size of every request and response read
pub const BUFFER_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Start,
    SendingRequest,
    ReceivingResponse,
    ReceivedWebSocketResponse,
    Done,
}

struct Control {
    phase: SessionPhase,
    http_handle_open: bool,
    websocket_handle_open: bool,
}

/// Counts an in-flight operation for as long as it lives
struct OutstandingOp<'a>(&'a AtomicUsize);

impl<'a> OutstandingOp<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for OutstandingOp<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ProxySession {
    app: String,
    request_id: String,
    host: Arc<dyn HostContext>,
    supervisor: Arc<ProcessSupervisor>,
    options: ForwardOptions,
    control: Mutex<Control>,
    outstanding_ops: AtomicUsize,
    request_bytes: AtomicU64,
    response_bytes: AtomicU64,
    has_error: AtomicBool,
    client_disconnected: AtomicBool,
    response_headers_sent: AtomicBool,
    finish_posted: AtomicBool,
    disconnect_registered: AtomicBool,
    abort: watch::Sender<bool>,
}

impl ProxySession {
    pub fn new(
        app: &str,
        host: Arc<dyn HostContext>,
        supervisor: Arc<ProcessSupervisor>,
    ) -> Arc<Self> {
        let options = supervisor.forward_options(app).unwrap_or_default();
        let (abort, _) = watch::channel(false);
        Arc::new(Self {
            app: app.to_string(),
            request_id: uuid::Uuid::new_v4().to_string(),
            host,
            supervisor,
            options,
            control: Mutex::new(Control {
                phase: SessionPhase::Start,
                http_handle_open: false,
                websocket_handle_open: false,
            }),
            outstanding_ops: AtomicUsize::new(0),
            request_bytes: AtomicU64::new(0),
            response_bytes: AtomicU64::new(0),
            has_error: AtomicBool::new(false),
            client_disconnected: AtomicBool::new(false),
            response_headers_sent: AtomicBool::new(false),
            finish_posted: AtomicBool::new(false),
            disconnect_registered: AtomicBool::new(false),
            abort,
        })
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn phase(&self) -> SessionPhase {
        self.control.lock().phase
    }

    pub fn outstanding_ops(&self) -> usize {
        self.outstanding_ops.load(Ordering::SeqCst)
    }

    pub fn request_bytes(&self) -> u64 {
        self.request_bytes.load(Ordering::SeqCst)
    }

    pub fn response_bytes(&self) -> u64 {
        self.response_bytes.load(Ordering::SeqCst)
    }

    pub fn has_error(&self) -> bool {
        self.has_error.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.finish_posted.load(Ordering::SeqCst)
    }

    /// Start forwarding. The returned task ends when the HTTP exchange is
    /// over; a WebSocket relay may outlive it.
    pub fn begin(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        self.disconnect_registered.store(true, Ordering::SeqCst);
        self.host.register_disconnect_callback(Arc::new(move || {
            if let Some(session) = weak.upgrade() {
                session.on_client_disconnect();
            }
        }));

        let session = Arc::clone(self);
        tokio::spawn(async move { session.run().await })
    }

    async fn run(self: Arc<Self>) {
        if let Err(err) = self.forward().await {
            self.fail(err).await;
        }

        let mut control = self.control.lock();
        if control.phase != SessionPhase::ReceivedWebSocketResponse {
            control.phase = SessionPhase::Done;
        }
        control.http_handle_open = false;
        self.try_finish(Some(&mut *control));
    }

    async fn forward(self: &Arc<Self>) -> Result<(), ForwardError> {
        if !self.host.is_client_connected() {
            return Err(ForwardError::ClientDisconnected);
        }
        self.set_phase(SessionPhase::SendingRequest);

        let lease = self.op(self.supervisor.get_or_start(&self.app)).await?;
        let port = lease.snapshot().port;

        let inbound = self.host.request_headers();
        let websocket = self.options.websocket_enabled && is_websocket_request(&inbound);
        let head = RequestHead {
            method: self.host.method().to_string(),
            target: self.host.path_and_query().to_string(),
            headers: forward_request_headers(
                self.host.as_ref(),
                &self.options,
                &lease.snapshot().token,
                websocket,
            ),
        };

        let mut channel = self
            .op(BackendConnectionChannel::connect(port, self.options.request_timeout))
            .await?;
        self.with_control(None, |c| c.http_handle_open = true);
        debug!(
            app = %self.app,
            request_id = %self.request_id,
            method = %head.method,
            target = %head.target,
            port,
            "Forwarding request"
        );

        self.op(channel.send_head(&head)).await?;
        if channel.request_has_body() {
            self.send_request_body(&mut channel).await?;
        }
        self.op(channel.finish_body()).await?;

        self.set_phase(SessionPhase::ReceivingResponse);
        let is_head = head.method.eq_ignore_ascii_case("HEAD");
        let response = self.op(channel.receive_head(is_head)).await?;
        debug!(
            app = %self.app,
            request_id = %self.request_id,
            status = response.status,
            "Received response head"
        );

        if response.status == 101 && !websocket {
            return Err(crate::error::ChannelError::InvalidResponse(
                "101 response to a request without an upgrade".to_string(),
            )
            .into());
        }

        let inbound_host = self.host.request_header("host");
        apply_response_head(
            self.host.as_ref(),
            &response,
            &self.options,
            inbound_host.as_deref(),
        );

        if response.status == 101 {
            return self.start_websocket(channel, lease).await;
        }

        self.stream_response(&mut channel).await
    }

    async fn send_request_body(
        &self,
        channel: &mut BackendConnectionChannel,
    ) -> Result<(), ForwardError> {
        let mut buf = vec![0u8; BUFFER_SIZE];
        loop {
            let n = self
                .op(async {
                    match self.host.read_body(&mut buf).await {
                        Ok(n) => Ok(n),
                        // A body cut short still ends the request
                        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(0),
                        Err(e) => Err(ForwardError::Client(e.to_string())),
                    }
                })
                .await?;
            if n == 0 {
                return Ok(());
            }
            self.request_bytes.fetch_add(n as u64, Ordering::SeqCst);
            self.op(channel.send_body(&buf[..n])).await?;
        }
    }

    /// Relay the response body. Reads are never larger than
    /// [`BUFFER_SIZE`]; with a minimum buffer below half of it every read is
    /// flushed, otherwise reads accumulate until the minimum is reached.
    async fn stream_response(
        &self,
        channel: &mut BackendConnectionChannel,
    ) -> Result<(), ForwardError> {
        let threshold = self.options.min_response_buffer;
        let buffering = threshold >= BUFFER_SIZE / 2;
        let mut chunk = vec![0u8; BUFFER_SIZE];
        let mut pending = Vec::new();

        loop {
            if self.op(channel.data_available()).await? == 0 {
                break;
            }
            let n = self.op(channel.read_data(&mut chunk)).await?;
            if n == 0 {
                break;
            }
            self.response_bytes.fetch_add(n as u64, Ordering::SeqCst);

            if buffering {
                pending.extend_from_slice(&chunk[..n]);
                if pending.len() >= threshold {
                    self.send_to_host(std::mem::take(&mut pending)).await?;
                }
            } else {
                self.send_to_host(chunk[..n].to_vec()).await?;
            }
        }

        if !pending.is_empty() {
            self.send_to_host(pending).await?;
        }
        Ok(())
    }

    async fn send_to_host(&self, data: Vec<u8>) -> Result<(), ForwardError> {
        self.response_headers_sent.store(true, Ordering::SeqCst);
        self.op(async {
            self.host
                .write_chunk(Bytes::from(data))
                .await
                .map_err(|_| ForwardError::ClientDisconnected)
        })
        .await?;
        self.flush_host().await
    }

    async fn flush_host(&self) -> Result<(), ForwardError> {
        self.op(async {
            self.host
                .flush()
                .await
                .map_err(|_| ForwardError::ClientDisconnected)
        })
        .await
    }

    async fn start_websocket(
        self: &Arc<Self>,
        channel: BackendConnectionChannel,
        lease: ProcessLease,
    ) -> Result<(), ForwardError> {
        self.set_phase(SessionPhase::ReceivedWebSocketResponse);
        self.response_headers_sent.store(true, Ordering::SeqCst);
        self.flush_host().await?;

        let client = self
            .op(async {
                self.host
                    .upgrade()
                    .await
                    .map_err(|_| ForwardError::ClientDisconnected)
            })
            .await?;
        let (backend, leftover) = channel.into_upgraded();

        self.with_control(None, |c| c.websocket_handle_open = true);
        info!(app = %self.app, request_id = %self.request_id, "WebSocket upgraded");

        let session = Arc::clone(self);
        tokio::spawn(async move {
            let _lease = lease;
            match relay(client, backend, leftover).await {
                Ok(outcome) => debug!(
                    app = %session.app,
                    request_id = %session.request_id,
                    closed_by = ?outcome.closed_by,
                    bytes = outcome.bytes,
                    "WebSocket closed"
                ),
                Err(e) => debug!(
                    app = %session.app,
                    request_id = %session.request_id,
                    error = %e,
                    "WebSocket relay failed"
                ),
            }
            session.close_websocket_handle();
        });
        Ok(())
    }

    /// Run one backend or host operation, counted as outstanding and
    /// abandoned if the client disconnects first
    async fn op<T, E, F>(&self, fut: F) -> Result<T, ForwardError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<ForwardError>,
    {
        let _outstanding = OutstandingOp::new(&self.outstanding_ops);
        let mut abort = self.abort.subscribe();
        let aborted = async move {
            let _ = abort.wait_for(|aborted| *aborted).await;
        };

        tokio::select! {
            biased;
            _ = aborted => Err(ForwardError::ClientDisconnected),
            result = fut => {
                let value = match result {
                    Ok(value) => value,
                    Err(e) => return Err(e.into()),
                };
                if self.client_disconnected.load(Ordering::SeqCst) {
                    return Err(ForwardError::ClientDisconnected);
                }
                Ok(value)
            }
        }
    }

    /// Record the first failure and report it to the host
    async fn fail(&self, err: ForwardError) {
        if self
            .has_error
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.set_phase(SessionPhase::Done);

        if matches!(err, ForwardError::ClientDisconnected)
            || self.client_disconnected.load(Ordering::SeqCst)
        {
            debug!(app = %self.app, request_id = %self.request_id, "Client disconnected");
            return;
        }

        if self.response_headers_sent.load(Ordering::SeqCst) {
            warn!(
                app = %self.app,
                request_id = %self.request_id,
                error = %err,
                "Forwarding failed after the response started; resetting client connection"
            );
            self.host.reset_connection();
            return;
        }

        let Some((code, reason)) = err.status() else {
            return;
        };
        if err.is_client_side() {
            debug!(app = %self.app, request_id = %self.request_id, error = %err, "Bad request");
        } else {
            warn!(app = %self.app, request_id = %self.request_id, error = %err, status = code, "Forwarding failed");
        }

        self.host.set_status(code, reason);
        self.host.delete_response_header("Content-Length");
        self.host.delete_response_header("Transfer-Encoding");

        if let ForwardError::Startup(ref cause) = err {
            if !self.options.disable_startup_error_page {
                let page = startup_error_page(&self.app, &cause.to_string());
                self.host
                    .set_response_header("Content-Type", "text/html; charset=utf-8", true);
                let _ = self.host.write_chunk(Bytes::from(page)).await;
            }
        }
    }

    fn on_client_disconnect(&self) {
        if self.client_disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(app = %self.app, request_id = %self.request_id, "Client went away");
        self.abort.send_replace(true);
        if self.disconnect_registered.swap(false, Ordering::SeqCst) {
            self.host.unregister_disconnect_callback();
        }
    }

    fn close_websocket_handle(&self) {
        let mut control = self.control.lock();
        control.websocket_handle_open = false;
        control.phase = SessionPhase::Done;
        self.try_finish(Some(&mut *control));
    }

    fn set_phase(&self, phase: SessionPhase) {
        self.with_control(None, |c| {
            if c.phase != SessionPhase::Done {
                c.phase = phase;
            }
        });
    }

    /// Use the control block, locking it unless the caller already holds it
    fn with_control<R>(&self, held: Option<&mut Control>, f: impl FnOnce(&mut Control) -> R) -> R {
        match held {
            Some(control) => f(control),
            None => f(&mut *self.control.lock()),
        }
    }

    /// Post completion once the session is done and no handle is open
    fn try_finish(&self, held: Option<&mut Control>) {
        let ready = self.with_control(held, |c| {
            c.phase == SessionPhase::Done && !c.http_handle_open && !c.websocket_handle_open
        });
        if !ready {
            return;
        }
        if self
            .finish_posted
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        if self.disconnect_registered.swap(false, Ordering::SeqCst) {
            self.host.unregister_disconnect_callback();
        }
        debug!(
            app = %self.app,
            request_id = %self.request_id,
            request_bytes = self.request_bytes(),
            response_bytes = self.response_bytes(),
            failed = self.has_error(),
            "Request complete"
        );
        self.host.post_completion();
    }
}
