//! The contract between a forwarding session and the server that accepted
//! the inbound request

use async_trait::async_trait;
use hyper::body::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream, used for upgraded connections
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexStream for T {}

pub type DisconnectCallback = Arc<dyn Fn() + Send + Sync>;

/// One inbound request and its response, as exposed by the host server.
///
/// Response methods take effect in call order. `set_status` and the header
/// setters are only meaningful before the first `write_chunk` or `flush`.
#[async_trait]
pub trait HostContext: Send + Sync {
    fn method(&self) -> &str;

    /// Path and query of the inbound request target
    fn path_and_query(&self) -> &str;

    /// Inbound headers in arrival order
    fn request_headers(&self) -> Vec<(String, String)>;

    /// First value of the named inbound header, matched case-insensitively
    fn request_header(&self, name: &str) -> Option<String> {
        self.request_headers()
            .into_iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Whether the inbound connection is TLS
    fn is_secure(&self) -> bool;

    /// Handle of the caller's impersonation token, if the host has one
    fn auth_token_handle(&self) -> Option<u64> {
        None
    }

    /// Read the next piece of the request body. `Ok(0)` means the body is
    /// complete.
    async fn read_body(&self, buf: &mut [u8]) -> std::io::Result<usize>;

    fn set_status(&self, code: u16, reason: &str);

    /// Set a response header; with `replace` false the value is appended
    /// to any existing ones
    fn set_response_header(&self, name: &str, value: &str, replace: bool);

    fn delete_response_header(&self, name: &str);

    async fn write_chunk(&self, data: Bytes) -> std::io::Result<()>;

    /// Send the response head, if not yet sent, and any written data
    async fn flush(&self) -> std::io::Result<()>;

    /// Take over the client connection after a `101` response has been
    /// flushed
    async fn upgrade(&self) -> std::io::Result<Box<dyn DuplexStream>>;

    /// Abort the client connection
    fn reset_connection(&self);

    fn is_client_connected(&self) -> bool;

    fn register_disconnect_callback(&self, callback: DisconnectCallback);

    fn unregister_disconnect_callback(&self);

    /// Signal that the request is finished. Called exactly once.
    fn post_completion(&self);
}
