//! Byte relay for upgraded (WebSocket) connections

use crate::host::DuplexStream;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

/// Which side ended the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedBy {
    Client,
    Backend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    pub closed_by: ClosedBy,
    /// Bytes carried by the direction that finished
    pub bytes: u64,
}

/// Pump bytes between the client and the worker until either side closes
/// or fails. `leftover` holds bytes the worker sent together with its
/// `101` head; they reach the client first.
pub async fn relay(
    client: Box<dyn DuplexStream>,
    backend: TcpStream,
    leftover: Vec<u8>,
) -> std::io::Result<RelayOutcome> {
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = backend.into_split();

    if !leftover.is_empty() {
        client_write.write_all(&leftover).await?;
        client_write.flush().await?;
    }

    let outcome = {
        let upstream = tokio::io::copy(&mut client_read, &mut backend_write);
        let downstream = tokio::io::copy(&mut backend_read, &mut client_write);

        tokio::select! {
            result = upstream => (ClosedBy::Client, result),
            result = downstream => (ClosedBy::Backend, result),
        }
    };

    let _ = backend_write.shutdown().await;
    let _ = client_write.shutdown().await;

    let (closed_by, result) = outcome;
    match result {
        Ok(bytes) => {
            debug!(?closed_by, bytes, "Relay closed");
            Ok(RelayOutcome { closed_by, bytes })
        }
        Err(e) => {
            debug!(?closed_by, error = %e, "Relay failed");
            Err(e)
        }
    }
}
