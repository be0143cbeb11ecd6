//! Port selection for worker processes
//!
//! Ports are drawn uniformly from [`MIN_PORT`, `MAX_PORT`]. A port handed
//! out as a [`PortLease`] is not handed out again by the same allocator
//! until the lease is dropped, which is what keeps two live workers of one
//! supervisor off the same port.

use crate::error::PortError;
use crate::probe::ReadinessProbe;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

pub const MIN_PORT: u16 = 1025;
pub const MAX_PORT: u16 = 48000;

/// Candidates tried before giving up
const MAX_ATTEMPTS: u32 = 10;

pub struct PortAllocator {
    probe: Option<ReadinessProbe>,
    leased: Arc<Mutex<HashSet<u16>>>,
}

/// A port reserved for one worker; released on drop
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    leased: Arc<Mutex<HashSet<u16>>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.leased.lock().remove(&self.port);
    }
}

impl PortAllocator {
    /// With a probe, candidates that already have a listener are skipped.
    /// Without one, the first candidate not excluded or leased is used.
    pub fn new(probe: Option<ReadinessProbe>) -> Self {
        Self {
            probe,
            leased: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Number of ports currently leased
    pub fn leased(&self) -> usize {
        self.leased.lock().len()
    }

    /// Pick a port other than `excluded` (pass 0 to exclude nothing)
    pub async fn allocate(&self, excluded: u16) -> Result<PortLease, PortError> {
        for attempt in 1..=MAX_ATTEMPTS {
            let candidate = random_port(excluded);

            // Reserved before probing; a concurrent allocate must not pick it
            if !self.leased.lock().insert(candidate) {
                continue;
            }
            let lease = PortLease {
                port: candidate,
                leased: Arc::clone(&self.leased),
            };

            let Some(probe) = &self.probe else {
                return Ok(lease);
            };

            match probe.is_listening(candidate).await {
                Ok(listening) if !listening.listening => return Ok(lease),
                Ok(listening) => {
                    debug!(port = candidate, attempt, owner = ?listening.owner_pid, "Port in use, retrying");
                }
                Err(e) => {
                    debug!(port = candidate, attempt, error = %e, "Port check failed, retrying");
                }
            }
        }

        Err(PortError::PortExhausted {
            attempts: MAX_ATTEMPTS,
        })
    }
}

fn random_port(excluded: u16) -> u16 {
    let mut rng = rand::thread_rng();
    loop {
        let port = rng.gen_range(MIN_PORT..=MAX_PORT);
        if port != excluded {
            return port;
        }
    }
}
