//! Job-server access: getwork over JSON-RPC with endpoint failover.
//!
//! - [`client`]: the [`JobServer`] seam and its reqwest implementation
//! - [`messages`]: request envelope and reply parsing
//! - [`pool`]: per-session endpoint selection and cool-downs

pub mod client;
pub mod messages;
pub mod pool;

#[cfg(test)]
pub mod mock;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use client::{HttpJobServer, JobServer, RpcReply};
pub use pool::RpcEndpointPool;

/// Upper bound on primary plus backup endpoints.
pub const MAX_ENDPOINTS: usize = 32;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RpcError {
    /// Connection, timeout or body-decoding failure.
    #[error("{0}")]
    Transport(String),

    /// The server answered with something that is not a usable reply.
    #[error("{0}")]
    Protocol(String),
}

/// A job-server URL with its credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub url: String,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("url", &self.url)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

const BASE_TIMEOUT_MS: f64 = 2000.0;

/// Fleet-size scaling of network patience.
///
/// Shared by every session and the HTTP client. Larger fleets on one network
/// see more contention, so timeouts and error thresholds are widened by this
/// factor. Stored as `f64` bits in an atomic so the supervisor can update it
/// while group threads read it.
#[derive(Debug, Clone)]
pub struct ConnectionEffort(Arc<AtomicU64>);

impl Default for ConnectionEffort {
    fn default() -> Self {
        Self::new(2.0)
    }
}

impl ConnectionEffort {
    pub fn new(value: f64) -> Self {
        Self(Arc::new(AtomicU64::new(value.to_bits())))
    }

    /// `1 + exp((1 - sqrt(min(cap, n) * n)) / 13)`
    pub fn for_fleet(fleet_size: usize, group_cap: usize) -> f64 {
        let n = fleet_size as f64;
        let per_thread = fleet_size.min(group_cap) as f64;
        1.0 + ((1.0 - (per_thread * n).sqrt()) / 13.0).exp()
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Recompute from the current fleet size and return the new value.
    pub fn update(&self, fleet_size: usize, group_cap: usize) -> f64 {
        let value = Self::for_fleet(fleet_size, group_cap);
        self.set(value);
        value
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis((BASE_TIMEOUT_MS * self.get()).round() as u64)
    }
}
