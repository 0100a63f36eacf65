//! Endpoint failover.
//!
//! Each session owns a pool over the configured endpoints and always uses
//! the first one that is not cooling down. Transport errors are counted and
//! disable an endpoint once they reach a threshold; a malformed reply
//! disables it straight away.

use std::time::{Duration, Instant};

use super::{ConnectionEffort, EndpointConfig};

/// Cool-down after repeated transport errors, single endpoint.
pub const SINGLE_COOL_DOWN: Duration = Duration::from_secs(60);

/// Cool-down after repeated transport errors, backups configured.
pub const BACKUP_COOL_DOWN: Duration = Duration::from_secs(30);

/// Cool-down after a malformed reply.
pub const PROTOCOL_COOL_DOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct Endpoint {
    config: EndpointConfig,
    disabled_until: Option<Instant>,
    errors: u32,
}

impl Endpoint {
    fn usable(&self, now: Instant) -> bool {
        self.disabled_until.map_or(true, |until| now >= until)
    }
}

#[derive(Debug, Clone)]
pub struct RpcEndpointPool {
    endpoints: Vec<Endpoint>,
    effort: ConnectionEffort,
}

impl RpcEndpointPool {
    pub fn new(configs: Vec<EndpointConfig>, effort: ConnectionEffort) -> Self {
        Self {
            endpoints: configs
                .into_iter()
                .map(|config| Endpoint {
                    config,
                    disabled_until: None,
                    errors: 0,
                })
                .collect(),
            effort,
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn config(&self, idx: usize) -> &EndpointConfig {
        &self.endpoints[idx].config
    }

    pub fn errors(&self, idx: usize) -> u32 {
        self.endpoints[idx].errors
    }

    /// First endpoint not cooling down.
    pub fn select(&self, now: Instant) -> Option<usize> {
        self.endpoints.iter().position(|e| e.usable(now))
    }

    pub fn is_usable(&self, idx: usize, now: Instant) -> bool {
        self.endpoints.get(idx).is_some_and(|e| e.usable(now))
    }

    /// Consecutive transport errors that disable an endpoint.
    pub fn error_threshold(&self) -> u32 {
        let base = if self.endpoints.len() > 1 { 2.0 } else { 4.0 };
        ((base * self.effort.get()).round() as u32).max(1)
    }

    fn transport_cool_down(&self) -> Duration {
        if self.endpoints.len() > 1 {
            BACKUP_COOL_DOWN
        } else {
            SINGLE_COOL_DOWN
        }
    }

    pub fn report_success(&mut self, idx: usize) {
        if let Some(e) = self.endpoints.get_mut(idx) {
            e.errors = 0;
        }
    }

    /// Count a transport error. Returns the cool-down if this error disabled
    /// the endpoint.
    pub fn report_transport_error(&mut self, idx: usize, now: Instant) -> Option<Duration> {
        let threshold = self.error_threshold();
        let cool_down = self.transport_cool_down();
        let e = self.endpoints.get_mut(idx)?;
        e.errors += 1;
        if e.errors >= threshold {
            e.errors = 0;
            e.disabled_until = Some(now + cool_down);
            Some(cool_down)
        } else {
            None
        }
    }

    /// Disable the endpoint for the fixed protocol cool-down.
    pub fn report_protocol_error(&mut self, idx: usize, now: Instant) -> Duration {
        if let Some(e) = self.endpoints.get_mut(idx) {
            e.errors = 0;
            e.disabled_until = Some(now + PROTOCOL_COOL_DOWN);
        }
        PROTOCOL_COOL_DOWN
    }
}
