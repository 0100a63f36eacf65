//! Miner configuration.
//!
//! Parses environment variables into the plain values the fleet and its
//! sessions are built from.

use std::env;
use std::time::Duration;

use crate::device::DEFAULT_MAX_POLL_INTERVAL;
use crate::rpc::{EndpointConfig, MAX_ENDPOINTS};

pub const DEFAULT_URL: &str = "http://127.0.0.1:8332";
pub const DEFAULT_GROUP_CAP: usize = 10;
const UNLIMITED_GROUP_CAP: usize = 127;
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },

    #[error("backup endpoint {0:?} is not of the form url,user,password")]
    Backup(String),

    #[error("too many endpoints: {0} (at most {MAX_ENDPOINTS})")]
    TooManyEndpoints(usize),
}

/// Miner configuration parsed from environment variables.
#[derive(Debug, Clone)]
pub struct MinerConfig {
    /// Primary endpoint first, then backups in order.
    pub endpoints: Vec<EndpointConfig>,

    /// Maximum number of devices served by one poll loop.
    pub group_cap: usize,

    /// Only drive the device with this serial number.
    pub serial: Option<String>,

    /// Fetch new work at least this often.
    pub max_poll_interval: Duration,

    /// Interval of the aggregate report.
    pub report_interval: Duration,
}

fn var(name: &'static str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_var<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match var(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var: name, value }),
    }
}

fn parse_backups(spec: &str) -> Result<Vec<EndpointConfig>, ConfigError> {
    spec.split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let parts: Vec<&str> = entry.splitn(3, ',').collect();
            match parts.as_slice() {
                [url, user, password] if !url.is_empty() => Ok(EndpointConfig {
                    url: url.to_string(),
                    user: user.to_string(),
                    password: password.to_string(),
                }),
                _ => Err(ConfigError::Backup(entry.to_string())),
            }
        })
        .collect()
}

impl MinerConfig {
    /// Parse configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `ZTEX_RPC_URL`: primary job-server URL (default: `http://127.0.0.1:8332`)
    /// - `ZTEX_RPC_USER`, `ZTEX_RPC_PASS`: primary credentials (required)
    /// - `ZTEX_RPC_BACKUPS`: `url,user,password` entries separated by `;`
    /// - `ZTEX_GROUP_CAP`: devices per poll loop (default: 10, values < 1 mean 127)
    /// - `ZTEX_SERIAL`: only drive the device with this serial number
    /// - `ZTEX_MAX_POLL_SECS`: maximum seconds between work fetches (default: 20)
    /// - `ZTEX_REPORT_SECS`: seconds between aggregate reports (default: 300)
    pub fn from_env() -> Result<Self, ConfigError> {
        let user = var("ZTEX_RPC_USER").ok_or(ConfigError::Missing("ZTEX_RPC_USER"))?;
        let password = var("ZTEX_RPC_PASS").ok_or(ConfigError::Missing("ZTEX_RPC_PASS"))?;
        let url = var("ZTEX_RPC_URL").unwrap_or_else(|| DEFAULT_URL.to_string());

        let mut endpoints = vec![EndpointConfig {
            url,
            user,
            password,
        }];
        if let Some(backups) = var("ZTEX_RPC_BACKUPS") {
            endpoints.extend(parse_backups(&backups)?);
        }
        if endpoints.len() > MAX_ENDPOINTS {
            return Err(ConfigError::TooManyEndpoints(endpoints.len()));
        }

        let group_cap = match parse_var::<i64>("ZTEX_GROUP_CAP")? {
            None => DEFAULT_GROUP_CAP,
            Some(n) if n < 1 => UNLIMITED_GROUP_CAP,
            Some(n) => n as usize,
        };

        let max_poll_interval = parse_var::<u64>("ZTEX_MAX_POLL_SECS")?
            .filter(|&s| s > 0)
            .map_or(DEFAULT_MAX_POLL_INTERVAL, Duration::from_secs);
        let report_interval = parse_var::<u64>("ZTEX_REPORT_SECS")?
            .filter(|&s| s > 0)
            .map_or(DEFAULT_REPORT_INTERVAL, Duration::from_secs);

        Ok(Self {
            endpoints,
            group_cap,
            serial: var("ZTEX_SERIAL"),
            max_poll_interval,
            report_interval,
        })
    }
}
