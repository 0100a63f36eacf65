//! Miner sessions: one per FPGA board.
//!
//! A [`DeviceSession`] owns an opened board and everything that belongs to
//! it: the active work item, the nonce slots, the frequency statistics, its
//! endpoint pool and its log buffer. Group threads drive sessions through
//! [`DeviceSession::cycle`]; nothing in a session is shared with another
//! session except the job-server client and the connection effort factor.
//!
//! ## Lifecycle
//!
//! ```text
//! Configuring --initialize--> Idle --first work sent--> Running
//!      |                        |                          |
//!      +------------------------+--- fatal error ---> Disabled
//! ```
//!
//! `Disabled` is terminal. The owning group drops the session on its next
//! sweep; a later rescan starts a fresh session for the same board.

pub mod descriptor;
pub mod log;
pub mod nonces;
pub mod stats;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use time::OffsetDateTime;

use crate::codec::WorkItem;
use crate::error::{Error, FailureClass, Result};
use crate::rpc::messages::{self, GETWORK};
use crate::rpc::{ConnectionEffort, EndpointConfig, JobServer, RpcEndpointPool, RpcError};
use crate::transport::{DeviceLocation, DeviceTransport};
use crate::types::{DecayingAverage, HashRate};

pub use self::descriptor::DeviceDescriptor;
pub use self::log::DeviceLog;
use self::nonces::{NonceSlot, RecentSubmissions, REQ_READ_NONCES, SLOT_LEN};
use self::stats::FrequencyStatistics;

pub const REQ_SEND_WORK: u8 = 0x80;
pub const REQ_SET_FREQUENCY: u8 = 0x83;

/// Device errors are ignored this long after new work is sent.
pub const SEND_WORK_GRACE: Duration = Duration::from_millis(500);

/// Device errors are ignored this long after a frequency change.
pub const FREQUENCY_GRACE: Duration = Duration::from_secs(2);

pub const DEFAULT_MAX_POLL_INTERVAL: Duration = Duration::from_secs(20);

const LATENCY_DECAY: f64 = 0.99;

/// Expected hashes per golden nonce (32 leading zero bits).
const HASHES_PER_SUBMISSION: f64 = 4_294_967_296.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Configuring,
    Idle,
    Running,
    Disabled,
}

/// Set while a bus scan is running. Overflows seen meanwhile are not
/// counted, since groups stop polling during the scan.
#[derive(Debug, Clone, Default)]
pub struct ScanFlag(Arc<AtomicBool>);

impl ScanFlag {
    pub fn set(&self, active: bool) {
        self.0.store(active, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Plain values a session is built from.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub endpoints: Vec<EndpointConfig>,
    pub effort: ConnectionEffort,
    pub max_poll_interval: Duration,
    pub scan: ScanFlag,
}

impl SessionConfig {
    pub fn new(endpoints: Vec<EndpointConfig>, effort: ConnectionEffort) -> Self {
        Self {
            endpoints,
            effort,
            max_poll_interval: DEFAULT_MAX_POLL_INTERVAL,
            scan: ScanFlag::default(),
        }
    }
}

/// Round-trip telemetry for the group report.
#[derive(Debug, Clone, Copy, Default)]
pub struct Latency {
    /// Mean getwork round trip in milliseconds.
    pub getwork_ms: f64,
    /// Mean submission round trip in milliseconds.
    pub submit_ms: f64,
}

pub struct DeviceSession {
    location: DeviceLocation,
    transport: Box<dyn DeviceTransport>,
    server: Arc<dyn JobServer>,
    pool: RpcEndpointPool,
    log: Arc<DeviceLog>,
    scan: ScanFlag,
    max_poll_interval: Duration,

    state: SessionState,
    descriptor: DeviceDescriptor,
    step: u8,
    stats: FrequencyStatistics,
    slots: Vec<NonceSlot>,
    recent: RecentSubmissions,
    work: Option<WorkItem>,
    /// Endpoint the active work came from.
    work_endpoint: usize,
    /// Endpoint used by the most recent network call, blamed on failure.
    call_endpoint: usize,
    last_fetch: Option<Instant>,
    ignore_errors_until: Option<Instant>,

    started: Instant,
    submitted_total: u64,
    submitted_since_report: u64,
    overflows: u64,
    usb_time: Duration,
    getwork_time: DecayingAverage,
    submit_time: DecayingAverage,
    fatal: Option<String>,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("location", &self.location)
            .field("name", &self.name())
            .field("state", &self.state)
            .field("step", &self.step)
            .finish_non_exhaustive()
    }
}

impl DeviceSession {
    pub fn new(
        location: DeviceLocation,
        transport: Box<dyn DeviceTransport>,
        server: Arc<dyn JobServer>,
        config: &SessionConfig,
        now: Instant,
    ) -> Self {
        Self {
            location,
            transport,
            server,
            pool: RpcEndpointPool::new(config.endpoints.clone(), config.effort.clone()),
            log: Arc::new(DeviceLog::default()),
            scan: config.scan.clone(),
            max_poll_interval: config.max_poll_interval,
            state: SessionState::Configuring,
            descriptor: DeviceDescriptor::default(),
            step: 0,
            stats: FrequencyStatistics::new(),
            slots: Vec::new(),
            recent: RecentSubmissions::default(),
            work: None,
            work_endpoint: 0,
            call_endpoint: 0,
            last_fetch: None,
            ignore_errors_until: None,
            started: now,
            submitted_total: 0,
            submitted_since_report: 0,
            overflows: 0,
            usb_time: Duration::ZERO,
            getwork_time: DecayingAverage::new(LATENCY_DECAY),
            submit_time: DecayingAverage::new(LATENCY_DECAY),
            fatal: None,
        }
    }

    pub fn location(&self) -> DeviceLocation {
        self.location
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> String {
        self.descriptor.name()
    }

    pub fn log(&self) -> Arc<DeviceLog> {
        Arc::clone(&self.log)
    }

    pub fn frequency_step(&self) -> u8 {
        self.step
    }

    pub fn statistics(&self) -> &FrequencyStatistics {
        &self.stats
    }

    pub fn slots(&self) -> &[NonceSlot] {
        &self.slots
    }

    pub fn work(&self) -> Option<&WorkItem> {
        self.work.as_ref()
    }

    pub fn pool(&self) -> &RpcEndpointPool {
        &self.pool
    }

    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    pub fn submitted_total(&self) -> u64 {
        self.submitted_total
    }

    pub fn fatal_error(&self) -> Option<&str> {
        self.fatal.as_deref()
    }

    pub fn latency(&self) -> Latency {
        Latency {
            getwork_ms: self.getwork_time.value(),
            submit_ms: self.submit_time.value(),
        }
    }

    /// Time spent in device transfers since the last call.
    pub fn take_usb_time(&mut self) -> Duration {
        std::mem::take(&mut self.usb_time)
    }

    pub fn take_overflows(&mut self) -> u64 {
        std::mem::take(&mut self.overflows)
    }

    fn is_active(&self) -> bool {
        matches!(self.state, SessionState::Idle | SessionState::Running)
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            SessionState::Idle | SessionState::Running => Ok(()),
            SessionState::Configuring => Err(Error::Other("Device not initialized".into())),
            SessionState::Disabled => Err(Error::Other("Device disabled".into())),
        }
    }

    fn in_grace_window(&self, now: Instant) -> bool {
        self.ignore_errors_until.is_some_and(|until| now < until)
    }

    fn vendor_request(&mut self, request: u8, value: u16, len: usize) -> Result<Vec<u8>> {
        let t = Instant::now();
        let result = self.transport.vendor_request(request, value, 0, len);
        self.usb_time += t.elapsed();
        Ok(result?)
    }

    fn vendor_command(&mut self, request: u8, value: u16, data: &[u8]) -> Result<()> {
        let t = Instant::now();
        let result = self.transport.vendor_command(request, value, 0, data);
        self.usb_time += t.elapsed();
        Ok(result?)
    }

    /// Read the descriptors, size the slot arrays and apply the default
    /// frequency.
    pub fn initialize(&mut self, now: Instant) -> Result<()> {
        self.state = SessionState::Configuring;

        let identity = self.vendor_request(descriptor::REQ_IDENTITY, 0, descriptor::IDENTITY_LEN)?;
        let serial = descriptor::parse_identity(&identity)?;
        let raw = self.vendor_request(descriptor::REQ_DESCRIPTOR, 0, descriptor::DESCRIPTOR_LEN)?;
        self.descriptor = DeviceDescriptor::parse(&raw, serial)?;

        self.slots = vec![NonceSlot::default(); self.descriptor.slots];
        self.stats = FrequencyStatistics::new();
        self.recent = RecentSubmissions::default();
        self.work = None;
        self.last_fetch = None;
        self.step = self.descriptor.default_step;
        self.set_frequency(self.step, now)?;

        self.state = SessionState::Idle;
        self.log
            .info(format!("New device: {}", self.descriptor.info()));
        Ok(())
    }

    fn set_frequency(&mut self, step: u8, now: Instant) -> Result<()> {
        let step = step.min(self.descriptor.max_step);
        self.vendor_command(REQ_SET_FREQUENCY, step as u16, &[])?;
        self.ignore_errors_until = Some(now + FREQUENCY_GRACE);
        Ok(())
    }

    /// Apply the current frequency step again, e.g. after a rescan found
    /// the board still attached.
    pub fn reassert_frequency(&mut self, now: Instant) -> Result<()> {
        self.ensure_active()?;
        self.set_frequency(self.step, now)
    }

    /// Whether new work should be fetched now.
    pub fn check_update(&self, now: Instant) -> bool {
        if !self.is_active() || self.in_grace_window(now) {
            return false;
        }
        if !self.pool.is_usable(self.work_endpoint, now) {
            return true;
        }
        let stale = self
            .last_fetch
            .map_or(true, |t| now.saturating_duration_since(t) >= self.max_poll_interval);
        stale || self.slots.iter().any(NonceSlot::needs_work)
    }

    /// Fetch work from the first usable endpoint and start the board on it.
    ///
    /// Golden nonces still pending for the old work are drained and
    /// submitted before it is replaced. Returns `false` when every endpoint
    /// is cooling down.
    pub fn fetch_work(&mut self, now: Instant) -> Result<bool> {
        self.ensure_active()?;
        let Some(idx) = self.pool.select(now) else {
            return Ok(false);
        };

        self.call_endpoint = idx;
        let t = Instant::now();
        let reply = self.server.call(self.pool.config(idx), GETWORK, &[])?;
        let elapsed = t.elapsed();
        self.getwork_time.record(elapsed.as_secs_f64() * 1000.0);
        self.pool.report_success(idx);

        // Deadlines set from here on must not include the request time
        let now = now + elapsed;

        // At most one pass per slot
        for _ in 0..self.slots.len() {
            if !self.poll_nonces(now)? {
                break;
            }
        }

        self.call_endpoint = idx;
        let work = messages::parse_work(&reply.body)?;
        self.work = Some(work);
        self.last_fetch = Some(now);
        self.work_endpoint = idx;
        self.log.debug("Got new work");
        self.send_work(now)?;
        Ok(true)
    }

    fn send_work(&mut self, now: Instant) -> Result<()> {
        let payload = match &self.work {
            Some(work) => work.device_payload(),
            None => return Ok(()),
        };
        self.vendor_command(REQ_SEND_WORK, 0, &payload)?;
        self.ignore_errors_until = Some(now + SEND_WORK_GRACE);
        self.slots.iter_mut().for_each(|s| s.counter = 0);
        self.state = SessionState::Running;
        Ok(())
    }

    /// Read the nonce slots, update the error statistics and submit new
    /// golden nonces. Returns whether anything was submitted.
    pub fn poll_nonces(&mut self, now: Instant) -> Result<bool> {
        if self.state != SessionState::Running || !self.pool.is_usable(self.work_endpoint, now) {
            return Ok(false);
        }
        let Some(work) = self.work.clone() else {
            return Ok(false);
        };
        self.call_endpoint = self.work_endpoint;

        let n = self.slots.len();
        let buf = self.vendor_request(REQ_READ_NONCES, 0, n * SLOT_LEN)?;
        let (overflow, moved) = nonces::update_slots(&buf, self.descriptor.nonce_offset, &mut self.slots);
        if overflow && !self.scan.is_active() {
            self.overflows += 1;
        }

        if !self.in_grace_window(now) && moved.iter().any(|&m| m) {
            let errors = self
                .slots
                .iter()
                .zip(&moved)
                .filter(|(slot, moved)| **moved && !work.check_nonce(slot.counter, slot.witness))
                .count();
            self.stats.record(self.step, errors, n);
        }

        let mut submitted = false;
        for i in 0..n {
            let slot = self.slots[i];
            if slot.golden_empty || self.recent.contains(slot.golden) || !work.is_golden(slot.golden) {
                continue;
            }
            match self.submit_work(&work, slot.golden) {
                Ok(()) => submitted = true,
                Err(e) => {
                    self.log
                        .warn(format!("Error attempting to submit new nonce: {}", e));
                    if matches!(e, RpcError::Transport(_)) {
                        self.note_transport_error(&e.to_string(), now);
                    }
                }
            }
        }
        Ok(submitted)
    }

    /// Submit one nonce for `work` to the endpoint the work came from.
    pub fn submit_work(&mut self, work: &WorkItem, nonce: u32) -> std::result::Result<(), RpcError> {
        self.log.debug(format!("Submitting new nonce {:08x}", nonce));
        let t = Instant::now();
        let params = [work.submission_hex(nonce)];
        let endpoint = self.pool.config(self.work_endpoint).clone();
        let reply = self.server.call(&endpoint, GETWORK, &params)?;
        self.pool.report_success(self.work_endpoint);

        if let Some(err) = messages::parse_submit(&reply.body).error {
            self.log
                .warn(format!("Error attempting to submit new nonce: {}", err));
        }
        if let Some(reason) = reply.reject_reason {
            self.log.warn(format!("Nonce {:08x} rejected: {}", nonce, reason));
        }

        self.recent.push(nonce);
        self.submitted_total += 1;
        self.submitted_since_report += 1;
        self.submit_time.record(t.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }

    /// Move to the step with the best expected throughput.
    pub fn update_frequency(&mut self, now: Instant) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }
        let best = self.stats.best_step(
            self.step,
            self.descriptor.default_step,
            self.descriptor.max_step,
        );
        if best != self.step {
            self.step = best;
            self.log.info(format!(
                "Set frequency to {:.2}MHz",
                self.descriptor.frequency_mhz(best)
            ));
            self.set_frequency(best, now)?;
        }
        Ok(())
    }

    /// One scheduler pass over this device.
    pub fn cycle(&mut self, now: Instant) -> Result<()> {
        let t = Instant::now();
        if !(self.check_update(now) && self.fetch_work(now)?) {
            self.poll_nonces(now)?;
        }
        self.update_frequency(now + t.elapsed())
    }

    fn note_transport_error(&mut self, msg: &str, now: Instant) {
        let idx = self.call_endpoint;
        if let Some(cool_down) = self.pool.report_transport_error(idx, now) {
            self.log.error(format!(
                "Error: {}: Disabling URL {} for {}s",
                msg,
                self.pool.config(idx).url,
                cool_down.as_secs()
            ));
        } else {
            self.log.debug(format!("Error: {}", msg));
        }
    }

    /// Classify a failed operation and take the matching action.
    pub fn handle_failure(&mut self, err: &Error, now: Instant) -> FailureClass {
        let class = err.class();
        match class {
            FailureClass::Transport => self.note_transport_error(&err.to_string(), now),
            FailureClass::Protocol => {
                let idx = self.call_endpoint;
                let cool_down = self.pool.report_protocol_error(idx, now);
                self.log.error(format!(
                    "Error: {}: Disabling URL {} for {}s",
                    err,
                    self.pool.config(idx).url,
                    cool_down.as_secs()
                ));
            }
            FailureClass::Fatal => self.disable(&err.to_string()),
        }
        class
    }

    /// Stop driving this board for good.
    pub fn disable(&mut self, msg: &str) {
        let since = OffsetDateTime::now_local()
            .unwrap_or_else(|_| OffsetDateTime::now_utc())
            .format(time::macros::format_description!(
                "[year]-[month]-[day] [hour]:[minute]:[second]"
            ))
            .unwrap_or_default();
        self.log.error(format!("Error: {}: Disabling device", msg));
        self.fatal = Some(format!("Error: {}: Device disabled since {}", msg, since));
        self.state = SessionState::Disabled;
    }

    /// Hash rate implied by the submitted golden nonces.
    pub fn hash_rate(&self, now: Instant) -> HashRate {
        if self.state == SessionState::Disabled {
            return HashRate(0);
        }
        let elapsed = now.saturating_duration_since(self.started).as_secs_f64();
        if elapsed <= 0.0 {
            return HashRate(0);
        }
        HashRate((HASHES_PER_SUBMISSION * self.submitted_total as f64 / elapsed) as u64)
    }

    /// Status line for the periodic report. Resets the per-report
    /// submission count.
    pub fn status_line(&mut self, now: Instant) -> String {
        if let Some(fatal) = &self.fatal {
            return fatal.clone();
        }
        let step = self.step;
        let mut line = format!("f={:.2}MHz", self.descriptor.frequency_mhz(step));
        if self.stats.weight(step) > 20.0 {
            line.push_str(&format!(",  errorRate={:.2}%", self.stats.error_rate(step) * 100.0));
        }
        if self.stats.weight(step) > 100.1 || self.stats.max_error_rate(step) > 0.001 {
            line.push_str(&format!(
                ",  maxErrorRate={:.2}%",
                self.stats.max_error_rate(step) * 100.0
            ));
        }
        if let Some(next) = step.checked_add(1) {
            if self.stats.weight(next) > 100.1 || self.stats.max_error_rate(next) > 0.001 {
                line.push_str(&format!(
                    ",  nextMaxErrorRate={:.2}%",
                    self.stats.max_error_rate(next) * 100.0
                ));
            }
        }
        line.push_str(&format!(
            ",  submitted {} new nonces,  submitted hash rate {:.1}MH/s",
            self.submitted_since_report,
            self.hash_rate(now).as_megahashes()
        ));
        self.submitted_since_report = 0;
        line
    }
}
