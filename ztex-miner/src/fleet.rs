//! Fleet supervision: discovery, grouping and reporting.
//!
//! The [`FleetManager`] runs on the supervisor thread. It scans the bus,
//! opens a [`DeviceSession`] for every new board and hands it to a
//! [`DeviceGroup`]. Groups are keyed by bus; once a bus group holds
//! `group_cap` devices the next one goes to a new numbered group on the
//! same bus (`001-0`, `001-1`, ...). Every group gets its own
//! [`PollScheduler`] thread.
//!
//! Between scans the supervisor drains the device log buffers every
//! [`FLUSH_INTERVAL`] and prints an aggregate report every
//! `report_interval`.

use std::collections::BTreeMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::MinerConfig;
use crate::device::{DeviceSession, ScanFlag, SessionConfig};
use crate::error::Result;
use crate::rpc::{ConnectionEffort, JobServer};
use crate::scheduler::{DeviceGroup, Member, PollScheduler};
use crate::tracing::prelude::*;
use crate::transport::{DeviceEnumerator, DeviceLocation, DiscoveredDevice};
use crate::types::HashRate;

/// Cadence of device log draining.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(300);

/// Requests from outside the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FleetCommand {
    /// Look for attached or reattached boards.
    Rescan,
}

/// Outcome of one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Boards seen on the bus that pass the serial filter.
    pub found: usize,
    /// Boards that got a new session.
    pub added: usize,
    /// Boards already driven; their frequency is re-applied.
    pub known: usize,
}

pub struct FleetManager {
    config: MinerConfig,
    enumerator: Box<dyn DeviceEnumerator>,
    server: Arc<dyn JobServer>,
    effort: ConnectionEffort,
    scan: ScanFlag,
    shutdown: CancellationToken,
    groups: Vec<Arc<DeviceGroup>>,
    members: BTreeMap<DeviceLocation, Arc<Member>>,
    threads: Vec<JoinHandle<()>>,
    last_report: Instant,
}

impl FleetManager {
    pub fn new(
        config: MinerConfig,
        enumerator: Box<dyn DeviceEnumerator>,
        server: Arc<dyn JobServer>,
        effort: ConnectionEffort,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            enumerator,
            server,
            effort,
            scan: ScanFlag::default(),
            shutdown,
            groups: Vec::new(),
            members: BTreeMap::new(),
            threads: Vec::new(),
            last_report: Instant::now(),
        }
    }

    pub fn groups(&self) -> &[Arc<DeviceGroup>] {
        &self.groups
    }

    pub fn group(&self, name: &str) -> Option<&Arc<DeviceGroup>> {
        self.groups.iter().find(|g| g.name() == name)
    }

    /// Tracked devices in bus order.
    pub fn members(&self) -> impl Iterator<Item = &Arc<Member>> {
        self.members.values()
    }

    pub fn scan_flag(&self) -> &ScanFlag {
        &self.scan
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            endpoints: self.config.endpoints.clone(),
            effort: self.effort.clone(),
            max_poll_interval: self.config.max_poll_interval,
            scan: self.scan.clone(),
        }
    }

    /// Scan the bus and start sessions for boards not yet driven.
    ///
    /// Group loops skip their sweeps while the scan runs.
    pub fn scan(&mut self, now: Instant) -> Result<ScanSummary> {
        self.scan.set(true);
        let result = self.scan_bus(now);
        self.scan.set(false);

        if let Ok(summary) = &result {
            self.log_summary(summary);
        }
        result
    }

    fn scan_bus(&mut self, now: Instant) -> Result<ScanSummary> {
        self.forget_disabled();

        let found: Vec<DiscoveredDevice> = self
            .enumerator
            .scan()?
            .into_iter()
            .filter(|d| match &self.config.serial {
                Some(serial) => d.serial.as_deref() == Some(serial.as_str()),
                None => true,
            })
            .collect();

        let mut summary = ScanSummary {
            found: found.len(),
            ..ScanSummary::default()
        };
        let session_config = self.session_config();
        for device in &found {
            if let Some(member) = self.members.get(&device.location) {
                member.request_reassert();
                summary.known += 1;
                continue;
            }
            match self.open(device, &session_config, now) {
                Ok(session) => {
                    self.assign(session);
                    summary.added += 1;
                }
                Err(e) => warn!(location = %device.location, error = %e, "Skipping device"),
            }
        }

        let fleet_size = self.members.len();
        let effort = self.effort.update(fleet_size.max(1), self.config.group_cap);
        debug!(devices = fleet_size, effort, "Connection effort updated");
        Ok(summary)
    }

    fn open(
        &self,
        device: &DiscoveredDevice,
        config: &SessionConfig,
        now: Instant,
    ) -> Result<DeviceSession> {
        let transport = self.enumerator.open(device)?;
        let mut session = DeviceSession::new(
            device.location,
            transport,
            Arc::clone(&self.server),
            config,
            now,
        );
        session.initialize(now)?;
        Ok(session)
    }

    /// Put a new session into the first group on its bus with room left,
    /// creating the group if needed.
    fn assign(&mut self, session: DeviceSession) {
        let location = session.location();
        let bus = location.bus_name();
        let group = (0..)
            .map(|j| format!("{}-{}", bus, j))
            .find_map(|name| match self.group(&name) {
                Some(g) if g.active_len() >= self.config.group_cap => None,
                Some(g) => Some(Arc::clone(g)),
                None => {
                    let g = DeviceGroup::new(name);
                    self.groups.push(Arc::clone(&g));
                    Some(g)
                }
            });
        let Some(group) = group else {
            return;
        };

        let member = Member::new(session, group.name());
        self.members.insert(location, Arc::clone(&member));
        if group.add(member) {
            self.start(group);
        }
    }

    fn start(&mut self, group: Arc<DeviceGroup>) {
        let name = group.name().to_string();
        let scheduler = PollScheduler::new(group, self.scan.clone(), self.shutdown.clone());
        match scheduler.spawn() {
            Ok(handle) => self.threads.push(handle),
            Err(e) => error!(group = %name, error = %e, "Failed to start poll loop"),
        }
        self.threads.retain(|h| !h.is_finished());
    }

    fn log_summary(&self, summary: &ScanSummary) {
        if summary.found == 0 {
            warn!("No devices found");
        }
        for group in &self.groups {
            let n = group.active_len();
            if n > 0 {
                info!("Bus {}: {} devices", group.name(), n);
            }
        }
        info!(
            added = summary.added,
            known = summary.known,
            "Total: {} devices",
            self.members.len()
        );
    }

    /// Drop disabled devices so that a later scan treats them as new.
    fn forget_disabled(&mut self) {
        self.members.retain(|_, m| {
            if m.is_disabled() {
                m.log().flush(m.name());
                false
            } else {
                true
            }
        });
    }

    /// Emit buffered device log lines.
    pub fn flush_logs(&self) {
        for member in self.members.values() {
            member.log().flush(member.name());
        }
    }

    /// Print the aggregate report and forget disabled devices.
    pub fn report(&mut self, now: Instant) -> HashRate {
        self.flush_logs();

        let mut rates = Vec::with_capacity(self.members.len());
        let mut overflows = 0;
        for group in &self.groups {
            let members: Vec<_> = self
                .members
                .values()
                .filter(|m| m.group() == group.name())
                .collect();
            if members.is_empty() {
                continue;
            }

            let mut lines = Vec::with_capacity(members.len());
            let (mut getwork_ms, mut submit_ms) = (0.0, 0.0);
            for member in &members {
                let mut session = member.session();
                let latency = session.latency();
                getwork_ms += latency.getwork_ms;
                submit_ms += latency.submit_ms;
                overflows += session.take_overflows();
                rates.push(session.hash_rate(now));
                lines.push((member.name(), session.status_line(now)));
            }

            let n = members.len() as f64;
            let telemetry = group.telemetry();
            info!(
                group = %group.name(),
                "poll loop time: {:.0}ms (USB: {:.0}ms network: {:.0}ms)   getwork time: {:.0}ms  submit time: {:.0}ms",
                telemetry.total_ms(),
                telemetry.usb_ms(),
                telemetry.network_ms(),
                getwork_ms / n,
                submit_ms / n,
            );
            for (name, line) in lines {
                info!(device = %name, "{}", line);
            }
        }

        if overflows > 0 {
            warn!(
                "{} overflows occurred. This is usually caused by a slow network connection.",
                overflows
            );
        }
        let total: HashRate = rates.into_iter().sum();
        info!("Total submitted hash rate: {:.1}MH/s", total.as_megahashes());

        self.forget_disabled();
        self.last_report = now;
        total
    }

    /// Supervise the fleet until shutdown.
    pub fn run(mut self, commands: Receiver<FleetCommand>) -> Result<()> {
        self.scan(Instant::now())?;

        while !self.shutdown.is_cancelled() {
            match commands.recv_timeout(FLUSH_INTERVAL) {
                Ok(FleetCommand::Rescan) => {
                    info!("Rescanning");
                    if let Err(e) = self.scan(Instant::now()) {
                        error!(error = %e, "Scan failed");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => thread::sleep(FLUSH_INTERVAL),
            }

            self.flush_logs();
            let now = Instant::now();
            if now.saturating_duration_since(self.last_report) >= self.config.report_interval {
                self.report(now);
            }
        }

        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("Poll loop panicked");
            }
        }
        self.flush_logs();
        Ok(())
    }
}
