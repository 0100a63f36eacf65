//! Group poll loops.
//!
//! Devices are partitioned into groups, one OS thread per group. A group's
//! loop sweeps its devices in turn: each device gets one [`cycle`] (fetch
//! or poll, then frequency update) before the loop moves on, so device I/O
//! within a group is serialized and bounded. Groups run in parallel with
//! each other, which in practice means one or more threads per USB bus.
//!
//! The member list is locked only to take a snapshot at the top of a sweep.
//! Disabled devices are dropped at that point; when nothing is left the
//! loop exits and the group is marked idle so the fleet can restart it if
//! devices are added later.
//!
//! [`cycle`]: crate::device::DeviceSession::cycle

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::device::{DeviceLog, DeviceSession, ScanFlag, SessionState};
use crate::error::FailureClass;
use crate::tracing::prelude::*;
use crate::transport::DeviceLocation;
use crate::types::DecayingAverage;

/// Minimum time between the starts of two sweeps.
pub const MIN_INTERVAL: Duration = Duration::from_millis(250);

/// Remaining sleep below this is skipped.
const MIN_SLEEP: Duration = Duration::from_millis(5);

const TELEMETRY_DECAY: f64 = 0.9998;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A device as seen by its group and by the fleet.
#[derive(Debug)]
pub struct Member {
    location: DeviceLocation,
    name: String,
    group: String,
    session: Mutex<DeviceSession>,
    log: Arc<DeviceLog>,
    reassert: AtomicBool,
    disabled: AtomicBool,
}

impl Member {
    pub fn new(session: DeviceSession, group: &str) -> Arc<Self> {
        Arc::new(Self {
            location: session.location(),
            name: format!("{}-{}", group, session.name()),
            group: group.to_string(),
            log: session.log(),
            disabled: AtomicBool::new(session.state() == SessionState::Disabled),
            session: Mutex::new(session),
            reassert: AtomicBool::new(false),
        })
    }

    pub fn location(&self) -> DeviceLocation {
        self.location
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn log(&self) -> &DeviceLog {
        &self.log
    }

    /// Lock the session. Blocks while the group thread is servicing it.
    pub fn session(&self) -> MutexGuard<'_, DeviceSession> {
        lock(&self.session)
    }

    /// Ask the group thread to re-apply the current frequency.
    pub fn request_reassert(&self) {
        self.reassert.store(true, Ordering::SeqCst);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    /// Run one cycle on this device. Returns the time spent in device
    /// transfers.
    fn service(&self, now: Instant) -> Duration {
        let mut session = self.session();
        if self.reassert.swap(false, Ordering::SeqCst) {
            if let Err(e) = session.reassert_frequency(now) {
                session.handle_failure(&e, now);
            }
        }
        if session.state() != SessionState::Disabled {
            if let Err(e) = session.cycle(now) {
                let class = session.handle_failure(&e, now);
                if class == FailureClass::Fatal {
                    debug!(device = %self.name, error = %e, "Device failed");
                }
            }
        }
        if session.state() == SessionState::Disabled {
            self.disabled.store(true, Ordering::SeqCst);
        }
        session.take_usb_time()
    }
}

/// Exponentially weighted sweep timing.
#[derive(Debug, Clone, Copy)]
pub struct LoopTelemetry {
    usb: DecayingAverage,
    network: DecayingAverage,
}

impl Default for LoopTelemetry {
    fn default() -> Self {
        Self {
            usb: DecayingAverage::new(TELEMETRY_DECAY),
            network: DecayingAverage::new(TELEMETRY_DECAY),
        }
    }
}

impl LoopTelemetry {
    /// Fold in one sweep: total wall time and the part spent in USB
    /// transfers. The rest is attributed to the network.
    pub fn record(&mut self, wall: Duration, usb: Duration) {
        let usb = usb.min(wall);
        self.usb.record(usb.as_secs_f64() * 1000.0);
        self.network.record((wall - usb).as_secs_f64() * 1000.0);
    }

    pub fn usb_ms(&self) -> f64 {
        self.usb.value()
    }

    pub fn network_ms(&self) -> f64 {
        self.network.value()
    }

    pub fn total_ms(&self) -> f64 {
        self.usb_ms() + self.network_ms()
    }
}

#[derive(Debug, Default)]
struct Live {
    members: Vec<Arc<Member>>,
    running: bool,
}

/// Devices served by one poll loop.
#[derive(Debug)]
pub struct DeviceGroup {
    name: String,
    live: Mutex<Live>,
    telemetry: Mutex<LoopTelemetry>,
}

impl DeviceGroup {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            live: Mutex::new(Live::default()),
            telemetry: Mutex::new(LoopTelemetry::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        lock(&self.live).members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Devices not yet disabled. Disabled ones still count in [`len`] until
    /// the next sweep removes them.
    ///
    /// [`len`]: Self::len
    pub fn active_len(&self) -> usize {
        lock(&self.live)
            .members
            .iter()
            .filter(|m| !m.is_disabled())
            .count()
    }

    pub fn members(&self) -> Vec<Arc<Member>> {
        lock(&self.live).members.clone()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.live).running
    }

    pub fn telemetry(&self) -> LoopTelemetry {
        *lock(&self.telemetry)
    }

    /// Add a device. Returns `true` if the group has no live loop and one
    /// must be started; the group counts as running from here on.
    pub fn add(&self, member: Arc<Member>) -> bool {
        let mut live = lock(&self.live);
        live.members.push(member);
        !std::mem::replace(&mut live.running, true)
    }

    /// Drop disabled devices and snapshot the rest. An empty group stops
    /// running.
    fn take_live(&self) -> Option<Vec<Arc<Member>>> {
        let mut live = lock(&self.live);
        live.members.retain(|m| {
            let keep = !m.is_disabled();
            if !keep {
                debug!(group = %self.name, device = %m.name(), "Removing disabled device");
            }
            keep
        });
        if live.members.is_empty() {
            live.running = false;
            None
        } else {
            Some(live.members.clone())
        }
    }

    fn record(&self, wall: Duration, usb: Duration) {
        lock(&self.telemetry).record(wall, usb);
    }
}

/// Poll loop of one group.
pub struct PollScheduler {
    group: Arc<DeviceGroup>,
    scan: ScanFlag,
    shutdown: CancellationToken,
}

impl PollScheduler {
    pub fn new(group: Arc<DeviceGroup>, scan: ScanFlag, shutdown: CancellationToken) -> Self {
        Self {
            group,
            scan,
            shutdown,
        }
    }

    /// Service every live device once. Returns `false` once the group has
    /// no devices left.
    pub fn sweep(&self, now: Instant) -> bool {
        let Some(members) = self.group.take_live() else {
            return false;
        };
        let started = Instant::now();
        // Advance the clock per device so deadlines set late in a slow sweep
        // are not already stale.
        let usb: Duration = members
            .iter()
            .map(|m| m.service(now + started.elapsed()))
            .sum();
        self.group.record(started.elapsed(), usb);
        true
    }

    /// Loop until the group is empty or shutdown is requested.
    pub fn run(self) {
        debug!(group = %self.group.name(), "Poll loop started");
        while !self.shutdown.is_cancelled() {
            let t0 = Instant::now();
            if !self.scan.is_active() && !self.sweep(t0) {
                break;
            }
            if let Some(rest) = MIN_INTERVAL.checked_sub(t0.elapsed()) {
                if rest > MIN_SLEEP {
                    thread::sleep(rest);
                }
            }
        }
        debug!(group = %self.group.name(), "Poll loop finished");
    }

    /// Run on a dedicated thread.
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("group-{}", self.group.name()))
            .spawn(move || self.run())
    }
}
