//! Scripted FPGA and bus for tests.
//!
//! The mock answers the miner firmware's vendor requests. Its cores count
//! through nonces at a fixed pace per poll and report witness words computed
//! with the real hasher, so sessions see the same data a healthy board would
//! produce. Tests inject golden nonces, bad witnesses and disconnects.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{
    DeviceEnumerator, DeviceLocation, DeviceTransport, DiscoveredDevice, TransportError,
};
use crate::codec::{top_word, WorkItem, WITNESS_BIAS};
use crate::device::descriptor::{build, REQ_DESCRIPTOR, REQ_IDENTITY};
use crate::device::nonces::{REQ_READ_NONCES, SLOT_LEN};
use crate::device::{REQ_SEND_WORK, REQ_SET_FREQUENCY};

#[derive(Debug)]
struct Fpga {
    identity: Vec<u8>,
    descriptor: Vec<u8>,
    offset: i32,
    known_work: Vec<WorkItem>,
    work: Option<WorkItem>,
    counters: Vec<u32>,
    golden: Vec<Option<u32>>,
    bad_witness: bool,
    disconnected: bool,
    frequency_history: Vec<u16>,
    work_sent: usize,
    polls: usize,
}

/// Handle to a simulated board. Clones share state.
#[derive(Debug, Clone)]
pub struct MockDevice {
    fpga: Arc<Mutex<Fpga>>,
}

impl MockDevice {
    pub const DEFAULT_ADVANCE: u32 = 0x0100_0000;

    /// A board with `slots` cores, 4 MHz steps and the given default and
    /// maximum step.
    pub fn new(serial: &str, slots: usize, default_step: u8, max_step: u8) -> Self {
        Self::with_offset(serial, slots, default_step, max_step, 0)
    }

    pub fn with_offset(
        serial: &str,
        slots: usize,
        default_step: u8,
        max_step: u8,
        offset: i32,
    ) -> Self {
        Self {
            fpga: Arc::new(Mutex::new(Fpga {
                identity: build::identity(serial),
                descriptor: build::descriptor_v2(
                    slots,
                    offset,
                    400,
                    default_step,
                    max_step,
                    "ztex_ufm1_15d4",
                ),
                offset,
                known_work: Vec::new(),
                work: None,
                counters: vec![0; slots],
                golden: vec![None; slots],
                bad_witness: false,
                disconnected: false,
                frequency_history: Vec::new(),
                work_sent: 0,
                polls: 0,
            })),
        }
    }

    fn fpga(&self) -> MutexGuard<'_, Fpga> {
        self.fpga.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make a work item recognizable when its payload is sent.
    pub fn register_work(&self, work: &WorkItem) {
        self.fpga().known_work.push(work.clone());
    }

    pub fn set_identity(&self, identity: Vec<u8>) {
        self.fpga().identity = identity;
    }

    pub fn set_golden(&self, slot: usize, nonce: Option<u32>) {
        self.fpga().golden[slot] = nonce;
    }

    pub fn set_counter(&self, slot: usize, counter: u32) {
        self.fpga().counters[slot] = counter;
    }

    pub fn set_bad_witness(&self, bad: bool) {
        self.fpga().bad_witness = bad;
    }

    pub fn disconnect(&self) {
        self.fpga().disconnected = true;
    }

    pub fn frequency_history(&self) -> Vec<u16> {
        self.fpga().frequency_history.clone()
    }

    pub fn work_sent(&self) -> usize {
        self.fpga().work_sent
    }

    pub fn polls(&self) -> usize {
        self.fpga().polls
    }

    pub fn active_work(&self) -> Option<WorkItem> {
        self.fpga().work.clone()
    }
}

impl Fpga {
    fn read_nonces(&mut self, len: usize) -> Vec<u8> {
        self.polls += 1;
        let bias = self.offset as u32;
        let mut buf = Vec::with_capacity(len);
        for slot in 0..self.counters.len() {
            let (counter, witness) = match &self.work {
                Some(work) => {
                    let counter = self.counters[slot].wrapping_add(MockDevice::DEFAULT_ADVANCE);
                    self.counters[slot] = counter;
                    let mut witness = top_word(&work.hash(counter)).wrapping_sub(WITNESS_BIAS);
                    if self.bad_witness {
                        witness ^= 0x0000_ffff;
                    }
                    (counter, witness)
                }
                None => (self.counters[slot], 0),
            };
            let golden = self.golden[slot].map_or(0, |g| g.wrapping_add(bias));
            buf.extend_from_slice(&golden.to_le_bytes());
            buf.extend_from_slice(&counter.wrapping_add(bias).to_le_bytes());
            buf.extend_from_slice(&witness.to_le_bytes());
        }
        buf.resize(len, 0);
        buf
    }

    fn send_work(&mut self, payload: &[u8]) {
        self.work_sent += 1;
        self.work = self
            .known_work
            .iter()
            .find(|w| w.device_payload().as_slice() == payload)
            .cloned();
        self.counters.iter_mut().for_each(|c| *c = 0);
        self.golden.iter_mut().for_each(|g| *g = None);
    }
}

impl DeviceTransport for MockDevice {
    fn vendor_request(
        &mut self,
        request: u8,
        _value: u16,
        _index: u16,
        len: usize,
    ) -> Result<Vec<u8>, TransportError> {
        let mut fpga = self.fpga();
        if fpga.disconnected {
            return Err(TransportError::Disconnected);
        }
        let reply = match request {
            REQ_IDENTITY => fpga.identity.clone(),
            REQ_DESCRIPTOR => fpga.descriptor.clone(),
            REQ_READ_NONCES => {
                let expected = fpga.counters.len() * SLOT_LEN;
                if len != expected {
                    return Err(TransportError::ShortReply {
                        request,
                        expected: len,
                        actual: expected,
                    });
                }
                fpga.read_nonces(len)
            }
            _ => {
                return Err(TransportError::Transfer {
                    request,
                    reason: "stall".into(),
                })
            }
        };
        if reply.len() < len {
            return Err(TransportError::ShortReply {
                request,
                expected: len,
                actual: reply.len(),
            });
        }
        Ok(reply[..len].to_vec())
    }

    fn vendor_command(
        &mut self,
        request: u8,
        value: u16,
        _index: u16,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let mut fpga = self.fpga();
        if fpga.disconnected {
            return Err(TransportError::Disconnected);
        }
        match request {
            REQ_SEND_WORK => fpga.send_work(data),
            REQ_SET_FREQUENCY => fpga.frequency_history.push(value),
            _ => {
                return Err(TransportError::Transfer {
                    request,
                    reason: "stall".into(),
                })
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Bus {
    devices: Vec<(DiscoveredDevice, MockDevice)>,
    scan_error: bool,
}

/// A simulated USB bus.
#[derive(Debug, Clone, Default)]
pub struct MockEnumerator {
    bus: Arc<Mutex<Bus>>,
}

impl MockEnumerator {
    pub fn new() -> Self {
        Self::default()
    }

    fn bus(&self) -> MutexGuard<'_, Bus> {
        self.bus.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn attach(&self, bus: u8, address: u8, device: MockDevice) {
        let serial = device
            .fpga()
            .identity
            .get(30..40)
            .map(|s| s.iter().take_while(|&&b| b != 0).map(|&b| b as char).collect());
        let discovered = DiscoveredDevice {
            location: DeviceLocation { bus, address },
            serial,
        };
        self.bus().devices.push((discovered, device));
    }

    pub fn detach(&self, bus: u8, address: u8) {
        self.bus()
            .devices
            .retain(|(d, _)| d.location != DeviceLocation { bus, address });
    }

    pub fn set_scan_error(&self, fail: bool) {
        self.bus().scan_error = fail;
    }
}

impl DeviceEnumerator for MockEnumerator {
    fn scan(&self) -> Result<Vec<DiscoveredDevice>, TransportError> {
        let bus = self.bus();
        if bus.scan_error {
            return Err(TransportError::Io(std::io::Error::other("scan failed")));
        }
        Ok(bus.devices.iter().map(|(d, _)| d.clone()).collect())
    }

    fn open(&self, device: &DiscoveredDevice) -> Result<Box<dyn DeviceTransport>, TransportError> {
        self.bus()
            .devices
            .iter()
            .find(|(d, _)| d.location == device.location)
            .map(|(_, m)| Box::new(m.clone()) as Box<dyn DeviceTransport>)
            .ok_or(TransportError::Disconnected)
    }
}
