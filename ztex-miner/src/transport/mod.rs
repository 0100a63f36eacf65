//! Device transport layer.
//!
//! Miner sessions talk to the FPGA board through vendor-specific control
//! transfers on the default endpoint. This module defines the seam between
//! the session logic and the USB stack: [`DeviceTransport`] carries the
//! transfers of one opened device, [`DeviceEnumerator`] finds and opens
//! devices. The nusb backend lives in [`usb`]; tests use the scripted FPGA
//! in `mock`.

pub mod usb;

#[cfg(test)]
pub mod mock;

use std::fmt;

pub use usb::UsbEnumerator;

/// ZTEX vendor ID.
pub const ZTEX_VENDOR_ID: u16 = 0x221a;

/// Product ID shared by ZTEX FPGA modules.
pub const ZTEX_PRODUCT_ID: u16 = 0x0100;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transfer {request:#04x} failed: {reason}")]
    Transfer { request: u8, reason: String },

    #[error("short reply to request {request:#04x}: {actual} of {expected} bytes")]
    ShortReply {
        request: u8,
        expected: usize,
        actual: usize,
    },

    #[error("device disconnected")]
    Disconnected,
}

/// Physical position of a device: bus number and address on that bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceLocation {
    pub bus: u8,
    pub address: u8,
}

impl DeviceLocation {
    /// Bus identity used to key device groups.
    pub fn bus_name(&self) -> String {
        format!("{:03}", self.bus)
    }
}

impl fmt::Display for DeviceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}:{:03}", self.bus, self.address)
    }
}

/// A device found during a scan, not yet opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub location: DeviceLocation,
    /// Serial number string descriptor, if the device reported one.
    pub serial: Option<String>,
}

/// Vendor control transfers on one opened device.
///
/// Implementations block for the duration of the transfer.
pub trait DeviceTransport: Send {
    /// Device-to-host vendor request. Returns exactly `len` bytes.
    fn vendor_request(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        len: usize,
    ) -> Result<Vec<u8>, TransportError>;

    /// Host-to-device vendor command.
    fn vendor_command(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<(), TransportError>;
}

/// Finds and opens miner devices.
pub trait DeviceEnumerator: Send {
    fn scan(&self) -> Result<Vec<DiscoveredDevice>, TransportError>;

    fn open(&self, device: &DiscoveredDevice) -> Result<Box<dyn DeviceTransport>, TransportError>;
}
