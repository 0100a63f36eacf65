//! USB backend built on nusb.
//!
//! Enumeration walks the bus once per scan; there is no hotplug monitor.
//! Operators trigger a rescan after plugging in boards. Each opened device
//! claims interface 0 and issues blocking control transfers, which suits the
//! one-thread-per-group scheduling model.

use std::time::Duration;

use nusb::transfer::{Control, ControlType, Recipient, TransferError};

use super::{
    DeviceEnumerator, DeviceLocation, DeviceTransport, DiscoveredDevice, TransportError,
    ZTEX_PRODUCT_ID, ZTEX_VENDOR_ID,
};
use crate::tracing::prelude::*;

const CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Scans for ZTEX modules with nusb.
#[derive(Debug, Default)]
pub struct UsbEnumerator;

impl UsbEnumerator {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceEnumerator for UsbEnumerator {
    fn scan(&self) -> Result<Vec<DiscoveredDevice>, TransportError> {
        let mut found: Vec<DiscoveredDevice> = nusb::list_devices()?
            .filter(|info| info.vendor_id() == ZTEX_VENDOR_ID && info.product_id() == ZTEX_PRODUCT_ID)
            .map(|info| DiscoveredDevice {
                location: DeviceLocation {
                    bus: info.bus_number(),
                    address: info.device_address(),
                },
                serial: info.serial_number().map(str::to_string),
            })
            .collect();
        found.sort_by_key(|d| d.location);
        trace!(count = found.len(), "USB scan complete");
        Ok(found)
    }

    fn open(&self, device: &DiscoveredDevice) -> Result<Box<dyn DeviceTransport>, TransportError> {
        let info = nusb::list_devices()?
            .find(|info| {
                info.bus_number() == device.location.bus
                    && info.device_address() == device.location.address
            })
            .ok_or(TransportError::Disconnected)?;
        let handle = info.open()?;
        let interface = handle.claim_interface(0)?;
        debug!(location = %device.location, "Opened USB device");
        Ok(Box::new(UsbDevice { interface }))
    }
}

/// An opened ZTEX module.
pub struct UsbDevice {
    interface: nusb::Interface,
}

fn vendor_control(request: u8, value: u16, index: u16) -> Control {
    Control {
        control_type: ControlType::Vendor,
        recipient: Recipient::Device,
        request,
        value,
        index,
    }
}

fn map_transfer_error(request: u8, err: TransferError) -> TransportError {
    match err {
        TransferError::Disconnected => TransportError::Disconnected,
        other => TransportError::Transfer {
            request,
            reason: other.to_string(),
        },
    }
}

impl DeviceTransport for UsbDevice {
    fn vendor_request(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        len: usize,
    ) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; len];
        let actual = self
            .interface
            .control_in_blocking(vendor_control(request, value, index), &mut buf, CONTROL_TIMEOUT)
            .map_err(|e| map_transfer_error(request, e))?;
        if actual < len {
            return Err(TransportError::ShortReply {
                request,
                expected: len,
                actual,
            });
        }
        Ok(buf)
    }

    fn vendor_command(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<(), TransportError> {
        self.interface
            .control_out_blocking(vendor_control(request, value, index), data, CONTROL_TIMEOUT)
            .map_err(|e| map_transfer_error(request, e))?;
        Ok(())
    }
}
