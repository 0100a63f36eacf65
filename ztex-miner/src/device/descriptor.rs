//! ZTEX identity and miner descriptors.
//!
//! Two descriptors are read when a session starts. The ZTEX identity
//! descriptor (vendor request 0x22, 40 bytes) proves the firmware speaks the
//! ZTEX protocol and carries the board's serial number:
//!
//! ```text
//! offset  size  field
//! 0       1     descriptor size
//! 1       1     descriptor version
//! 2       4     magic "ZTEX"
//! 6       4     product id (10, *, 1, 1 for the miner firmware)
//! 10      20    firmware/interface versions and capabilities (unused)
//! 30      10    serial number, ASCII
//! ```
//!
//! The miner descriptor (vendor request 0x82, 64 bytes) describes the
//! loaded bitstream:
//!
//! ```text
//! offset  size  field
//! 0       1     version (2 or 3)
//! 1       1     nonce slots - 1
//! 2       2     nonce offset + 10000, little-endian
//! 4       2     frequency unit in 10 kHz, little-endian
//! 6       1     default frequency step
//! 7       1     maximum frequency step
//! 8       2     hashes per clock - 1, little-endian (version 3 only)
//! 8 / 10  ..    bitstream name, NUL-terminated
//! ```

use crate::error::{Error, Result};

pub const REQ_IDENTITY: u8 = 0x22;
pub const IDENTITY_LEN: usize = 40;

pub const REQ_DESCRIPTOR: u8 = 0x82;
pub const DESCRIPTOR_LEN: usize = 64;

const ZTEX_MAGIC: &[u8; 4] = b"ZTEX";
const NONCE_OFFSET_BIAS: i32 = 10_000;

/// Parse the ZTEX identity descriptor and return the board's serial number.
pub fn parse_identity(buf: &[u8]) -> Result<String> {
    if buf.len() < IDENTITY_LEN {
        return Err(Error::Firmware(format!(
            "ZTEX descriptor too short ({} bytes)",
            buf.len()
        )));
    }
    if &buf[2..6] != ZTEX_MAGIC {
        return Err(Error::Firmware("Invalid ZTEX descriptor".into()));
    }
    let product = &buf[6..10];
    if product[0] != 10 || product[2] != 1 || product[3] != 1 {
        return Err(Error::Firmware(format!(
            "Wrong or no firmware (product id {}.{}.{}.{})",
            product[0], product[1], product[2], product[3]
        )));
    }
    let serial: String = buf[30..40]
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect();
    Ok(serial)
}

/// Properties of a miner bitstream, read once at session start.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceDescriptor {
    pub version: u8,
    /// Number of nonce slots (hashing cores) reported on each poll, 1..=256.
    pub slots: usize,
    /// Bias the device adds to every reported nonce and counter.
    pub nonce_offset: i32,
    /// MHz per frequency step; actual clock is `(step + 1) * freq_unit_mhz`.
    pub freq_unit_mhz: f64,
    pub default_step: u8,
    pub max_step: u8,
    pub hashes_per_clock: u16,
    pub bitstream: String,
    pub serial: String,
}

impl DeviceDescriptor {
    pub fn parse(buf: &[u8], serial: String) -> Result<Self> {
        if buf.len() < DESCRIPTOR_LEN {
            return Err(Error::Descriptor(format!("{} of 64 bytes", buf.len())));
        }
        let version = buf[0];
        let name_start = match version {
            2 => 8,
            3 => 10,
            _ => {
                return Err(Error::Firmware(format!(
                    "Invalid miner descriptor version {}",
                    version
                )))
            }
        };

        let slots = buf[1] as usize + 1;
        let nonce_offset = u16::from_le_bytes([buf[2], buf[3]]) as i32 - NONCE_OFFSET_BIAS;
        let freq_unit_mhz = u16::from_le_bytes([buf[4], buf[5]]) as f64 * 0.01;
        let max_step = buf[7];
        let default_step = buf[6].min(max_step);
        let hashes_per_clock = if version >= 3 {
            u16::from_le_bytes([buf[8], buf[9]]).saturating_add(1)
        } else {
            1
        };

        let name_bytes = &buf[name_start..];
        let name_len = name_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(name_bytes.len());
        if name_len == 0 {
            return Err(Error::Firmware("Invalid bitstream file name".into()));
        }
        let bitstream = String::from_utf8_lossy(&name_bytes[..name_len]).into_owned();

        Ok(Self {
            version,
            slots,
            nonce_offset,
            freq_unit_mhz,
            default_step,
            max_step,
            hashes_per_clock,
            bitstream,
            serial,
        })
    }

    pub fn frequency_mhz(&self, step: u8) -> f64 {
        (step as f64 + 1.0) * self.freq_unit_mhz
    }

    /// Display name of the device: bitstream and serial.
    pub fn name(&self) -> String {
        format!("{}-{}", self.bitstream, self.serial)
    }

    /// One-line summary logged when a session starts.
    pub fn info(&self) -> String {
        format!(
            "bitfile={}   f_default={:.2}MHz  f_max={:.2}MHz",
            self.bitstream,
            self.frequency_mhz(self.default_step),
            self.frequency_mhz(self.max_step)
        )
    }
}
