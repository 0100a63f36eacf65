//! Per-device message buffer.
//!
//! Group threads append here; the supervisor drains every buffer on a short
//! cadence and emits the lines through `tracing` with the device name
//! attached, so output from devices that share a thread stays readable.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use time::OffsetDateTime;

use crate::tracing::prelude::*;

pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub level: LogLevel,
    pub at: OffsetDateTime,
    pub message: String,
}

#[derive(Debug, Default)]
struct Buffer {
    lines: VecDeque<LogLine>,
    dropped: u64,
}

impl LogLine {
    /// Append time as shown next to the flushed message.
    pub fn stamp(&self) -> String {
        self.at
            .format(time::macros::format_description!(
                "[hour]:[minute]:[second].[subsecond digits:3]"
            ))
            .unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct DeviceLog {
    buffer: Mutex<Buffer>,
    capacity: usize,
}

impl Default for DeviceLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl DeviceLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(Buffer::default()),
            capacity: capacity.max(1),
        }
    }

    /// Append a line, dropping the oldest one if the buffer is full.
    pub fn push(&self, level: LogLevel, message: impl Into<String>) {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        if buffer.lines.len() >= self.capacity {
            buffer.lines.pop_front();
            buffer.dropped += 1;
        }
        buffer.lines.push_back(LogLine {
            level,
            at: OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc()),
            message: message.into(),
        });
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.push(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.push(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.push(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.push(LogLevel::Error, message);
    }

    /// Take all buffered lines in order, plus the number of lines lost to
    /// overflow since the last drain.
    pub fn drain(&self) -> (Vec<LogLine>, u64) {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        let dropped = std::mem::take(&mut buffer.dropped);
        (buffer.lines.drain(..).collect(), dropped)
    }

    /// Drain and emit through the tracing subscriber.
    pub fn flush(&self, device: &str) {
        let (lines, dropped) = self.drain();
        if dropped > 0 {
            warn!(device = %device, dropped, "Device log overflowed");
        }
        for line in lines {
            match line.level {
                LogLevel::Debug => debug!(device = %device, at = %line.stamp(), "{}", line.message),
                LogLevel::Info => info!(device = %device, at = %line.stamp(), "{}", line.message),
                LogLevel::Warn => warn!(device = %device, at = %line.stamp(), "{}", line.message),
                LogLevel::Error => error!(device = %device, at = %line.stamp(), "{}", line.message),
            }
        }
    }
}
