//! Bitcoin getwork miner for ZTEX USB-FPGA modules.
//!
//! Boards are discovered on USB, grouped per bus and polled by one thread
//! per group. Each board has its own [`device::DeviceSession`] that fetches
//! work from a job server, watches the board's nonce slots, submits golden
//! nonces and tunes the clock from the observed error rate.

pub mod codec;
pub mod config;
pub mod daemon;
pub mod device;
pub mod error;
pub mod fleet;
pub mod rpc;
pub mod scheduler;
pub mod tracing;
pub mod transport;
pub mod types;

#[cfg(test)]
mod test_data;
