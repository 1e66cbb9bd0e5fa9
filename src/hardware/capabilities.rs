//! Hardware Capabilities
//!
//! The production test needs exactly two things from the instrument:
//!
//! - `AnalogInput`: a multi-channel ADC with a writable sample rate, a writable
//!   per-channel scale register and an integer raw reading per channel.
//! - `AnalogOutput`: a single-channel DAC with a raw output register and a
//!   read-only scale factor fixed by the device configuration.
//!
//! Each backend (`iiod`, `sysfs`, `mock`) implements both traits. The runner is
//! written against the traits only, so a simulated board and a networked one
//! go through the same code path.
//!
//! # Design
//!
//! Like the other capability traits in this crate family, each trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Takes `&self` and keeps mutable state behind interior mutability

use async_trait::async_trait;

use crate::error::Result;

/// Capability: multi-channel analog input (ADC).
///
/// # Contract
/// - Channels are addressed by index `0..channel_count()`
/// - `read_raw` returns the converter's integer code, unscaled
/// - `set_channel_scale` writes the device's per-channel scale register; it
///   does not change what `read_raw` returns
#[async_trait]
pub trait AnalogInput: Send + Sync {
    /// Device name as reported by the instrument (e.g. `ad7124-4`).
    fn name(&self) -> &str;

    /// Number of addressable input channels.
    fn channel_count(&self) -> usize;

    /// Set the converter sample rate in samples per second.
    async fn set_sample_rate(&self, samples_per_second: u32) -> Result<()>;

    /// Write the scale register of one channel.
    async fn set_channel_scale(&self, channel: usize, scale: f64) -> Result<()>;

    /// Take one raw reading from a channel.
    async fn read_raw(&self, channel: usize) -> Result<i64>;

    /// Release the device. Called once at the end of a run.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Capability: single-channel analog output (DAC).
///
/// # Contract
/// - `write_raw` sets the output register; the board output follows after
///   its settling time
/// - `scale` is informational calibration data (mV per code); it is never
///   written by this crate
#[async_trait]
pub trait AnalogOutput: Send + Sync {
    /// Device name as reported by the instrument (e.g. `ad5683r`).
    fn name(&self) -> &str;

    /// Write the raw output code.
    async fn write_raw(&self, code: i64) -> Result<()>;

    /// Read the output scale factor.
    async fn scale(&self) -> Result<f64>;

    /// Release the device. Called once at the end of a run.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
