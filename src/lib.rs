//! # CN0508 Production Test
//!
//! Factory test for the CN0508 adjustable power supply board. A run connects to
//! the board's AD7124 ADC and AD5683R DAC, calibrates the ADC channels, walks
//! the operator through a fixed sequence of checks and prints a pass/fail
//! verdict with the list of failed tests.
//!
//! ## Crate Structure
//!
//! - **`calibration`**: The fixed scale table, the monitored quantities and
//!   their ADC channels, raw-to-engineering and setpoint-to-DAC-code
//!   conversions.
//! - **`config`**: Figment-based configuration (defaults, TOML file,
//!   `CN0508_` environment variables).
//! - **`error`**: The `TestError` enum and `Result` alias.
//! - **`hardware`**: `AnalogInput` / `AnalogOutput` capability traits, URI
//!   parsing and the three backends (IIOD over TCP, local sysfs, simulated).
//! - **`logging`**: tracing-subscriber setup.
//! - **`operator`**: How the procedure asks a person to act (console or
//!   scripted).
//! - **`procedures`**: The production test sequence, its thresholds, the
//!   output safety finalizer and the report types.

pub mod calibration;
pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod operator;
pub mod procedures;

pub use error::{Result, TestError};
