//! Error types for the production test.
//!
//! `TestError` is the single error type of the library. Using `thiserror`, it
//! separates the failures that can happen while talking to the instrument
//! from configuration and operator problems.
//!
//! ## Error Hierarchy
//!
//! - **Connection-time**: `Connection`, `DeviceNotFound`, `ChannelNotFound`,
//!   `UnsupportedUri`. Raised while opening the instrument; the board could
//!   not be tested at all ("No device found").
//! - **Transport**: `Io`, `Timeout`, `Protocol`, `Remote`, `Parse`. Raised by
//!   the instrument backends once a session is open.
//! - **Run control**: `OperatorInput`, `PotGateExhausted`, `Interrupted`,
//!   `Panicked`. These abort a run that already touched the hardware, so the
//!   DAC is forced back to zero before they surface.
//! - **Configuration**: `Config`, `Configuration`.
//!
//! Threshold violations are not errors. They are recorded in the run's
//! failure list and execution continues.

use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type Result<T> = std::result::Result<T, TestError>;

/// Errors raised while connecting to or driving the board under test.
#[derive(Error, Debug)]
pub enum TestError {
    /// The instrument could not be reached at all.
    #[error("Failed to connect to '{uri}': {message}")]
    Connection {
        /// Instrument URI that was attempted
        uri: String,
        /// Underlying reason
        message: String,
    },

    /// The URI scheme is not one of `ip:`, `local:` or `sim:`.
    #[error("Unsupported instrument URI '{0}' (expected ip:<host>, local: or sim:)")]
    UnsupportedUri(String),

    /// The instrument is reachable but does not expose the named device.
    #[error("Device '{0}' not found in instrument context")]
    DeviceNotFound(String),

    /// A channel index or id does not exist on the device.
    #[error("Channel {channel} not found on device '{device}'")]
    ChannelNotFound {
        /// Device name
        device: String,
        /// Channel index or id
        channel: String,
    },

    /// I/O error from the operating system (socket, sysfs, stdin).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No reply from the instrument within the configured timeout.
    #[error("Timeout after {timeout_ms} ms waiting for: {command}")]
    Timeout {
        /// Command that timed out
        command: String,
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// The instrument replied with something that does not follow the protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The instrument daemon reported a negative errno.
    #[error("Instrument rejected '{command}' with errno {errno}")]
    Remote {
        /// Command that was rejected
        command: String,
        /// Positive errno value
        errno: i32,
    },

    /// An attribute value could not be parsed.
    #[error("Failed to parse '{value}' for attribute '{attr}'")]
    Parse {
        /// Attribute name
        attr: String,
        /// Raw text that failed to parse
        value: String,
    },

    /// Operator input stream closed while a prompt was pending.
    #[error("Operator input closed while waiting for: {0}")]
    OperatorInput(String),

    /// The potentiometer gate ran out of re-prompts.
    #[error("Potentiometers still out of range after {prompts} re-prompts")]
    PotGateExhausted {
        /// Number of re-prompts issued
        prompts: u32,
    },

    /// The run was cancelled (Ctrl-C).
    #[error("Test interrupted by operator")]
    Interrupted,

    /// A test step panicked.
    #[error("Test step panicked: {0}")]
    Panicked(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but holds invalid values.
    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

impl From<figment::Error> for TestError {
    fn from(value: figment::Error) -> Self {
        TestError::Config(Box::new(value))
    }
}
