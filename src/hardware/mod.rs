//! Instrument access for the production test.
//!
//! An [`Instrument`] is the pair of sub-devices the test drives: the AD7124 ADC
//! that monitors the board and the AD5683R DAC that sets its output. It is
//! opened from a context URI, the same addressing scheme the vendor tooling
//! uses:
//!
//! - `ip:<host>[:<port>]` talks to the IIO daemon over TCP ([`iiod`])
//! - `local:` reads the Linux IIO sysfs tree directly ([`sysfs`])
//! - `sim:` uses a simulated passing board ([`mock`])

pub mod capabilities;
pub mod iiod;
pub mod mock;
pub mod sysfs;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::InstrumentConfig;
use crate::error::{Result, TestError};

pub use capabilities::{AnalogInput, AnalogOutput};

/// Default TCP port of the IIO daemon.
pub const IIOD_DEFAULT_PORT: u16 = 30431;

/// Parsed instrument context URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstrumentUri {
    /// Remote IIO daemon
    Network {
        /// Host name or address
        host: String,
        /// TCP port
        port: u16,
    },
    /// Local sysfs tree
    Local,
    /// Simulated board
    Simulated,
}

impl FromStr for InstrumentUri {
    type Err = TestError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix("ip:") {
            if rest.is_empty() {
                return Err(TestError::UnsupportedUri(s.to_string()));
            }
            // Bracketed IPv6 literal, optionally followed by :port
            if let Some(inner) = rest.strip_prefix('[') {
                let (host, tail) = inner
                    .split_once(']')
                    .ok_or_else(|| TestError::UnsupportedUri(s.to_string()))?;
                let port = match tail.strip_prefix(':') {
                    Some(p) => parse_port(s, p)?,
                    None if tail.is_empty() => IIOD_DEFAULT_PORT,
                    None => return Err(TestError::UnsupportedUri(s.to_string())),
                };
                return Ok(InstrumentUri::Network {
                    host: host.to_string(),
                    port,
                });
            }
            return match rest.rsplit_once(':') {
                // A single colon separates host and port; more means bare IPv6
                Some((host, port)) if !host.contains(':') => Ok(InstrumentUri::Network {
                    host: host.to_string(),
                    port: parse_port(s, port)?,
                }),
                _ => Ok(InstrumentUri::Network {
                    host: rest.to_string(),
                    port: IIOD_DEFAULT_PORT,
                }),
            };
        }
        match s {
            "local:" => Ok(InstrumentUri::Local),
            "sim:" => Ok(InstrumentUri::Simulated),
            _ => Err(TestError::UnsupportedUri(s.to_string())),
        }
    }
}

fn parse_port(uri: &str, port: &str) -> Result<u16> {
    port.parse()
        .map_err(|_| TestError::UnsupportedUri(uri.to_string()))
}

impl fmt::Display for InstrumentUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstrumentUri::Network { host, port } if host.contains(':') => {
                write!(f, "ip:[{host}]:{port}")
            }
            InstrumentUri::Network { host, port } => write!(f, "ip:{host}:{port}"),
            InstrumentUri::Local => f.write_str("local:"),
            InstrumentUri::Simulated => f.write_str("sim:"),
        }
    }
}

/// An open connection to the board's ADC and DAC.
pub struct Instrument {
    adc: Box<dyn AnalogInput>,
    dac: Box<dyn AnalogOutput>,
}

impl Instrument {
    /// Assemble an instrument from already-open devices.
    pub fn new(adc: Box<dyn AnalogInput>, dac: Box<dyn AnalogOutput>) -> Self {
        Self { adc, dac }
    }

    /// Open both sub-devices described by `config`.
    ///
    /// Any failure here means the board cannot be tested.
    pub async fn connect(config: &InstrumentConfig) -> Result<Self> {
        let uri: InstrumentUri = config.uri.parse()?;
        info!(uri = %uri, adc = %config.adc_part, dac = %config.dac_part, "Opening instrument");

        match uri {
            InstrumentUri::Network { host, port } => {
                let timeout = Duration::from_millis(config.timeout_ms);
                let client = Arc::new(iiod::IiodClient::connect(&host, port, timeout).await?);
                let context = client.context().await?;
                let adc = iiod::IiodAdc::open(
                    Arc::clone(&client),
                    &context,
                    &config.adc_part,
                    config.adc_channels.as_deref(),
                )?;
                let dac = iiod::IiodDac::open(client, &context, &config.dac_part)?;
                Ok(Self::new(Box::new(adc), Box::new(dac)))
            }
            InstrumentUri::Local => {
                let adc = sysfs::SysfsAdc::open(
                    &config.sysfs_root,
                    &config.adc_part,
                    config.adc_channels.as_deref(),
                )
                .await?;
                let dac = sysfs::SysfsDac::open(&config.sysfs_root, &config.dac_part).await?;
                Ok(Self::new(Box::new(adc), Box::new(dac)))
            }
            InstrumentUri::Simulated => Ok(mock::SimulatedBoard::passing().instrument()),
        }
    }

    /// The ADC monitoring the board.
    pub fn adc(&self) -> &dyn AnalogInput {
        self.adc.as_ref()
    }

    /// The DAC driving the board output.
    pub fn dac(&self) -> &dyn AnalogOutput {
        self.dac.as_ref()
    }

    /// Release both devices.
    ///
    /// Errors are logged, not returned: closing happens after the verdict is
    /// already known and must not mask it.
    pub async fn close(self) {
        if let Err(e) = self.adc.close().await {
            warn!(device = self.adc.name(), error = %e, "Failed to close ADC");
        }
        if let Err(e) = self.dac.close().await {
            warn!(device = self.dac.name(), error = %e, "Failed to close DAC");
        }
    }
}
