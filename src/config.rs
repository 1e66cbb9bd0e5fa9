//! Configuration using Figment
//!
//! Strongly-typed settings for a production test run. Values are merged from:
//! 1. Built-in defaults (the bench setup the procedure was written for)
//! 2. A TOML file (`cn0508.toml` by default, or `--config <path>`)
//! 3. Environment variables prefixed with `CN0508_`, `__` separating sections
//!
//! Command-line flags are applied on top by the binary.
//!
//! # Example
//! ```no_run
//! use cn0508_production_test::config::TestConfig;
//!
//! let config = TestConfig::load()?;
//! println!("Instrument: {}", config.instrument.uri);
//! # Ok::<(), cn0508_production_test::error::TestError>(())
//! ```
//!
//! Environment override: `CN0508_INSTRUMENT__URI=ip:10.0.0.5`

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TestError};
use crate::hardware::sysfs::DEFAULT_SYSFS_ROOT;
use crate::hardware::InstrumentUri;

/// Default configuration file, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "cn0508.toml";

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "CN0508_";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Where the board under test is reached
    #[serde(default)]
    pub instrument: InstrumentConfig,
    /// Settling delays
    #[serde(default)]
    pub timing: TimingConfig,
    /// Potentiometer gate policy
    #[serde(default)]
    pub pot_gate: PotGatePolicy,
    /// Process exit status policy
    #[serde(default)]
    pub exit: ExitConfig,
}

/// Instrument connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Context URI (`ip:<host>[:<port>]`, `local:` or `sim:`)
    #[serde(default = "default_uri")]
    pub uri: String,
    /// ADC device name
    #[serde(default = "default_adc_part")]
    pub adc_part: String,
    /// DAC device name
    #[serde(default = "default_dac_part")]
    pub dac_part: String,
    /// Explicit ADC channel ids, in channel-index order. Discovered when unset.
    #[serde(default)]
    pub adc_channels: Option<Vec<String>>,
    /// Per-exchange timeout for the network backend, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Root of the IIO sysfs tree for `local:`
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,
}

/// Settling delays between output changes and readings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Wait after every DAC setpoint change, in milliseconds
    #[serde(default = "default_dac_settle_ms")]
    pub dac_settle_ms: u64,
    /// Wait after the load resistor is attached, in milliseconds
    #[serde(default = "default_load_settle_ms")]
    pub load_settle_ms: u64,
}

/// How long the potentiometer gate keeps asking.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PotGatePolicy {
    /// Re-prompts allowed before giving up; unset waits for the operator forever
    #[serde(default)]
    pub max_prompts: Option<u32>,
}

/// Exit status policy
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExitConfig {
    /// Exit 0 on pass, 1 on board failure, 2 when the board could not be tested.
    /// When false the process exits 0 whatever the verdict.
    #[serde(default)]
    pub strict: bool,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_uri() -> String {
    "ip:172.20.10.7".to_string()
}

fn default_adc_part() -> String {
    "ad7124-4".to_string()
}

fn default_dac_part() -> String {
    "ad5683r".to_string()
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from(DEFAULT_SYSFS_ROOT)
}

fn default_dac_settle_ms() -> u64 {
    100
}

fn default_load_settle_ms() -> u64 {
    5000
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            instrument: InstrumentConfig::default(),
            timing: TimingConfig::default(),
            pot_gate: PotGatePolicy::default(),
            exit: ExitConfig::default(),
        }
    }
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            uri: default_uri(),
            adc_part: default_adc_part(),
            dac_part: default_dac_part(),
            adc_channels: None,
            timeout_ms: default_timeout_ms(),
            sysfs_root: default_sysfs_root(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            dac_settle_ms: default_dac_settle_ms(),
            load_settle_ms: default_load_settle_ms(),
        }
    }
}

impl TimingConfig {
    /// Delay after a DAC setpoint change.
    pub fn dac_settle(&self) -> Duration {
        Duration::from_millis(self.dac_settle_ms)
    }

    /// Delay after attaching the load.
    pub fn load_settle(&self) -> Duration {
        Duration::from_millis(self.load_settle_ms)
    }
}

impl TestConfig {
    /// Load from `cn0508.toml` (if present) and the environment.
    pub fn load() -> Result<Self> {
        Self::figment(Path::new(DEFAULT_CONFIG_FILE))
            .extract()
            .map_err(TestError::from)
    }

    /// Load from a specific file, which must exist, and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(TestError::Configuration(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        Self::figment(path).extract().map_err(TestError::from)
    }

    /// Layered provider: defaults, then the TOML file, then the environment.
    ///
    /// A missing file contributes nothing.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(TestConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(TestError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.log_format.to_lowercase().as_str()) {
            return Err(TestError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.instrument.uri.trim().is_empty() {
            return Err(TestError::Configuration(
                "instrument.uri must not be empty".to_string(),
            ));
        }
        self.instrument.uri.parse::<InstrumentUri>()?;

        if self.instrument.timeout_ms == 0 {
            return Err(TestError::Configuration(
                "instrument.timeout_ms must be greater than 0".to_string(),
            ));
        }

        if let Some(channels) = &self.instrument.adc_channels {
            let mut seen = std::collections::HashSet::new();
            for id in channels {
                if !seen.insert(id) {
                    return Err(TestError::Configuration(format!(
                        "Duplicate ADC channel id: {id}"
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    #[serial]
    fn defaults_match_bench_setup() {
        let config: TestConfig = TestConfig::figment(Path::new("does-not-exist.toml"))
            .extract()
            .unwrap();

        assert_eq!(config, TestConfig::default());
        assert_eq!(config.instrument.uri, "ip:172.20.10.7");
        assert_eq!(config.instrument.adc_part, "ad7124-4");
        assert_eq!(config.instrument.dac_part, "ad5683r");
        assert_eq!(config.timing.dac_settle(), Duration::from_millis(100));
        assert_eq!(config.timing.load_settle(), Duration::from_secs(5));
        assert_eq!(config.pot_gate.max_prompts, None);
        assert!(!config.exit.strict);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn file_overrides_defaults() {
        let file = write_config(
            r#"
            log_level = "debug"

            [instrument]
            uri = "sim:"
            adc_channels = ["voltage0-voltage1", "voltage2-voltage3"]

            [pot_gate]
            max_prompts = 5
            "#,
        );

        let config = TestConfig::load_from(file.path()).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.instrument.uri, "sim:");
        assert_eq!(config.instrument.adc_part, "ad7124-4");
        assert_eq!(
            config.instrument.adc_channels.as_deref(),
            Some(&["voltage0-voltage1".to_string(), "voltage2-voltage3".to_string()][..])
        );
        assert_eq!(config.pot_gate.max_prompts, Some(5));
        assert_eq!(config.timing.dac_settle_ms, 100);
    }

    #[test]
    #[serial]
    fn environment_overrides_file() {
        let file = write_config("[instrument]\nuri = \"sim:\"\n");
        std::env::set_var("CN0508_INSTRUMENT__URI", "ip:10.0.0.9");
        std::env::set_var("CN0508_TIMING__LOAD_SETTLE_MS", "250");

        let result = TestConfig::load_from(file.path());

        std::env::remove_var("CN0508_INSTRUMENT__URI");
        std::env::remove_var("CN0508_TIMING__LOAD_SETTLE_MS");

        let config = result.unwrap();
        assert_eq!(config.instrument.uri, "ip:10.0.0.9");
        assert_eq!(config.timing.load_settle_ms, 250);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let err = TestConfig::load_from("/nonexistent/cn0508.toml").unwrap_err();
        assert!(matches!(err, TestError::Configuration(_)));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = TestConfig::default();
        config.log_level = "loud".into();
        assert!(config.validate().is_err());

        let mut config = TestConfig::default();
        config.log_format = "xml".into();
        assert!(config.validate().is_err());

        let mut config = TestConfig::default();
        config.instrument.uri = "  ".into();
        assert!(config.validate().is_err());

        let mut config = TestConfig::default();
        config.instrument.uri = "usb:1.2".into();
        assert!(matches!(
            config.validate(),
            Err(TestError::UnsupportedUri(_))
        ));

        let mut config = TestConfig::default();
        config.instrument.timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = TestConfig::default();
        config.instrument.adc_channels = Some(vec!["a".into(), "a".into()]);
        assert!(config.validate().is_err());
    }
}
