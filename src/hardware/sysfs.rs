//! Local IIO devices through sysfs.
//!
//! Used for `local:` URIs, when the test runs on the carrier board itself.
//! Devices live under `/sys/bus/iio/devices/iio:deviceN` and are matched by
//! their `name` file. Channel attributes are plain files:
//!
//! - `in_<channel>_<attr>` / `out_<channel>_<attr>` for per-channel attributes
//! - `in_<type>_<attr>` when the driver shares an attribute across a type
//! - `<attr>` for device-wide attributes
//!
//! The first of these that exists is used.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::calibration::ADC_CHANNEL_COUNT;
use crate::error::{Result, TestError};
use crate::hardware::capabilities::{AnalogInput, AnalogOutput};

/// Where the kernel exposes IIO devices.
pub const DEFAULT_SYSFS_ROOT: &str = "/sys/bus/iio/devices";

const DAC_CHANNEL: &str = "voltage0";

/// Locate the device directory whose `name` file matches `part`.
pub async fn find_device(root: &Path, part: &str) -> Result<PathBuf> {
    let mut entries = tokio::fs::read_dir(root)
        .await
        .map_err(|e| TestError::Connection {
            uri: "local:".to_string(),
            message: format!("{}: {e}", root.display()),
        })?;

    let mut matches = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_name().to_string_lossy().starts_with("iio:device") {
            continue;
        }
        if let Ok(name) = tokio::fs::read_to_string(entry.path().join("name")).await {
            if name.trim() == part {
                matches.push(entry.path());
            }
        }
    }

    // read_dir order is unspecified
    matches.sort();
    matches
        .into_iter()
        .next()
        .ok_or_else(|| TestError::DeviceNotFound(part.to_string()))
}

/// Leading type of a channel id: `voltage0-voltage19` -> `voltage`.
fn channel_type(id: &str) -> &str {
    let end = id
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(id.len());
    &id[..end]
}

/// Numeric index of a channel id: `voltage12` -> 12.
fn channel_index(id: &str) -> u32 {
    id[channel_type(id).len()..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .unwrap_or(u32::MAX)
}

async fn resolve_attr(
    dir: &Path,
    device: &str,
    prefix: &str,
    channel: &str,
    attr: &str,
) -> Result<PathBuf> {
    let candidates = [
        dir.join(format!("{prefix}_{channel}_{attr}")),
        dir.join(format!("{prefix}_{}_{attr}", channel_type(channel))),
        dir.join(attr),
    ];
    for candidate in candidates {
        if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return Ok(candidate);
        }
    }
    Err(TestError::ChannelNotFound {
        device: device.to_string(),
        channel: format!("{channel}/{attr}"),
    })
}

async fn read_attr(path: &Path) -> Result<String> {
    let text = tokio::fs::read_to_string(path).await?;
    Ok(text.trim().to_string())
}

async fn write_attr(path: &Path, value: &str) -> Result<()> {
    debug!(path = %path.display(), value, "sysfs write");
    tokio::fs::write(path, value).await?;
    Ok(())
}

/// List input channels that have a `raw` attribute, by channel index.
async fn discover_input_channels(dir: &Path) -> Result<Vec<String>> {
    let raw_re =
        Regex::new(r"^in_(.+)_raw$").map_err(|e| TestError::Protocol(format!("bad pattern: {e}")))?;

    let mut channels = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let file = entry.file_name().to_string_lossy().into_owned();
        if let Some(caps) = raw_re.captures(&file) {
            channels.push(caps[1].to_string());
        }
    }
    channels.sort_by(|a, b| {
        channel_index(a)
            .cmp(&channel_index(b))
            .then_with(|| a.cmp(b))
    });
    Ok(channels)
}

/// AD7124 through sysfs.
pub struct SysfsAdc {
    dir: PathBuf,
    name: String,
    channels: Vec<String>,
}

impl SysfsAdc {
    /// Open the ADC named `part` under `root`.
    pub async fn open(root: &Path, part: &str, channel_ids: Option<&[String]>) -> Result<Self> {
        let dir = find_device(root, part).await?;
        let available = discover_input_channels(&dir).await?;

        let channels = match channel_ids {
            Some(ids) => {
                if let Some(missing) = ids.iter().find(|id| !available.contains(id)) {
                    return Err(TestError::ChannelNotFound {
                        device: part.to_string(),
                        channel: missing.clone(),
                    });
                }
                ids.to_vec()
            }
            None => available,
        };

        if channels.len() < ADC_CHANNEL_COUNT {
            return Err(TestError::ChannelNotFound {
                device: part.to_string(),
                channel: channels.len().to_string(),
            });
        }

        debug!(dir = %dir.display(), channels = ?channels, "Opened sysfs ADC");
        Ok(Self {
            dir,
            name: part.to_string(),
            channels,
        })
    }

    async fn attr_path(&self, channel: usize, attr: &str) -> Result<PathBuf> {
        let id = self
            .channels
            .get(channel)
            .ok_or_else(|| TestError::ChannelNotFound {
                device: self.name.clone(),
                channel: channel.to_string(),
            })?;
        resolve_attr(&self.dir, &self.name, "in", id, attr).await
    }
}

#[async_trait]
impl AnalogInput for SysfsAdc {
    fn name(&self) -> &str {
        &self.name
    }

    fn channel_count(&self) -> usize {
        self.channels.len()
    }

    async fn set_sample_rate(&self, samples_per_second: u32) -> Result<()> {
        let value = samples_per_second.to_string();
        let mut written: Vec<PathBuf> = Vec::new();
        for channel in 0..self.channels.len() {
            let path = self.attr_path(channel, "sampling_frequency").await?;
            // Shared attributes resolve to the same file
            if !written.contains(&path) {
                write_attr(&path, &value).await?;
                written.push(path);
            }
        }
        Ok(())
    }

    async fn set_channel_scale(&self, channel: usize, scale: f64) -> Result<()> {
        let path = self.attr_path(channel, "scale").await?;
        write_attr(&path, &scale.to_string()).await
    }

    async fn read_raw(&self, channel: usize) -> Result<i64> {
        let path = self.attr_path(channel, "raw").await?;
        let text = read_attr(&path).await?;
        text.parse().map_err(|_| TestError::Parse {
            attr: path.display().to_string(),
            value: text,
        })
    }
}

/// AD5683R through sysfs.
pub struct SysfsDac {
    raw: PathBuf,
    scale: PathBuf,
    name: String,
}

impl SysfsDac {
    /// Open the DAC named `part` under `root`.
    pub async fn open(root: &Path, part: &str) -> Result<Self> {
        let dir = find_device(root, part).await?;
        let raw = resolve_attr(&dir, part, "out", DAC_CHANNEL, "raw").await?;
        let scale = resolve_attr(&dir, part, "out", DAC_CHANNEL, "scale").await?;
        Ok(Self {
            raw,
            scale,
            name: part.to_string(),
        })
    }
}

#[async_trait]
impl AnalogOutput for SysfsDac {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write_raw(&self, code: i64) -> Result<()> {
        write_attr(&self.raw, &code.to_string()).await
    }

    async fn scale(&self) -> Result<f64> {
        let text = read_attr(&self.scale).await?;
        text.parse().map_err(|_| TestError::Parse {
            attr: self.scale.display().to_string(),
            value: text,
        })
    }
}
