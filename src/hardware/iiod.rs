//! IIO daemon client over TCP.
//!
//! Speaks the text protocol of the IIO daemon (`iiod`), which is what an
//! `ip:` context URI connects to. Only the handful of commands the production
//! test needs are implemented:
//!
//! ```text
//! PRINT\r\n                                   -> <len>\n<xml>\n
//! READ <dev> INPUT|OUTPUT <chn> <attr>\r\n    -> <len>\n<data>\n   (len < 0: -errno)
//! WRITE <dev> INPUT|OUTPUT <chn> <attr> <len>\r\n<data>
//!                                             -> <written>\n       (< 0: -errno)
//! ```
//!
//! Devices are addressed by the id found in the context description. Each
//! exchange is bounded by the client timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, trace};

use crate::calibration::ADC_CHANNEL_COUNT;
use crate::error::{Result, TestError};
use crate::hardware::capabilities::{AnalogInput, AnalogOutput};

/// Output channel of the AD5683R.
pub const DAC_CHANNEL: &str = "voltage0";

/// Largest data block accepted from the daemon (the context XML is the biggest).
pub const MAX_REPLY_BYTES: usize = 1024 * 1024;

// =============================================================================
// Context description
// =============================================================================

/// Channel entry from the context XML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDescription {
    /// Channel id (e.g. `voltage0-voltage19`)
    pub id: String,
    /// Whether this is an output channel
    pub output: bool,
}

/// Device entry from the context XML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescription {
    /// Device id (e.g. `iio:device0`)
    pub id: String,
    /// Driver name (e.g. `ad7124-4`)
    pub name: Option<String>,
    /// Channels in context order
    pub channels: Vec<ChannelDescription>,
}

impl DeviceDescription {
    fn has_channel(&self, id: &str, output: bool) -> bool {
        self.channels.iter().any(|c| c.id == id && c.output == output)
    }
}

/// The subset of the context XML the test relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextDescription {
    /// Devices in context order
    pub devices: Vec<DeviceDescription>,
}

impl ContextDescription {
    /// Extract devices and channels from the `PRINT` reply.
    pub fn parse(xml: &str) -> Result<Self> {
        let device_re = compile(r"(?s)<device\s([^>]*)>(.*?)</device>")?;
        let channel_re = compile(r"<channel\s([^>]*)>")?;
        let attr_re = compile(r#"([A-Za-z_:-]+)="([^"]*)""#)?;

        let attr = |tag: &str, key: &str| -> Option<String> {
            attr_re
                .captures_iter(tag)
                .find(|c| &c[1] == key)
                .map(|c| c[2].to_string())
        };

        let mut devices = Vec::new();
        for dev in device_re.captures_iter(xml) {
            let Some(id) = attr(&dev[1], "id") else {
                return Err(TestError::Protocol("device element without id".into()));
            };
            let channels = channel_re
                .captures_iter(&dev[2])
                .filter_map(|ch| {
                    let id = attr(&ch[1], "id")?;
                    let output = attr(&ch[1], "type").as_deref() == Some("output");
                    Some(ChannelDescription { id, output })
                })
                .collect();
            devices.push(DeviceDescription {
                id,
                name: attr(&dev[1], "name"),
                channels,
            });
        }
        Ok(Self { devices })
    }

    /// Find a device by driver name or id.
    pub fn device(&self, name_or_id: &str) -> Option<&DeviceDescription> {
        self.devices
            .iter()
            .find(|d| d.name.as_deref() == Some(name_or_id))
            .or_else(|| self.devices.iter().find(|d| d.id == name_or_id))
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| TestError::Protocol(format!("bad pattern: {e}")))
}

// =============================================================================
// Client
// =============================================================================

/// Async client for one IIO daemon connection.
pub struct IiodClient {
    stream: Mutex<BufReader<TcpStream>>,
    timeout: Duration,
}

impl IiodClient {
    /// Connect to the daemon at `host:port`.
    ///
    /// Both a refused connection and a connect timeout are reported as
    /// [`TestError::Connection`].
    pub async fn connect(host: &str, port: u16, limit: Duration) -> Result<Self> {
        let uri = if host.contains(':') {
            format!("ip:[{host}]:{port}")
        } else {
            format!("ip:{host}:{port}")
        };

        let stream = match timeout(limit, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TestError::Connection {
                    uri,
                    message: e.to_string(),
                })
            }
            Err(_) => {
                return Err(TestError::Connection {
                    uri,
                    message: format!("no answer within {} ms", limit.as_millis()),
                })
            }
        };

        // Disable Nagle's algorithm for low latency
        stream.set_nodelay(true)?;

        info!("Connected to IIO daemon at {}:{}", host, port);

        Ok(Self {
            stream: Mutex::new(BufReader::new(stream)),
            timeout: limit,
        })
    }

    /// Fetch and parse the context description.
    pub async fn context(&self) -> Result<ContextDescription> {
        let xml = self.transact("PRINT".to_string(), None).await?;
        debug!(bytes = xml.len(), "Received context description");
        ContextDescription::parse(&xml)
    }

    /// Read a channel attribute as trimmed text.
    pub async fn read_channel_attr(
        &self,
        device: &str,
        channel: &str,
        output: bool,
        attr: &str,
    ) -> Result<String> {
        let command = format!("READ {device} {} {channel} {attr}", direction(output));
        self.transact(command, None).await
    }

    /// Write a channel attribute.
    pub async fn write_channel_attr(
        &self,
        device: &str,
        channel: &str,
        output: bool,
        attr: &str,
        value: &str,
    ) -> Result<()> {
        let command = format!(
            "WRITE {device} {} {channel} {attr} {}",
            direction(output),
            value.len()
        );
        self.transact(command, Some(value.as_bytes())).await?;
        Ok(())
    }

    /// Send one command and collect its reply.
    ///
    /// Commands with a payload (WRITE) reply with a status only; all others
    /// reply with a length-prefixed data block.
    async fn transact(&self, command: String, payload: Option<&[u8]>) -> Result<String> {
        let mut stream = self.stream.lock().await;

        let exchange = async {
            Self::flush_input_buffer(&mut stream).await;
            Self::send(&mut stream, &command, payload).await?;

            let status = Self::read_status(&mut stream, &command).await?;
            if payload.is_some() {
                return Ok(String::new());
            }
            if status > MAX_REPLY_BYTES {
                return Err(TestError::Protocol(format!(
                    "reply to '{command}' announces {status} bytes, limit is {MAX_REPLY_BYTES}"
                )));
            }

            let mut data = vec![0u8; status];
            stream.read_exact(&mut data).await?;
            // Trailing newline after the data block, sent even when it is empty
            let mut newline = [0u8; 1];
            stream.read_exact(&mut newline).await?;

            let text = String::from_utf8_lossy(&data)
                .trim_matches(|c: char| c == '\0' || c.is_whitespace())
                .to_string();
            trace!(command = %command, reply = %text, "IIOD reply");
            Ok(text)
        };

        match timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(TestError::Timeout {
                command: command.clone(),
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    async fn send(
        stream: &mut BufReader<TcpStream>,
        command: &str,
        payload: Option<&[u8]>,
    ) -> Result<()> {
        debug!("IIOD command: {:?}", command);

        let writer = stream.get_mut();
        writer.write_all(command.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
        if let Some(data) = payload {
            writer.write_all(data).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    /// Read the integer status line; negative values are errno codes.
    async fn read_status(stream: &mut BufReader<TcpStream>, command: &str) -> Result<usize> {
        let mut line = String::new();
        if stream.read_line(&mut line).await? == 0 {
            return Err(TestError::Protocol(
                "connection closed by instrument".to_string(),
            ));
        }

        let status: i64 = line.trim().parse().map_err(|_| {
            TestError::Protocol(format!(
                "expected integer reply to '{command}', got {:?}",
                line.trim()
            ))
        })?;

        if status < 0 {
            return Err(TestError::Remote {
                command: command.to_string(),
                errno: i32::try_from(-status).unwrap_or(i32::MAX),
            });
        }
        usize::try_from(status)
            .map_err(|_| TestError::Protocol(format!("reply length {status} out of range")))
    }

    /// Discard any bytes left over from an aborted exchange.
    async fn flush_input_buffer(stream: &mut BufReader<TcpStream>) {
        let buffered = stream.buffer().len();
        if buffered > 0 {
            debug!("Flushing {} bytes from buffer", buffered);
            stream.consume(buffered);
        }

        let mut discard = [0u8; 256];
        loop {
            match stream.get_mut().try_read(&mut discard) {
                Ok(0) | Err(_) => break,
                Ok(n) => debug!("Flushed {} stale bytes from stream", n),
            }
        }
    }
}

fn direction(output: bool) -> &'static str {
    if output {
        "OUTPUT"
    } else {
        "INPUT"
    }
}

// =============================================================================
// Devices
// =============================================================================

/// AD7124 reached through the IIO daemon.
pub struct IiodAdc {
    client: Arc<IiodClient>,
    device: String,
    name: String,
    channels: Vec<String>,
}

impl IiodAdc {
    /// Bind to the ADC named `part` in `context`.
    ///
    /// Channel `i` is the i-th input channel of the device unless
    /// `channel_ids` lists them explicitly.
    pub fn open(
        client: Arc<IiodClient>,
        context: &ContextDescription,
        part: &str,
        channel_ids: Option<&[String]>,
    ) -> Result<Self> {
        let dev = context
            .device(part)
            .ok_or_else(|| TestError::DeviceNotFound(part.to_string()))?;

        let channels: Vec<String> = match channel_ids {
            Some(ids) => {
                if let Some(missing) = ids.iter().find(|id| !dev.has_channel(id, false)) {
                    return Err(TestError::ChannelNotFound {
                        device: part.to_string(),
                        channel: missing.clone(),
                    });
                }
                ids.to_vec()
            }
            None => dev
                .channels
                .iter()
                .filter(|c| !c.output && c.id != "timestamp")
                .map(|c| c.id.clone())
                .collect(),
        };

        if channels.len() < ADC_CHANNEL_COUNT {
            return Err(TestError::ChannelNotFound {
                device: part.to_string(),
                channel: channels.len().to_string(),
            });
        }

        debug!(device = %dev.id, channels = ?channels, "Bound ADC");

        Ok(Self {
            client,
            device: dev.id.clone(),
            name: part.to_string(),
            channels,
        })
    }

    fn channel_id(&self, channel: usize) -> Result<&str> {
        self.channels
            .get(channel)
            .map(String::as_str)
            .ok_or_else(|| TestError::ChannelNotFound {
                device: self.name.clone(),
                channel: channel.to_string(),
            })
    }
}

#[async_trait]
impl AnalogInput for IiodAdc {
    fn name(&self) -> &str {
        &self.name
    }

    fn channel_count(&self) -> usize {
        self.channels.len()
    }

    async fn set_sample_rate(&self, samples_per_second: u32) -> Result<()> {
        let value = samples_per_second.to_string();
        for channel in &self.channels {
            self.client
                .write_channel_attr(&self.device, channel, false, "sampling_frequency", &value)
                .await?;
        }
        Ok(())
    }

    async fn set_channel_scale(&self, channel: usize, scale: f64) -> Result<()> {
        let id = self.channel_id(channel)?;
        self.client
            .write_channel_attr(&self.device, id, false, "scale", &scale.to_string())
            .await
    }

    async fn read_raw(&self, channel: usize) -> Result<i64> {
        let id = self.channel_id(channel)?;
        let text = self
            .client
            .read_channel_attr(&self.device, id, false, "raw")
            .await?;
        text.parse().map_err(|_| TestError::Parse {
            attr: format!("{id}/raw"),
            value: text,
        })
    }
}

/// AD5683R reached through the IIO daemon.
pub struct IiodDac {
    client: Arc<IiodClient>,
    device: String,
    name: String,
}

impl IiodDac {
    /// Bind to the DAC named `part` in `context`.
    pub fn open(client: Arc<IiodClient>, context: &ContextDescription, part: &str) -> Result<Self> {
        let dev = context
            .device(part)
            .ok_or_else(|| TestError::DeviceNotFound(part.to_string()))?;
        if !dev.has_channel(DAC_CHANNEL, true) {
            return Err(TestError::ChannelNotFound {
                device: part.to_string(),
                channel: DAC_CHANNEL.to_string(),
            });
        }

        Ok(Self {
            client,
            device: dev.id.clone(),
            name: part.to_string(),
        })
    }
}

#[async_trait]
impl AnalogOutput for IiodDac {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write_raw(&self, code: i64) -> Result<()> {
        self.client
            .write_channel_attr(&self.device, DAC_CHANNEL, true, "raw", &code.to_string())
            .await
    }

    async fn scale(&self) -> Result<f64> {
        let text = self
            .client
            .read_channel_attr(&self.device, DAC_CHANNEL, true, "scale")
            .await?;
        text.parse().map_err(|_| TestError::Parse {
            attr: format!("{DAC_CHANNEL}/scale"),
            value: text,
        })
    }
}
