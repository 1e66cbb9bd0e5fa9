//! Simulated CN0508 board.
//!
//! Provides a board that can be driven without hardware, for `sim:` URIs and
//! for tests. Readings are scripted per quantity in engineering units:
//!
//! - each read of a channel takes the next scripted value
//! - the last scripted value repeats once the script is exhausted
//! - unscripted channels read code 0
//!
//! Every DAC write, scale write and sample rate change is recorded so tests
//! can assert on what the runner did to the board.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use crate::calibration::{Quantity, ScaleTable, ADC_CHANNEL_COUNT};
use crate::error::{Result, TestError};
use crate::hardware::capabilities::{AnalogInput, AnalogOutput};
use crate::hardware::Instrument;

/// AD5683R scale with the 2.5 V internal reference, mV per code.
pub const DEFAULT_DAC_SCALE: f64 = 0.038146972;

#[derive(Debug, Default)]
struct BoardState {
    readings: HashMap<usize, VecDeque<i64>>,
    reads: HashMap<usize, usize>,
    fail_after: HashMap<usize, usize>,
    dac_writes: Vec<i64>,
    dac_scale: f64,
    sample_rate: Option<u32>,
    channel_scales: HashMap<usize, f64>,
    closed: bool,
}

/// A scripted stand-in for the board and its instrument.
///
/// Cloning shares the same simulated state.
#[derive(Clone)]
pub struct SimulatedBoard {
    state: Arc<Mutex<BoardState>>,
    scales: ScaleTable,
}

impl Default for SimulatedBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBoard {
    /// A board with nothing scripted: every channel reads 0.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BoardState {
                dac_scale: DEFAULT_DAC_SCALE,
                ..BoardState::default()
            })),
            scales: ScaleTable::cn0508(),
        }
    }

    /// A healthy board that passes every check.
    ///
    /// Output current reads 0 A at the initial readout and 1.5 A once the
    /// load resistor is attached.
    pub fn passing() -> Self {
        Self::new()
            .with_readings(Quantity::U2Temperature, [25.0])
            .with_readings(Quantity::U3Temperature, [25.0])
            .with_readings(Quantity::OutputCurrent, [0.0, 1.5])
            .with_readings(Quantity::InputVoltage, [24.0])
            .with_readings(Quantity::OutputVoltage, [0.0])
            .with_readings(Quantity::IlimPotPosition, [50.0])
            .with_readings(Quantity::VoutPotPosition, [50.0])
    }

    /// Script the values read back for a quantity, in engineering units.
    pub fn with_readings(self, quantity: Quantity, values: impl IntoIterator<Item = f64>) -> Self {
        let codes: VecDeque<i64> = values
            .into_iter()
            .map(|v| self.scales.raw_for(quantity, v))
            .collect();
        self.lock().readings.insert(quantity.channel(), codes);
        self
    }

    /// Script raw ADC codes for a channel.
    pub fn with_raw_codes(self, channel: usize, codes: impl IntoIterator<Item = i64>) -> Self {
        self.lock()
            .readings
            .insert(channel, codes.into_iter().collect());
        self
    }

    /// Make reads of `quantity` fail after `good_reads` successful ones.
    pub fn fail_after(self, quantity: Quantity, good_reads: usize) -> Self {
        self.lock().fail_after.insert(quantity.channel(), good_reads);
        self
    }

    /// Override the DAC scale factor reported by the board.
    pub fn with_dac_scale(self, scale: f64) -> Self {
        self.lock().dac_scale = scale;
        self
    }

    /// Open the simulated ADC and DAC as an instrument.
    pub fn instrument(&self) -> Instrument {
        Instrument::new(
            Box::new(SimulatedAdc {
                state: Arc::clone(&self.state),
            }),
            Box::new(SimulatedDac {
                state: Arc::clone(&self.state),
            }),
        )
    }

    /// Every code written to the DAC, in order.
    pub fn dac_writes(&self) -> Vec<i64> {
        self.lock().dac_writes.clone()
    }

    /// The DAC code currently applied.
    pub fn dac_code(&self) -> Option<i64> {
        self.lock().dac_writes.last().copied()
    }

    /// Sample rate last written to the ADC.
    pub fn sample_rate(&self) -> Option<u32> {
        self.lock().sample_rate
    }

    /// Scale register last written to an ADC channel.
    pub fn channel_scale(&self, channel: usize) -> Option<f64> {
        self.lock().channel_scales.get(&channel).copied()
    }

    /// How many times a quantity's channel was read.
    pub fn read_count(&self, quantity: Quantity) -> usize {
        self.lock()
            .reads
            .get(&quantity.channel())
            .copied()
            .unwrap_or(0)
    }

    /// Whether the instrument was released.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, BoardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock(state: &Mutex<BoardState>) -> MutexGuard<'_, BoardState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

struct SimulatedAdc {
    state: Arc<Mutex<BoardState>>,
}

#[async_trait]
impl AnalogInput for SimulatedAdc {
    fn name(&self) -> &str {
        "ad7124-4"
    }

    fn channel_count(&self) -> usize {
        ADC_CHANNEL_COUNT
    }

    async fn set_sample_rate(&self, samples_per_second: u32) -> Result<()> {
        lock(&self.state).sample_rate = Some(samples_per_second);
        Ok(())
    }

    async fn set_channel_scale(&self, channel: usize, scale: f64) -> Result<()> {
        if channel >= ADC_CHANNEL_COUNT {
            return Err(TestError::ChannelNotFound {
                device: self.name().to_string(),
                channel: channel.to_string(),
            });
        }
        lock(&self.state).channel_scales.insert(channel, scale);
        Ok(())
    }

    async fn read_raw(&self, channel: usize) -> Result<i64> {
        if channel >= ADC_CHANNEL_COUNT {
            return Err(TestError::ChannelNotFound {
                device: self.name().to_string(),
                channel: channel.to_string(),
            });
        }

        let mut state = lock(&self.state);
        let reads = state.reads.get(&channel).copied().unwrap_or(0);
        if state.fail_after.get(&channel).is_some_and(|&limit| reads >= limit) {
            return Err(TestError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("simulated ADC channel {channel} stopped responding"),
            )));
        }
        state.reads.insert(channel, reads + 1);

        let code = match state.readings.get_mut(&channel) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(0),
            Some(queue) => queue.front().copied().unwrap_or(0),
            None => 0,
        };
        debug!(channel, code, "Simulated ADC read");
        Ok(code)
    }

    async fn close(&self) -> Result<()> {
        lock(&self.state).closed = true;
        Ok(())
    }
}

struct SimulatedDac {
    state: Arc<Mutex<BoardState>>,
}

#[async_trait]
impl AnalogOutput for SimulatedDac {
    fn name(&self) -> &str {
        "ad5683r"
    }

    async fn write_raw(&self, code: i64) -> Result<()> {
        debug!(code, "Simulated DAC write");
        lock(&self.state).dac_writes.push(code);
        Ok(())
    }

    async fn scale(&self) -> Result<f64> {
        Ok(lock(&self.state).dac_scale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_readings_advance_then_stick() {
        let board = SimulatedBoard::new().with_readings(Quantity::OutputVoltage, [1.0, 17.0]);
        let instrument = board.instrument();
        let table = ScaleTable::cn0508();
        let ch = Quantity::OutputVoltage.channel();

        let first = table.convert(Quantity::OutputVoltage, instrument.adc().read_raw(ch).await.unwrap());
        let second = table.convert(Quantity::OutputVoltage, instrument.adc().read_raw(ch).await.unwrap());
        let third = table.convert(Quantity::OutputVoltage, instrument.adc().read_raw(ch).await.unwrap());

        assert!((first - 1.0).abs() < 1e-3);
        assert!((second - 17.0).abs() < 1e-3);
        assert!((third - 17.0).abs() < 1e-3);
        assert_eq!(board.read_count(Quantity::OutputVoltage), 3);
    }

    #[tokio::test]
    async fn raw_codes_are_returned_verbatim() {
        let board = SimulatedBoard::new().with_raw_codes(5, [8_388_643, -1]);
        let instrument = board.instrument();
        let adc = instrument.adc();

        assert_eq!(adc.read_raw(5).await.unwrap(), 8_388_643);
        assert_eq!(adc.read_raw(5).await.unwrap(), -1);
        assert_eq!(adc.read_raw(5).await.unwrap(), -1);
        assert_eq!(board.read_count(Quantity::IlimPotPosition), 3);
    }

    #[tokio::test]
    async fn unscripted_channel_reads_zero() {
        let board = SimulatedBoard::new();
        assert_eq!(board.instrument().adc().read_raw(7).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn records_dac_writes_and_close() {
        let board = SimulatedBoard::new();
        let instrument = board.instrument();
        instrument.dac().write_raw(11000).await.unwrap();
        instrument.dac().write_raw(0).await.unwrap();
        instrument.close().await;

        assert_eq!(board.dac_writes(), vec![11000, 0]);
        assert_eq!(board.dac_code(), Some(0));
        assert!(board.is_closed());
    }

    #[tokio::test]
    async fn injected_failure_after_good_reads() {
        let board = SimulatedBoard::new().fail_after(Quantity::OutputCurrent, 1);
        let instrument = board.instrument();
        let ch = Quantity::OutputCurrent.channel();

        assert!(instrument.adc().read_raw(ch).await.is_ok());
        assert!(matches!(
            instrument.adc().read_raw(ch).await,
            Err(TestError::Io(_))
        ));
    }

    #[tokio::test]
    async fn rejects_out_of_range_channel() {
        let board = SimulatedBoard::new();
        let err = board.instrument().adc().read_raw(8).await.unwrap_err();
        assert!(matches!(err, TestError::ChannelNotFound { .. }));
    }
}
