//! CN0508 Production Test Procedure
//!
//! The fixed sequence run against every board coming off the line:
//!
//! ```text
//! connect ─▶ calibrate ─▶ initial readout ─▶ zero output ─▶ pot gate
//!                                                              │
//!      verdict ◀─ close ◀─ DAC = 0 ◀─ current limit ◀─ OR circuit
//! ```
//!
//! Threshold checks ([`step`]) never abort the run; a reading outside its
//! window appends a message to the [`FailureList`]. Device errors, a closed
//! operator terminal, an exhausted pot gate, Ctrl-C and panics do abort it,
//! and [`panic_safety`] forces the DAC back to zero before any of them
//! surfaces.
//!
//! # Example
//!
//! ```rust,ignore
//! use cn0508_production_test::procedures;
//!
//! let mut operator = ConsoleOperator::new();
//! match procedures::run(&config, &ScaleTable::cn0508(), &mut operator, ctrl_c).await? {
//!     RunOutcome::Completed(report) if report.passed() => { /* ship it */ }
//!     RunOutcome::Completed(_) => { /* set aside for debug */ }
//!     RunOutcome::NoDevice(_) => { /* check cabling */ }
//! }
//! ```

pub mod panic_safety;
pub mod result;
pub mod step;

use std::future::Future;

use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::calibration::{
    dac_code_for_setpoint, Quantity, ScaleTable, ADC_CHANNEL_COUNT, DAC_CALIBRATION_CODE,
};
use crate::config::{PotGatePolicy, TestConfig, TimingConfig};
use crate::error::{Result, TestError};
use crate::hardware::{AnalogInput, AnalogOutput, Instrument};
use crate::operator::Operator;

// Re-exports
pub use panic_safety::{with_output_safety, SAFE_OUTPUT_CODE};
pub use result::{BoardConditions, FailureList, PotPositions, RunOutcome, TestReport};
pub use step::{
    AcceptanceWindow, StepOutcome, ThresholdCheck, CURRENT_LIMIT, OR_CIRCUIT,
    POT_POSITION_WINDOW, ZERO_OUTPUT,
};

/// ADC sample rate used for every reading.
pub const ADC_SAMPLE_RATE_HZ: u32 = 9600;

/// Output setpoint for the zero-output test.
pub const ZERO_OUTPUT_SETPOINT_VOLTS: f64 = 0.0;

/// Output setpoint for the pot gate and OR-circuit test.
pub const OR_CIRCUIT_SETPOINT_VOLTS: f64 = 18.0;

/// Instruction shown for the potentiometer gate.
pub const POT_INSTRUCTION: &str = "Set both potentiometers to 3:45 position";

/// Instruction shown before the current-limit test.
pub const LOAD_INSTRUCTION: &str =
    "Connect a 4-ohm, 50W resistor ON A HEAT SINK to output of the board";

/// The production test bound to one scale table and timing profile.
#[derive(Debug, Clone)]
pub struct ProductionTest<'a> {
    scales: &'a ScaleTable,
    timing: TimingConfig,
    pot_gate: PotGatePolicy,
}

impl<'a> ProductionTest<'a> {
    /// Create a test with explicit timing and pot gate policy.
    pub fn new(scales: &'a ScaleTable, timing: TimingConfig, pot_gate: PotGatePolicy) -> Self {
        Self {
            scales,
            timing,
            pot_gate,
        }
    }

    /// Create a test from the loaded configuration.
    pub fn from_config(scales: &'a ScaleTable, config: &TestConfig) -> Self {
        Self::new(scales, config.timing.clone(), config.pot_gate.clone())
    }

    /// Run every step on an open instrument, then zero the DAC and close it.
    ///
    /// `interrupt` resolving aborts the run with [`TestError::Interrupted`].
    /// The DAC is written to zero on every path, including panics.
    pub async fn execute<I>(
        &self,
        instrument: Instrument,
        operator: &mut dyn Operator,
        interrupt: I,
    ) -> Result<TestReport>
    where
        I: Future<Output = ()>,
    {
        let result = with_output_safety(
            instrument.dac(),
            interrupt,
            self.execute_steps(&instrument, operator),
        )
        .await;

        instrument.close().await;
        result
    }

    /// Steps 2 to 9 of the sequence. Leaves the DAC at the last setpoint.
    async fn execute_steps(
        &self,
        instrument: &Instrument,
        operator: &mut dyn Operator,
    ) -> Result<TestReport> {
        let adc = instrument.adc();
        let dac = instrument.dac();
        let mut failures = FailureList::new();

        // Calibration
        println!("setting up DAC, setting output to 2.5V...");
        dac.write_raw(DAC_CALIBRATION_CODE).await?;
        let dac_scale = dac.scale().await?;
        println!("DAC scale factor: {dac_scale}");

        println!("Setting sample rates...");
        adc.set_sample_rate(ADC_SAMPLE_RATE_HZ).await?;

        println!(
            "Setting scales to {} (unity gain)...",
            self.scales.adc_code_to_volts()
        );
        if adc.channel_count() < ADC_CHANNEL_COUNT {
            return Err(TestError::ChannelNotFound {
                device: adc.name().to_string(),
                channel: ADC_CHANNEL_COUNT.saturating_sub(1).to_string(),
            });
        }
        for channel in 0..ADC_CHANNEL_COUNT {
            adc.set_channel_scale(channel, self.scales.adc_code_to_volts())
                .await?;
        }

        // Initial readout
        println!("Reading all voltages...\n\n");
        let initial_conditions = self.read_conditions(adc).await?;
        print!("{initial_conditions}");

        println!("\n\nStarting Production Test! Connect Fluke 87 or equivalent meter");
        println!("to output jacks. Do not connect any additional load");

        // Zero output
        self.set_output(dac, dac_scale, ZERO_OUTPUT_SETPOINT_VOLTS)
            .await?;
        let outcome = ZERO_OUTPUT.evaluate(self.measure(adc, ZERO_OUTPUT.quantity).await?);
        if outcome.success {
            println!("Zero output voltage: {:.3}, test PASSES!", outcome.value);
        } else {
            println!("Zero output voltage test FAILS!");
        }
        record(&outcome, &mut failures);

        // Pot gate
        let (pot_positions, pot_reprompts) = self.pot_gate(adc, dac, dac_scale, operator).await?;

        // OR circuit, same DAC setting
        let outcome = OR_CIRCUIT.evaluate(self.measure(adc, OR_CIRCUIT.quantity).await?);
        if outcome.success {
            println!("Output voltage: {:.3}, test PASSES!", outcome.value);
        } else {
            println!("Precision diode OR circuitry FAILS!");
        }
        record(&outcome, &mut failures);

        // Current limit
        operator.confirm(LOAD_INSTRUCTION).await?;
        sleep(self.timing.load_settle()).await;
        let outcome = CURRENT_LIMIT.evaluate(self.measure(adc, CURRENT_LIMIT.quantity).await?);
        if outcome.success {
            println!("Current limit test PASS!");
        } else {
            println!("Current limit test FAILS");
        }
        record(&outcome, &mut failures);

        Ok(TestReport {
            dac_scale,
            initial_conditions,
            pot_positions,
            pot_reprompts,
            failures,
        })
    }

    /// Block until both potentiometers sit inside [`POT_POSITION_WINDOW`].
    ///
    /// Returns the accepted positions and how many re-prompts it took.
    async fn pot_gate(
        &self,
        adc: &dyn AnalogInput,
        dac: &dyn AnalogOutput,
        dac_scale: f64,
        operator: &mut dyn Operator,
    ) -> Result<(PotPositions, u32)> {
        operator.confirm(POT_INSTRUCTION).await?;
        self.set_output(dac, dac_scale, OR_CIRCUIT_SETPOINT_VOLTS)
            .await?;

        let mut pots = self.read_pots(adc).await?;
        let mut reprompts: u32 = 0;

        while !(POT_POSITION_WINDOW.contains(pots.ilim) && POT_POSITION_WINDOW.contains(pots.vout)) {
            println!("Pot positions fail!");
            println!("Ilim pot position: {} %", pots.ilim);
            println!("Vout pot position: {} %", pots.vout);

            if self
                .pot_gate
                .max_prompts
                .is_some_and(|max| reprompts >= max)
            {
                warn!(reprompts, "Potentiometer gate exhausted");
                return Err(TestError::PotGateExhausted { prompts: reprompts });
            }

            operator.confirm(POT_INSTRUCTION).await?;
            reprompts += 1;
            sleep(self.timing.dac_settle()).await;
            pots = self.read_pots(adc).await?;
        }

        println!("Ilim pot position: {} %, ILIM POT PASS!", pots.ilim);
        println!("Vout pot position: {} %, Vout POT PASS!", pots.vout);
        info!(ilim = pots.ilim, vout = pots.vout, reprompts, "Potentiometers in range");
        Ok((pots, reprompts))
    }

    async fn read_conditions(&self, adc: &dyn AnalogInput) -> Result<BoardConditions> {
        let mut conditions = BoardConditions::default();
        for quantity in Quantity::ALL {
            conditions.set(quantity, self.measure(adc, quantity).await?);
        }
        Ok(conditions)
    }

    async fn read_pots(&self, adc: &dyn AnalogInput) -> Result<PotPositions> {
        Ok(PotPositions {
            ilim: self.measure(adc, Quantity::IlimPotPosition).await?,
            vout: self.measure(adc, Quantity::VoutPotPosition).await?,
        })
    }

    async fn measure(&self, adc: &dyn AnalogInput, quantity: Quantity) -> Result<f64> {
        let raw = adc.read_raw(quantity.channel()).await?;
        let value = self.scales.convert(quantity, raw);
        debug!(%quantity, raw, value, "Measured");
        Ok(value)
    }

    /// Command an output voltage and wait for it to settle.
    async fn set_output(&self, dac: &dyn AnalogOutput, dac_scale: f64, volts: f64) -> Result<()> {
        let code = dac_code_for_setpoint(volts, dac_scale);
        info!(setpoint_volts = volts, code, "Setting output");
        dac.write_raw(code).await?;
        sleep(self.timing.dac_settle()).await;
        Ok(())
    }
}

fn record(outcome: &StepOutcome, failures: &mut FailureList) {
    match outcome.error {
        Some(message) => {
            warn!(check = outcome.name, value = outcome.value, "Check failed");
            failures.push(message);
        }
        None => debug!(check = outcome.name, value = outcome.value, "Check passed"),
    }
}

/// Connect to the board named in `config` and run the production test.
///
/// A connection failure is not an error: it prints `No device found` and
/// returns [`RunOutcome::NoDevice`] without touching the hardware. Errors
/// after connecting are returned once the DAC has been zeroed.
#[instrument(skip_all, fields(uri = %config.instrument.uri))]
pub async fn run<I>(
    config: &TestConfig,
    scales: &ScaleTable,
    operator: &mut dyn Operator,
    interrupt: I,
) -> Result<RunOutcome>
where
    I: Future<Output = ()>,
{
    println!("Connecting with CN0508 context at {}", config.instrument.uri);

    let instrument = match Instrument::connect(&config.instrument).await {
        Ok(instrument) => instrument,
        Err(e) => {
            warn!(error = %e, "Instrument not available");
            println!("No device found");
            return Ok(RunOutcome::NoDevice(e));
        }
    };

    let report = ProductionTest::from_config(scales, config)
        .execute(instrument, operator, interrupt)
        .await?;

    info!(
        passed = report.passed(),
        failures = report.failures.len(),
        "Production test complete"
    );
    print!("{report}");
    Ok(RunOutcome::Completed(report))
}
