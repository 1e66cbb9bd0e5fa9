//! Channel calibration for the CN0508 board.
//!
//! Every engineering-unit reading is derived the same way:
//!
//! ```text
//! value = raw_code * adc_code_to_volts * quantity_scale
//! ```
//!
//! `adc_code_to_volts` is written into every ADC channel's scale register
//! before the first reading (unity gain baseline). The per-quantity scale then
//! accounts for the board's dividers and sensors.

use std::fmt;

/// ADC code-to-volts factor for the AD7124 at Vref = 2.5 V.
pub const ADC_CODE_TO_VOLTS: f64 = 0.000149011;

/// DAC code that produces 2.5 V at the op-amp output during setup.
pub const DAC_CALIBRATION_CODE: i64 = 11000;

/// Gain of the CN0508 output stage between the DAC and the output jacks.
pub const OUTPUT_STAGE_GAIN: f64 = 11.0;

/// Number of ADC channels whose scale register is initialized.
pub const ADC_CHANNEL_COUNT: usize = 8;

/// Physical quantities monitored by the ADC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quantity {
    /// Temperature of LDO U2
    U2Temperature,
    /// Temperature of LDO U3
    U3Temperature,
    /// Output current
    OutputCurrent,
    /// Input voltage
    InputVoltage,
    /// Output voltage
    OutputVoltage,
    /// Current-limit potentiometer position
    IlimPotPosition,
    /// Output-voltage potentiometer position
    VoutPotPosition,
}

impl Quantity {
    /// All quantities in ADC channel order.
    pub const ALL: [Quantity; 7] = [
        Quantity::U2Temperature,
        Quantity::U3Temperature,
        Quantity::OutputCurrent,
        Quantity::InputVoltage,
        Quantity::OutputVoltage,
        Quantity::IlimPotPosition,
        Quantity::VoutPotPosition,
    ];

    /// ADC channel wired to this quantity.
    pub fn channel(self) -> usize {
        match self {
            Quantity::U2Temperature => 0,
            Quantity::U3Temperature => 1,
            Quantity::OutputCurrent => 2,
            Quantity::InputVoltage => 3,
            Quantity::OutputVoltage => 4,
            Quantity::IlimPotPosition => 5,
            Quantity::VoutPotPosition => 6,
        }
    }

    /// Engineering unit symbol.
    pub fn unit(self) -> &'static str {
        match self {
            Quantity::U2Temperature | Quantity::U3Temperature => "C",
            Quantity::OutputCurrent => "A",
            Quantity::InputVoltage | Quantity::OutputVoltage => "V",
            Quantity::IlimPotPosition | Quantity::VoutPotPosition => "%",
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Quantity::U2Temperature => "U2 Temperature",
            Quantity::U3Temperature => "U3 Temperature",
            Quantity::OutputCurrent => "Output Current",
            Quantity::InputVoltage => "Input Voltage",
            Quantity::OutputVoltage => "Output Voltage",
            Quantity::IlimPotPosition => "ILIM pot position",
            Quantity::VoutPotPosition => "Vout pot position",
        };
        f.write_str(label)
    }
}

/// Immutable calibration table for one run.
///
/// Built once at startup and handed to the runner by reference.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleTable {
    adc_code_to_volts: f64,
    u2_temperature: f64,
    u3_temperature: f64,
    output_current: f64,
    input_voltage: f64,
    output_voltage: f64,
    ilim_pot_position: f64,
    vout_pot_position: f64,
}

impl ScaleTable {
    /// Calibration of the CN0508 reference design.
    pub fn cn0508() -> Self {
        Self {
            adc_code_to_volts: ADC_CODE_TO_VOLTS,
            // degrees C per mV
            u2_temperature: 1.0,
            u3_temperature: 1.0,
            // A per mV
            output_current: 0.005,
            // 1 / (21.5 / 1.5) divider
            input_voltage: 14.33 / 1000.0,
            // 1 / (22.1 / 2.1) divider
            output_voltage: 10.52 / 1000.0,
            // percent of 2.5 V full travel
            ilim_pot_position: 100.0 / (2.5 * 1000.0),
            vout_pot_position: 100.0 / (2.5 * 1000.0),
        }
    }

    /// Factor written to every ADC channel scale register.
    pub fn adc_code_to_volts(&self) -> f64 {
        self.adc_code_to_volts
    }

    /// Multiplier for a quantity, applied after the code-to-volts factor.
    pub fn scale(&self, quantity: Quantity) -> f64 {
        match quantity {
            Quantity::U2Temperature => self.u2_temperature,
            Quantity::U3Temperature => self.u3_temperature,
            Quantity::OutputCurrent => self.output_current,
            Quantity::InputVoltage => self.input_voltage,
            Quantity::OutputVoltage => self.output_voltage,
            Quantity::IlimPotPosition => self.ilim_pot_position,
            Quantity::VoutPotPosition => self.vout_pot_position,
        }
    }

    /// Convert a raw ADC code into engineering units.
    pub fn convert(&self, quantity: Quantity, raw: i64) -> f64 {
        (raw as f64 * self.adc_code_to_volts) * self.scale(quantity)
    }

    /// Raw ADC code that converts back to `value` (used by the simulator).
    pub fn raw_for(&self, quantity: Quantity, value: f64) -> i64 {
        (value / self.scale(quantity) / self.adc_code_to_volts).round() as i64
    }
}

impl Default for ScaleTable {
    fn default() -> Self {
        Self::cn0508()
    }
}

/// DAC code for an output setpoint in volts.
///
/// Truncates toward zero, matching the integer conversion the board was
/// characterized with.
pub fn dac_code_for_setpoint(setpoint_volts: f64, dac_scale: f64) -> i64 {
    (setpoint_volts * 1000.0 / (OUTPUT_STAGE_GAIN * dac_scale)) as i64
}
