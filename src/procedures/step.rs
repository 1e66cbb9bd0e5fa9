//! Test Steps - Acceptance Windows and Outcomes
//!
//! Each numeric check compares one engineering-unit reading against a fixed
//! acceptance window. A check never aborts the run: a value outside the window
//! produces a failed [`StepOutcome`] carrying the failure message that goes
//! into the report.

use crate::calibration::Quantity;

// =============================================================================
// Acceptance Window
// =============================================================================

/// Range of accepted values.
///
/// Bounds are either both exclusive or both inclusive. A missing bound is
/// unbounded. NaN is never accepted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcceptanceWindow {
    min: Option<f64>,
    max: Option<f64>,
    inclusive: bool,
}

impl AcceptanceWindow {
    /// `min < value < max`
    pub const fn open(min: f64, max: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
            inclusive: false,
        }
    }

    /// `min <= value <= max`
    pub const fn closed(min: f64, max: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
            inclusive: true,
        }
    }

    /// `value < max`
    pub const fn below(max: f64) -> Self {
        Self {
            min: None,
            max: Some(max),
            inclusive: false,
        }
    }

    /// Whether `value` is accepted.
    pub fn contains(&self, value: f64) -> bool {
        if value.is_nan() {
            return false;
        }
        let above_min = self.min.map_or(true, |min| {
            if self.inclusive {
                value >= min
            } else {
                value > min
            }
        });
        let below_max = self.max.map_or(true, |max| {
            if self.inclusive {
                value <= max
            } else {
                value < max
            }
        });
        above_min && below_max
    }
}

// =============================================================================
// Threshold Checks
// =============================================================================

/// A recorded pass/fail check on one quantity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdCheck {
    /// Short identifier used in logs
    pub name: &'static str,
    /// Quantity measured
    pub quantity: Quantity,
    /// Accepted range
    pub window: AcceptanceWindow,
    /// Message appended to the failure list when the check fails
    pub failure_message: &'static str,
}

/// Output must sit at 0 V, which needs the negative rail to sink current.
pub const ZERO_OUTPUT: ThresholdCheck = ThresholdCheck {
    name: "zero_output",
    quantity: Quantity::OutputVoltage,
    window: AcceptanceWindow::open(-0.01, 0.01),
    failure_message: "Fails zero output test",
};

/// With the DAC asking for 18 V, the precision-diode OR circuit must hold the
/// output below the potentiometer setting.
pub const OR_CIRCUIT: ThresholdCheck = ThresholdCheck {
    name: "or_circuit",
    quantity: Quantity::OutputVoltage,
    window: AcceptanceWindow::below(16.0),
    failure_message: "Fails OR circuit test",
};

/// Into a 4 ohm load the output must current-limit at roughly 1.5 A.
pub const CURRENT_LIMIT: ThresholdCheck = ThresholdCheck {
    name: "current_limit",
    quantity: Quantity::OutputCurrent,
    window: AcceptanceWindow::open(1.0, 2.0),
    failure_message: "Fails current limit test",
};

/// Both potentiometers must be near mid travel before the OR circuit test.
pub const POT_POSITION_WINDOW: AcceptanceWindow = AcceptanceWindow::closed(40.0, 60.0);

impl ThresholdCheck {
    /// Judge a reading.
    pub fn evaluate(&self, value: f64) -> StepOutcome {
        if self.window.contains(value) {
            StepOutcome::success(self.name, value)
        } else {
            StepOutcome::failure(self.name, value, self.failure_message)
        }
    }
}

// =============================================================================
// Step Outcome
// =============================================================================

/// Result of one threshold check.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    /// Check that produced this outcome
    pub name: &'static str,
    /// Whether the reading was accepted
    pub success: bool,
    /// The reading that was judged
    pub value: f64,
    /// Failure message, present when `success` is false
    pub error: Option<&'static str>,
}

impl StepOutcome {
    /// Create a successful outcome
    pub fn success(name: &'static str, value: f64) -> Self {
        Self {
            name,
            success: true,
            value,
            error: None,
        }
    }

    /// Create a failed outcome
    pub fn failure(name: &'static str, value: f64, error: &'static str) -> Self {
        Self {
            name,
            success: false,
            value,
            error: Some(error),
        }
    }
}
