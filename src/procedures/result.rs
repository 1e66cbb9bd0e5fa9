//! Test Results
//!
//! What a production test run produces: the initial board conditions, the
//! potentiometer positions that satisfied the gate, and the ordered failure
//! list that decides the verdict.

use std::fmt;

use crate::calibration::Quantity;

// =============================================================================
// Board Conditions
// =============================================================================

/// One snapshot of every monitored quantity, in engineering units.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BoardConditions {
    /// LDO U2 temperature, degrees C
    pub u2_temperature: f64,
    /// LDO U3 temperature, degrees C
    pub u3_temperature: f64,
    /// Output current, A
    pub output_current: f64,
    /// Input voltage, V
    pub input_voltage: f64,
    /// Output voltage, V
    pub output_voltage: f64,
    /// Current-limit potentiometer, percent of travel
    pub ilim_pot_position: f64,
    /// Output-voltage potentiometer, percent of travel
    pub vout_pot_position: f64,
}

impl BoardConditions {
    /// Value of one quantity.
    pub fn get(&self, quantity: Quantity) -> f64 {
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

    /// Set one quantity.
    pub fn set(&mut self, quantity: Quantity, value: f64) {
        let slot = match quantity {
            Quantity::U2Temperature => &mut self.u2_temperature,
            Quantity::U3Temperature => &mut self.u3_temperature,
            Quantity::OutputCurrent => &mut self.output_current,
            Quantity::InputVoltage => &mut self.input_voltage,
            Quantity::OutputVoltage => &mut self.output_voltage,
            Quantity::IlimPotPosition => &mut self.ilim_pot_position,
            Quantity::VoutPotPosition => &mut self.vout_pot_position,
        };
        *slot = value;
    }
}

impl fmt::Display for BoardConditions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Initial Board conditions:")?;
        for quantity in Quantity::ALL {
            writeln!(f, "{}: {} {}", quantity, self.get(quantity), quantity.unit())?;
        }
        Ok(())
    }
}

/// Potentiometer positions, percent of travel.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PotPositions {
    /// Current-limit potentiometer
    pub ilim: f64,
    /// Output-voltage potentiometer
    pub vout: f64,
}

// =============================================================================
// Failure List
// =============================================================================

/// Ordered, append-only list of failure messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureList {
    failures: Vec<String>,
}

impl FailureList {
    /// Empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a failure.
    pub fn push(&mut self, message: impl Into<String>) {
        self.failures.push(message.into());
    }

    /// Whether no failure was recorded.
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of failures recorded.
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Failures in the order they were recorded.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(String::as_str)
    }
}

// =============================================================================
// Test Report
// =============================================================================

/// Everything a completed run reports.
#[derive(Debug, Clone, PartialEq)]
pub struct TestReport {
    /// DAC scale factor read back during setup
    pub dac_scale: f64,
    /// Readings taken before the first check
    pub initial_conditions: BoardConditions,
    /// Positions that satisfied the potentiometer gate
    pub pot_positions: PotPositions,
    /// How many times the operator was asked to readjust the potentiometers
    pub pot_reprompts: u32,
    /// Recorded failures
    pub failures: FailureList,
}

impl TestReport {
    /// Whether the board passed every check.
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for TestReport {
    /// Final verdict as printed to the operator.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.passed() {
            return writeln!(f, "Board PASSES!!");
        }
        writeln!(f, "Board FAILED the following tests:")?;
        for failure in self.failures.iter() {
            writeln!(f, "{failure}")?;
        }
        writeln!(f, "Note failures and set aside for debug.")
    }
}

/// How a run ended when it did not raise an error.
#[derive(Debug)]
pub enum RunOutcome {
    /// The instrument could not be opened; no step ran.
    NoDevice(crate::error::TestError),
    /// Every step ran; the report holds the verdict.
    Completed(TestReport),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(failures: &[&str]) -> TestReport {
        let mut list = FailureList::new();
        for f in failures {
            list.push(*f);
        }
        TestReport {
            dac_scale: 0.038,
            initial_conditions: BoardConditions::default(),
            pot_positions: PotPositions {
                ilim: 50.0,
                vout: 50.0,
            },
            pot_reprompts: 0,
            failures: list,
        }
    }

    #[test]
    fn failure_list_keeps_insertion_order_and_duplicates() {
        let mut list = FailureList::new();
        list.push("b");
        list.push("a");
        list.push("b");
        assert_eq!(list.iter().collect::<Vec<_>>(), vec!["b", "a", "b"]);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn passing_verdict() {
        let text = report(&[]).to_string();
        assert_eq!(text, "Board PASSES!!\n");
    }

    #[test]
    fn failing_verdict_lists_each_failure() {
        let text = report(&["Fails zero output test", "Fails OR circuit test"]).to_string();
        assert_eq!(
            text,
            "Board FAILED the following tests:\n\
             Fails zero output test\n\
             Fails OR circuit test\n\
             Note failures and set aside for debug.\n"
        );
    }

    #[test]
    fn conditions_display_every_quantity() {
        let mut conditions = BoardConditions::default();
        conditions.set(Quantity::InputVoltage, 24.0);
        assert_eq!(conditions.get(Quantity::InputVoltage), 24.0);

        let text = conditions.to_string();
        assert!(text.starts_with("Initial Board conditions:\n"));
        assert!(text.contains("Input Voltage: 24 V"));
        assert!(text.contains("Vout pot position: 0 %"));
        assert_eq!(text.lines().count(), 8);
    }
}
