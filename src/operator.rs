//! Operator interaction.
//!
//! Two steps of the test need a person at the bench: setting both
//! potentiometers, and attaching the load resistor. The runner asks an
//! [`Operator`] to confirm each instruction and blocks until it does.

use std::io::Write;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

use crate::error::{Result, TestError};

/// Someone (or something) that performs physical actions on request.
#[async_trait]
pub trait Operator: Send {
    /// Show `instruction` and wait until the operator confirms it is done.
    async fn confirm(&mut self, instruction: &str) -> Result<()>;
}

/// Operator at a terminal: prints the instruction and waits for Enter.
pub struct ConsoleOperator {
    lines: Lines<BufReader<Stdin>>,
}

impl Default for ConsoleOperator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleOperator {
    /// Read confirmations from standard input.
    pub fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }
}

#[async_trait]
impl Operator for ConsoleOperator {
    async fn confirm(&mut self, instruction: &str) -> Result<()> {
        print!("\n{instruction}, then press enter to continue...");
        std::io::stdout().flush()?;

        match self.lines.next_line().await? {
            Some(_) => Ok(()),
            None => Err(TestError::OperatorInput(instruction.to_string())),
        }
    }
}

/// Operator that confirms immediately and remembers what it was asked.
///
/// Optionally stops answering after a number of confirmations, which looks
/// to the runner like a closed terminal.
#[derive(Debug, Default, Clone)]
pub struct ScriptedOperator {
    instructions: Vec<String>,
    answer_limit: Option<usize>,
}

impl ScriptedOperator {
    /// Confirm every instruction.
    pub fn new() -> Self {
        Self::default()
    }

    /// Confirm only the first `limit` instructions.
    pub fn answering(limit: usize) -> Self {
        Self {
            instructions: Vec::new(),
            answer_limit: Some(limit),
        }
    }

    /// Instructions received so far, in order.
    pub fn instructions(&self) -> &[String] {
        &self.instructions
    }

    /// Number of instructions received so far.
    pub fn prompt_count(&self) -> usize {
        self.instructions.len()
    }
}

#[async_trait]
impl Operator for ScriptedOperator {
    async fn confirm(&mut self, instruction: &str) -> Result<()> {
        if self
            .answer_limit
            .is_some_and(|limit| self.instructions.len() >= limit)
        {
            return Err(TestError::OperatorInput(instruction.to_string()));
        }
        self.instructions.push(instruction.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_operator_records_instructions() {
        let mut operator = ScriptedOperator::new();
        operator.confirm("first").await.unwrap();
        operator.confirm("second").await.unwrap();
        assert_eq!(operator.instructions(), ["first", "second"]);
    }

    #[tokio::test]
    async fn scripted_operator_stops_answering() {
        let mut operator = ScriptedOperator::answering(1);
        operator.confirm("first").await.unwrap();
        let err = operator.confirm("second").await.unwrap_err();
        assert!(matches!(err, TestError::OperatorInput(ref s) if s == "second"));
        assert_eq!(operator.prompt_count(), 1);
    }
}
