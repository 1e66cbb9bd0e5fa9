//! Panic Safety for Test Execution
//!
//! Makes sure the board output is left at 0 V however a run ends.
//!
//! # Problem
//!
//! Once the DAC has been written, the board is driving its output jacks. If a
//! step then fails, panics, or the operator hits Ctrl-C, a plain sequential
//! script would leave the output at whatever was last commanded (up to the
//! 18 V OR-circuit setpoint).
//!
//! # Solution
//!
//! [`with_output_safety`] wraps the test steps:
//! - panics inside the steps are caught and turned into [`TestError::Panicked`]
//! - the interrupt future is raced against the steps
//! - the DAC is written to [`SAFE_OUTPUT_CODE`] afterwards, on every path
//!
//! # Example
//!
//! ```rust,ignore
//! let result = with_output_safety(instrument.dac(), ctrl_c, async {
//!     instrument.dac().write_raw(42_000).await?;
//!     measure(&instrument).await
//! })
//! .await;
//! // DAC is back at 0 here, whether `result` is Ok or Err
//! ```

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::{error, info, warn};

use crate::error::{Result, TestError};
use crate::hardware::AnalogOutput;

/// DAC code that puts the board output at 0 V.
pub const SAFE_OUTPUT_CODE: i64 = 0;

/// Run `steps`, then force the DAC to [`SAFE_OUTPUT_CODE`].
///
/// Returns the steps' result, unless the safety write itself fails after the
/// steps succeeded: an output that could not be zeroed is reported as an
/// error even if every check passed.
pub async fn with_output_safety<T, S, I>(dac: &dyn AnalogOutput, interrupt: I, steps: S) -> Result<T>
where
    S: Future<Output = Result<T>>,
    I: Future<Output = ()>,
{
    let guarded = AssertUnwindSafe(steps).catch_unwind();

    let result = tokio::select! {
        outcome = guarded => match outcome {
            Ok(result) => result,
            Err(payload) => Err(TestError::Panicked(panic_message(payload.as_ref()))),
        },
        () = interrupt => Err(TestError::Interrupted),
    };

    if let Err(e) = &result {
        warn!(error = %e, "Test aborted, forcing output to zero");
    }

    println!("Setting DAC output to zero, just to be safe...\n\n");
    match dac.write_raw(SAFE_OUTPUT_CODE).await {
        Ok(()) => {
            info!(device = dac.name(), "Output set to safe state");
            result
        }
        Err(safety_err) => {
            error!(device = dac.name(), error = %safety_err, "Failed to zero output");
            // The original failure explains more than the follow-on one
            match result {
                Ok(_) => Err(safety_err),
                Err(e) => Err(e),
            }
        }
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::SimulatedBoard;
    use std::future::pending;

    #[tokio::test]
    async fn zeroes_output_after_success() {
        let board = SimulatedBoard::new();
        let instrument = board.instrument();

        let value = with_output_safety(instrument.dac(), pending(), async {
            instrument.dac().write_raw(42_000).await?;
            Ok(7)
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(board.dac_writes(), vec![42_000, 0]);
    }

    #[tokio::test]
    async fn zeroes_output_after_error() {
        let board = SimulatedBoard::new();
        let instrument = board.instrument();

        let result: Result<()> = with_output_safety(instrument.dac(), pending(), async {
            instrument.dac().write_raw(42_000).await?;
            Err(TestError::Protocol("lost sync".into()))
        })
        .await;

        assert!(matches!(result, Err(TestError::Protocol(_))));
        assert_eq!(board.dac_code(), Some(0));
    }

    #[tokio::test]
    #[allow(clippy::panic)]
    async fn zeroes_output_after_panic() {
        let board = SimulatedBoard::new();
        let instrument = board.instrument();

        let result: Result<()> = with_output_safety(instrument.dac(), pending(), async {
            instrument.dac().write_raw(42_000).await?;
            panic!("step exploded");
        })
        .await;

        match result {
            Err(TestError::Panicked(msg)) => assert_eq!(msg, "step exploded"),
            other => panic!("unexpected result: {:?}", other.err()),
        }
        assert_eq!(board.dac_writes(), vec![42_000, 0]);
    }

    #[tokio::test]
    async fn zeroes_output_when_interrupted() {
        let board = SimulatedBoard::new();
        let instrument = board.instrument();

        let result: Result<()> = with_output_safety(instrument.dac(), async {}, async {
            instrument.dac().write_raw(42_000).await?;
            pending::<()>().await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(TestError::Interrupted)));
        assert_eq!(board.dac_code(), Some(0));
    }

    #[test]
    fn extracts_panic_messages() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
