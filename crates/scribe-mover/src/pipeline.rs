//! Ordered step execution with suspend semantics
//!
//! A reconcile pass has no saved progress: every pass runs the mover's step
//! list from the top. Each step is idempotent and returns:
//!
//! - `Ok(true)`: done, run the next step
//! - `Ok(false)`: not ready yet, stop this pass without error
//! - `Err(e)`: stop this pass and surface `e`

use std::fmt::Display;

use async_trait::async_trait;
use tracing::{debug, debug_span, Instrument};

use scribe_common::Error;

/// Executes individual steps of type `S`
#[async_trait]
pub trait StepRunner<S>: Send {
    /// Run one step
    async fn run_step(&mut self, step: S) -> Result<bool, Error>;
}

/// Run `steps` in order until one suspends or fails.
///
/// Returns the last step's result. An empty list counts as complete.
pub async fn run_steps<S, R>(runner: &mut R, steps: &[S]) -> Result<bool, Error>
where
    S: Copy + Display + Send + Sync,
    R: StepRunner<S> + ?Sized,
{
    for &step in steps {
        let span = debug_span!("step", step = %step);
        let proceed = runner.run_step(step).instrument(span).await?;
        if !proceed {
            debug!(step = %step, "step suspended pipeline");
            return Ok(false);
        }
    }
    Ok(true)
}
