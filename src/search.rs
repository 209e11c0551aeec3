//! Measurement search loop.
//!
//! A search strategy ([`Optimizer`]) proposes measurement positions and is
//! told the power measured at each. The supervisor moves the range there and
//! a [`PowerMeter`] is read only after every axis has confirmed arrival.
//!
//! ```text
//! Optimizer::next_target -> MotionSupervisor::move_to_measurement_position
//!     -> PowerMeter::measure_power -> Optimizer::observe
//! ```

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::controller::MoveReport;
use crate::error::PositionerError;
use crate::supervisor::{MeasurementPosition, MotionSupervisor};

/// Source of measurement positions.
pub trait Optimizer: Send {
    /// Next position to measure, or `None` when the search is done.
    fn next_target(&mut self) -> Option<MeasurementPosition>;

    /// Feed back the power measured at `position`.
    fn observe(&mut self, position: MeasurementPosition, power: f64);
}

/// Instrument that measures received power at the current position.
#[async_trait]
pub trait PowerMeter: Send + Sync {
    /// Measure power with the instrument's current settings.
    async fn measure_power(&self) -> Result<f64>;
}

/// Why a search stopped early.
#[derive(Error, Debug)]
pub enum SearchError {
    /// The range could not reach a proposed position.
    #[error("move to {position:?} failed: {source}")]
    Move {
        position: MeasurementPosition,
        #[source]
        source: PositionerError,
    },

    /// The instrument failed after a confirmed move.
    #[error("power measurement at {position:?} failed: {source}")]
    Measurement {
        position: MeasurementPosition,
        #[source]
        source: anyhow::Error,
    },
}

/// One completed iteration.
#[derive(Debug, Clone)]
pub struct Observation {
    /// Zero-based iteration index.
    pub iteration: usize,
    /// Position measured.
    pub position: MeasurementPosition,
    /// Measured power.
    pub power: f64,
    /// Per-axis move reports, in move order.
    pub moves: Vec<MoveReport>,
}

/// Run up to `max_iterations` optimizer steps.
///
/// Stops early when the optimizer has no further target. A failed move or
/// measurement ends the search with an error; observations made so far are
/// already with the optimizer.
pub async fn run_search(
    supervisor: &MotionSupervisor,
    optimizer: &mut dyn Optimizer,
    meter: &dyn PowerMeter,
    max_iterations: usize,
) -> std::result::Result<Vec<Observation>, SearchError> {
    let mut observations = Vec::new();
    for iteration in 0..max_iterations {
        let Some(position) = optimizer.next_target() else {
            info!(iteration, "Optimizer finished");
            break;
        };

        let moves = supervisor
            .move_to_measurement_position(position, true)
            .await
            .map_err(|source| SearchError::Move { position, source })?;

        let power = meter
            .measure_power()
            .await
            .map_err(|source| SearchError::Measurement { position, source })?;

        info!(iteration, ?position, power, "Measured");
        optimizer.observe(position, power);
        observations.push(Observation {
            iteration,
            position,
            power,
            moves,
        });
    }
    Ok(observations)
}

/// Observation with the highest power.
pub fn best_observation(observations: &[Observation]) -> Option<&Observation> {
    observations
        .iter()
        .max_by(|a, b| a.power.total_cmp(&b.power))
}
