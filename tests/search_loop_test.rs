//! Optimizer / power meter loop over a simulated range

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

use rust_positioner::axis::AxisKind;
use rust_positioner::config::PositionerConfig;
use rust_positioner::log_capture::NullSink;
use rust_positioner::search::{best_observation, run_search, Optimizer, PowerMeter, SearchError};
use rust_positioner::supervisor::{MeasurementPosition, MotionSupervisor};
use rust_positioner::PositionerError;

/// Proposes a fixed list of positions and remembers what it was told.
struct ScriptedOptimizer {
    plan: VecDeque<MeasurementPosition>,
    observed: Vec<(MeasurementPosition, f64)>,
}

impl ScriptedOptimizer {
    fn new(plan: impl IntoIterator<Item = MeasurementPosition>) -> Self {
        Self {
            plan: plan.into_iter().collect(),
            observed: Vec::new(),
        }
    }
}

impl Optimizer for ScriptedOptimizer {
    fn next_target(&mut self) -> Option<MeasurementPosition> {
        self.plan.pop_front()
    }

    fn observe(&mut self, position: MeasurementPosition, power: f64) {
        self.observed.push((position, power));
    }
}

/// Returns queued readings; fails once the queue is empty.
struct QueuedMeter {
    readings: Mutex<VecDeque<f64>>,
    calls: AtomicUsize,
}

impl QueuedMeter {
    fn new(readings: &[f64]) -> Self {
        Self {
            readings: Mutex::new(readings.iter().copied().collect()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PowerMeter for QueuedMeter {
    async fn measure_power(&self) -> Result<f64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.readings
            .lock()
            .pop_front()
            .ok_or_else(|| anyhow!("power meter not responding"))
    }
}

fn at(ant_roll: f64, tt_roll: f64) -> MeasurementPosition {
    MeasurementPosition {
        ant_roll,
        ant_height: 1540.0,
        eut_roll: 0.0,
        tt_roll,
    }
}

fn supervisor() -> MotionSupervisor {
    let (supervisor, _) =
        MotionSupervisor::simulated(&PositionerConfig::default(), Arc::new(NullSink)).unwrap();
    supervisor
}

#[tokio::test(start_paused = true)]
async fn search_measures_each_proposed_position() {
    let supervisor = supervisor();
    let mut optimizer = ScriptedOptimizer::new([at(10.0, 20.0), at(20.0, 40.0), at(30.0, 60.0)]);
    let meter = QueuedMeter::new(&[-42.0, -37.5, -40.0]);

    let observations = run_search(&supervisor, &mut optimizer, &meter, 10)
        .await
        .unwrap();

    assert_eq!(observations.len(), 3);
    assert_eq!(optimizer.observed.len(), 3);
    assert_eq!(meter.calls.load(Ordering::SeqCst), 3);
    for (i, observation) in observations.iter().enumerate() {
        assert_eq!(observation.iteration, i);
        assert_eq!(observation.moves.len(), 4);
    }

    let best = best_observation(&observations).unwrap();
    assert_eq!(best.position, at(20.0, 40.0));
    assert_eq!(best.power, -37.5);

    // The last measurement happened at the last proposed position.
    let tt = supervisor
        .controller(AxisKind::TurntableRoll)
        .read_position()
        .await
        .unwrap();
    assert!((tt - 60.0).abs() < 0.1);
}

#[tokio::test(start_paused = true)]
async fn search_stops_at_iteration_budget() {
    let supervisor = supervisor();
    let mut optimizer = ScriptedOptimizer::new([at(10.0, 0.0), at(20.0, 0.0), at(30.0, 0.0)]);
    let meter = QueuedMeter::new(&[-50.0, -49.0, -48.0]);

    let observations = run_search(&supervisor, &mut optimizer, &meter, 2)
        .await
        .unwrap();

    assert_eq!(observations.len(), 2);
    assert_eq!(optimizer.plan.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unreachable_position_aborts_without_measuring() {
    let supervisor = supervisor();
    let mut unreachable = at(20.0, 0.0);
    unreachable.ant_height = 1000.0;
    let mut optimizer = ScriptedOptimizer::new([at(10.0, 0.0), unreachable, at(30.0, 0.0)]);
    let meter = QueuedMeter::new(&[-50.0, -49.0, -48.0]);

    let err = run_search(&supervisor, &mut optimizer, &meter, 10)
        .await
        .unwrap_err();

    match err {
        SearchError::Move { position, source } => {
            assert_eq!(position, unreachable);
            assert!(matches!(
                source,
                PositionerError::Range {
                    axis: AxisKind::AntennaHeight,
                    ..
                }
            ));
        }
        other => panic!("expected move failure, got {other}"),
    }
    assert_eq!(meter.calls.load(Ordering::SeqCst), 1);
    assert_eq!(optimizer.observed.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn meter_failure_is_reported_with_position() {
    let supervisor = supervisor();
    let mut optimizer = ScriptedOptimizer::new([at(10.0, 0.0), at(20.0, 0.0)]);
    let meter = QueuedMeter::new(&[-45.0]);

    let err = run_search(&supervisor, &mut optimizer, &meter, 10)
        .await
        .unwrap_err();

    assert!(matches!(err, SearchError::Measurement { position, .. } if position == at(20.0, 0.0)));
    assert!(err.to_string().contains("power meter not responding"));
    assert_eq!(optimizer.observed, vec![(at(10.0, 0.0), -45.0)]);
}
