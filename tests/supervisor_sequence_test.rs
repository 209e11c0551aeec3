//! Multi-axis sequencing and teardown against simulated controllers

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rust_positioner::axis::AxisKind;
use rust_positioner::config::PositionerConfig;
use rust_positioner::error::{CommFailure, PositionerError};
use rust_positioner::log_capture::{EventBuffer, EventKind};
use rust_positioner::mock::{Fault, SimulatedDevice};
use rust_positioner::supervisor::{
    MeasurementPosition, MotionSupervisor, TeardownStep, MOVE_ORDER,
};

const ANTENNA_PORT: &str = "COM15";
const EUT_PORT: &str = "COM17";
const TURNTABLE_PORT: &str = "COM12";

fn simulated() -> (MotionSupervisor, HashMap<String, SimulatedDevice>, EventBuffer) {
    let events = EventBuffer::new();
    let (supervisor, devices) =
        MotionSupervisor::simulated(&PositionerConfig::default(), Arc::new(events.clone()))
            .unwrap();
    (supervisor, devices, events)
}

fn position() -> MeasurementPosition {
    MeasurementPosition {
        ant_roll: 30.0,
        ant_height: 1600.0,
        eut_roll: 20.0,
        tt_roll: 40.0,
    }
}

#[tokio::test(start_paused = true)]
async fn axes_move_one_at_a_time_in_fixed_order() {
    let (supervisor, devices, events) = simulated();
    supervisor.initialize().await.unwrap();

    let reports = supervisor
        .move_to_measurement_position(position(), true)
        .await
        .unwrap();

    let moved: Vec<AxisKind> = reports.iter().map(|r| r.axis).collect();
    assert_eq!(moved, MOVE_ORDER.to_vec());

    let steps: Vec<String> = events
        .of_kind(EventKind::SequenceStep)
        .into_iter()
        .map(|e| e.source)
        .collect();
    assert_eq!(steps, ["ANT_ROLL", "TT_ROLL", "EUT_ROLL", "ANT_HEIGHT"]);

    // Each axis completes before the next one starts.
    let order: Vec<String> = events
        .events()
        .into_iter()
        .filter(|e| matches!(e.kind, EventKind::MoveStarted | EventKind::MoveComplete))
        .map(|e| format!("{:?} {}", e.kind, e.source))
        .collect();
    assert_eq!(
        order,
        [
            "MoveStarted ANT_ROLL",
            "MoveComplete ANT_ROLL",
            "MoveStarted TT_ROLL",
            "MoveComplete TT_ROLL",
            "MoveStarted EUT_ROLL",
            "MoveComplete EUT_ROLL",
            "MoveStarted ANT_HEIGHT",
            "MoveComplete ANT_HEIGHT",
        ]
    );

    let tt = devices[TURNTABLE_PORT]
        .position(AxisKind::TurntableRoll)
        .unwrap();
    assert!((tt - 40.0).abs() <= 0.1);
    let height = devices[ANTENNA_PORT]
        .position(AxisKind::AntennaHeight)
        .unwrap();
    assert!((height - 1600.0).abs() <= 0.1);
}

#[tokio::test(start_paused = true)]
async fn failed_health_read_aborts_before_later_axes() {
    let (supervisor, devices, events) = simulated();
    devices[TURNTABLE_PORT].fail_always(Some(Fault::Timeout));

    let err = supervisor
        .move_to_measurement_position(position(), true)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PositionerError::Communication {
            kind: CommFailure::Transient,
            attempts: 3,
            ..
        }
    ));
    let aborted = events.of_kind(EventKind::SequenceAborted);
    assert_eq!(aborted.len(), 1);
    assert_eq!(aborted[0].source, "TT_ROLL");
    assert_eq!(events.count(EventKind::SequenceStep), 2);

    // The antenna roll moved; nothing after the turntable was touched.
    assert!(devices[EUT_PORT].journal().is_empty());
    let antenna_target = devices[ANTENNA_PORT].target(AxisKind::AntennaHeight);
    assert_ne!(antenna_target, Some(1600.0));
}

#[tokio::test(start_paused = true)]
async fn out_of_range_target_aborts_sequence() {
    let (supervisor, devices, events) = simulated();
    let mut target = position();
    target.ant_height = 2500.0;

    let err = supervisor
        .move_to_measurement_position(target, true)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PositionerError::Range {
            axis: AxisKind::AntennaHeight,
            ..
        }
    ));
    assert_eq!(events.count(EventKind::SequenceStep), 4);
    assert_eq!(
        devices[ANTENNA_PORT].position(AxisKind::AntennaHeight),
        Some(1520.0)
    );
}

#[tokio::test(start_paused = true)]
async fn emergency_stop_cancels_move_in_progress() {
    let (supervisor, devices, _) = simulated();
    let supervisor = Arc::new(supervisor);

    let mover = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move {
            let mut target = position();
            target.ant_roll = 170.0;
            supervisor.move_to_measurement_position(target, true).await
        })
    };

    tokio::time::sleep(Duration::from_secs(2)).await;
    let failures = supervisor.emergency_stop_all().await;
    assert!(failures.is_empty());

    let err = mover.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        PositionerError::Cancelled {
            axis: AxisKind::AntennaRoll
        }
    ));
    assert!(!devices[ANTENNA_PORT].is_moving(AxisKind::AntennaRoll));
    let stopped_at = devices[ANTENNA_PORT]
        .position(AxisKind::AntennaRoll)
        .unwrap();
    assert!(stopped_at < 170.0);
}

#[tokio::test(start_paused = true)]
async fn emergency_stop_between_axes_halts_the_sequence() {
    let mut config = PositionerConfig::default();
    config.sequence.inter_move_settle_ms = 10_000;
    let events = EventBuffer::new();
    let (supervisor, devices) =
        MotionSupervisor::simulated(&config, Arc::new(events.clone())).unwrap();
    let supervisor = Arc::new(supervisor);

    let mover = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move {
            supervisor
                .move_to_measurement_position(position(), true)
                .await
        })
    };

    // Wait until the first axis has arrived and the sequence is settling.
    while events.count(EventKind::MoveComplete) == 0 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(supervisor.emergency_stop_all().await.is_empty());
    assert!(supervisor.is_halted());

    let err = mover.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        PositionerError::Cancelled {
            axis: AxisKind::TurntableRoll
        }
    ));
    let aborted = events.of_kind(EventKind::SequenceAborted);
    assert_eq!(aborted.len(), 1);
    assert_eq!(aborted[0].source, "TT_ROLL");

    // The turntable only saw the stop itself.
    let turntable = &devices[TURNTABLE_PORT];
    assert!(!turntable.has_register_writes());
    let start_coil = AxisKind::TurntableRoll.profile().registers.start_bit.address;
    assert_eq!(turntable.coil_writes(start_coil), [false]);
    assert_eq!(turntable.position(AxisKind::TurntableRoll), Some(0.0));
    assert!(!devices[EUT_PORT].has_register_writes());

    // A later sequence stays refused until the operator resumes.
    assert!(matches!(
        supervisor
            .move_to_measurement_position(position(), true)
            .await,
        Err(PositionerError::Cancelled {
            axis: AxisKind::AntennaRoll
        })
    ));
    supervisor.resume();
    let reports = supervisor
        .move_to_measurement_position(position(), true)
        .await
        .unwrap();
    assert_eq!(reports.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn cleanup_isolates_a_dead_controller() {
    let (supervisor, devices, events) = simulated();
    devices[EUT_PORT].fail_always(Some(Fault::Timeout));

    let failures = supervisor.cleanup().await;

    let steps: Vec<(TeardownStep, &str)> = failures
        .iter()
        .map(|f| (f.step, f.target.as_str()))
        .collect();
    assert_eq!(
        steps,
        [
            (TeardownStep::Stop, "EUT_ROLL"),
            (TeardownStep::ResetStartBit, "EUT_ROLL"),
        ]
    );
    assert_eq!(events.count(EventKind::CleanupFailed), 2);

    // Every line is released exactly once, including the dead one.
    for device in devices.values() {
        assert_eq!(device.close_count(), 1);
    }
    let stop_coil = AxisKind::TurntableRoll.profile().registers.start_bit.address;
    assert_eq!(devices[TURNTABLE_PORT].coil_writes(stop_coil), [false, false]);

    assert!(supervisor.cleanup().await.is_empty());
    for device in devices.values() {
        assert_eq!(device.close_count(), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn operations_after_cleanup_fail_cleanly() {
    let (supervisor, _, _) = simulated();
    supervisor.cleanup().await;

    let err = supervisor
        .controller(AxisKind::TurntableRoll)
        .read_position()
        .await
        .unwrap_err();
    assert!(matches!(err, PositionerError::Communication { attempts: 1, .. }));
}
