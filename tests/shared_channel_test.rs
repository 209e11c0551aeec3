//! Two axes on one serial line
//!
//! The antenna roll and mast height controllers share a physical line. These
//! tests drive both concurrently and check the wire never interleaves a
//! multi-frame exchange of one axis with frames of the other.

use std::sync::Arc;

use rust_positioner::axis::{AxisKind, ANTENNA_HEIGHT, ANTENNA_ROLL};
use rust_positioner::controller::{AxisController, MotionTiming, MoveOutcome};
use rust_positioner::log_capture::{EventBuffer, EventKind, EventSink};
use rust_positioner::mock::{BusOp, Fault, SimulatedDevice};
use rust_positioner::transport::{RetryPolicy, TransportChannel};

struct SharedLine {
    device: SimulatedDevice,
    events: EventBuffer,
    roll: AxisController,
    height: AxisController,
}

fn shared_line() -> SharedLine {
    let device = SimulatedDevice::new(&[&ANTENNA_ROLL, &ANTENNA_HEIGHT]);
    let events = EventBuffer::new();
    let sink: Arc<dyn EventSink> = Arc::new(events.clone());
    let channel = Arc::new(TransportChannel::new(
        "COM15",
        Box::new(device.bus()),
        RetryPolicy::default(),
        Arc::clone(&sink),
    ));
    let roll = AxisController::new(
        &ANTENNA_ROLL,
        Arc::clone(&channel),
        MotionTiming::default(),
        Arc::clone(&sink),
    );
    let height = AxisController::new(&ANTENNA_HEIGHT, channel, MotionTiming::default(), sink);
    SharedLine {
        device,
        events,
        roll,
        height,
    }
}

/// Every start pulse must be an uninterrupted `false` then `true` on one coil.
fn assert_pulses_unbroken(journal: &[BusOp]) {
    for (i, op) in journal.iter().enumerate() {
        if let BusOp::WriteCoil {
            address,
            value: true,
        } = op
        {
            assert!(i > 0, "pulse without a preceding clear");
            assert_eq!(
                journal[i - 1],
                BusOp::WriteCoil {
                    address: *address,
                    value: false
                },
                "pulse on coil {} was interleaved",
                address
            );
        }
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_moves_on_one_line_do_not_interleave() {
    let line = shared_line();
    let start_coils = (
        ANTENNA_ROLL.registers.start_bit.address,
        ANTENNA_HEIGHT.registers.start_bit.address,
    );

    let (roll, height) = tokio::join!(
        line.roll.move_to(45.0, true),
        line.height.move_to(1700.0, true)
    );

    let roll = roll.unwrap();
    let height = height.unwrap();
    assert_eq!(roll.outcome, MoveOutcome::Complete);
    assert_eq!(height.outcome, MoveOutcome::Complete);
    assert!((44.9..=45.1).contains(&line.device.position(AxisKind::AntennaRoll).unwrap()));
    assert!((1699.9..=1700.1).contains(&line.device.position(AxisKind::AntennaHeight).unwrap()));

    let journal = line.device.journal();
    assert_pulses_unbroken(&journal);
    assert!(line.device.coil_writes(start_coils.0).contains(&true));
    assert!(line.device.coil_writes(start_coils.1).contains(&true));
}

#[tokio::test(start_paused = true)]
async fn every_exchange_starts_with_a_buffer_clear() {
    let line = shared_line();

    let (roll, height) = tokio::join!(line.roll.read_position(), line.height.read_position());
    roll.unwrap();
    height.unwrap();

    let journal = line.device.journal();
    assert_eq!(journal.len(), 4);
    for pair in journal.chunks(2) {
        assert_eq!(pair[0], BusOp::ClearBuffers);
        assert!(matches!(pair[1], BusOp::ReadRegisters { count: 2, .. }));
    }
}

#[tokio::test(start_paused = true)]
async fn transient_fault_on_shared_line_is_absorbed() {
    let line = shared_line();
    line.device.fail_next(1, Fault::Timeout);

    let (roll, height) = tokio::join!(
        line.roll.move_to(20.0, true),
        line.height.move_to(1600.0, true)
    );

    assert!(roll.is_ok());
    assert!(height.is_ok());
    assert_eq!(line.events.count(EventKind::RetryAttempt), 1);
    assert_eq!(line.events.count(EventKind::RetriesExhausted), 0);
    assert_pulses_unbroken(&line.device.journal());
}

#[tokio::test(start_paused = true)]
async fn closing_one_axis_leaves_the_line_open() {
    let line = shared_line();

    line.roll.close().await.unwrap();

    assert_eq!(line.device.close_count(), 0);
    assert!(line.height.channel().is_open().await);
    line.height.read_position().await.unwrap();
}
