//! Multi-axis sequencing, emergency stop and teardown.
//!
//! The [`MotionSupervisor`] owns every [`TransportChannel`] and one
//! [`AxisController`] per axis kind. Axes that name the same port in the
//! configuration share one channel; the supervisor, not the controllers,
//! closes channels.
//!
//! Composite moves are strictly sequential in a fixed physical order
//! (antenna roll, turntable, EUT roll, antenna height). Stop and cleanup are
//! best effort: every axis and every step is attempted even when earlier
//! ones fail.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::axis::AxisKind;
use crate::config::PositionerConfig;
use crate::controller::{AxisController, JogDirection, MoveReport};
use crate::error::{PositionerError, PositionerResult};
use crate::log_capture::{EventKind, EventSink, MotionEvent};
use crate::mock::SimulatedDevice;
use crate::modbus::{open_serial_async, ModbusRtu, RegisterBus};
use crate::transport::TransportChannel;

/// Order in which a measurement position is approached.
pub const MOVE_ORDER: [AxisKind; 4] = [
    AxisKind::AntennaRoll,
    AxisKind::TurntableRoll,
    AxisKind::EutRoll,
    AxisKind::AntennaHeight,
];

const SUPERVISOR_SOURCE: &str = "SUPERVISOR";

/// Delays used between supervisor steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceTiming {
    /// Pause after each axis move in a sequence.
    pub inter_move_settle: Duration,
    /// Pause between stop-all and start-bit reset during cleanup.
    pub cleanup_settle: Duration,
    /// Write default speeds in [`MotionSupervisor::initialize`].
    pub apply_default_speeds: bool,
}

impl Default for SequenceTiming {
    fn default() -> Self {
        Self {
            inter_move_settle: Duration::from_millis(500),
            cleanup_settle: Duration::from_millis(500),
            apply_default_speeds: true,
        }
    }
}

/// Target of every axis for one measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeasurementPosition {
    /// Antenna roll, degrees.
    pub ant_roll: f64,
    /// Antenna height, millimetres.
    pub ant_height: f64,
    /// EUT roll, degrees.
    pub eut_roll: f64,
    /// Turntable, degrees.
    pub tt_roll: f64,
}

impl MeasurementPosition {
    /// Target for `axis`.
    pub fn target(&self, axis: AxisKind) -> f64 {
        match axis {
            AxisKind::AntennaRoll => self.ant_roll,
            AxisKind::AntennaHeight => self.ant_height,
            AxisKind::EutRoll => self.eut_roll,
            AxisKind::TurntableRoll => self.tt_roll,
        }
    }
}

/// Position and speed of one axis, `None` where the read failed.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AxisSnapshot {
    /// Physical position.
    pub position: Option<f64>,
    /// Speed register; always `None` on fixed-speed axes.
    pub speed: Option<u16>,
}

/// Teardown step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    /// Clearing the start bit to stop motion.
    Stop,
    /// Final start-bit reset.
    ResetStartBit,
    /// Releasing a channel.
    Close,
}

/// A failed, skipped-over teardown step.
#[derive(Debug)]
pub struct TeardownFailure {
    /// Which step.
    pub step: TeardownStep,
    /// Axis id or port name.
    pub target: String,
    /// What went wrong.
    pub error: PositionerError,
}

/// Owner of all channels and axis controllers of one session.
pub struct MotionSupervisor {
    controllers: [Arc<AxisController>; 4],
    channels: Vec<Arc<TransportChannel>>,
    timing: SequenceTiming,
    sink: Arc<dyn EventSink>,
    halted: AtomicBool,
    cleaned_up: AtomicBool,
}

impl std::fmt::Debug for MotionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MotionSupervisor")
            .field("controllers", &self.controllers)
            .field("channels", &self.channels)
            .field("timing", &self.timing)
            .field("halted", &self.is_halted())
            .finish_non_exhaustive()
    }
}

impl MotionSupervisor {
    /// Assemble a supervisor from existing parts.
    ///
    /// `controllers` must hold one controller per axis kind, and every
    /// controller's channel must be one of `channels`.
    pub fn from_parts(
        controllers: Vec<Arc<AxisController>>,
        channels: Vec<Arc<TransportChannel>>,
        timing: SequenceTiming,
        sink: Arc<dyn EventSink>,
    ) -> PositionerResult<Self> {
        let mut by_kind: BTreeMap<AxisKind, Arc<AxisController>> = BTreeMap::new();
        for controller in controllers {
            let kind = controller.kind();
            if !channels.iter().any(|c| Arc::ptr_eq(c, controller.channel())) {
                return Err(PositionerError::Config(format!(
                    "{} uses a channel the supervisor does not own",
                    kind
                )));
            }
            if by_kind.insert(kind, controller).is_some() {
                return Err(PositionerError::Config(format!("duplicate controller for {}", kind)));
            }
        }
        let ordered: Vec<Arc<AxisController>> = AxisKind::ALL
            .iter()
            .map(|kind| {
                by_kind
                    .remove(kind)
                    .ok_or_else(|| PositionerError::Config(format!("no controller for {}", kind)))
            })
            .collect::<PositionerResult<_>>()?;
        let controllers: [Arc<AxisController>; 4] = ordered
            .try_into()
            .map_err(|_| PositionerError::Config("expected four axis controllers".to_string()))?;

        Ok(Self {
            controllers,
            channels,
            timing,
            sink,
            halted: AtomicBool::new(false),
            cleaned_up: AtomicBool::new(false),
        })
    }

    /// Build channels from `buses` (one per configured port) and wire the
    /// controllers to them.
    fn assemble(
        config: &PositionerConfig,
        mut buses: HashMap<String, Box<dyn RegisterBus>>,
        sink: Arc<dyn EventSink>,
    ) -> PositionerResult<Self> {
        let policy = config.retry.policy();
        let timing = config.motion.timing();
        let mut channels = Vec::new();
        let mut controllers = Vec::new();

        for (port, axes) in config.ports.groups() {
            let bus = buses
                .remove(&port)
                .ok_or_else(|| PositionerError::Config(format!("no bus for port {}", port)))?;
            let channel = Arc::new(TransportChannel::new(
                port.clone(),
                bus,
                policy.clone(),
                Arc::clone(&sink),
            ));
            for axis in axes {
                controllers.push(Arc::new(AxisController::new(
                    axis.profile(),
                    Arc::clone(&channel),
                    timing.clone(),
                    Arc::clone(&sink),
                )));
            }
            info!(port = %port, "Channel ready");
            channels.push(channel);
        }

        Self::from_parts(controllers, channels, config.sequence.timing(), sink)
    }

    /// Open every configured serial port and build the supervisor.
    pub async fn connect(
        config: &PositionerConfig,
        sink: Arc<dyn EventSink>,
    ) -> PositionerResult<Self> {
        config.validate()?;
        let settings = config.serial.settings();
        let mut buses: HashMap<String, Box<dyn RegisterBus>> = HashMap::new();
        for (port, _) in config.ports.groups() {
            let stream = open_serial_async(&port, &settings).await?;
            let bus = ModbusRtu::new(stream, config.serial.slave_address, settings.timeout);
            buses.insert(port, Box::new(bus));
        }
        Self::assemble(config, buses, sink)
    }

    /// Build the supervisor against simulated controllers, one device per
    /// configured port. Returns the devices keyed by port.
    pub fn simulated(
        config: &PositionerConfig,
        sink: Arc<dyn EventSink>,
    ) -> PositionerResult<(Self, HashMap<String, SimulatedDevice>)> {
        config.validate()?;
        let mut devices = HashMap::new();
        let mut buses: HashMap<String, Box<dyn RegisterBus>> = HashMap::new();
        for (port, axes) in config.ports.groups() {
            let profiles: Vec<_> = axes.iter().map(|a| a.profile()).collect();
            let device = SimulatedDevice::new(&profiles);
            buses.insert(port.clone(), Box::new(device.bus()));
            devices.insert(port, device);
        }
        let supervisor = Self::assemble(config, buses, sink)?;
        Ok((supervisor, devices))
    }

    /// Controller of `axis`.
    pub fn controller(&self, axis: AxisKind) -> &Arc<AxisController> {
        &self.controllers[axis as usize]
    }

    /// All controllers, in axis declaration order.
    pub fn controllers(&self) -> &[Arc<AxisController>] {
        &self.controllers
    }

    /// All owned channels.
    pub fn channels(&self) -> &[Arc<TransportChannel>] {
        &self.channels
    }

    /// True while an emergency stop is latched.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Clear a latched emergency stop on the supervisor and every axis.
    pub fn resume(&self) {
        if self.halted.swap(false, Ordering::SeqCst) {
            info!("Emergency stop cleared");
        }
        for controller in &self.controllers {
            controller.resume();
        }
    }

    /// True once [`cleanup`](Self::cleanup) has run.
    pub fn is_cleaned_up(&self) -> bool {
        self.cleaned_up.load(Ordering::SeqCst)
    }

    fn emit(&self, event: MotionEvent) {
        self.sink.record(event);
    }

    /// Check every axis answers a position read, then apply default speeds.
    ///
    /// Every axis is checked; the first failure is returned.
    #[instrument(skip(self), err)]
    pub async fn initialize(&self) -> PositionerResult<()> {
        let mut first_error = None;
        for controller in &self.controllers {
            match controller.read_position().await {
                Ok(position) => {
                    info!(axis = %controller.kind(), position, "Axis online");
                }
                Err(e) => {
                    error!(axis = %controller.kind(), error = %e, "Axis not responding");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        if self.timing.apply_default_speeds {
            for controller in &self.controllers {
                if let Some(speed) = controller.apply_default_speed().await? {
                    debug!(axis = %controller.kind(), speed, "Default speed applied");
                }
            }
        }
        Ok(())
    }

    /// Move every axis to `position`, one at a time, in [`MOVE_ORDER`].
    ///
    /// Each axis' position is read first as a health check. The first failed
    /// read or move aborts the sequence; later axes are not touched. A latched
    /// emergency stop fails the sequence with `Cancelled` before the next
    /// axis; call [`resume`](Self::resume) to move again.
    #[instrument(skip(self), err)]
    pub async fn move_to_measurement_position(
        &self,
        position: MeasurementPosition,
        wait: bool,
    ) -> PositionerResult<Vec<MoveReport>> {
        let mut reports = Vec::with_capacity(MOVE_ORDER.len());
        for axis in MOVE_ORDER {
            let controller = self.controller(axis);
            let target = position.target(axis);
            self.emit(MotionEvent::new(axis.id(), EventKind::SequenceStep).with("target", target));

            let step = async {
                if self.is_halted() {
                    return Err(PositionerError::Cancelled { axis });
                }
                let current = controller.read_position().await?;
                debug!(axis = %axis, current, target, "Health check passed");
                controller.move_to(target, wait).await
            };
            match step.await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    error!(axis = %axis, error = %e, "Sequence aborted");
                    self.emit(
                        MotionEvent::new(axis.id(), EventKind::SequenceAborted)
                            .with("target", target)
                            .detail(e.to_string()),
                    );
                    return Err(e);
                }
            }
            tokio::time::sleep(self.timing.inter_move_settle).await;
        }
        Ok(reports)
    }

    /// Stop every axis. Each stop is isolated; failures are returned, never
    /// short-circuited.
    pub async fn emergency_stop_all(&self) -> Vec<(AxisKind, PositionerError)> {
        warn!("Emergency stop requested for all axes");
        self.halted.store(true, Ordering::SeqCst);
        let mut failures = Vec::new();
        for controller in &self.controllers {
            controller.request_stop();
            if let Err(e) = controller.stop_movement().await {
                error!(axis = %controller.kind(), error = %e, "Emergency stop failed");
                failures.push((controller.kind(), e));
            }
        }
        failures
    }

    /// Stop everything, reset start bits and close every channel.
    ///
    /// Runs once; later calls return immediately with no failures. A failed
    /// step is logged and skipped.
    pub async fn cleanup(&self) -> Vec<TeardownFailure> {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            debug!("Cleanup already done");
            return Vec::new();
        }
        info!("Cleaning up positioner session");
        let mut failures = Vec::new();

        for (axis, error) in self.emergency_stop_all().await {
            failures.push(TeardownFailure {
                step: TeardownStep::Stop,
                target: axis.id().to_string(),
                error,
            });
        }

        tokio::time::sleep(self.timing.cleanup_settle).await;

        for controller in &self.controllers {
            if let Err(error) = controller.reset_start_bit().await {
                failures.push(TeardownFailure {
                    step: TeardownStep::ResetStartBit,
                    target: controller.kind().id().to_string(),
                    error,
                });
            }
        }

        for channel in &self.channels {
            if let Err(error) = channel.close().await {
                failures.push(TeardownFailure {
                    step: TeardownStep::Close,
                    target: channel.port().to_string(),
                    error,
                });
            }
        }

        for failure in &failures {
            warn!(
                step = ?failure.step,
                target = %failure.target,
                error = %failure.error,
                "Cleanup step failed"
            );
            self.emit(
                MotionEvent::new(SUPERVISOR_SOURCE, EventKind::CleanupFailed)
                    .detail(format!("{:?} {}: {}", failure.step, failure.target, failure.error)),
            );
        }
        failures
    }

    /// Position and speed of every axis. Per-axis failures read as `None`.
    pub async fn all_positions(&self) -> BTreeMap<AxisKind, AxisSnapshot> {
        let mut snapshot = BTreeMap::new();
        for controller in &self.controllers {
            let position = match controller.read_position().await {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!(axis = %controller.kind(), error = %e, "Position unavailable");
                    None
                }
            };
            let speed = if controller.profile().capabilities.speed_control {
                controller.read_speed().await.ok()
            } else {
                None
            };
            snapshot.insert(controller.kind(), AxisSnapshot { position, speed });
        }
        snapshot
    }

    /// Write `speed` to every axis, best effort.
    ///
    /// Returns the axes that did not accept it; fixed-speed axes always do
    /// not. An empty result means every axis took the new speed.
    pub async fn set_all_speeds(&self, speed: u16) -> Vec<(AxisKind, PositionerError)> {
        let mut failures = Vec::new();
        for controller in &self.controllers {
            if let Err(e) = controller.set_speed(speed).await {
                warn!(axis = %controller.kind(), speed, error = %e, "Speed not applied");
                failures.push((controller.kind(), e));
            }
        }
        failures
    }

    /// Redefine the current position of `axis`.
    pub async fn calibrate(&self, axis: AxisKind, value: f64) -> PositionerResult<f64> {
        self.controller(axis).calibrate_position(value).await
    }

    /// Start jogging `axis`.
    pub async fn jog(&self, axis: AxisKind, direction: JogDirection) -> PositionerResult<()> {
        self.controller(axis).jog(direction).await
    }

    /// Stop jogging `axis`.
    pub async fn stop_jog(&self, axis: AxisKind) -> PositionerResult<()> {
        self.controller(axis).stop_jog().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_capture::EventBuffer;
    use crate::mock::Fault;

    fn simulated() -> (MotionSupervisor, HashMap<String, SimulatedDevice>, EventBuffer) {
        let events = EventBuffer::new();
        let (supervisor, devices) =
            MotionSupervisor::simulated(&PositionerConfig::default(), Arc::new(events.clone()))
                .unwrap();
        (supervisor, devices, events)
    }

    #[test]
    fn antenna_axes_share_one_channel() {
        let (supervisor, devices, _) = simulated();
        assert_eq!(supervisor.channels().len(), 3);
        assert_eq!(devices.len(), 3);
        assert!(Arc::ptr_eq(
            supervisor.controller(AxisKind::AntennaRoll).channel(),
            supervisor.controller(AxisKind::AntennaHeight).channel()
        ));
        assert!(!Arc::ptr_eq(
            supervisor.controller(AxisKind::EutRoll).channel(),
            supervisor.controller(AxisKind::TurntableRoll).channel()
        ));
    }

    #[test]
    fn controllers_are_indexed_by_kind() {
        let (supervisor, _, _) = simulated();
        for kind in AxisKind::ALL {
            assert_eq!(supervisor.controller(kind).kind(), kind);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_applies_default_speeds() {
        let (supervisor, devices, _) = simulated();
        supervisor.initialize().await.unwrap();
        assert_eq!(devices["COM12"].speed(AxisKind::TurntableRoll), Some(3000));
        assert_eq!(devices["COM15"].speed(AxisKind::AntennaHeight), Some(30000));
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_reports_unreachable_axis_as_none() {
        let (supervisor, devices, _) = simulated();
        devices["COM17"].fail_always(Some(Fault::Timeout));

        let snapshot = supervisor.all_positions().await;
        assert_eq!(snapshot[&AxisKind::EutRoll], AxisSnapshot::default());
        assert_eq!(snapshot[&AxisKind::AntennaHeight].position, Some(1520.0));
        assert_eq!(snapshot[&AxisKind::TurntableRoll].speed, Some(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn set_all_speeds_counts_fixed_speed_axis_as_failure() {
        let (supervisor, devices, _) = simulated();
        let failures = supervisor.set_all_speeds(3500).await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, AxisKind::EutRoll);
        assert_eq!(devices["COM15"].speed(AxisKind::AntennaRoll), Some(3500));
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_closes_each_channel_once() {
        let (supervisor, devices, _) = simulated();
        assert!(supervisor.cleanup().await.is_empty());
        assert!(supervisor.cleanup().await.is_empty());
        assert!(supervisor.is_cleaned_up());
        for device in devices.values() {
            assert_eq!(device.close_count(), 1);
        }
    }
}
