//! Per-axis move-and-confirm control.
//!
//! An [`AxisController`] pairs one static [`AxisProfile`] with a reference to
//! the [`TransportChannel`] its axis is wired to. It converts physical units
//! to raw counts, writes the target, pulses the start bit and then polls
//! position until the axis arrives or one of the abort conditions fires:
//!
//! - limit switch tripped (checked first on every poll)
//! - wall-clock budget exceeded
//! - position unchanged for `stall_polls` consecutive polls
//! - stop requested from another task (latched until [`AxisController::resume`])
//! - communication failure after the channel's retries
//!
//! Every abort stops the axis (clears the start bit) before returning.
//! Position within tolerance is the completion criterion; the controller's
//! COMPLETE bit is read for diagnostics only.
//!
//! ```text
//! Idle -> TargetSet -> Moving -> Complete | Stalled | Drifted | TimedOut | LimitFault | CommFailed
//! ```

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::axis::{AxisKind, AxisProfile, LimitState};
use crate::error::{PositionerError, PositionerResult};
use crate::log_capture::{EventKind, EventSink, MotionEvent};
use crate::transport::TransportChannel;

/// Where an axis is in its move lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionState {
    /// No move in progress.
    Idle,
    /// Target register written, not yet started.
    TargetSet,
    /// Start pulse issued.
    Moving,
    /// Last move confirmed by position.
    Complete,
    /// Last move aborted: no progress.
    Stalled,
    /// Last move arrived but the confirming read was outside tolerance.
    Drifted,
    /// Last move aborted: wall-clock budget exceeded.
    TimedOut,
    /// Last move aborted: limit switch.
    LimitFault,
    /// Last operation failed on the wire.
    CommFailed,
}

/// Tolerances and delays of the move-and-confirm loop.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionTiming {
    /// Arrival tolerance in physical units.
    pub tolerance: f64,
    /// Delay between position polls.
    pub poll_interval: Duration,
    /// Largest poll-to-poll change still counted as "no movement".
    pub stall_threshold: f64,
    /// Consecutive motionless polls before a stall abort.
    pub stall_polls: u32,
    /// Wall-clock budget of one move.
    pub move_timeout: Duration,
    /// Gap between the 0 and 1 writes of a start pulse.
    pub start_settle: Duration,
    /// Wait after clearing the start bit.
    pub stop_settle: Duration,
    /// Wait between writing LOCATION and reading it back.
    pub calibration_settle: Duration,
    /// Wait after writing the speed register.
    pub speed_settle: Duration,
}

impl Default for MotionTiming {
    fn default() -> Self {
        Self {
            tolerance: 0.1,
            poll_interval: Duration::from_millis(100),
            stall_threshold: 0.01,
            stall_polls: 50,
            move_timeout: Duration::from_secs(120),
            start_settle: Duration::from_millis(200),
            stop_settle: Duration::from_millis(100),
            calibration_settle: Duration::from_millis(200),
            speed_settle: Duration::from_millis(500),
        }
    }
}

/// Jog direction for axes with jog coils.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JogDirection {
    /// Toward the upper limit.
    Up,
    /// Toward the lower limit.
    Down,
}

impl fmt::Display for JogDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JogDirection::Up => f.write_str("up"),
            JogDirection::Down => f.write_str("down"),
        }
    }
}

impl FromStr for JogDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "up" => Ok(JogDirection::Up),
            "down" => Ok(JogDirection::Down),
            other => Err(format!("unknown jog direction '{}' (expected up or down)", other)),
        }
    }
}

/// How a successful `move_to` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    /// Axis was already within tolerance; nothing was written.
    AlreadyAtTarget,
    /// Motion was started and not waited for.
    Started,
    /// Arrival confirmed by position.
    Complete,
}

/// Summary of a successful move.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveReport {
    /// Axis moved.
    pub axis: AxisKind,
    /// Target as requested.
    pub requested: f64,
    /// Absolute target after shortest-path adjustment.
    pub target: f64,
    /// Last confirmed position.
    pub position: f64,
    /// Number of position polls.
    pub polls: u32,
    /// Time from call to confirmation.
    pub elapsed: Duration,
    /// True if a dropped start pulse was resent.
    pub start_resent: bool,
    /// How the move ended.
    pub outcome: MoveOutcome,
}

#[derive(Debug)]
struct Telemetry {
    state: MotionState,
    last_position: Option<f64>,
    last_read_at: Option<DateTime<Local>>,
}

/// Controller for one physical axis.
pub struct AxisController {
    profile: &'static AxisProfile,
    channel: Arc<TransportChannel>,
    timing: MotionTiming,
    sink: Arc<dyn EventSink>,
    telemetry: Mutex<Telemetry>,
    stop_requested: AtomicBool,
}

impl fmt::Debug for AxisController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AxisController")
            .field("axis", &self.profile.kind)
            .field("port", &self.channel.port())
            .field("telemetry", &*self.telemetry.lock())
            .finish_non_exhaustive()
    }
}

impl AxisController {
    /// Create a controller. The channel may be shared with other axes.
    pub fn new(
        profile: &'static AxisProfile,
        channel: Arc<TransportChannel>,
        timing: MotionTiming,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            profile,
            channel,
            timing,
            sink,
            telemetry: Mutex::new(Telemetry {
                state: MotionState::Idle,
                last_position: None,
                last_read_at: None,
            }),
            stop_requested: AtomicBool::new(false),
        }
    }

    /// Axis identity.
    pub fn kind(&self) -> AxisKind {
        self.profile.kind
    }

    /// Static axis profile.
    pub fn profile(&self) -> &'static AxisProfile {
        self.profile
    }

    /// Channel this axis is wired to.
    pub fn channel(&self) -> &Arc<TransportChannel> {
        &self.channel
    }

    /// Loop tolerances and delays.
    pub fn timing(&self) -> &MotionTiming {
        &self.timing
    }

    /// Current lifecycle state.
    pub fn state(&self) -> MotionState {
        self.telemetry.lock().state
    }

    /// Most recent successfully read position.
    pub fn last_known_position(&self) -> Option<f64> {
        self.telemetry.lock().last_position
    }

    /// Wall-clock time of the most recent successful position read.
    pub fn last_read_at(&self) -> Option<DateTime<Local>> {
        self.telemetry.lock().last_read_at
    }

    fn set_state(&self, state: MotionState) {
        self.telemetry.lock().state = state;
    }

    fn event(&self, kind: EventKind) -> MotionEvent {
        MotionEvent::new(self.profile.kind.id(), kind)
    }

    fn emit(&self, event: MotionEvent) {
        self.sink.record(event);
    }

    /// Read the current position in physical units.
    pub async fn read_position(&self) -> PositionerResult<f64> {
        let counts = self
            .channel
            .read_long(self.profile.registers.location)
            .await?;
        let position = self.profile.from_counts(counts);
        let mut telemetry = self.telemetry.lock();
        telemetry.last_position = Some(position);
        telemetry.last_read_at = Some(Local::now());
        Ok(position)
    }

    /// Write the target register for `target` and return the absolute target
    /// actually written.
    ///
    /// Height targets are range-checked before any bus traffic. Roll targets
    /// are unwrapped along the shortest path from the current position first,
    /// and the unwrapped value must lie within range.
    #[instrument(skip(self), fields(axis = %self.profile.kind), err)]
    pub async fn set_target_position(&self, target: f64) -> PositionerResult<f64> {
        if !self.profile.is_angular() {
            self.profile.check_range(target)?;
        }
        let current = self.read_position().await?;
        self.write_target(current, target).await
    }

    async fn write_target(&self, current: f64, target: f64) -> PositionerResult<f64> {
        let adjusted = self.profile.shortest_path(current, target);
        let counts = self.profile.to_counts(adjusted)?;
        self.channel
            .write_long(self.profile.registers.target, counts)
            .await?;
        self.set_state(MotionState::TargetSet);
        debug!(axis = %self.profile.kind, current, target, adjusted, counts, "Target set");
        self.emit(
            self.event(EventKind::TargetSet)
                .with("requested", target)
                .with("target", adjusted)
                .with("counts", counts as f64),
        );
        Ok(adjusted)
    }

    /// Pulse the start bit 0 -> 1.
    ///
    /// Some controllers ignore a start bit that is still set from the previous
    /// move, so the bit is always cleared first. Both writes happen under one
    /// channel lock.
    pub async fn start_movement(&self) -> PositionerResult<()> {
        self.channel
            .pulse_coil(
                self.profile.registers.start_bit.address,
                self.timing.start_settle,
            )
            .await?;
        self.set_state(MotionState::Moving);
        self.emit(self.event(EventKind::MoveStarted));
        Ok(())
    }

    /// Stop motion by clearing the start bit.
    ///
    /// The STOP coil in the register map is never written.
    pub async fn stop_movement(&self) -> PositionerResult<()> {
        self.channel
            .write_coil(
                self.profile.registers.start_bit.address,
                false,
                self.timing.stop_settle,
            )
            .await?;
        {
            let mut telemetry = self.telemetry.lock();
            if matches!(
                telemetry.state,
                MotionState::Moving | MotionState::TargetSet
            ) {
                telemetry.state = MotionState::Idle;
            }
        }
        info!(axis = %self.profile.kind, "Motion stopped");
        self.emit(self.event(EventKind::StopIssued));
        Ok(())
    }

    /// Clear the start bit without settling.
    pub async fn reset_start_bit(&self) -> PositionerResult<()> {
        self.channel
            .write_coil(self.profile.registers.start_bit.address, false, Duration::ZERO)
            .await
    }

    /// Ask an in-progress `move_to` to stop at its next poll.
    ///
    /// The request stays latched: later moves fail with `Cancelled` until
    /// [`resume`](Self::resume) is called.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Clear a latched stop request.
    pub fn resume(&self) {
        if self.stop_requested.swap(false, Ordering::SeqCst) {
            info!(axis = %self.profile.kind, "Stop latch cleared");
        }
    }

    /// True while a stop request is latched.
    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    fn ensure_not_stopped(&self) -> PositionerResult<()> {
        if self.is_stop_requested() {
            Err(PositionerError::Cancelled {
                axis: self.profile.kind,
            })
        } else {
            Ok(())
        }
    }

    /// Move to `target` and, if `wait` is set, confirm arrival.
    #[instrument(skip(self), fields(axis = %self.profile.kind), err)]
    pub async fn move_to(&self, target: f64, wait: bool) -> PositionerResult<MoveReport> {
        self.ensure_not_stopped()
            .map_err(|e| self.record_failure(e))?;
        if !self.profile.is_angular() {
            self.profile.check_range(target)?;
        }
        let started = Instant::now();

        let current = self
            .read_position()
            .await
            .map_err(|e| self.record_failure(e))?;
        let adjusted = self.profile.shortest_path(current, target);

        let mut report = MoveReport {
            axis: self.profile.kind,
            requested: target,
            target: adjusted,
            position: current,
            polls: 0,
            elapsed: Duration::ZERO,
            start_resent: false,
            outcome: MoveOutcome::AlreadyAtTarget,
        };

        if (current - adjusted).abs() < self.timing.tolerance {
            info!(axis = %self.profile.kind, position = current, target, "Already at target");
            self.set_state(MotionState::Complete);
            self.emit(
                self.event(EventKind::AlreadyAtTarget)
                    .with("position", current)
                    .with("target", adjusted),
            );
            return Ok(report);
        }

        self.write_target(current, target)
            .await
            .map_err(|e| self.record_failure(e))?;
        self.ensure_not_stopped()
            .map_err(|e| self.record_failure(e))?;
        self.start_movement()
            .await
            .map_err(|e| self.record_failure(e))?;

        if !wait {
            report.outcome = MoveOutcome::Started;
            report.elapsed = started.elapsed();
            return Ok(report);
        }

        match self.confirm_arrival(&mut report, started).await {
            Ok(()) => Ok(report),
            Err(err) => {
                if !matches!(err, PositionerError::Drifted { .. }) {
                    self.halt().await;
                }
                Err(self.record_failure(err))
            }
        }
    }

    /// Poll until arrival or abort. On error the caller stops the axis.
    async fn confirm_arrival(
        &self,
        report: &mut MoveReport,
        started: Instant,
    ) -> PositionerResult<()> {
        let axis = self.profile.kind;
        let target = report.target;
        let mut last = report.position;
        let mut motionless = 0u32;

        loop {
            tokio::time::sleep(self.timing.poll_interval).await;

            self.ensure_not_stopped()?;

            let switches = self.check_limits().await?;
            if switches.is_tripped() {
                return Err(PositionerError::LimitFault { axis, switches });
            }

            let position = self.read_position().await?;
            report.polls += 1;
            report.position = position;
            debug!(axis = %axis, position, target, poll = report.polls, "Polled position");

            if (position - target).abs() < self.timing.tolerance {
                break;
            }

            let elapsed = started.elapsed();
            if elapsed >= self.timing.move_timeout {
                return Err(PositionerError::TimedOut {
                    axis,
                    target,
                    position: Some(position),
                    elapsed,
                });
            }

            if (position - last).abs() <= self.timing.stall_threshold {
                motionless += 1;
                if motionless >= self.timing.stall_polls {
                    return Err(PositionerError::Stalled {
                        axis,
                        position,
                        target,
                    });
                }
                if !report.start_resent {
                    warn!(axis = %axis, position, "No progress, resending start pulse");
                    self.start_movement().await?;
                    report.start_resent = true;
                    self.emit(self.event(EventKind::StartPulseResent).with("position", position));
                }
            } else {
                motionless = 0;
            }
            last = position;
        }

        match self.check_completion().await {
            Ok(bit) => debug!(axis = %axis, complete_bit = bit, "Position reached"),
            Err(e) => debug!(axis = %axis, error = %e, "COMPLETE bit unreadable"),
        }

        let position = self.read_position().await?;
        report.position = position;
        report.elapsed = started.elapsed();
        if (position - target).abs() >= self.timing.tolerance {
            return Err(PositionerError::Drifted {
                axis,
                position,
                target,
            });
        }

        report.outcome = MoveOutcome::Complete;
        self.set_state(MotionState::Complete);
        info!(
            axis = %axis,
            position,
            polls = report.polls,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Move complete"
        );
        self.emit(
            self.event(EventKind::MoveComplete)
                .with("position", position)
                .with("target", target)
                .with("polls", f64::from(report.polls))
                .with("elapsed_s", report.elapsed.as_secs_f64()),
        );
        Ok(())
    }

    /// Best-effort stop used on abort paths.
    async fn halt(&self) {
        if let Err(e) = self.stop_movement().await {
            warn!(axis = %self.profile.kind, error = %e, "Stop after failed move also failed");
        }
    }

    /// Update state and emit the event matching `err`, then hand it back.
    fn record_failure(&self, err: PositionerError) -> PositionerError {
        let (state, kind) = match &err {
            PositionerError::Communication { .. } => (MotionState::CommFailed, EventKind::CommFailed),
            PositionerError::Stalled { .. } => (MotionState::Stalled, EventKind::Stalled),
            PositionerError::Drifted { .. } => (MotionState::Drifted, EventKind::Drifted),
            PositionerError::TimedOut { .. } => (MotionState::TimedOut, EventKind::TimedOut),
            PositionerError::LimitFault { .. } => (MotionState::LimitFault, EventKind::LimitFault),
            PositionerError::Cancelled { .. } => (MotionState::Idle, EventKind::Cancelled),
            _ => {
                warn!(axis = %self.profile.kind, error = %err, "Move rejected");
                return err;
            }
        };
        self.set_state(state);
        warn!(axis = %self.profile.kind, error = %err, "Move failed");
        let mut event = self.event(kind).detail(err.to_string());
        if let Some(position) = self.last_known_position() {
            event = event.with("position", position);
        }
        self.emit(event);
        err
    }

    /// Redefine the current position as `value` without moving.
    ///
    /// Writes LOCATION directly, settles, and reads it back. Fails with
    /// `CalibrationMismatch` if the read-back differs by tolerance or more.
    #[instrument(skip(self), fields(axis = %self.profile.kind), err)]
    pub async fn calibrate_position(&self, value: f64) -> PositionerResult<f64> {
        let counts = self.profile.to_counts(value)?;
        let read_back = self
            .channel
            .write_long_read_back(
                self.profile.registers.location,
                counts,
                self.timing.calibration_settle,
            )
            .await?;
        let actual = self.profile.from_counts(read_back);
        {
            let mut telemetry = self.telemetry.lock();
            telemetry.last_position = Some(actual);
            telemetry.last_read_at = Some(Local::now());
        }

        if (actual - value).abs() < self.timing.tolerance {
            info!(axis = %self.profile.kind, value, "Position calibrated");
            self.emit(self.event(EventKind::Calibrated).with("position", actual));
            Ok(actual)
        } else {
            self.emit(
                self.event(EventKind::CalibrationFailed)
                    .with("expected", value)
                    .with("actual", actual),
            );
            Err(PositionerError::CalibrationMismatch {
                axis: self.profile.kind,
                expected: value,
                actual,
            })
        }
    }

    fn speed_register(&self, operation: &'static str) -> PositionerResult<u16> {
        self.profile
            .registers
            .speed
            .filter(|_| self.profile.capabilities.speed_control)
            .ok_or(PositionerError::Unsupported {
                axis: self.profile.kind,
                operation,
            })
    }

    /// Read the speed register.
    pub async fn read_speed(&self) -> PositionerResult<u16> {
        let address = self.speed_register("read_speed")?;
        self.channel.read_register(address).await
    }

    /// Write the speed register. Rejects values above the axis maximum.
    #[instrument(skip(self), fields(axis = %self.profile.kind), err)]
    pub async fn set_speed(&self, speed: u16) -> PositionerResult<()> {
        let address = self.speed_register("set_speed")?;
        if let Some(range) = self.profile.speed {
            if speed > range.max {
                return Err(PositionerError::InvalidSpeed {
                    axis: self.profile.kind,
                    speed,
                    max: range.max,
                });
            }
        }
        self.channel
            .write_register(address, speed, self.timing.speed_settle)
            .await?;
        self.emit(self.event(EventKind::SpeedSet).with("speed", f64::from(speed)));
        Ok(())
    }

    /// Apply the profile's default speed. Returns the speed written, if any.
    pub async fn apply_default_speed(&self) -> PositionerResult<Option<u16>> {
        match self.profile.speed {
            Some(range) => {
                self.set_speed(range.default).await?;
                Ok(Some(range.default))
            }
            None => Ok(None),
        }
    }

    /// Read the controller's COMPLETE bit. Advisory only.
    pub async fn check_completion(&self) -> PositionerResult<bool> {
        self.channel
            .read_bit(self.profile.registers.complete_bit)
            .await
    }

    /// Read both limit switches of this axis.
    pub async fn check_limits(&self) -> PositionerResult<LimitState> {
        let limits = self.profile.registers.limits;
        let (positive_bit, negative_bit) = limits.pair();
        let (positive, negative) = self
            .channel
            .read_bit_pair(positive_bit, negative_bit)
            .await?;
        Ok(LimitState {
            positive,
            negative,
            rotary: limits.is_rotary(),
        })
    }

    /// Assert a jog coil. Only axes with jog coils support this.
    pub async fn jog(&self, direction: JogDirection) -> PositionerResult<()> {
        let jog = self
            .profile
            .registers
            .jog
            .filter(|_| self.profile.capabilities.jog)
            .ok_or(PositionerError::Unsupported {
                axis: self.profile.kind,
                operation: "jog",
            })?;
        let coil = match direction {
            JogDirection::Up => jog.up,
            JogDirection::Down => jog.down,
        };
        self.channel
            .write_coil(coil.address, true, Duration::ZERO)
            .await?;
        info!(axis = %self.profile.kind, %direction, "Jogging");
        self.emit(self.event(EventKind::Jog).detail(direction.to_string()));
        Ok(())
    }

    /// Jog toward the upper limit.
    pub async fn move_up(&self) -> PositionerResult<()> {
        self.jog(JogDirection::Up).await
    }

    /// Jog toward the lower limit.
    pub async fn move_down(&self) -> PositionerResult<()> {
        self.jog(JogDirection::Down).await
    }

    /// Release both jog coils.
    pub async fn stop_jog(&self) -> PositionerResult<()> {
        let jog = self.profile.registers.jog.ok_or(PositionerError::Unsupported {
            axis: self.profile.kind,
            operation: "stop_jog",
        })?;
        self.channel
            .write_coil(jog.up.address, false, Duration::ZERO)
            .await?;
        self.channel
            .write_coil(jog.down.address, false, Duration::ZERO)
            .await
    }

    /// Per-axis teardown: stop, settle, reset the start bit.
    ///
    /// Both steps run even if the first fails. The channel is left open; it
    /// may be shared and is closed by its owner.
    pub async fn close(&self) -> PositionerResult<()> {
        let stopped = self.stop_movement().await;
        tokio::time::sleep(self.timing.start_settle).await;
        let reset = self.reset_start_bit().await;
        stopped.and(reset)
    }
}
