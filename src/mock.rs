//! Simulated positioner controller for tests and `--simulate` runs.
//!
//! A [`SimulatedDevice`] models one Modbus slave hosting one or more axes,
//! addressed through the same register map the real controllers use. Every
//! bus operation is appended to a journal so tests can assert on the exact
//! wire traffic.
//!
//! Motion is driven by location reads rather than wall time: while an axis
//! is moving, each read of its LOCATION register advances it by one step
//! toward TARGET. This makes "N polls" deterministic under a paused clock.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crate::axis::{AxisKind, AxisProfile, BitField, BitFunction, LimitState};
use crate::error::{BusError, EXCEPTION_ILLEGAL_DATA_ADDRESS};
use crate::modbus::rtu::{
    FN_READ_COILS, FN_READ_DISCRETE_INPUTS, FN_READ_HOLDING_REGISTERS, FN_WRITE_MULTIPLE_REGISTERS,
    FN_WRITE_SINGLE_COIL,
};
use crate::modbus::{decode_long, encode_long, RegisterBus};

/// One operation as seen on the simulated wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusOp {
    /// Holding register read.
    ReadRegisters { address: u16, count: u16 },
    /// Holding register write.
    WriteRegisters { address: u16, values: Vec<u16> },
    /// Coil or discrete input read.
    ReadBit { address: u16, function: BitFunction },
    /// Single coil write.
    WriteCoil { address: u16, value: bool },
    /// Buffer flush before an operation.
    ClearBuffers,
    /// Port released.
    Close,
}

/// Injected failure for the next register operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// No reply.
    Timeout,
    /// Exception 0x02.
    IllegalAddress,
}

#[derive(Debug)]
struct SimAxis {
    profile: &'static AxisProfile,
    location: i64,
    target: i64,
    speed: u16,
    moving: bool,
    jog: Option<bool>,
    step: i64,
    stuck: bool,
    dropped_pulses: u32,
    drift_after_arrival: Option<i64>,
    settled: bool,
    limits: LimitState,
}

impl SimAxis {
    fn new(profile: &'static AxisProfile) -> Self {
        let (min, max) = profile.position_range;
        let factor = profile.conversion.factor();
        let home = (0.0f64.clamp(min, max) * factor).round() as i64;
        let step = (((max - min) / 100.0) * factor).round().max(1.0) as i64;
        Self {
            profile,
            location: home,
            target: home,
            speed: profile.speed.map(|s| s.default).unwrap_or(0),
            moving: false,
            jog: None,
            step,
            stuck: false,
            dropped_pulses: 0,
            drift_after_arrival: None,
            settled: false,
            limits: LimitState {
                rotary: profile.registers.limits.is_rotary(),
                ..LimitState::default()
            },
        }
    }

    fn counts(&self, value: f64) -> i64 {
        (value * self.profile.conversion.factor()).round() as i64
    }

    /// One motion step, applied on every location read.
    fn advance(&mut self) {
        if self.stuck {
            return;
        }
        if let Some(up) = self.jog {
            let (min, max) = self.profile.position_range;
            let bound = if up { self.counts(max) } else { self.counts(min) };
            let delta = (bound - self.location).clamp(-self.step, self.step);
            self.location += delta;
            if self.location == bound {
                if up {
                    self.limits.positive = true;
                } else {
                    self.limits.negative = true;
                }
            }
            return;
        }
        if self.moving {
            let delta = (self.target - self.location).clamp(-self.step, self.step);
            self.location += delta;
            if self.location == self.target {
                self.moving = false;
                self.settled = true;
            }
        } else if self.settled {
            self.settled = false;
            if let Some(offset) = self.drift_after_arrival.take() {
                self.location += offset;
            }
        }
    }
}

#[derive(Debug, Default)]
struct DeviceState {
    axes: Vec<SimAxis>,
    coils: HashMap<u16, bool>,
    journal: Vec<BusOp>,
    faults: VecDeque<Fault>,
    persistent_fault: Option<Fault>,
    closes: usize,
}

impl DeviceState {
    fn axis_mut(&mut self, kind: AxisKind) -> Option<&mut SimAxis> {
        self.axes.iter_mut().find(|a| a.profile.kind == kind)
    }

    fn take_fault(&mut self, function: u8) -> Result<(), BusError> {
        let fault = self.faults.pop_front().or(self.persistent_fault);
        match fault {
            None => Ok(()),
            Some(Fault::Timeout) => Err(BusError::ResponseTimeout(Duration::from_secs(1))),
            Some(Fault::IllegalAddress) => Err(illegal(function)),
        }
    }
}

fn illegal(function: u8) -> BusError {
    BusError::Exception {
        function,
        code: EXCEPTION_ILLEGAL_DATA_ADDRESS,
    }
}

/// Shared handle to one simulated slave.
///
/// Cloning yields another handle to the same device. Axes sharing a device
/// must have disjoint register layouts (one height plus one roll axis, as on
/// the antenna mast).
#[derive(Debug, Clone, Default)]
pub struct SimulatedDevice(Arc<Mutex<DeviceState>>);

impl SimulatedDevice {
    /// A device hosting the given axes, each parked at 0 (or its range minimum).
    pub fn new(profiles: &[&'static AxisProfile]) -> Self {
        let state = DeviceState {
            axes: profiles.iter().map(|p| SimAxis::new(p)).collect(),
            ..DeviceState::default()
        };
        Self(Arc::new(Mutex::new(state)))
    }

    /// A bus endpoint talking to this device.
    pub fn bus(&self) -> SimulatedBus {
        SimulatedBus {
            device: self.clone(),
            closed: false,
        }
    }

    fn with_axis<T>(&self, kind: AxisKind, f: impl FnOnce(&mut SimAxis) -> T) -> Option<T> {
        self.0.lock().axis_mut(kind).map(f)
    }

    /// Current physical position of `kind`.
    pub fn position(&self, kind: AxisKind) -> Option<f64> {
        self.with_axis(kind, |a| a.location as f64 / a.profile.conversion.factor())
    }

    /// Last commanded physical target of `kind`.
    pub fn target(&self, kind: AxisKind) -> Option<f64> {
        self.with_axis(kind, |a| a.target as f64 / a.profile.conversion.factor())
    }

    /// Force the physical position of `kind`.
    pub fn set_position(&self, kind: AxisKind, value: f64) {
        self.with_axis(kind, |a| {
            a.location = a.counts(value);
            a.target = a.location;
        });
    }

    /// Distance travelled per location read while moving.
    pub fn set_step(&self, kind: AxisKind, step: f64) {
        self.with_axis(kind, |a| a.step = a.counts(step).max(1));
    }

    /// Freeze the axis in place regardless of commands.
    pub fn set_stuck(&self, kind: AxisKind, stuck: bool) {
        self.with_axis(kind, |a| a.stuck = stuck);
    }

    /// Shift `kind` by `offset` on the first location read after its next
    /// arrival.
    pub fn drift_after_arrival(&self, kind: AxisKind, offset: f64) {
        self.with_axis(kind, |a| a.drift_after_arrival = Some(a.counts(offset)));
    }

    /// Ignore the next `count` start edges.
    pub fn drop_start_pulses(&self, kind: AxisKind, count: u32) {
        self.with_axis(kind, |a| a.dropped_pulses = count);
    }

    /// Assert or release the limit switches of `kind`.
    pub fn set_limits(&self, kind: AxisKind, positive: bool, negative: bool) {
        self.with_axis(kind, |a| {
            a.limits.positive = positive;
            a.limits.negative = negative;
        });
    }

    /// Current speed register of `kind`.
    pub fn speed(&self, kind: AxisKind) -> Option<u16> {
        self.with_axis(kind, |a| a.speed)
    }

    /// True while `kind` is executing a start command.
    pub fn is_moving(&self, kind: AxisKind) -> bool {
        self.with_axis(kind, |a| a.moving).unwrap_or(false)
    }

    /// Fail the next `count` register operations with `fault`.
    pub fn fail_next(&self, count: usize, fault: Fault) {
        let mut state = self.0.lock();
        state.faults.extend(std::iter::repeat(fault).take(count));
    }

    /// Fail every register operation until cleared with `None`.
    pub fn fail_always(&self, fault: Option<Fault>) {
        self.0.lock().persistent_fault = fault;
    }

    /// Copy of every operation seen so far.
    pub fn journal(&self) -> Vec<BusOp> {
        self.0.lock().journal.clone()
    }

    /// Forget the recorded operations.
    pub fn clear_journal(&self) {
        self.0.lock().journal.clear();
    }

    /// Values written to coil `address`, in order.
    pub fn coil_writes(&self, address: u16) -> Vec<bool> {
        self.0
            .lock()
            .journal
            .iter()
            .filter_map(|op| match op {
                BusOp::WriteCoil { address: a, value } if *a == address => Some(*value),
                _ => None,
            })
            .collect()
    }

    /// True if any write to holding registers happened.
    pub fn has_register_writes(&self) -> bool {
        self.0
            .lock()
            .journal
            .iter()
            .any(|op| matches!(op, BusOp::WriteRegisters { .. }))
    }

    /// Number of times a bus endpoint was closed.
    pub fn close_count(&self) -> usize {
        self.0.lock().closes
    }

    fn read_registers(&self, address: u16, count: u16) -> Result<Vec<u16>, BusError> {
        let mut state = self.0.lock();
        state.journal.push(BusOp::ReadRegisters { address, count });
        state.take_fault(FN_READ_HOLDING_REGISTERS)?;

        for axis in state.axes.iter_mut() {
            let regs = axis.profile.registers;
            if address == regs.location.address && count == u16::from(regs.location.registers) {
                axis.advance();
                return encode_long(&regs.location, axis.location);
            }
            if address == regs.target.address && count == u16::from(regs.target.registers) {
                return encode_long(&regs.target, axis.target);
            }
            if regs.speed == Some(address) && count == 1 {
                return Ok(vec![axis.speed]);
            }
        }
        Err(illegal(FN_READ_HOLDING_REGISTERS))
    }

    fn write_registers(&self, address: u16, values: &[u16]) -> Result<(), BusError> {
        let mut state = self.0.lock();
        state.journal.push(BusOp::WriteRegisters {
            address,
            values: values.to_vec(),
        });
        state.take_fault(FN_WRITE_MULTIPLE_REGISTERS)?;

        for axis in state.axes.iter_mut() {
            let regs = axis.profile.registers;
            if address == regs.target.address && values.len() == usize::from(regs.target.registers)
            {
                axis.target = decode_long(&regs.target, values)?;
                return Ok(());
            }
            if address == regs.location.address
                && values.len() == usize::from(regs.location.registers)
            {
                axis.location = decode_long(&regs.location, values)?;
                axis.target = axis.location;
                axis.moving = false;
                return Ok(());
            }
            if regs.speed == Some(address) && values.len() == 1 {
                axis.speed = values[0];
                return Ok(());
            }
        }
        Err(illegal(FN_WRITE_MULTIPLE_REGISTERS))
    }

    fn read_bit(&self, bit: BitField) -> Result<bool, BusError> {
        let mut state = self.0.lock();
        state.journal.push(BusOp::ReadBit {
            address: bit.address,
            function: bit.function,
        });
        let function = match bit.function {
            BitFunction::Coil => FN_READ_COILS,
            BitFunction::DiscreteInput => FN_READ_DISCRETE_INPUTS,
        };
        state.take_fault(function)?;

        if bit.function == BitFunction::Coil {
            return Ok(state.coils.get(&bit.address).copied().unwrap_or(false));
        }
        for axis in &state.axes {
            let regs = axis.profile.registers;
            let (positive, negative) = regs.limits.pair();
            if bit == regs.complete_bit {
                return Ok(!axis.moving && axis.location == axis.target);
            }
            if bit == positive {
                return Ok(axis.limits.positive);
            }
            if bit == negative {
                return Ok(axis.limits.negative);
            }
        }
        Err(illegal(function))
    }

    fn write_coil(&self, address: u16, value: bool) -> Result<(), BusError> {
        let mut state = self.0.lock();
        state.journal.push(BusOp::WriteCoil { address, value });
        state.take_fault(FN_WRITE_SINGLE_COIL)?;

        let previous = state.coils.insert(address, value).unwrap_or(false);
        for axis in state.axes.iter_mut() {
            let regs = axis.profile.registers;
            if address == regs.start_bit.address {
                if !value {
                    axis.moving = false;
                } else if !previous {
                    if axis.dropped_pulses > 0 {
                        axis.dropped_pulses -= 1;
                    } else {
                        axis.moving = axis.location != axis.target;
                    }
                }
                return Ok(());
            }
            if let Some(jog) = regs.jog {
                if address == jog.up.address {
                    axis.jog = value.then_some(true);
                    return Ok(());
                }
                if address == jog.down.address {
                    axis.jog = value.then_some(false);
                    return Ok(());
                }
            }
        }
        // Enable, stop and unknown coils are stored but have no effect.
        Ok(())
    }
}

/// [`RegisterBus`] endpoint of a [`SimulatedDevice`].
#[derive(Debug)]
pub struct SimulatedBus {
    device: SimulatedDevice,
    closed: bool,
}

impl SimulatedBus {
    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RegisterBus for SimulatedBus {
    async fn read_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>, BusError> {
        self.ensure_open()?;
        self.device.read_registers(address, count)
    }

    async fn write_registers(&mut self, address: u16, values: &[u16]) -> Result<(), BusError> {
        self.ensure_open()?;
        self.device.write_registers(address, values)
    }

    async fn read_bit(&mut self, bit: BitField) -> Result<bool, BusError> {
        self.ensure_open()?;
        self.device.read_bit(bit)
    }

    async fn write_coil(&mut self, address: u16, value: bool) -> Result<(), BusError> {
        self.ensure_open()?;
        self.device.write_coil(address, value)
    }

    async fn clear_buffers(&mut self) -> Result<(), BusError> {
        self.ensure_open()?;
        self.device.0.lock().journal.push(BusOp::ClearBuffers);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BusError> {
        self.ensure_open()?;
        self.closed = true;
        let mut state = self.device.0.lock();
        state.journal.push(BusOp::Close);
        state.closes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::{ANTENNA_HEIGHT, ANTENNA_ROLL, EUT_ROLL};
    use crate::modbus::{read_long, write_long};

    #[tokio::test]
    async fn start_edge_moves_toward_target() {
        let device = SimulatedDevice::new(&[&ANTENNA_ROLL]);
        device.set_step(AxisKind::AntennaRoll, 30.0);
        let mut bus = device.bus();
        let regs = ANTENNA_ROLL.registers;

        write_long(&mut bus, &regs.target, 90_000).await.unwrap();
        bus.write_coil(regs.start_bit.address, false).await.unwrap();
        bus.write_coil(regs.start_bit.address, true).await.unwrap();

        let mut reads = Vec::new();
        for _ in 0..4 {
            reads.push(read_long(&mut bus, &regs.location).await.unwrap());
        }
        assert_eq!(reads, vec![30_000, 60_000, 90_000, 90_000]);
        assert!(bus.read_bit(regs.complete_bit).await.unwrap());
    }

    #[tokio::test]
    async fn shared_device_hosts_height_and_roll() {
        let device = SimulatedDevice::new(&[&ANTENNA_ROLL, &ANTENNA_HEIGHT]);
        let mut bus = device.bus();
        let height = read_long(&mut bus, &ANTENNA_HEIGHT.registers.location)
            .await
            .unwrap();
        assert_eq!(height, 1520 * 8960);
        let roll = read_long(&mut bus, &ANTENNA_ROLL.registers.location)
            .await
            .unwrap();
        assert_eq!(roll, 0);
    }

    #[tokio::test]
    async fn signed_axis_accepts_negative_targets() {
        let device = SimulatedDevice::new(&[&EUT_ROLL]);
        let mut bus = device.bus();
        write_long(&mut bus, &EUT_ROLL.registers.target, -800)
            .await
            .unwrap();
        assert_eq!(device.target(AxisKind::EutRoll), Some(-10.0));
    }

    #[tokio::test]
    async fn unknown_register_is_illegal_address() {
        let device = SimulatedDevice::new(&[&EUT_ROLL]);
        let mut bus = device.bus();
        let err = bus.read_registers(100, 2).await.unwrap_err();
        assert!(err.is_addressing());
        // EUT roll has no speed register.
        assert!(bus.read_registers(9, 1).await.unwrap_err().is_addressing());
    }

    #[tokio::test]
    async fn injected_faults_are_consumed_in_order() {
        let device = SimulatedDevice::new(&[&ANTENNA_ROLL]);
        device.fail_next(1, Fault::Timeout);
        let mut bus = device.bus();
        assert!(matches!(
            bus.read_registers(4, 2).await,
            Err(BusError::ResponseTimeout(_))
        ));
        assert!(bus.read_registers(4, 2).await.is_ok());
        assert_eq!(device.journal().len(), 2);
    }

    #[tokio::test]
    async fn jogging_runs_into_the_limit_switch() {
        let device = SimulatedDevice::new(&[&ANTENNA_HEIGHT]);
        device.set_position(AxisKind::AntennaHeight, 1899.0);
        let mut bus = device.bus();
        let regs = ANTENNA_HEIGHT.registers;
        let (upper, _) = regs.limits.pair();
        let jog = regs.jog.unwrap();

        bus.write_coil(jog.up.address, true).await.unwrap();
        read_long(&mut bus, &regs.location).await.unwrap();
        assert_eq!(device.position(AxisKind::AntennaHeight), Some(1900.0));
        assert!(bus.read_bit(upper).await.unwrap());
    }

    #[tokio::test]
    async fn closed_bus_rejects_operations() {
        let device = SimulatedDevice::new(&[&ANTENNA_ROLL]);
        let mut bus = device.bus();
        bus.close().await.unwrap();
        assert!(matches!(bus.read_registers(4, 2).await, Err(BusError::Closed)));
        assert_eq!(device.close_count(), 1);
    }
}
