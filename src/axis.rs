//! Axis kinds, their immutable profiles and unit conversion.
//!
//! Every positioner on the range is one of four axis kinds. The kinds differ
//! only in data: conversion factor, travel limits, speed bounds and the
//! register layout of the controller they sit behind. Two capability flags
//! (`jog`, `speed_control`) cover the only behavioral differences.
//!
//! Profiles are `static` and never mutated.
//!
//! | Axis | Unit | Factor | Range | Speed (default/max) |
//! |------|------|--------|-------|---------------------|
//! | ANT_ROLL | deg | 1000 steps/deg | 0..180 | 3000 / 5000 |
//! | ANT_HEIGHT | mm | 8960 counts/mm | 1520..1900 | 30000 / 37500 |
//! | EUT_ROLL | deg | 80 steps/deg | -360..360 | fixed |
//! | TT_ROLL | deg | 373 steps/deg | 0..360 | 3000 / 4000 |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{PositionerError, PositionerResult};

/// One independently controlled mechanical degree of freedom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisKind {
    /// Antenna polarization roll.
    AntennaRoll,
    /// Antenna mast height.
    AntennaHeight,
    /// Equipment-under-test roll.
    EutRoll,
    /// Turntable azimuth.
    TurntableRoll,
}

impl AxisKind {
    /// All axis kinds, in declaration order.
    pub const ALL: [AxisKind; 4] = [
        AxisKind::AntennaRoll,
        AxisKind::AntennaHeight,
        AxisKind::EutRoll,
        AxisKind::TurntableRoll,
    ];

    /// Short identifier used in logs and configuration.
    pub fn id(&self) -> &'static str {
        match self {
            AxisKind::AntennaRoll => "ANT_ROLL",
            AxisKind::AntennaHeight => "ANT_HEIGHT",
            AxisKind::EutRoll => "EUT_ROLL",
            AxisKind::TurntableRoll => "TT_ROLL",
        }
    }

    /// The static profile for this axis kind.
    pub fn profile(&self) -> &'static AxisProfile {
        match self {
            AxisKind::AntennaRoll => &ANTENNA_ROLL,
            AxisKind::AntennaHeight => &ANTENNA_HEIGHT,
            AxisKind::EutRoll => &EUT_ROLL,
            AxisKind::TurntableRoll => &TURNTABLE_ROLL,
        }
    }
}

impl fmt::Display for AxisKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for AxisKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "ant_roll" | "antenna_roll" => Ok(AxisKind::AntennaRoll),
            "ant_height" | "antenna_height" => Ok(AxisKind::AntennaHeight),
            "eut_roll" => Ok(AxisKind::EutRoll),
            "tt_roll" | "turntable_roll" => Ok(AxisKind::TurntableRoll),
            other => Err(format!(
                "unknown axis '{}' (expected ant_roll, ant_height, eut_roll or tt_roll)",
                other
            )),
        }
    }
}

// =============================================================================
// Register layout
// =============================================================================

/// Word order of a multi-register long value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordOrder {
    /// Least significant register at the lowest address.
    LowFirst,
    /// Most significant register at the lowest address.
    HighFirst,
}

/// A long integer spread over consecutive holding registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterField {
    /// Address of the first holding register.
    pub address: u16,
    /// Number of 16-bit registers (1..=4).
    pub registers: u8,
    /// Two's complement interpretation.
    pub signed: bool,
    /// Register order within the value.
    pub word_order: WordOrder,
}

impl RegisterField {
    const fn long(address: u16, signed: bool) -> Self {
        Self {
            address,
            registers: 2,
            signed,
            word_order: WordOrder::LowFirst,
        }
    }

    /// Largest raw count representable in this field.
    pub fn max_count(&self) -> i64 {
        let bits = u32::from(self.registers) * 16;
        if bits >= 64 {
            i64::MAX
        } else if self.signed {
            (1i64 << (bits - 1)) - 1
        } else {
            (1i64 << bits) - 1
        }
    }

    /// Smallest raw count representable in this field.
    pub fn min_count(&self) -> i64 {
        let bits = u32::from(self.registers) * 16;
        if !self.signed {
            0
        } else if bits >= 64 {
            i64::MIN
        } else {
            -(1i64 << (bits - 1))
        }
    }
}

/// How a single discrete bit is accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitFunction {
    /// Read with function 0x01, write with 0x05.
    Coil,
    /// Read-only, function 0x02.
    DiscreteInput,
}

/// A single discrete bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitField {
    /// Bit address.
    pub address: u16,
    /// Access function.
    pub function: BitFunction,
}

impl BitField {
    const fn coil(address: u16) -> Self {
        Self {
            address,
            function: BitFunction::Coil,
        }
    }

    const fn input(address: u16) -> Self {
        Self {
            address,
            function: BitFunction::DiscreteInput,
        }
    }
}

/// End-of-travel switches for one axis family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitBits {
    /// Height axes: upper and lower limit.
    Vertical { upper: BitField, lower: BitField },
    /// Roll axes: clockwise and counter-clockwise limit.
    Rotary { cw: BitField, ccw: BitField },
}

impl LimitBits {
    /// The (positive, negative) switch pair.
    pub fn pair(&self) -> (BitField, BitField) {
        match *self {
            LimitBits::Vertical { upper, lower } => (upper, lower),
            LimitBits::Rotary { cw, ccw } => (cw, ccw),
        }
    }

    /// True for clockwise/counter-clockwise switches.
    pub fn is_rotary(&self) -> bool {
        matches!(self, LimitBits::Rotary { .. })
    }
}

/// Jog coils, only present on the height axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JogBits {
    /// Drive up while asserted.
    pub up: BitField,
    /// Drive down while asserted.
    pub down: BitField,
}

/// Register and bit layout of one controller family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMap {
    /// Current raw position (read; written only by calibration).
    pub location: RegisterField,
    /// Desired raw position (write).
    pub target: RegisterField,
    /// 16-bit speed register, absent on fixed-speed axes.
    pub speed: Option<u16>,
    /// A 0 -> 1 edge starts motion; clearing it stops motion.
    pub start_bit: BitField,
    /// Drive enable output.
    pub enable_bit: BitField,
    /// Advisory "move complete" input.
    pub complete_bit: BitField,
    /// Jog coils.
    pub jog: Option<JogBits>,
    /// End-of-travel switches.
    pub limits: LimitBits,
    /// Present in the controller but never written; stop clears `start_bit`.
    pub stop_bit: BitField,
}

/// Layout shared by the height controller.
pub const HEIGHT_REGISTERS: RegisterMap = RegisterMap {
    location: RegisterField::long(0, false),
    target: RegisterField::long(2, false),
    speed: Some(8),
    start_bit: BitField::coil(0),
    enable_bit: BitField::coil(1),
    complete_bit: BitField::input(2),
    jog: Some(JogBits {
        up: BitField::coil(3),
        down: BitField::coil(4),
    }),
    limits: LimitBits::Vertical {
        upper: BitField::input(11),
        lower: BitField::input(12),
    },
    stop_bit: BitField::coil(14),
};

/// Layout shared by the roll controllers.
pub const ROLL_REGISTERS: RegisterMap = RegisterMap {
    location: RegisterField::long(4, false),
    target: RegisterField::long(6, false),
    speed: Some(9),
    start_bit: BitField::coil(5),
    enable_bit: BitField::coil(6),
    complete_bit: BitField::input(7),
    jog: None,
    limits: LimitBits::Rotary {
        cw: BitField::input(13),
        ccw: BitField::input(14),
    },
    stop_bit: BitField::coil(15),
};

// =============================================================================
// Profiles
// =============================================================================

/// Conversion between physical units and raw counts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Conversion {
    /// Linear axis: 800 counts/rev x 56:1 worm / 5 mm per turn.
    CountsPerMillimetre(f64),
    /// Rotary axis.
    StepsPerDegree(f64),
}

impl Conversion {
    /// Raw counts per physical unit.
    pub fn factor(&self) -> f64 {
        match *self {
            Conversion::CountsPerMillimetre(f) | Conversion::StepsPerDegree(f) => f,
        }
    }

    /// Physical unit label.
    pub fn unit(&self) -> &'static str {
        match self {
            Conversion::CountsPerMillimetre(_) => "mm",
            Conversion::StepsPerDegree(_) => "deg",
        }
    }
}

/// Default and maximum speed register values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeedRange {
    /// Applied at initialization.
    pub default: u16,
    /// Upper bound accepted by `set_speed`.
    pub max: u16,
}

/// Operations that only some axis kinds support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// `move_up`/`move_down` jogging.
    pub jog: bool,
    /// Independent speed register.
    pub speed_control: bool,
}

/// Immutable per-axis configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisProfile {
    /// Axis identity.
    pub kind: AxisKind,
    /// Unit conversion.
    pub conversion: Conversion,
    /// Legal position range (min, max) in physical units.
    pub position_range: (f64, f64),
    /// Speed bounds, `None` on fixed-speed axes.
    pub speed: Option<SpeedRange>,
    /// Register layout.
    pub registers: RegisterMap,
    /// Capability flags.
    pub capabilities: Capabilities,
}

/// Antenna roll: 1000 steps/degree, 0..180 degrees.
pub static ANTENNA_ROLL: AxisProfile = AxisProfile {
    kind: AxisKind::AntennaRoll,
    conversion: Conversion::StepsPerDegree(1000.0),
    position_range: (0.0, 180.0),
    speed: Some(SpeedRange {
        default: 3000,
        max: 5000,
    }),
    registers: ROLL_REGISTERS,
    capabilities: Capabilities {
        jog: false,
        speed_control: true,
    },
};

/// Antenna height: 8960 counts/mm, 1520..1900 mm.
pub static ANTENNA_HEIGHT: AxisProfile = AxisProfile {
    kind: AxisKind::AntennaHeight,
    conversion: Conversion::CountsPerMillimetre(8960.0),
    position_range: (1520.0, 1900.0),
    speed: Some(SpeedRange {
        default: 30000,
        max: 37500,
    }),
    registers: HEIGHT_REGISTERS,
    capabilities: Capabilities {
        jog: true,
        speed_control: true,
    },
};

/// EUT roll: 80 steps/degree, -360..360 degrees, fixed speed.
pub static EUT_ROLL: AxisProfile = AxisProfile {
    kind: AxisKind::EutRoll,
    conversion: Conversion::StepsPerDegree(80.0),
    position_range: (-360.0, 360.0),
    speed: None,
    registers: RegisterMap {
        location: RegisterField::long(4, true),
        target: RegisterField::long(6, true),
        speed: None,
        ..ROLL_REGISTERS
    },
    capabilities: Capabilities {
        jog: false,
        speed_control: false,
    },
};

/// Turntable: 373 steps/degree, 0..360 degrees.
pub static TURNTABLE_ROLL: AxisProfile = AxisProfile {
    kind: AxisKind::TurntableRoll,
    conversion: Conversion::StepsPerDegree(373.0),
    position_range: (0.0, 360.0),
    speed: Some(SpeedRange {
        default: 3000,
        max: 4000,
    }),
    registers: ROLL_REGISTERS,
    capabilities: Capabilities {
        jog: false,
        speed_control: true,
    },
};

impl AxisProfile {
    /// True for roll axes, which use shortest-path adjustment.
    pub fn is_angular(&self) -> bool {
        matches!(self.conversion, Conversion::StepsPerDegree(_))
    }

    /// Physical unit label.
    pub fn unit(&self) -> &'static str {
        self.conversion.unit()
    }

    /// Physical size of one raw count.
    pub fn resolution(&self) -> f64 {
        1.0 / self.conversion.factor()
    }

    /// True when `value` lies inside the legal position range.
    pub fn in_range(&self, value: f64) -> bool {
        let (min, max) = self.position_range;
        value.is_finite() && (min..=max).contains(&value)
    }

    /// Reject `value` if it lies outside the legal position range.
    pub fn check_range(&self, value: f64) -> PositionerResult<()> {
        if self.in_range(value) {
            return Ok(());
        }
        let (min, max) = self.position_range;
        Err(PositionerError::Range {
            axis: self.kind,
            value,
            min,
            max,
        })
    }

    /// Convert a physical value to raw counts, rejecting out-of-range input.
    pub fn to_counts(&self, value: f64) -> PositionerResult<i64> {
        self.check_range(value)?;
        Ok((value * self.conversion.factor()).round() as i64)
    }

    /// Convert raw counts to a physical value.
    ///
    /// Out-of-range readings are logged, not rejected: a stale or
    /// miscalibrated reading is still what the hardware reports.
    pub fn from_counts(&self, counts: i64) -> f64 {
        let value = counts as f64 / self.conversion.factor();
        if !self.in_range(value) {
            let (min, max) = self.position_range;
            tracing::warn!(
                axis = %self.kind,
                counts,
                value,
                min,
                max,
                "Position reading outside configured range"
            );
        }
        value
    }

    /// Unwrap a modular target into the absolute target nearest `current`.
    ///
    /// Height axes return `target` unchanged.
    pub fn shortest_path(&self, current: f64, target: f64) -> f64 {
        if !self.is_angular() {
            return target;
        }
        let diff = target - current;
        if diff > 180.0 {
            current - (360.0 - diff)
        } else if diff < -180.0 {
            current + (360.0 + diff)
        } else {
            target
        }
    }

    /// Check that the register widths hold every count in `position_range`.
    pub fn validate(&self) -> PositionerResult<()> {
        let (min, max) = self.position_range;
        let factor = self.conversion.factor();
        let lo = (min * factor).round() as i64;
        let hi = (max * factor).round() as i64;
        for (name, field) in [
            ("location", self.registers.location),
            ("target", self.registers.target),
        ] {
            if !(1..=4).contains(&field.registers) {
                return Err(PositionerError::Config(format!(
                    "{} {} register count {} must be 1-4",
                    self.kind, name, field.registers
                )));
            }
            if lo < field.min_count() || hi > field.max_count() {
                return Err(PositionerError::Config(format!(
                    "{} {} field cannot hold counts {}..{}",
                    self.kind, name, lo, hi
                )));
            }
        }
        if self.capabilities.speed_control != self.speed.is_some()
            || self.speed.is_some() != self.registers.speed.is_some()
        {
            return Err(PositionerError::Config(format!(
                "{} speed capability and speed register disagree",
                self.kind
            )));
        }
        if self.capabilities.jog != self.registers.jog.is_some() {
            return Err(PositionerError::Config(format!(
                "{} jog capability and jog bits disagree",
                self.kind
            )));
        }
        Ok(())
    }
}

/// Snapshot of the two limit switches of one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LimitState {
    /// Upper (height) or clockwise (roll) switch.
    pub positive: bool,
    /// Lower (height) or counter-clockwise (roll) switch.
    pub negative: bool,
    /// Labels the switches as cw/ccw instead of upper/lower.
    pub rotary: bool,
}

impl LimitState {
    /// True when either switch is asserted.
    pub fn is_tripped(&self) -> bool {
        self.positive || self.negative
    }
}

impl fmt::Display for LimitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (pos, neg) = if self.rotary {
            ("cw", "ccw")
        } else {
            ("upper", "lower")
        };
        match (self.positive, self.negative) {
            (false, false) => f.write_str("clear"),
            (true, false) => f.write_str(pos),
            (false, true) => f.write_str(neg),
            (true, true) => write!(f, "{}+{}", pos, neg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_profile_fits_its_registers() {
        for kind in AxisKind::ALL {
            let profile = kind.profile();
            assert_eq!(profile.kind, kind);
            profile.validate().unwrap();
        }
    }

    #[test]
    fn conversion_round_trips_within_one_count() {
        for kind in AxisKind::ALL {
            let profile = kind.profile();
            let (min, max) = profile.position_range;
            let steps = 97;
            for i in 0..=steps {
                let v = min + (max - min) * i as f64 / steps as f64;
                let back = profile.from_counts(profile.to_counts(v).unwrap());
                assert!(
                    (back - v).abs() <= profile.resolution(),
                    "{kind}: {v} -> {back}"
                );
            }
        }
    }

    #[test]
    fn height_counts_use_8960_per_mm() {
        assert_eq!(ANTENNA_HEIGHT.to_counts(1600.0).unwrap(), 14_336_000);
        assert_eq!(ANTENNA_HEIGHT.from_counts(14_336_000), 1600.0);
    }

    #[test]
    fn to_counts_rejects_out_of_range() {
        let err = ANTENNA_HEIGHT.to_counts(2000.0).unwrap_err();
        assert!(matches!(
            err,
            PositionerError::Range { axis: AxisKind::AntennaHeight, .. }
        ));
        assert!(ANTENNA_ROLL.to_counts(-0.5).is_err());
        assert!(ANTENNA_ROLL.to_counts(f64::NAN).is_err());
    }

    #[test]
    fn from_counts_reports_out_of_range_values() {
        // 2000 mm is outside the height range but still returned.
        assert_eq!(ANTENNA_HEIGHT.from_counts(17_920_000), 2000.0);
    }

    #[test]
    fn shortest_path_wraps_forward_and_backward() {
        assert_eq!(TURNTABLE_ROLL.shortest_path(350.0, 10.0), 370.0);
        assert_eq!(TURNTABLE_ROLL.shortest_path(10.0, 350.0), -10.0);
        assert_eq!(TURNTABLE_ROLL.shortest_path(90.0, 200.0), 200.0);
        assert_eq!(EUT_ROLL.shortest_path(0.0, 180.0), 180.0);
    }

    #[test]
    fn height_never_applies_shortest_path() {
        assert_eq!(ANTENNA_HEIGHT.shortest_path(1520.0, 1900.0), 1900.0);
    }

    #[test]
    fn capability_flags() {
        assert!(ANTENNA_HEIGHT.capabilities.jog);
        assert!(!ANTENNA_ROLL.capabilities.jog);
        assert!(!EUT_ROLL.capabilities.speed_control);
        assert!(EUT_ROLL.registers.speed.is_none());
        assert!(TURNTABLE_ROLL.capabilities.speed_control);
    }

    #[test]
    fn axis_kind_parses_ids_and_names() {
        assert_eq!("ANT_ROLL".parse::<AxisKind>(), Ok(AxisKind::AntennaRoll));
        assert_eq!("turntable-roll".parse::<AxisKind>(), Ok(AxisKind::TurntableRoll));
        assert!("pan".parse::<AxisKind>().is_err());
    }

    #[test]
    fn signed_field_limits() {
        let field = EUT_ROLL.registers.location;
        assert_eq!(field.max_count(), i32::MAX as i64);
        assert_eq!(field.min_count(), i32::MIN as i64);
        assert_eq!(ROLL_REGISTERS.location.max_count(), u32::MAX as i64);
    }
}
