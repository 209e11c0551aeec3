//! Layered configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. `config/positioner.toml` (or an explicit path)
//! 2. Environment variables prefixed with `RUST_POSITIONER_`, nested keys
//!    separated by `__` (e.g. `RUST_POSITIONER_MOTION__TOLERANCE=0.05`)
//!
//! Every section is optional; missing keys fall back to the values the
//! positioner controllers were commissioned with.
//!
//! # Example
//! ```no_run
//! use rust_positioner::config::PositionerConfig;
//!
//! let config = PositionerConfig::load()?;
//! config.validate()?;
//! println!("Antenna mast on {}", config.ports.ant_height);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::axis::AxisKind;
use crate::controller::MotionTiming;
use crate::error::{PositionerError, PositionerResult};
use crate::modbus::SerialSettings;
use crate::supervisor::SequenceTiming;
use crate::transport::RetryPolicy;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/positioner.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "RUST_POSITIONER_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionerConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Serial line parameters shared by every port
    pub serial: SerialConfig,
    /// Serial port of each axis
    pub ports: PortsConfig,
    /// Move-and-confirm loop
    pub motion: MotionConfig,
    /// Channel retry policy
    pub retry: RetryConfig,
    /// Multi-axis sequencing
    pub sequence: SequenceConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Rust Positioner".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Serial line configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Baud rate
    pub baud_rate: u32,
    /// Time to wait for a Modbus reply
    pub response_timeout_ms: u64,
    /// Modbus slave address of every positioner controller
    pub slave_address: u8,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 19200,
            response_timeout_ms: 1000,
            slave_address: 233,
        }
    }
}

impl SerialConfig {
    /// Line settings for opening a port.
    pub fn settings(&self) -> SerialSettings {
        SerialSettings {
            baud_rate: self.baud_rate,
            timeout: Duration::from_millis(self.response_timeout_ms),
        }
    }
}

/// Serial port per axis. Axes naming the same port share one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    /// Antenna roll
    pub ant_roll: String,
    /// Antenna height
    pub ant_height: String,
    /// EUT roll
    pub eut_roll: String,
    /// Turntable
    pub tt_roll: String,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            ant_roll: "COM15".to_string(),
            ant_height: "COM15".to_string(),
            eut_roll: "COM17".to_string(),
            tt_roll: "COM12".to_string(),
        }
    }
}

impl PortsConfig {
    /// Port of `axis`.
    pub fn port(&self, axis: AxisKind) -> &str {
        match axis {
            AxisKind::AntennaRoll => &self.ant_roll,
            AxisKind::AntennaHeight => &self.ant_height,
            AxisKind::EutRoll => &self.eut_roll,
            AxisKind::TurntableRoll => &self.tt_roll,
        }
    }

    /// Distinct ports with the axes wired to each, in axis order.
    pub fn groups(&self) -> Vec<(String, Vec<AxisKind>)> {
        let mut groups: Vec<(String, Vec<AxisKind>)> = Vec::new();
        for axis in AxisKind::ALL {
            let port = self.port(axis);
            match groups.iter_mut().find(|(p, _)| p == port) {
                Some((_, axes)) => axes.push(axis),
                None => groups.push((port.to_string(), vec![axis])),
            }
        }
        groups
    }
}

/// Move-and-confirm loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Arrival tolerance in physical units
    pub tolerance: f64,
    /// Position poll period
    pub poll_interval_ms: u64,
    /// Largest poll-to-poll change counted as no movement
    pub stall_threshold: f64,
    /// Motionless polls before a stall abort
    pub stall_polls: u32,
    /// Wall-clock budget of one move
    pub move_timeout_secs: u64,
    /// Gap inside the start pulse
    pub start_settle_ms: u64,
    /// Wait after clearing the start bit
    pub stop_settle_ms: u64,
    /// Wait before reading back a calibration
    pub calibration_settle_ms: u64,
    /// Wait after a speed write
    pub speed_settle_ms: u64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        let timing = MotionTiming::default();
        Self {
            tolerance: timing.tolerance,
            poll_interval_ms: timing.poll_interval.as_millis() as u64,
            stall_threshold: timing.stall_threshold,
            stall_polls: timing.stall_polls,
            move_timeout_secs: timing.move_timeout.as_secs(),
            start_settle_ms: timing.start_settle.as_millis() as u64,
            stop_settle_ms: timing.stop_settle.as_millis() as u64,
            calibration_settle_ms: timing.calibration_settle.as_millis() as u64,
            speed_settle_ms: timing.speed_settle.as_millis() as u64,
        }
    }
}

impl MotionConfig {
    /// Loop timing for controllers.
    pub fn timing(&self) -> MotionTiming {
        MotionTiming {
            tolerance: self.tolerance,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            stall_threshold: self.stall_threshold,
            stall_polls: self.stall_polls,
            move_timeout: Duration::from_secs(self.move_timeout_secs),
            start_settle: Duration::from_millis(self.start_settle_ms),
            stop_settle: Duration::from_millis(self.stop_settle_ms),
            calibration_settle: Duration::from_millis(self.calibration_settle_ms),
            speed_settle: Duration::from_millis(self.speed_settle_ms),
        }
    }
}

/// Channel retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per register command, including the first
    pub max_attempts: u32,
    /// Backoff unit; wait after attempt n is n times this
    pub backoff_step_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step_ms: 200,
        }
    }
}

impl RetryConfig {
    /// Retry policy for channels.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_step: Duration::from_millis(self.backoff_step_ms),
        }
    }
}

/// Multi-axis sequencing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceConfig {
    /// Pause after each axis move in a sequence
    pub inter_move_settle_ms: u64,
    /// Pause between stop-all and start-bit reset during cleanup
    pub cleanup_settle_ms: u64,
    /// Write each axis' default speed during initialization
    pub apply_default_speeds: bool,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            inter_move_settle_ms: 500,
            cleanup_settle_ms: 500,
            apply_default_speeds: true,
        }
    }
}

impl SequenceConfig {
    /// Sequencing timing for the supervisor.
    pub fn timing(&self) -> SequenceTiming {
        SequenceTiming {
            inter_move_settle: Duration::from_millis(self.inter_move_settle_ms),
            cleanup_settle: Duration::from_millis(self.cleanup_settle_ms),
            apply_default_speeds: self.apply_default_speeds,
        }
    }
}

impl PositionerConfig {
    /// Load configuration from the default file and environment variables.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path plus environment.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> PositionerResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(PositionerError::Config(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.serial.baud_rate == 0 || self.serial.response_timeout_ms == 0 {
            return Err(PositionerError::Config(
                "serial baud_rate and response_timeout_ms must be positive".to_string(),
            ));
        }
        if !(1..=247).contains(&self.serial.slave_address) {
            return Err(PositionerError::Config(format!(
                "Invalid slave_address {}. Must be 1-247",
                self.serial.slave_address
            )));
        }

        let motion = &self.motion;
        if !(motion.tolerance.is_finite() && motion.tolerance > 0.0) {
            return Err(PositionerError::Config(format!(
                "Invalid tolerance {}. Must be positive",
                motion.tolerance
            )));
        }
        if motion.poll_interval_ms == 0 {
            return Err(PositionerError::Config(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        if !(motion.stall_threshold.is_finite() && motion.stall_threshold >= 0.0)
            || motion.stall_polls == 0
        {
            return Err(PositionerError::Config(
                "stall_threshold must be non-negative and stall_polls positive".to_string(),
            ));
        }
        if motion.move_timeout_secs == 0 {
            return Err(PositionerError::Config(
                "move_timeout_secs must be positive".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(PositionerError::Config(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }

        for axis in AxisKind::ALL {
            if self.ports.port(axis).trim().is_empty() {
                return Err(PositionerError::Config(format!("No port configured for {}", axis)));
            }
        }

        // Axes on one line must not answer at the same addresses.
        for (port, axes) in self.ports.groups() {
            for (i, a) in axes.iter().enumerate() {
                for b in &axes[i + 1..] {
                    let (ra, rb) = (a.profile().registers, b.profile().registers);
                    if ra.location.address == rb.location.address
                        || ra.start_bit.address == rb.start_bit.address
                    {
                        return Err(PositionerError::Config(format!(
                            "{} and {} share port {} but use the same registers",
                            a, b, port
                        )));
                    }
                }
            }
        }

        for axis in AxisKind::ALL {
            axis.profile().validate()?;
        }

        Ok(())
    }
}
