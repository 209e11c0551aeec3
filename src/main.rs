//! CLI Entry Point for rust-positioner
//!
//! Thin driver over [`MotionSupervisor`]: every command connects, does its
//! work and always runs the supervisor's cleanup before exiting.
//!
//! # Usage
//!
//! ```bash
//! rust-positioner positions
//! rust-positioner move --ant-roll 90 --ant-height 1600 --eut-roll 0 --tt-roll 180
//! rust-positioner --simulate jog --axis ant-height --direction up --duration 2
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use rust_positioner::axis::AxisKind;
use rust_positioner::config::PositionerConfig;
use rust_positioner::controller::JogDirection;
use rust_positioner::log_capture::{EventBuffer, EventSink, TracingSink};
use rust_positioner::supervisor::{MeasurementPosition, MotionSupervisor};
use rust_positioner::tracing_setup::{self, OutputFormat, TracingConfig};

#[derive(Parser)]
#[command(name = "rust-positioner")]
#[command(about = "Antenna test-range positioner control over Modbus RTU", long_about = None)]
struct Cli {
    /// Configuration file (defaults to config/positioner.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Drive simulated controllers instead of serial ports
    #[arg(long, global = true)]
    simulate: bool,

    /// Log output format: pretty, compact or json
    #[arg(long, global = true, default_value = "compact")]
    log_format: OutputFormat,

    /// Print the motion event log when the command finishes
    #[arg(long, global = true)]
    session_log: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print position and speed of every axis
    Positions,

    /// Move all axes to a measurement position
    Move {
        /// Antenna roll, degrees
        #[arg(long)]
        ant_roll: f64,
        /// Antenna height, millimetres
        #[arg(long)]
        ant_height: f64,
        /// EUT roll, degrees
        #[arg(long, allow_negative_numbers = true)]
        eut_roll: f64,
        /// Turntable, degrees
        #[arg(long)]
        tt_roll: f64,
    },

    /// Redefine the current position of one axis
    Calibrate {
        /// Axis (ant-roll, ant-height, eut-roll, tt-roll)
        #[arg(long)]
        axis: AxisKind,
        /// New current position in physical units
        #[arg(long, allow_negative_numbers = true)]
        value: f64,
    },

    /// Set the speed register of every axis
    Speed {
        /// Speed in controller units
        #[arg(long)]
        value: u16,
    },

    /// Jog one axis for a fixed time
    Jog {
        /// Axis to jog
        #[arg(long, default_value = "ant-height")]
        axis: AxisKind,
        /// up or down
        #[arg(long)]
        direction: JogDirection,
        /// Seconds to jog before stopping (Ctrl+C stops early)
        #[arg(long, default_value = "1.0")]
        duration: f64,
    },

    /// Stop every axis
    Stop,

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => PositionerConfig::load_from(path),
        None => PositionerConfig::load(),
    }
    .context("Failed to load configuration")?;
    config.validate()?;

    let tracing_config = TracingConfig::from_config(&config)
        .map_err(anyhow::Error::msg)?
        .with_format(cli.log_format);
    tracing_setup::init(tracing_config).map_err(anyhow::Error::msg)?;

    if let Commands::Config = cli.command {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let events = EventBuffer::new();
    let sink: Arc<dyn EventSink> = if cli.session_log {
        Arc::new(events.clone())
    } else {
        Arc::new(TracingSink)
    };

    let supervisor = Arc::new(if cli.simulate {
        info!("Using simulated controllers");
        let (supervisor, _devices) = MotionSupervisor::simulated(&config, sink)?;
        supervisor
    } else {
        MotionSupervisor::connect(&config, sink)
            .await
            .context("Failed to open serial ports")?
    });

    let result = run(&supervisor, cli.command).await;

    for failure in supervisor.cleanup().await {
        warn!(
            step = ?failure.step,
            target = %failure.target,
            error = %failure.error,
            "Cleanup incomplete"
        );
    }

    if cli.session_log {
        for event in events.events() {
            println!("{}", event);
        }
    }

    result
}

async fn run(supervisor: &Arc<MotionSupervisor>, command: Commands) -> Result<()> {
    match command {
        Commands::Positions => print_positions(supervisor).await,
        Commands::Move {
            ant_roll,
            ant_height,
            eut_roll,
            tt_roll,
        } => {
            supervisor.initialize().await?;
            let position = MeasurementPosition {
                ant_roll,
                ant_height,
                eut_roll,
                tt_roll,
            };
            // The stop runs beside the move; the move unwinds at its next poll.
            let interrupt = {
                let supervisor = Arc::clone(supervisor);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        error!("Interrupted, stopping all axes");
                        supervisor.emergency_stop_all().await;
                    }
                })
            };
            let result = supervisor
                .move_to_measurement_position(position, true)
                .await;
            interrupt.abort();
            for report in result? {
                println!(
                    "{:<10} {:?} at {:.3} (target {:.3}, {} polls, {:.1}s)",
                    report.axis.id(),
                    report.outcome,
                    report.position,
                    report.target,
                    report.polls,
                    report.elapsed.as_secs_f64()
                );
            }
            Ok(())
        }
        Commands::Calibrate { axis, value } => {
            let position = supervisor.calibrate(axis, value).await?;
            println!("{} now reads {:.3}", axis.id(), position);
            Ok(())
        }
        Commands::Speed { value } => {
            let failures = supervisor.set_all_speeds(value).await;
            for (axis, e) in &failures {
                println!("{:<10} not set: {}", axis.id(), e);
            }
            print_positions(supervisor).await?;
            if failures.is_empty() {
                Ok(())
            } else {
                anyhow::bail!("speed not applied to {} axis(es)", failures.len())
            }
        }
        Commands::Jog {
            axis,
            direction,
            duration,
        } => {
            let duration = Duration::try_from_secs_f64(duration)
                .context("duration must be a non-negative number of seconds")?;
            supervisor.jog(axis, direction).await?;
            tokio::select! {
                _ = tokio::time::sleep(duration) => {}
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted, stopping jog");
                }
            }
            supervisor.stop_jog(axis).await?;
            let position = supervisor.controller(axis).read_position().await?;
            println!("{} stopped at {:.3}", axis.id(), position);
            Ok(())
        }
        Commands::Stop => {
            let failures = supervisor.emergency_stop_all().await;
            if failures.is_empty() {
                println!("All axes stopped");
                Ok(())
            } else {
                for (axis, e) in &failures {
                    println!("{:<10} stop failed: {}", axis.id(), e);
                }
                anyhow::bail!("{} axis(es) did not acknowledge stop", failures.len())
            }
        }
        Commands::Config => Ok(()),
    }
}

async fn print_positions(supervisor: &MotionSupervisor) -> Result<()> {
    println!("{:<10} {:>12} {:>8}", "AXIS", "POSITION", "SPEED");
    for (axis, snapshot) in supervisor.all_positions().await {
        let position = snapshot
            .position
            .map(|p| format!("{:.3} {}", p, axis.profile().conversion.unit()))
            .unwrap_or_else(|| "--".to_string());
        let speed = snapshot
            .speed
            .map(|s| s.to_string())
            .unwrap_or_else(|| "--".to_string());
        println!("{:<10} {:>12} {:>8}", axis.id(), position, speed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOVE: [&str; 10] = [
        "rust-positioner",
        "move",
        "--ant-roll",
        "90",
        "--ant-height",
        "1600",
        "--eut-roll",
        "-10",
        "--tt-roll",
        "180",
    ];

    #[test]
    fn move_takes_all_four_targets() {
        let cli = Cli::try_parse_from(MOVE).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Move { eut_roll, .. } if eut_roll == -10.0
        ));
    }

    #[test]
    fn move_always_waits_for_arrival() {
        let args = MOVE.iter().copied().chain(["--no-wait"]);
        assert!(Cli::try_parse_from(args).is_err());
    }
}
