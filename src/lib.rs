//! # Rust Positioner Core Library
//!
//! Register-level control of the four motion axes of an antenna test range:
//! antenna polarization roll, antenna mast height, equipment-under-test roll
//! and turntable azimuth. Each axis sits behind a positioner controller that
//! speaks Modbus RTU over a serial line; several axes may share one line.
//!
//! ## Crate Structure
//!
//! - **`axis`**: Static description of each axis kind: register map, unit
//!   conversion, travel range, speed limits and shortest-path targeting.
//! - **`modbus`**: Modbus RTU framing over any async byte stream and the
//!   `RegisterBus` primitives the rest of the crate is written against.
//! - **`transport`**: `TransportChannel`, the mutually exclusive, retrying
//!   gateway to one physical line.
//! - **`controller`**: `AxisController`, the per-axis move-and-confirm state
//!   machine with stall, timeout and limit supervision.
//! - **`supervisor`**: `MotionSupervisor`, which owns all channels, sequences
//!   composite moves and guarantees best-effort teardown.
//! - **`search`**: The optimizer / power-meter loop built on the supervisor.
//! - **`log_capture`**: Structured motion events and the sinks they go to.
//! - **`mock`**: A simulated positioner controller for tests and dry runs.
//! - **`config`**: Layered configuration (TOML file plus environment).
//! - **`tracing_setup`**: Subscriber initialization for the binary.
//! - **`error`**: The `PositionerError` and `BusError` taxonomy.

pub mod axis;
pub mod config;
pub mod controller;
pub mod error;
pub mod log_capture;
pub mod mock;
pub mod modbus;
pub mod search;
pub mod supervisor;
pub mod tracing_setup;
pub mod transport;

pub use axis::{AxisKind, AxisProfile, LimitState};
pub use config::PositionerConfig;
pub use controller::{AxisController, JogDirection, MotionState, MotionTiming, MoveReport};
pub use error::{BusError, PositionerError, PositionerResult};
pub use log_capture::{EventBuffer, EventKind, EventSink, MotionEvent, NullSink, TracingSink};
pub use search::{run_search, Optimizer, PowerMeter};
pub use supervisor::{MeasurementPosition, MotionSupervisor};
pub use transport::{RetryPolicy, TransportChannel};
