//! One physical serial line, shared by every axis wired to it.
//!
//! A [`TransportChannel`] owns the bus handle behind an async mutex. Every
//! [`RegisterCommand`] runs to completion while holding that lock, including
//! any settle delay it carries, so two axes on one cable can never interleave
//! a start pulse or a multi-register write.
//!
//! Failed attempts are retried with a linear backoff. The lock is released
//! while backing off, so the other axis on the line can make progress.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::axis::{BitField, RegisterField};
use crate::error::{BusError, CommFailure, PositionerError, PositionerResult};
use crate::log_capture::{EventKind, EventSink, MotionEvent};
use crate::modbus::{read_long, write_long, RegisterBus};

/// How often and how patiently a channel retries a failed command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per command, including the first.
    pub max_attempts: u32,

    /// Backoff unit. The wait after failed attempt `n` is `n * backoff_step`.
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Delay after the failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt
    }
}

/// One logical register operation, executed atomically on the line.
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterCommand {
    /// Read a multi-register long.
    ReadLong(RegisterField),
    /// Write a multi-register long.
    WriteLong(RegisterField, i64),
    /// Write a long, wait `settle`, then read the same field back.
    WriteLongReadBack {
        field: RegisterField,
        value: i64,
        settle: Duration,
    },
    /// Read one 16-bit holding register.
    ReadRegister(u16),
    /// Write one 16-bit holding register, then wait `settle`.
    WriteRegister {
        address: u16,
        value: u16,
        settle: Duration,
    },
    /// Read one bit.
    ReadBit(BitField),
    /// Read two bits in one locked exchange.
    ReadBitPair(BitField, BitField),
    /// Write one coil, then wait `settle`.
    WriteCoil {
        address: u16,
        value: bool,
        settle: Duration,
    },
    /// Write a coil to 0, wait `settle`, write it to 1.
    PulseCoil { address: u16, settle: Duration },
}

/// Result of a [`RegisterCommand`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegisterValue {
    /// A long value.
    Long(i64),
    /// A single register.
    Word(u16),
    /// A single bit.
    Bit(bool),
    /// Two bits, in request order.
    BitPair(bool, bool),
    /// Write acknowledged.
    Done,
}

impl RegisterCommand {
    fn name(&self) -> &'static str {
        match self {
            RegisterCommand::ReadLong(_) => "read_long",
            RegisterCommand::WriteLong(..) => "write_long",
            RegisterCommand::WriteLongReadBack { .. } => "write_long_read_back",
            RegisterCommand::ReadRegister(_) => "read_register",
            RegisterCommand::WriteRegister { .. } => "write_register",
            RegisterCommand::ReadBit(_) => "read_bit",
            RegisterCommand::ReadBitPair(..) => "read_bit_pair",
            RegisterCommand::WriteCoil { .. } => "write_coil",
            RegisterCommand::PulseCoil { .. } => "pulse_coil",
        }
    }

    async fn run(&self, bus: &mut dyn RegisterBus) -> Result<RegisterValue, BusError> {
        match self {
            RegisterCommand::ReadLong(field) => Ok(RegisterValue::Long(read_long(bus, field).await?)),
            RegisterCommand::WriteLong(field, value) => {
                write_long(bus, field, *value).await?;
                Ok(RegisterValue::Done)
            }
            RegisterCommand::WriteLongReadBack {
                field,
                value,
                settle,
            } => {
                write_long(bus, field, *value).await?;
                tokio::time::sleep(*settle).await;
                Ok(RegisterValue::Long(read_long(bus, field).await?))
            }
            RegisterCommand::ReadRegister(address) => {
                let words = bus.read_registers(*address, 1).await?;
                match words.as_slice() {
                    [word] => Ok(RegisterValue::Word(*word)),
                    other => Err(BusError::Malformed(format!(
                        "expected 1 register, got {}",
                        other.len()
                    ))),
                }
            }
            RegisterCommand::WriteRegister {
                address,
                value,
                settle,
            } => {
                bus.write_registers(*address, &[*value]).await?;
                tokio::time::sleep(*settle).await;
                Ok(RegisterValue::Done)
            }
            RegisterCommand::ReadBit(bit) => Ok(RegisterValue::Bit(bus.read_bit(*bit).await?)),
            RegisterCommand::ReadBitPair(first, second) => {
                let a = bus.read_bit(*first).await?;
                let b = bus.read_bit(*second).await?;
                Ok(RegisterValue::BitPair(a, b))
            }
            RegisterCommand::WriteCoil {
                address,
                value,
                settle,
            } => {
                bus.write_coil(*address, *value).await?;
                tokio::time::sleep(*settle).await;
                Ok(RegisterValue::Done)
            }
            RegisterCommand::PulseCoil { address, settle } => {
                bus.write_coil(*address, false).await?;
                tokio::time::sleep(*settle).await;
                bus.write_coil(*address, true).await?;
                Ok(RegisterValue::Done)
            }
        }
    }
}

/// Serialized, retrying access to one physical line.
pub struct TransportChannel {
    port: String,
    bus: Mutex<Option<Box<dyn RegisterBus>>>,
    policy: RetryPolicy,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for TransportChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportChannel")
            .field("port", &self.port)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl TransportChannel {
    /// Wrap an already-open bus.
    pub fn new(
        port: impl Into<String>,
        bus: Box<dyn RegisterBus>,
        policy: RetryPolicy,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            port: port.into(),
            bus: Mutex::new(Some(bus)),
            policy,
            sink,
        }
    }

    /// Physical port name.
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Retry policy used by [`execute`](Self::execute).
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `command` with the channel's default retry budget.
    pub async fn execute(&self, command: &RegisterCommand) -> PositionerResult<RegisterValue> {
        self.execute_with(command, self.policy.max_attempts).await
    }

    /// Run `command`, attempting it at most `max_attempts` times.
    ///
    /// Each attempt holds the line lock for the whole command and starts by
    /// clearing the line buffers. A closed channel fails immediately.
    pub async fn execute_with(
        &self,
        command: &RegisterCommand,
        max_attempts: u32,
    ) -> PositionerResult<RegisterValue> {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = {
                let mut guard = self.bus.lock().await;
                match guard.as_mut() {
                    Some(bus) => Self::attempt(bus.as_mut(), command).await,
                    None => Err(BusError::Closed),
                }
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let kind = CommFailure::from(&err);
            if matches!(err, BusError::Closed) || attempt >= max_attempts {
                error!(
                    port = %self.port,
                    command = command.name(),
                    attempts = attempt,
                    %kind,
                    error = %err,
                    "Register command failed"
                );
                self.sink.record(
                    MotionEvent::new(self.port.as_str(), EventKind::RetriesExhausted)
                        .with("attempts", f64::from(attempt))
                        .detail(format!("{} {}: {}", kind, command.name(), err)),
                );
                return Err(PositionerError::Communication {
                    port: self.port.clone(),
                    kind,
                    attempts: attempt,
                    source: err,
                });
            }

            let backoff = self.policy.backoff(attempt);
            warn!(
                port = %self.port,
                command = command.name(),
                attempt,
                max_attempts,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "Register command failed, retrying"
            );
            self.sink.record(
                MotionEvent::new(self.port.as_str(), EventKind::RetryAttempt)
                    .with("attempt", f64::from(attempt))
                    .with("backoff_ms", backoff.as_secs_f64() * 1000.0)
                    .detail(err.to_string()),
            );
            tokio::time::sleep(backoff).await;
        }
    }

    async fn attempt(
        bus: &mut dyn RegisterBus,
        command: &RegisterCommand,
    ) -> Result<RegisterValue, BusError> {
        bus.clear_buffers().await?;
        command.run(bus).await
    }

    /// Read a long value.
    pub async fn read_long(&self, field: RegisterField) -> PositionerResult<i64> {
        match self.execute(&RegisterCommand::ReadLong(field)).await? {
            RegisterValue::Long(v) => Ok(v),
            other => Err(self.unexpected("read_long", other)),
        }
    }

    /// Write a long value.
    pub async fn write_long(&self, field: RegisterField, value: i64) -> PositionerResult<()> {
        self.execute(&RegisterCommand::WriteLong(field, value))
            .await
            .map(|_| ())
    }

    /// Write a long value, settle, and return what reads back.
    pub async fn write_long_read_back(
        &self,
        field: RegisterField,
        value: i64,
        settle: Duration,
    ) -> PositionerResult<i64> {
        let command = RegisterCommand::WriteLongReadBack {
            field,
            value,
            settle,
        };
        match self.execute(&command).await? {
            RegisterValue::Long(v) => Ok(v),
            other => Err(self.unexpected("write_long_read_back", other)),
        }
    }

    /// Read one holding register.
    pub async fn read_register(&self, address: u16) -> PositionerResult<u16> {
        match self.execute(&RegisterCommand::ReadRegister(address)).await? {
            RegisterValue::Word(v) => Ok(v),
            other => Err(self.unexpected("read_register", other)),
        }
    }

    /// Write one holding register and settle.
    pub async fn write_register(
        &self,
        address: u16,
        value: u16,
        settle: Duration,
    ) -> PositionerResult<()> {
        self.execute(&RegisterCommand::WriteRegister {
            address,
            value,
            settle,
        })
        .await
        .map(|_| ())
    }

    /// Read one bit.
    pub async fn read_bit(&self, bit: BitField) -> PositionerResult<bool> {
        match self.execute(&RegisterCommand::ReadBit(bit)).await? {
            RegisterValue::Bit(v) => Ok(v),
            other => Err(self.unexpected("read_bit", other)),
        }
    }

    /// Read two bits under one lock.
    pub async fn read_bit_pair(
        &self,
        first: BitField,
        second: BitField,
    ) -> PositionerResult<(bool, bool)> {
        match self
            .execute(&RegisterCommand::ReadBitPair(first, second))
            .await?
        {
            RegisterValue::BitPair(a, b) => Ok((a, b)),
            other => Err(self.unexpected("read_bit_pair", other)),
        }
    }

    /// Write one coil and settle.
    pub async fn write_coil(
        &self,
        address: u16,
        value: bool,
        settle: Duration,
    ) -> PositionerResult<()> {
        self.execute(&RegisterCommand::WriteCoil {
            address,
            value,
            settle,
        })
        .await
        .map(|_| ())
    }

    /// Drive a coil 0 -> 1 with `settle` in between, as one locked command.
    pub async fn pulse_coil(&self, address: u16, settle: Duration) -> PositionerResult<()> {
        self.execute(&RegisterCommand::PulseCoil { address, settle })
            .await
            .map(|_| ())
    }

    fn unexpected(&self, command: &str, value: RegisterValue) -> PositionerError {
        PositionerError::Communication {
            port: self.port.clone(),
            kind: CommFailure::Transient,
            attempts: 1,
            source: BusError::Malformed(format!("{} returned {:?}", command, value)),
        }
    }

    /// True until [`close`](Self::close) has run.
    pub async fn is_open(&self) -> bool {
        self.bus.lock().await.is_some()
    }

    /// Release the line. Closing an already closed channel is a no-op.
    pub async fn close(&self) -> PositionerResult<()> {
        let mut guard = self.bus.lock().await;
        let Some(mut bus) = guard.take() else {
            debug!(port = %self.port, "Channel already closed");
            return Ok(());
        };
        self.sink
            .record(MotionEvent::new(self.port.as_str(), EventKind::ChannelClosed));
        bus.close()
            .await
            .map_err(|source| PositionerError::Communication {
                port: self.port.clone(),
                kind: CommFailure::from(&source),
                attempts: 1,
                source,
            })
    }
}
