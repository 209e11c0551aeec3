//! Modbus RTU framing over an async byte stream.
//!
//! Frame layout: `[slave][function][payload...][crc_lo][crc_hi]`, CRC-16/MODBUS.
//! Exception replies set the high bit of the function code and carry a single
//! exception code byte.

use async_trait::async_trait;
use crc::{Crc, CRC_16_MODBUS};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

use super::serial::{drain_serial_buffer, SerialPortIO};
use super::RegisterBus;
use crate::axis::{BitField, BitFunction};
use crate::error::BusError;

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Read coils.
pub const FN_READ_COILS: u8 = 0x01;
/// Read discrete inputs.
pub const FN_READ_DISCRETE_INPUTS: u8 = 0x02;
/// Read holding registers.
pub const FN_READ_HOLDING_REGISTERS: u8 = 0x03;
/// Write single coil.
pub const FN_WRITE_SINGLE_COIL: u8 = 0x05;
/// Write multiple registers.
pub const FN_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;

/// Append the CRC to a PDU addressed to `slave`.
pub fn encode_frame(slave: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(pdu.len() + 3);
    frame.push(slave);
    frame.extend_from_slice(pdu);
    let crc = MODBUS_CRC.checksum(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Verify the trailing CRC of a complete frame.
pub fn check_crc(frame: &[u8]) -> Result<(), BusError> {
    if frame.len() < 4 {
        return Err(BusError::Malformed(format!(
            "frame too short: {} bytes",
            frame.len()
        )));
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    let expected = MODBUS_CRC.checksum(body);
    let received = u16::from_le_bytes([tail[0], tail[1]]);
    if expected != received {
        return Err(BusError::Crc { expected, received });
    }
    Ok(())
}

/// Modbus RTU master for one slave on one serial line.
pub struct ModbusRtu<S> {
    port: Option<S>,
    slave: u8,
    response_timeout: Duration,
}

impl<S: SerialPortIO> ModbusRtu<S> {
    /// Wrap an open stream.
    pub fn new(port: S, slave: u8, response_timeout: Duration) -> Self {
        Self {
            port: Some(port),
            slave,
            response_timeout,
        }
    }

    /// Slave address used for every request.
    pub fn slave(&self) -> u8 {
        self.slave
    }

    /// Send one request PDU and return the response PDU (without slave/CRC).
    async fn transact(&mut self, pdu: &[u8]) -> Result<Vec<u8>, BusError> {
        let slave = self.slave;
        let timeout = self.response_timeout;
        let port = self.port.as_mut().ok_or(BusError::Closed)?;

        let request = encode_frame(slave, pdu);
        port.write_all(&request).await?;
        port.flush().await?;
        trace!(slave, request = ?request, "Modbus request sent");

        let response = tokio::time::timeout(timeout, read_response(port, pdu[0]))
            .await
            .map_err(|_| BusError::ResponseTimeout(timeout))??;
        trace!(slave, response = ?response, "Modbus response received");

        if response[0] != slave {
            return Err(BusError::Malformed(format!(
                "response from slave {} while talking to {}",
                response[0], slave
            )));
        }
        let function = response[1];
        if function == pdu[0] | 0x80 {
            return Err(BusError::Exception {
                function: pdu[0],
                code: response[2],
            });
        }
        if function != pdu[0] {
            return Err(BusError::Malformed(format!(
                "function {:#04x} in reply to {:#04x}",
                function, pdu[0]
            )));
        }
        Ok(response[1..response.len() - 2].to_vec())
    }

    async fn expect_echo(&mut self, pdu: &[u8]) -> Result<(), BusError> {
        let reply = self.transact(pdu).await?;
        if reply.as_slice() != pdu.get(..5).unwrap_or(pdu) {
            return Err(BusError::Malformed(format!(
                "write echo mismatch: sent {:02X?}, got {:02X?}",
                &pdu[..pdu.len().min(5)],
                reply
            )));
        }
        Ok(())
    }
}

/// Read one complete response frame for a request with `function`.
async fn read_response<S: SerialPortIO>(port: &mut S, function: u8) -> Result<Vec<u8>, BusError> {
    let mut frame = vec![0u8; 2];
    port.read_exact(&mut frame).await?;

    let remaining = if frame[1] & 0x80 != 0 {
        // exception code + CRC
        3
    } else {
        match function {
            FN_READ_COILS | FN_READ_DISCRETE_INPUTS | FN_READ_HOLDING_REGISTERS => {
                let count = port.read_u8().await?;
                frame.push(count);
                usize::from(count) + 2
            }
            FN_WRITE_SINGLE_COIL | FN_WRITE_MULTIPLE_REGISTERS => 6,
            other => {
                return Err(BusError::Malformed(format!(
                    "unsupported function {:#04x}",
                    other
                )))
            }
        }
    };

    let start = frame.len();
    frame.resize(start + remaining, 0);
    port.read_exact(&mut frame[start..]).await?;
    check_crc(&frame)?;
    Ok(frame)
}

#[async_trait]
impl<S: SerialPortIO> RegisterBus for ModbusRtu<S> {
    async fn read_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>, BusError> {
        let mut pdu = vec![FN_READ_HOLDING_REGISTERS];
        pdu.extend_from_slice(&address.to_be_bytes());
        pdu.extend_from_slice(&count.to_be_bytes());

        let reply = self.transact(&pdu).await?;
        let data = &reply[2..];
        if usize::from(reply[1]) != usize::from(count) * 2 || data.len() != usize::from(count) * 2 {
            return Err(BusError::Malformed(format!(
                "expected {} register bytes, got {}",
                count * 2,
                reply[1]
            )));
        }
        Ok(data
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    async fn write_registers(&mut self, address: u16, values: &[u16]) -> Result<(), BusError> {
        let count = values.len() as u16;
        let mut pdu = vec![FN_WRITE_MULTIPLE_REGISTERS];
        pdu.extend_from_slice(&address.to_be_bytes());
        pdu.extend_from_slice(&count.to_be_bytes());
        pdu.push((values.len() * 2) as u8);
        for value in values {
            pdu.extend_from_slice(&value.to_be_bytes());
        }
        self.expect_echo(&pdu).await
    }

    async fn read_bit(&mut self, bit: BitField) -> Result<bool, BusError> {
        let function = match bit.function {
            BitFunction::Coil => FN_READ_COILS,
            BitFunction::DiscreteInput => FN_READ_DISCRETE_INPUTS,
        };
        let mut pdu = vec![function];
        pdu.extend_from_slice(&bit.address.to_be_bytes());
        pdu.extend_from_slice(&1u16.to_be_bytes());

        let reply = self.transact(&pdu).await?;
        match reply.get(2) {
            Some(byte) if reply[1] == 1 => Ok(byte & 0x01 != 0),
            _ => Err(BusError::Malformed(format!(
                "bit read returned {:02X?}",
                reply
            ))),
        }
    }

    async fn write_coil(&mut self, address: u16, value: bool) -> Result<(), BusError> {
        let mut pdu = vec![FN_WRITE_SINGLE_COIL];
        pdu.extend_from_slice(&address.to_be_bytes());
        let state = if value { COIL_ON } else { COIL_OFF };
        pdu.extend_from_slice(&state.to_be_bytes());
        self.expect_echo(&pdu).await
    }

    async fn clear_buffers(&mut self) -> Result<(), BusError> {
        let port = self.port.as_mut().ok_or(BusError::Closed)?;
        let discarded = drain_serial_buffer(port, 10).await;
        if discarded > 0 {
            tracing::debug!(slave = self.slave, discarded, "Discarded stale bytes");
        }
        port.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BusError> {
        if let Some(mut port) = self.port.take() {
            port.flush().await?;
            port.shutdown().await?;
        }
        Ok(())
    }
}
