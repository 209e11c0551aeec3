//! Register-level access to positioner controllers.
//!
//! [`RegisterBus`] is the set of Modbus primitives the rest of the crate
//! consumes: read/write holding registers, read a discrete bit, write a coil,
//! clear the line. [`rtu::ModbusRtu`] speaks Modbus RTU over any async byte
//! stream; [`crate::mock::SimulatedBus`] implements the same trait in memory.
//!
//! Long values (positions) span several registers. [`read_long`] and
//! [`write_long`] assemble them according to a [`RegisterField`].

pub mod rtu;
pub mod serial;

use async_trait::async_trait;

use crate::axis::{BitField, RegisterField, WordOrder};
use crate::error::BusError;

pub use rtu::ModbusRtu;
pub use serial::{open_serial_async, SerialSettings};

/// Modbus primitives against one slave on one line.
#[async_trait]
pub trait RegisterBus: Send {
    /// Read `count` consecutive holding registers (function 0x03).
    async fn read_registers(&mut self, address: u16, count: u16) -> Result<Vec<u16>, BusError>;

    /// Write consecutive holding registers (function 0x10).
    async fn write_registers(&mut self, address: u16, values: &[u16]) -> Result<(), BusError>;

    /// Read one coil (0x01) or discrete input (0x02).
    async fn read_bit(&mut self, bit: BitField) -> Result<bool, BusError>;

    /// Write one coil (function 0x05).
    async fn write_coil(&mut self, address: u16, value: bool) -> Result<(), BusError>;

    /// Discard pending input and flush pending output.
    async fn clear_buffers(&mut self) -> Result<(), BusError>;

    /// Release the underlying line. Further calls fail with `BusError::Closed`.
    async fn close(&mut self) -> Result<(), BusError>;
}

/// Split a raw count into registers for `field`.
pub fn encode_long(field: &RegisterField, value: i64) -> Result<Vec<u16>, BusError> {
    if value < field.min_count() || value > field.max_count() {
        return Err(BusError::Malformed(format!(
            "value {} does not fit {} register(s) (signed: {})",
            value, field.registers, field.signed
        )));
    }
    let raw = value as u64;
    let mut words: Vec<u16> = (0..field.registers)
        .map(|i| (raw >> (16 * u32::from(i))) as u16)
        .collect();
    if field.word_order == WordOrder::HighFirst {
        words.reverse();
    }
    Ok(words)
}

/// Assemble registers read from `field` into a raw count.
pub fn decode_long(field: &RegisterField, words: &[u16]) -> Result<i64, BusError> {
    if words.len() != usize::from(field.registers) {
        return Err(BusError::Malformed(format!(
            "expected {} registers, got {}",
            field.registers,
            words.len()
        )));
    }
    let bits = u32::from(field.registers) * 16;
    let low_first: Vec<u16> = match field.word_order {
        WordOrder::LowFirst => words.to_vec(),
        WordOrder::HighFirst => words.iter().rev().copied().collect(),
    };
    let raw = low_first
        .iter()
        .enumerate()
        .fold(0u64, |acc, (i, w)| acc | (u64::from(*w) << (16 * i)));

    if field.signed && bits < 64 && raw & (1u64 << (bits - 1)) != 0 {
        Ok((raw | (u64::MAX << bits)) as i64)
    } else {
        Ok(raw as i64)
    }
}

/// Read a long value described by `field`.
pub async fn read_long(bus: &mut dyn RegisterBus, field: &RegisterField) -> Result<i64, BusError> {
    let words = bus
        .read_registers(field.address, u16::from(field.registers))
        .await?;
    decode_long(field, &words)
}

/// Write a long value described by `field`.
pub async fn write_long(
    bus: &mut dyn RegisterBus,
    field: &RegisterField,
    value: i64,
) -> Result<(), BusError> {
    let words = encode_long(field, value)?;
    bus.write_registers(field.address, &words).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(signed: bool, word_order: WordOrder) -> RegisterField {
        RegisterField {
            address: 4,
            registers: 2,
            signed,
            word_order,
        }
    }

    #[test]
    fn low_word_is_stored_first() {
        let f = field(false, WordOrder::LowFirst);
        assert_eq!(encode_long(&f, 0x1122_3344).unwrap(), vec![0x3344, 0x1122]);
        assert_eq!(decode_long(&f, &[0x3344, 0x1122]).unwrap(), 0x1122_3344);
    }

    #[test]
    fn high_first_order_is_supported() {
        let f = field(false, WordOrder::HighFirst);
        assert_eq!(encode_long(&f, 0x1122_3344).unwrap(), vec![0x1122, 0x3344]);
    }

    #[test]
    fn negative_values_use_twos_complement() {
        let f = field(true, WordOrder::LowFirst);
        let words = encode_long(&f, -800).unwrap();
        assert_eq!(words, vec![0xFCE0, 0xFFFF]);
        assert_eq!(decode_long(&f, &words).unwrap(), -800);
    }

    #[test]
    fn unsigned_field_rejects_negative() {
        let f = field(false, WordOrder::LowFirst);
        assert!(encode_long(&f, -1).is_err());
        assert!(encode_long(&f, 1 << 32).is_err());
    }

    #[test]
    fn wrong_register_count_is_malformed() {
        let f = field(false, WordOrder::LowFirst);
        assert!(matches!(
            decode_long(&f, &[1, 2, 3]),
            Err(BusError::Malformed(_))
        ));
    }
}
