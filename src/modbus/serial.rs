//! Serial line helpers.
//!
//! Positioner controllers listen on RS-232/RS-485 at 19200 baud, 8N1, with
//! flow control and the RTS/DTR lines disabled.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// Trait alias for async serial port I/O.
///
/// Covers `tokio_serial::SerialStream` as well as `tokio::io::DuplexStream`
/// in tests.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Line parameters for one channel.
#[derive(Debug, Clone)]
pub struct SerialSettings {
    /// Baud rate.
    pub baud_rate: u32,
    /// Low-level read timeout of the port itself.
    pub timeout: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 19200,
            timeout: Duration::from_secs(1),
        }
    }
}

/// Open a serial port on a blocking thread with positioner line settings.
pub async fn open_serial_async(
    port_path: &str,
    settings: &SerialSettings,
) -> std::io::Result<tokio_serial::SerialStream> {
    use tokio_serial::{SerialPort, SerialPortBuilderExt};

    let path = port_path.to_string();
    let settings = settings.clone();

    tokio::task::spawn_blocking(move || -> std::io::Result<tokio_serial::SerialStream> {
        let mut port = tokio_serial::new(&path, settings.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(settings.timeout)
            .open_native_async()?;

        port.write_request_to_send(false)?;
        port.write_data_terminal_ready(false)?;
        port.clear(tokio_serial::ClearBuffer::All)?;

        tracing::info!(
            port = %path,
            baud = settings.baud_rate,
            timeout_ms = settings.timeout.as_millis() as u64,
            "Opened positioner serial port"
        );
        Ok(port)
    })
    .await
    .map_err(std::io::Error::other)?
}

/// Read and discard whatever is already waiting on the line.
///
/// Returns the number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, timeout_ms: u64) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut total_discarded = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) | Err(_) => break,
        }
    }

    total_discarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn default_settings_match_controller() {
        let settings = SerialSettings::default();
        assert_eq!(settings.baud_rate, 19200);
        assert_eq!(settings.timeout, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn drain_discards_stale_bytes() {
        let (mut host, mut device) = tokio::io::duplex(64);
        host.write_all(b"\x01\x03stale").await.unwrap();

        let discarded = drain_serial_buffer(&mut device, 20).await;
        assert_eq!(discarded, 7);
    }

    #[tokio::test]
    async fn drain_on_quiet_line_returns_zero() {
        let (_host, mut device) = tokio::io::duplex(64);
        assert_eq!(drain_serial_buffer(&mut device, 5).await, 0);
    }
}
