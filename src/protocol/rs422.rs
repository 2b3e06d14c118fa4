//! RS-422 board link.
//!
//! Frames are 9 raw bytes at a fixed baud rate, 8N1, no flow control. The port is
//! opened per send and all I/O runs on the blocking pool.

use super::packet::check_rs422_frame;
use super::{BoardLink, LinkReport};
use crate::config::Rs422Config;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::time::Duration;

/// RS-422 link to the board
#[derive(Debug, Clone)]
pub struct Rs422Link {
    port: String,
    baud_rate: u32,
    reply_wait: Duration,
}

impl Rs422Link {
    /// Link on `port` at `baud_rate`
    pub fn new(port: impl Into<String>, baud_rate: u32, reply_wait: Duration) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            reply_wait,
        }
    }

    /// Link from configuration
    pub fn from_config(config: &Rs422Config) -> Self {
        Self::new(config.port.clone(), config.baud_rate, config.reply_wait)
    }

    /// Same settings on a different port
    pub fn with_port(&self, port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..self.clone()
        }
    }

    /// Serial device name
    pub fn port(&self) -> &str {
        &self.port
    }
}

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl BoardLink for Rs422Link {
    async fn send_frame(&self, frame: &[u8]) -> AppResult<LinkReport> {
        use super::packet::to_hex;
        use std::io::{Read, Write};
        use tracing::{debug, warn};

        let frame = *check_rs422_frame(frame)?;
        let port_name = self.port.clone();
        let baud = self.baud_rate;
        let wait = self.reply_wait;

        let received = tokio::task::spawn_blocking(move || -> AppResult<Vec<u8>> {
            let mut port = serialport::new(&port_name, baud)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                .timeout(Duration::from_millis(20))
                .open()?;

            port.write_all(&frame)?;
            port.flush()?;
            debug!(port = %port_name, "RS-422 >> {}", to_hex(&frame));

            // collect whatever the board echoes until a full frame or the wait expires
            let mut received = Vec::new();
            let mut buffer = [0u8; 64];
            let start = std::time::Instant::now();
            while start.elapsed() < wait && received.len() < frame.len() {
                match port.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => received.extend_from_slice(&buffer[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => return Err(DaqError::Serial(e.to_string())),
                }
            }
            Ok(received)
        })
        .await
        .map_err(|e| DaqError::Serial(format!("RS-422 task failed: {}", e)))??;

        let received_hex = if received.is_empty() {
            warn!(port = %self.port, wait = ?self.reply_wait, "RS-422 frame sent but unconfirmed");
            None
        } else {
            let hex = to_hex(&received);
            debug!(port = %self.port, "RS-422 << {}", hex);
            Some(hex)
        };

        Ok(LinkReport {
            sent_bytes: frame.len(),
            sent_hex: to_hex(&frame),
            received_hex,
        })
    }
}

#[cfg(not(feature = "instrument_serial"))]
#[async_trait]
impl BoardLink for Rs422Link {
    async fn send_frame(&self, frame: &[u8]) -> AppResult<LinkReport> {
        check_rs422_frame(frame)?;
        Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wrong_length_rejected_before_open() {
        let link = Rs422Link::new("/dev/does-not-exist", 115_200, Duration::from_millis(10));
        let err = link.send_frame(&[0u8; 8]).await.unwrap_err();
        assert!(matches!(err, DaqError::MalformedField { .. }));
    }

    #[cfg(feature = "instrument_serial")]
    #[tokio::test]
    async fn test_missing_port_is_serial_error() {
        let link = Rs422Link::new("/dev/does-not-exist", 115_200, Duration::from_millis(10));
        let err = link.send_frame(&[0u8; 9]).await.unwrap_err();
        assert!(matches!(err, DaqError::Serial(_)));
    }

    #[test]
    fn test_with_port_keeps_settings() {
        let link = Rs422Link::from_config(&Rs422Config::default()).with_port("COM7");
        assert_eq!(link.port(), "COM7");
        assert_eq!(link.baud_rate, 115_200);
    }
}
