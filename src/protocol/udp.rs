//! UDP board link.
//!
//! Every send binds a fresh socket to the configured source address, so the board
//! sees a stable source port and replies land on the socket that is listening.

use super::packet::{check_udp_frame, to_hex};
use super::{BoardLink, LinkReport};
use crate::config::UdpConfig;
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Largest datagram accepted as a reply
const MAX_REPLY: usize = 65_536;

/// UDP link to the board
#[derive(Debug, Clone)]
pub struct UdpLink {
    source: SocketAddr,
    destination: SocketAddr,
    reply_wait: Duration,
}

impl UdpLink {
    /// Link with explicit endpoints
    pub fn new(source: SocketAddr, destination: SocketAddr, reply_wait: Duration) -> Self {
        Self {
            source,
            destination,
            reply_wait,
        }
    }

    /// Link from configuration
    pub fn from_config(config: &UdpConfig) -> AppResult<Self> {
        Ok(Self::new(
            config.source_addr()?,
            config.destination_addr()?,
            config.reply_wait,
        ))
    }

    /// Board address
    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    /// First datagram from the board; anything from another peer is skipped
    async fn await_reply(&self, socket: &UdpSocket) -> std::io::Result<String> {
        let mut buf = vec![0u8; MAX_REPLY];
        loop {
            let (n, from) = socket.recv_from(&mut buf).await?;
            if from != self.destination {
                debug!(from = %from, dst = %self.destination, bytes = n, "UDP datagram from unexpected peer ignored");
                continue;
            }
            let hex = to_hex(&buf[..n]);
            debug!(from = %from, bytes = n, "UDP << {}", hex);
            return Ok(hex);
        }
    }
}

#[async_trait]
impl BoardLink for UdpLink {
    async fn send_frame(&self, frame: &[u8]) -> AppResult<LinkReport> {
        let frame = check_udp_frame(frame)?;

        let socket = UdpSocket::bind(self.source)
            .await
            .map_err(|e| DaqError::Connection(format!("cannot bind {}: {}", self.source, e)))?;
        let sent_bytes = socket
            .send_to(frame, self.destination)
            .await
            .map_err(|e| DaqError::Connection(format!("send to {} failed: {}", self.destination, e)))?;

        let sent_hex = to_hex(frame);
        debug!(src = %self.source, dst = %self.destination, sent_bytes, "UDP >> {}", sent_hex);

        let received_hex = match tokio::time::timeout(self.reply_wait, self.await_reply(&socket)).await {
            Ok(Ok(hex)) => Some(hex),
            Ok(Err(e)) => {
                // ICMP port unreachable shows up here on some platforms
                warn!(dst = %self.destination, "UDP frame sent but reply failed: {}", e);
                None
            }
            Err(_) => {
                warn!(dst = %self.destination, wait = ?self.reply_wait, "UDP frame sent but unconfirmed");
                None
            }
        };

        Ok(LinkReport {
            sent_bytes,
            sent_hex,
            received_hex,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::build_udp_frame;
    use tracing_test::traced_test;

    async fn echo_server() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind echo");
        let addr = socket.local_addr().expect("addr");
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..n], from).await;
            }
        });
        addr
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().expect("addr")
    }

    #[tokio::test]
    async fn test_echo_confirms_frame() {
        let echo = echo_server().await;
        let link = UdpLink::new(loopback(), echo, Duration::from_millis(500));
        let frame = build_udp_frame("0A", "01 02", "01 02 03 04").expect("frame");

        let report = link.send_frame(&frame).await.expect("send");
        assert_eq!(report.sent_bytes, 40);
        assert!(report.confirmed());
        assert_eq!(report.received_hex.as_deref(), Some(report.sent_hex.as_str()));
    }

    /// Board that lets a third party answer first, then echoes
    async fn crowded_board(echo: bool) -> SocketAddr {
        let board = UdpSocket::bind("127.0.0.1:0").await.expect("bind board");
        let stranger = UdpSocket::bind("127.0.0.1:0").await.expect("bind stranger");
        let addr = board.local_addr().expect("addr");
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            if let Ok((n, from)) = board.recv_from(&mut buf).await {
                let _ = stranger.send_to(b"noise", from).await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                if echo {
                    let _ = board.send_to(&buf[..n], from).await;
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_reply_from_other_peer_is_skipped() {
        let board = crowded_board(true).await;
        let link = UdpLink::new(loopback(), board, Duration::from_millis(500));
        let frame = build_udp_frame("05", "01 02", "01 02 03 04").expect("frame");

        let report = link.send_frame(&frame).await.expect("send");
        assert_eq!(report.received_hex.as_deref(), Some(report.sent_hex.as_str()));
    }

    #[tokio::test]
    async fn test_only_foreign_reply_is_unconfirmed() {
        let board = crowded_board(false).await;
        let link = UdpLink::new(loopback(), board, Duration::from_millis(150));
        let frame = build_udp_frame("05", "01 02", "01 02 03 04").expect("frame");

        let report = link.send_frame(&frame).await.expect("send");
        assert!(!report.confirmed());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_silence_is_not_an_error() {
        // a bound socket that never answers
        let silent = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let dst = silent.local_addr().expect("addr");
        let link = UdpLink::new(loopback(), dst, Duration::from_millis(50));
        let frame = build_udp_frame("00", "00 00", "00 00 00 00").expect("frame");

        let report = link.send_frame(&frame).await.expect("send");
        assert!(!report.confirmed());
        assert!(logs_contain("unconfirmed"));
        drop(silent);
    }

    #[tokio::test]
    async fn test_wrong_length_rejected_before_send() {
        let link = UdpLink::new(loopback(), loopback(), Duration::from_millis(10));
        let err = link.send_frame(&[0u8; 39]).await.unwrap_err();
        assert!(matches!(err, DaqError::MalformedField { .. }));
    }
}
