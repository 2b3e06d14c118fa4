//! Board transports.
//!
//! The board under test accepts fixed-length frames over UDP and over RS-422.
//! Both links follow the same contract: send the frame once, then wait a bounded
//! interval for a loopback reply. No reply is reported as `received: None` with a
//! warning, never as an error.

use crate::error::AppResult;
use async_trait::async_trait;
use serde::Serialize;

pub mod packet;
pub mod rs422;
pub mod udp;

pub use packet::{build_udp_frame, to_hex, FrameFields};
pub use rs422::Rs422Link;
pub use udp::UdpLink;

/// Outcome of one frame transmission
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkReport {
    /// Bytes handed to the transport
    pub sent_bytes: usize,
    /// What was sent, spaced upper-case hex
    pub sent_hex: String,
    /// Loopback reply, spaced upper-case hex; `None` if nothing came back in time
    pub received_hex: Option<String>,
}

impl LinkReport {
    /// True if the board echoed something back
    pub fn confirmed(&self) -> bool {
        self.received_hex.is_some()
    }
}

/// A transport that carries board frames
#[async_trait]
pub trait BoardLink: Send + Sync {
    /// Transmit one frame and wait for the loopback reply
    async fn send_frame(&self, frame: &[u8]) -> AppResult<LinkReport>;
}
