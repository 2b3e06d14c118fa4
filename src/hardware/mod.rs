//! Hardware communication layer.
//!
//! Instruments are reached through two seams:
//!
//! - [`ResourceManager`] enumerates resource strings and opens them. It is the
//!   stand-in for the system VISA resource manager and is implemented by
//!   [`visa::VisaResourceManager`] (feature `instrument_visa`) and by the simulated
//!   bench in [`mock`].
//! - [`ScpiTransport`] is one open, exclusive byte pipe to a single instrument.
//!
//! Transports are never shared directly. [`session::InstrumentSession`] owns one and
//! funnels every exchange through a FIFO queue, and [`registry::SessionRegistry`]
//! guarantees a logical instrument name maps to at most one live session.

use crate::error::AppResult;
use async_trait::async_trait;

pub mod mock;
pub mod registry;
pub mod session;
pub mod visa;

pub use registry::{AttachTarget, Identity, SessionRegistry};
pub use session::InstrumentSession;

/// An open connection to one instrument resource.
///
/// Implementations do not need to be `Sync`: the owning session task is the only
/// caller, so exchanges never overlap.
#[async_trait]
pub trait ScpiTransport: Send {
    /// Resource string this transport was opened on
    fn resource(&self) -> &str;

    /// Send one command; the line terminator is added by the transport
    async fn write(&mut self, command: &str) -> AppResult<()>;

    /// Read one complete response, undecoded
    async fn read_raw(&mut self) -> AppResult<Vec<u8>>;

    /// Release the underlying resource
    async fn close(&mut self) -> AppResult<()>;
}

/// Lists and opens instrument resources.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Resource strings currently visible, in no particular order
    async fn list_resources(&self) -> AppResult<Vec<String>>;

    /// Open an exclusive transport to `resource`
    async fn open(&self, resource: &str) -> AppResult<Box<dyn ScpiTransport>>;
}
