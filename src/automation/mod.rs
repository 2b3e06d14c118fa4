//! Measurement run orchestration.

pub mod controller;
pub mod request;
pub mod state;

pub use controller::AutomationController;
pub use request::{RunRequest, ValidatedRun};
pub use state::{RunState, RunStatus, SpotFault};
