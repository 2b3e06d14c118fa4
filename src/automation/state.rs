//! Run state snapshot.

use crate::data::{MeasurementRecord, ReportRef};
use chrono::{DateTime, Local};
use serde::Serialize;
use uuid::Uuid;

/// Where the controller is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// No run yet, or reset
    Idle,
    /// A run is in progress
    Running,
    /// The last run finished and its report was written
    Completed,
    /// The last run aborted
    Error,
}

impl RunStatus {
    /// True for `Completed` and `Error`
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Error)
    }
}

/// A spot whose reading is missing, and why
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpotFault {
    /// Spot value
    pub spot: u8,
    /// What went wrong
    pub message: String,
}

/// State of the current or most recent run
#[derive(Debug, Clone, Serialize)]
pub struct RunState {
    /// Id of the current or last run
    pub run_id: Option<Uuid>,
    /// Lifecycle position
    pub status: RunStatus,
    /// Spots done
    pub current: usize,
    /// Spots in the run
    pub total: usize,
    /// Board of the current or last run
    pub board_no: u32,
    /// Channel of the current or last run
    pub channel_no: u32,
    /// Last progress or terminal message
    pub message: String,
    /// Records so far, in spot order
    pub records: Vec<MeasurementRecord>,
    /// Spots recorded as missing
    pub faults: Vec<SpotFault>,
    /// Report written at completion
    pub report: Option<ReportRef>,
    /// When the run started
    pub started_at: Option<DateTime<Local>>,
    /// When the run reached a terminal state
    pub finished_at: Option<DateTime<Local>>,
}

impl RunState {
    /// Initial state
    pub fn idle() -> Self {
        Self {
            run_id: None,
            status: RunStatus::Idle,
            current: 0,
            total: 0,
            board_no: 0,
            channel_no: 0,
            message: String::new(),
            records: Vec::new(),
            faults: Vec::new(),
            report: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Records holding a real reading
    pub fn successful(&self) -> usize {
        self.records.iter().filter(|r| r.is_valid()).count()
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::idle()
    }
}
