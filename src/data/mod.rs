//! Measurement data: analyzer trace decoding and run reports.

pub mod report;
pub mod trace;

pub use report::{ChartPoint, MeasurementRecord, ReportRef, ReportStore, ReportSummary};
pub use trace::{TraceFormat, TracePayload};
