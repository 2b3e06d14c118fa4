//! Core library for the rf_daq application.
//!
//! This library sequences a power supply, signal generator and spectrum analyzer
//! through a parameterized RF board test, exchanges fixed-length frames with the
//! board over UDP and RS-422, decodes analyzer traces, reports run progress to
//! any number of observers and aggregates the results into daily reports.
//!
//! [`app::DaqContext`] is the entry point; it is used by the `rf_daq` binary and
//! by whatever request layer sits in front of it.

pub mod app;
pub mod automation;
pub mod config;
pub mod data;
pub mod error;
pub mod events;
pub mod fpga;
pub mod hardware;
pub mod instrument;
pub mod logging;
pub mod protocol;
