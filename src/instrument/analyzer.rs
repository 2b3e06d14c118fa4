//! Spectrum analyzer driver (X-Series command set).
//!
//! Marker readings come from the instrument's own peak search; nothing is
//! recomputed locally from trace data.

use crate::config::AnalyzerConfig;
use crate::data::trace::{decode_trace, parse_definite_block, TraceFormat, TracePayload};
use crate::error::{AppResult, DaqError};
use crate::hardware::InstrumentSession;
use chrono::Local;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where the mass-memory fallback stores the capture on the instrument
const INSTRUMENT_SCREEN_FILE: &str = "D:\\User_My_Documents\\rf_daq_screen.png";

/// Marker reading after a peak search
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Marker {
    /// Marker X (Hz)
    pub freq_hz: f64,
    /// Marker Y (dBm)
    pub power_dbm: f64,
}

/// Trace update mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceMode {
    /// Each sweep overwrites the trace
    ClearWrite,
    /// Keep the maximum of every sweep since the mode was entered
    MaxHold,
}

impl TraceMode {
    fn scpi(self) -> &'static str {
        match self {
            TraceMode::ClearWrite => "WRIT",
            TraceMode::MaxHold => "MAXH",
        }
    }
}

/// Live readback of the analyzer
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AnalyzerReadback {
    /// Center frequency (Hz)
    pub center_hz: f64,
    /// Span (Hz)
    pub span_hz: f64,
    /// Resolution bandwidth (Hz)
    pub rbw_hz: f64,
    /// Reference level (dBm)
    pub ref_level_dbm: f64,
}

/// Spectrum analyzer driver
pub struct Analyzer {
    session: InstrumentSession,
    sweep_points: usize,
    transfer_timeout: Duration,
    screenshot_dir: PathBuf,
}

impl Analyzer {
    /// Wrap an attached session
    pub fn new(session: InstrumentSession, config: &AnalyzerConfig) -> Self {
        Self {
            session,
            sweep_points: config.sweep_points,
            transfer_timeout: config.transfer_timeout,
            screenshot_dir: config.screenshot_dir.clone(),
        }
    }

    /// Program center frequency, span and resolution bandwidth
    pub async fn set(&self, center_hz: f64, span_hz: f64, rbw_hz: f64) -> AppResult<()> {
        for (field, value) in [("center_hz", center_hz), ("span_hz", span_hz), ("rbw_hz", rbw_hz)] {
            if !value.is_finite() || value <= 0.0 {
                return Err(DaqError::malformed(field, format!("{} must be positive", value)));
            }
        }
        self.session.write(&format!(":FREQ:CENT {}", center_hz)).await?;
        self.session.write(&format!(":FREQ:SPAN {}", span_hz)).await?;
        self.session.write(&format!(":BAND:RES {}", rbw_hz)).await?;
        debug!(resource = %self.session.resource(), center_hz, span_hz, rbw_hz, "Analyzer configured");
        Ok(())
    }

    /// Center frequency
    pub async fn center(&self) -> AppResult<f64> {
        self.session.query_f64(":FREQ:CENT?").await
    }

    /// Span
    pub async fn span(&self) -> AppResult<f64> {
        self.session.query_f64(":FREQ:SPAN?").await
    }

    /// Resolution bandwidth
    pub async fn rbw(&self) -> AppResult<f64> {
        self.session.query_f64(":BAND:RES?").await
    }

    /// Reference level
    pub async fn ref_level(&self) -> AppResult<f64> {
        self.session.query_f64(":DISP:WIND:TRAC:Y:RLEV?").await
    }

    /// Set the reference level
    pub async fn set_ref_level(&self, dbm: f64) -> AppResult<()> {
        if !dbm.is_finite() {
            return Err(DaqError::malformed("ref_level", "level must be finite"));
        }
        self.session
            .write(&format!(":DISP:WIND:TRAC:Y:RLEV {}", dbm))
            .await
    }

    /// Move the reference level by `step_db` (negative steps down); returns the new level
    pub async fn step_ref_level(&self, step_db: f64) -> AppResult<f64> {
        let level = self.ref_level().await? + step_db;
        self.set_ref_level(level).await?;
        Ok(level)
    }

    /// Switch the trace update mode and wait for the instrument to apply it
    pub async fn set_trace_mode(&self, mode: TraceMode) -> AppResult<()> {
        self.session
            .write(&format!(":TRAC:TYPE {}", mode.scpi()))
            .await?;
        self.session.wait_opc(self.session.default_timeout()).await
    }

    /// Clear the trace (back to clear/write)
    pub async fn trace_clear(&self) -> AppResult<()> {
        self.set_trace_mode(TraceMode::ClearWrite).await
    }

    /// Enter max-hold
    pub async fn trace_max(&self) -> AppResult<()> {
        self.set_trace_mode(TraceMode::MaxHold).await
    }

    /// Move marker 1 to the highest peak
    pub async fn peak_search(&self) -> AppResult<()> {
        self.session.write(":CALC:MARK:MAX").await
    }

    /// Peak search, then read marker X and Y, each under `timeout`
    pub async fn marker(&self, timeout: Duration) -> AppResult<Marker> {
        self.peak_search().await?;
        let freq_hz = parse_number(":CALC:MARK:X?", &self.session.query(":CALC:MARK:X?", timeout).await?)?;
        let power_dbm = parse_number(":CALC:MARK:Y?", &self.session.query(":CALC:MARK:Y?", timeout).await?)?;
        Ok(Marker { freq_hz, power_dbm })
    }

    /// Fetch and decode trace 1
    pub async fn trace(&self) -> AppResult<TracePayload> {
        let format = TraceFormat::Real64;
        self.session
            .write(&format!(":FORM:DATA {}", format.scpi()))
            .await?;
        let raw = self
            .session
            .query_binary(":TRAC:DATA? TRACE1", self.transfer_timeout)
            .await?;
        decode_trace(&raw, format, self.sweep_points)
    }

    /// Grab a PNG of the display and store it under the screenshot directory
    ///
    /// Tries the inline capture query first; if that yields nothing usable the
    /// image is saved on the instrument's file system and transferred from there.
    pub async fn screenshot(&self) -> AppResult<PathBuf> {
        let image = match self.capture_inline().await {
            Ok(image) => image,
            Err(e) if e.is_disconnect() => return Err(e),
            Err(e) => {
                warn!(resource = %self.session.resource(), "Inline capture failed, using file transfer: {}", e);
                self.capture_via_mmem().await?
            }
        };

        let path = store_image(&self.screenshot_dir, &image).await?;
        info!(path = %path.display(), bytes = image.len(), "Screenshot stored");
        Ok(path)
    }

    async fn capture_inline(&self) -> AppResult<Vec<u8>> {
        self.session.write(":DISP:CAPT:FORM PNG").await?;
        self.session.write(":DISP:CAPT").await?;
        let raw = self
            .session
            .query_binary(":DISP:CAPT:DATA?", self.transfer_timeout)
            .await?;
        non_empty(parse_definite_block(&raw)?)
    }

    async fn capture_via_mmem(&self) -> AppResult<Vec<u8>> {
        self.session
            .write(&format!(":MMEM:STOR:SCR '{}'", INSTRUMENT_SCREEN_FILE))
            .await?;
        self.session.wait_opc(self.transfer_timeout).await?;
        let raw = self
            .session
            .query_binary(&format!(":MMEM:DATA? '{}'", INSTRUMENT_SCREEN_FILE), self.transfer_timeout)
            .await?;
        non_empty(parse_definite_block(&raw)?)
    }

    /// Center, span, RBW and reference level in one call
    pub async fn readback(&self) -> AppResult<AnalyzerReadback> {
        Ok(AnalyzerReadback {
            center_hz: self.center().await?,
            span_hz: self.span().await?,
            rbw_hz: self.rbw().await?,
            ref_level_dbm: self.ref_level().await?,
        })
    }
}

fn parse_number(command: &str, text: &str) -> AppResult<f64> {
    text.trim()
        .parse::<f64>()
        .map_err(|_| DaqError::malformed(command, format!("'{}' is not a number", text)))
}

fn non_empty(payload: &[u8]) -> AppResult<Vec<u8>> {
    if payload.is_empty() {
        return Err(DaqError::Decode("empty image payload".to_string()));
    }
    Ok(payload.to_vec())
}

async fn store_image(dir: &Path, image: &[u8]) -> AppResult<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let name = format!("screenshot_{}.png", Local::now().format("%Y%m%d_%H%M%S_%3f"));
    let path = dir.join(name);
    tokio::fs::write(&path, image).await?;
    Ok(path)
}
