//! Configuration System using Figment
//!
//! Settings are loaded from:
//! 1. `config/rf_daq.toml` (optional base configuration)
//! 2. Environment variables (prefixed with `RFDAQ_`, `__` separates nesting)
//!
//! Every section has defaults, so a missing file yields a usable configuration.
//!
//! # Environment Variable Overrides
//!
//! ```text
//! RFDAQ_APPLICATION__LOG_LEVEL=debug
//! RFDAQ_UDP__DESTINATION=192.168.1.10:5005
//! RFDAQ_AUTOMATION__MARKER_RETRIES=5
//! ```
//!
//! # Example
//!
//! ```no_run
//! use rf_daq::config::Settings;
//!
//! let settings = Settings::load()?;
//! println!("Reports go to {}", settings.report.directory.display());
//! # Ok::<(), rf_daq::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/rf_daq.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Instrument session settings
    pub instruments: InstrumentConfig,
    /// Spectrum analyzer defaults
    pub analyzer: AnalyzerConfig,
    /// Automation sequence settings
    pub automation: AutomationConfig,
    /// UDP board link
    pub udp: UdpConfig,
    /// RS-422 board link
    pub rs422: Rs422Config,
    /// Report store
    pub report: ReportConfig,
    /// FPGA toolchain
    pub fpga: FpgaConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones
    pub json_logs: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "rf_daq".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// What the PSU driver does with a voltage above the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClampPolicy {
    /// Transmit the ceiling instead and log a warning
    Clamp,
    /// Refuse the command
    Reject,
}

/// Instrument session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    /// Default query timeout
    #[serde(with = "humantime_serde")]
    pub query_timeout: Duration,
    /// Timeout for the `*IDN?` probe while auto-attaching
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    /// Identity substrings expected from the power supplies (vendor, model)
    pub psu_family: (String, String),
    /// Identity substrings expected from the signal generator
    pub generator_family: (String, String),
    /// Identity substrings expected from the spectrum analyzer
    pub analyzer_family: (String, String),
    /// Hard ceiling for PSU output voltage in volts
    pub psu_voltage_ceiling: f64,
    /// Behaviour when a requested voltage exceeds the ceiling
    pub psu_clamp_policy: ClampPolicy,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_millis(1500),
            psu_family: ("Agilent".to_string(), "N8739A".to_string()),
            generator_family: ("Rohde&Schwarz".to_string(), "SMB100A".to_string()),
            analyzer_family: ("Keysight".to_string(), "N9030".to_string()),
            psu_voltage_ceiling: 32.0,
            psu_clamp_policy: ClampPolicy::Clamp,
        }
    }
}

/// Spectrum analyzer defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Number of points per sweep; decoded traces must match this count
    pub sweep_points: usize,
    /// Center frequency applied at the start of a run (Hz)
    pub center_hz: f64,
    /// Span applied at the start of a run (Hz)
    pub span_hz: f64,
    /// Resolution bandwidth applied at the start of a run (Hz)
    pub rbw_hz: f64,
    /// Directory screenshots are stored in
    pub screenshot_dir: PathBuf,
    /// Timeout for large binary transfers (screenshots, traces)
    #[serde(with = "humantime_serde")]
    pub transfer_timeout: Duration,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            sweep_points: 1001,
            center_hz: 3.1e9,
            span_hz: 600e6,
            rbw_hz: 100e3,
            screenshot_dir: PathBuf::from("reports/screenshots"),
            transfer_timeout: Duration::from_secs(30),
        }
    }
}

/// Automation sequence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    /// Wait after tuning the generator and clearing the trace
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
    /// Wait after sending the board packet, before the max-hold window closes
    #[serde(with = "humantime_serde")]
    pub hold_delay: Duration,
    /// Marker reads per spot, first try included, before recording a missing value
    #[serde(alias = "marker_retries")]
    pub marker_attempts: u32,
    /// Timeout for one marker read
    #[serde(with = "humantime_serde")]
    pub marker_timeout: Duration,
    /// Generator frequency for spot 0 (Hz)
    pub generator_base_hz: f64,
    /// Generator frequency increment per spot value (Hz)
    pub generator_step_hz: f64,
    /// Generator output level (dBm)
    pub generator_power_dbm: f64,
    /// Spot sweep used when a run request names no spots
    pub default_spots: Vec<String>,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(2),
            hold_delay: Duration::from_secs(3),
            marker_attempts: 3,
            marker_timeout: Duration::from_secs(5),
            generator_base_hz: 2.8e9,
            generator_step_hz: 7.5e6,
            generator_power_dbm: -10.0,
            default_spots: (0x00..=0x50u8)
                .step_by(5)
                .map(|spot| format!("{:02X}", spot))
                .collect(),
        }
    }
}

/// UDP board link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    /// Local address the ephemeral socket binds to
    pub source: String,
    /// Board address
    pub destination: String,
    /// How long to wait for the loopback reply
    #[serde(with = "humantime_serde")]
    pub reply_wait: Duration,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            source: "192.168.1.5:6005".to_string(),
            destination: "192.168.1.10:5005".to_string(),
            reply_wait: Duration::from_millis(500),
        }
    }
}

impl UdpConfig {
    /// Parsed source address
    pub fn source_addr(&self) -> AppResult<SocketAddr> {
        parse_addr("udp.source", &self.source)
    }

    /// Parsed destination address
    pub fn destination_addr(&self) -> AppResult<SocketAddr> {
        parse_addr("udp.destination", &self.destination)
    }
}

/// RS-422 board link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Rs422Config {
    /// Serial device (e.g. "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate, 8N1 framing is fixed
    pub baud_rate: u32,
    /// How long to wait for the loopback reply
    #[serde(with = "humantime_serde")]
    pub reply_wait: Duration,
}

impl Default for Rs422Config {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            reply_wait: Duration::from_millis(500),
        }
    }
}

/// Report store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Directory that holds one store per calendar day
    pub directory: PathBuf,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("reports"),
        }
    }
}

/// FPGA toolchain configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FpgaConfig {
    /// Toolchain executable
    pub command: String,
    /// Arguments passed to the toolchain
    pub args: Vec<String>,
}

impl Default for FpgaConfig {
    fn default() -> Self {
        Self {
            command: "vivado".to_string(),
            args: vec![
                "-mode".to_string(),
                "batch".to_string(),
                "-source".to_string(),
                "scripts/program_fpga.tcl".to_string(),
            ],
        }
    }
}

fn parse_addr(field: &str, value: &str) -> AppResult<SocketAddr> {
    value
        .parse()
        .map_err(|e| DaqError::Configuration(format!("{} '{}' is not ip:port: {}", field, value, e)))
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from the default path and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment overrides apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RFDAQ_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Sweep point count is non-zero
    /// - PSU ceiling is positive and finite
    /// - UDP endpoints parse as `ip:port`
    /// - FPGA command is not empty
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.analyzer.sweep_points == 0 {
            return Err(DaqError::Configuration(
                "analyzer.sweep_points must be at least 1".to_string(),
            ));
        }

        let ceiling = self.instruments.psu_voltage_ceiling;
        if !ceiling.is_finite() || ceiling <= 0.0 {
            return Err(DaqError::Configuration(format!(
                "instruments.psu_voltage_ceiling must be positive, got {}",
                ceiling
            )));
        }

        self.udp.source_addr()?;
        self.udp.destination_addr()?;

        if self.fpga.command.trim().is_empty() {
            return Err(DaqError::Configuration(
                "fpga.command cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}
