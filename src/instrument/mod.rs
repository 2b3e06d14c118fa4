//! Device drivers.
//!
//! Each driver composes an [`InstrumentSession`](crate::hardware::InstrumentSession)
//! and exposes a typed command set for one device class. Drivers hold no state of
//! their own beyond configuration, so they are cheap to construct per call.

use crate::config::InstrumentConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod analyzer;
pub mod generator;
pub mod psu;

pub use analyzer::{Analyzer, Marker, TraceMode};
pub use generator::Generator;
pub use psu::PowerSupply;

/// Logical instrument names known to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InstrumentKind {
    /// First DC power supply
    #[serde(rename = "psu")]
    Psu,
    /// Second DC power supply
    #[serde(rename = "psu2")]
    Psu2,
    /// Signal generator
    #[serde(rename = "gen")]
    Generator,
    /// Spectrum analyzer
    #[serde(rename = "sa")]
    Analyzer,
}

impl InstrumentKind {
    /// Every logical name, in attach order
    pub const ALL: [InstrumentKind; 4] = [
        InstrumentKind::Psu,
        InstrumentKind::Psu2,
        InstrumentKind::Generator,
        InstrumentKind::Analyzer,
    ];

    /// Logical name as used by callers
    pub fn name(self) -> &'static str {
        match self {
            InstrumentKind::Psu => "psu",
            InstrumentKind::Psu2 => "psu2",
            InstrumentKind::Generator => "gen",
            InstrumentKind::Analyzer => "sa",
        }
    }

    /// `(vendor, model)` substrings an identity must contain to match this kind
    pub fn family(self, config: &InstrumentConfig) -> (&str, &str) {
        let (vendor, model) = match self {
            InstrumentKind::Psu | InstrumentKind::Psu2 => &config.psu_family,
            InstrumentKind::Generator => &config.generator_family,
            InstrumentKind::Analyzer => &config.analyzer_family,
        };
        (vendor.as_str(), model.as_str())
    }

    /// Case-insensitive family match against an `*IDN?` reply
    pub fn matches_identity(self, config: &InstrumentConfig, idn: &str) -> bool {
        let (vendor, model) = self.family(config);
        let idn = idn.to_ascii_lowercase();
        idn.contains(&vendor.to_ascii_lowercase()) && idn.contains(&model.to_ascii_lowercase())
    }
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for InstrumentKind {
    type Err = crate::error::DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "psu" => Ok(InstrumentKind::Psu),
            "psu2" => Ok(InstrumentKind::Psu2),
            "gen" => Ok(InstrumentKind::Generator),
            "sa" => Ok(InstrumentKind::Analyzer),
            other => Err(crate::error::DaqError::malformed(
                "name",
                format!("unknown instrument '{}', expected psu, psu2, gen or sa", other),
            )),
        }
    }
}
