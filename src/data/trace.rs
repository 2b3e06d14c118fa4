//! Binary trace decoding.
//!
//! Analyzers return sweeps either as comma-separated ASCII or as an IEEE 488.2
//! definite-length block `#<ndigits><length><payload>`. The element width and byte
//! order actually on the wire depend on firmware and on `:FORM:BORD`, so binary
//! payloads are not trusted to match the requested format. Every candidate
//! encoding is tried and the first one that yields exactly the configured number
//! of sweep points, all finite, wins.
//!
//! Candidate order is: the requested width big-endian, the requested width
//! little-endian, then the other width in the same order. A first pass also
//! rejects candidates containing subnormal or absurdly large magnitudes, which is
//! what byte-swapped dBm values look like; if no candidate passes that, a second
//! pass accepts any all-finite candidate.

use crate::error::{AppResult, DaqError};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Unit of analyzer trace values
pub const TRACE_UNIT: &str = "dBm";

const MAX_PLAUSIBLE: f64 = 1e30;
const MIN_PLAUSIBLE: f64 = 1e-30;

/// Requested data format (`:FORM:DATA`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TraceFormat {
    /// Comma-separated text
    Ascii,
    /// 4-byte IEEE floats
    Real32,
    /// 8-byte IEEE floats
    Real64,
}

impl TraceFormat {
    /// Argument for `:FORM:DATA`
    pub fn scpi(self) -> &'static str {
        match self {
            TraceFormat::Ascii => "ASC",
            TraceFormat::Real32 => "REAL,32",
            TraceFormat::Real64 => "REAL,64",
        }
    }

    fn width(self) -> Option<usize> {
        match self {
            TraceFormat::Ascii => None,
            TraceFormat::Real32 => Some(4),
            TraceFormat::Real64 => Some(8),
        }
    }
}

impl FromStr for TraceFormat {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace(' ', "").as_str() {
            "ASC" | "ASCII" => Ok(TraceFormat::Ascii),
            "REAL,32" | "REAL32" => Ok(TraceFormat::Real32),
            "REAL,64" | "REAL64" => Ok(TraceFormat::Real64),
            other => Err(DaqError::malformed("format", format!("unknown trace format '{}'", other))),
        }
    }
}

/// Byte order of a decoded binary payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    /// Network order
    Big,
    /// Swapped
    Little,
}

/// How a payload was actually decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Encoding {
    /// Bytes per element, 0 for ASCII
    pub width: usize,
    /// Byte order, `None` for ASCII
    pub order: Option<ByteOrder>,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.order {
            None => write!(f, "ascii"),
            Some(ByteOrder::Big) => write!(f, "f{}be", self.width * 8),
            Some(ByteOrder::Little) => write!(f, "f{}le", self.width * 8),
        }
    }
}

/// A decoded sweep
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TracePayload {
    /// Values in sweep order
    pub values: Vec<f64>,
    /// Always [`TRACE_UNIT`]
    pub unit: &'static str,
    /// Encoding the decoder settled on
    pub encoding: Encoding,
}

impl TracePayload {
    /// Number of points
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True for an empty sweep
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// `index,power_dbm` rows with a header line
    pub fn to_csv(&self) -> String {
        let mut out = String::from("index,power_dbm\n");
        for (i, v) in self.values.iter().enumerate() {
            out.push_str(&format!("{},{}\n", i, v));
        }
        out
    }
}

/// Extract the payload of a definite-length block.
///
/// Leading whitespace is skipped and anything after the declared payload (usually
/// a line feed) is discarded.
pub fn parse_definite_block(raw: &[u8]) -> AppResult<&[u8]> {
    let start = raw
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .ok_or_else(|| DaqError::Decode("empty response".to_string()))?;
    let raw = &raw[start..];

    if raw.first() != Some(&b'#') {
        return Err(DaqError::Decode(
            "response is not a definite-length block".to_string(),
        ));
    }
    let ndigits = raw
        .get(1)
        .filter(|b| b.is_ascii_digit())
        .map(|b| (b - b'0') as usize)
        .ok_or_else(|| DaqError::Decode("missing block digit count".to_string()))?;
    if ndigits == 0 {
        return Err(DaqError::Decode(
            "indefinite-length blocks are not supported".to_string(),
        ));
    }

    let len_field = raw
        .get(2..2 + ndigits)
        .ok_or_else(|| DaqError::Decode("truncated block header".to_string()))?;
    let length: usize = std::str::from_utf8(len_field)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| DaqError::Decode("block length is not decimal".to_string()))?;

    let payload_start = 2 + ndigits;
    raw.get(payload_start..payload_start + length).ok_or_else(|| {
        DaqError::Decode(format!(
            "block declares {} bytes but only {} arrived",
            length,
            raw.len().saturating_sub(payload_start)
        ))
    })
}

/// Decode an analyzer trace response.
///
/// # Errors
/// [`DaqError::Decode`] if no encoding yields `sweep_points` finite values.
pub fn decode_trace(raw: &[u8], format: TraceFormat, sweep_points: usize) -> AppResult<TracePayload> {
    let looks_binary = raw
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'#');

    if !looks_binary {
        return decode_ascii(raw, sweep_points);
    }

    let payload = parse_definite_block(raw)?;
    let preferred = format.width().unwrap_or(8);
    let other = if preferred == 8 { 4 } else { 8 };
    let candidates = [
        (preferred, ByteOrder::Big),
        (preferred, ByteOrder::Little),
        (other, ByteOrder::Big),
        (other, ByteOrder::Little),
    ];

    let decoded: Vec<(Encoding, Vec<f64>)> = candidates
        .iter()
        .filter(|(width, _)| payload.len() % width == 0 && payload.len() / width == sweep_points)
        .map(|&(width, order)| {
            (
                Encoding {
                    width,
                    order: Some(order),
                },
                unpack(payload, width, order),
            )
        })
        .filter(|(_, values)| values.iter().all(|v| v.is_finite()))
        .collect();

    let chosen = decoded
        .iter()
        .find(|(_, values)| values.iter().all(|v| plausible(*v)))
        .or_else(|| decoded.first());

    match chosen {
        Some((encoding, values)) => Ok(TracePayload {
            values: values.clone(),
            unit: TRACE_UNIT,
            encoding: *encoding,
        }),
        None => Err(DaqError::Decode(format!(
            "{} payload bytes do not decode to {} finite values in any float encoding",
            payload.len(),
            sweep_points
        ))),
    }
}

fn decode_ascii(raw: &[u8], sweep_points: usize) -> AppResult<TracePayload> {
    let text = String::from_utf8_lossy(raw);
    let values = text
        .trim()
        .split(',')
        .map(|token| {
            token
                .trim()
                .parse::<f64>()
                .map_err(|_| DaqError::Decode(format!("'{}' is not a number", token.trim())))
        })
        .collect::<AppResult<Vec<f64>>>()?;

    if values.len() != sweep_points {
        return Err(DaqError::Decode(format!(
            "expected {} points, got {}",
            sweep_points,
            values.len()
        )));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(DaqError::Decode("trace contains non-finite values".to_string()));
    }

    Ok(TracePayload {
        values,
        unit: TRACE_UNIT,
        encoding: Encoding {
            width: 0,
            order: None,
        },
    })
}

fn unpack(payload: &[u8], width: usize, order: ByteOrder) -> Vec<f64> {
    payload
        .chunks_exact(width)
        .map(|chunk| match (width, order) {
            (4, ByteOrder::Big) => {
                f32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64
            }
            (4, ByteOrder::Little) => {
                f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as f64
            }
            (_, ByteOrder::Big) => {
                let mut b = [0u8; 8];
                b.copy_from_slice(chunk);
                f64::from_be_bytes(b)
            }
            (_, ByteOrder::Little) => {
                let mut b = [0u8; 8];
                b.copy_from_slice(chunk);
                f64::from_le_bytes(b)
            }
        })
        .collect()
}

fn plausible(v: f64) -> bool {
    v == 0.0 || (v.is_normal() && (MIN_PLAUSIBLE..=MAX_PLAUSIBLE).contains(&v.abs()))
}
