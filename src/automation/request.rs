//! Run request validation.

use crate::error::{AppResult, DaqError};
use crate::protocol::packet::{parse_hex_field, FrameFields, PRT_LEN, PULSE_LEN};
use serde::{Deserialize, Serialize};

/// Parameters of one automation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    /// Board under test
    pub board_no: u32,
    /// Channel under test
    pub channel_no: u32,
    /// Pulse width, 2 hex bytes (`"00 01"`)
    pub pulse_width: String,
    /// Pulse repetition time, 4 hex bytes (`"0A AB 00 00"`)
    pub prt: String,
    /// Spot values in run order, 1 hex byte each
    pub spots: Vec<String>,
}

/// A request whose fields have been parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRun {
    /// Board under test
    pub board_no: u32,
    /// Channel under test
    pub channel_no: u32,
    /// Pulse width bytes
    pub pulse: [u8; PULSE_LEN],
    /// PRT bytes
    pub prt: [u8; PRT_LEN],
    /// Spot values in run order
    pub spots: Vec<u8>,
}

impl ValidatedRun {
    /// Board frame fields for `spot`
    pub fn frame_fields(&self, spot: u8) -> FrameFields {
        FrameFields {
            spot,
            pulse: self.pulse,
            prt: self.prt,
        }
    }
}

impl RunRequest {
    /// Parse and check every field
    ///
    /// # Errors
    /// - [`DaqError::InvalidRequest`] for an empty spot list
    /// - [`DaqError::MalformedField`] for any hex field of the wrong shape
    pub fn validate(&self) -> AppResult<ValidatedRun> {
        if self.spots.is_empty() {
            return Err(DaqError::InvalidRequest("spot list is empty".to_string()));
        }

        let mut pulse = [0u8; PULSE_LEN];
        pulse.copy_from_slice(&parse_hex_field("pulse_width", &self.pulse_width, PULSE_LEN)?);
        let mut prt = [0u8; PRT_LEN];
        prt.copy_from_slice(&parse_hex_field("prt", &self.prt, PRT_LEN)?);

        let spots = self
            .spots
            .iter()
            .enumerate()
            .map(|(i, s)| parse_hex_field(&format!("spots[{}]", i), s, 1).map(|b| b[0]))
            .collect::<AppResult<Vec<u8>>>()?;

        Ok(ValidatedRun {
            board_no: self.board_no,
            channel_no: self.channel_no,
            pulse,
            prt,
            spots,
        })
    }
}
