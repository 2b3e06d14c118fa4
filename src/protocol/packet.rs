//! Board frame codec.
//!
//! UDP frames are 40 bytes built from a fixed template; three fields are spliced
//! in per packet:
//!
//! | offset | length | field       |
//! |--------|--------|-------------|
//! | 9      | 1      | spot        |
//! | 10..12 | 2      | pulse width |
//! | 12..16 | 4      | PRT         |
//!
//! Field values arrive as hex-byte tokens (`"0A"`, `"01 02"`, `"01 02 03 04"`).
//! RS-422 frames are 9 raw bytes supplied whole by the caller.
//!
//! Nothing here pads or truncates: a frame or field of the wrong length is
//! rejected with [`DaqError::MalformedField`].

use crate::error::{AppResult, DaqError};

/// UDP frame length
pub const UDP_FRAME_LEN: usize = 40;
/// RS-422 frame length
pub const RS422_FRAME_LEN: usize = 9;

/// Offset of the spot byte
pub const SPOT_OFFSET: usize = 9;
/// Offset of the 2-byte pulse width
pub const PULSE_OFFSET: usize = 10;
/// Offset of the 4-byte PRT
pub const PRT_OFFSET: usize = 12;

/// Pulse width length in bytes
pub const PULSE_LEN: usize = 2;
/// PRT length in bytes
pub const PRT_LEN: usize = 4;

/// Constant preamble and trailer of every UDP frame; fields are overwritten.
pub const UDP_TEMPLATE: [u8; UDP_FRAME_LEN] = [
    0x00, 0xAB, 0xAB, 0x06, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, //
    0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x10, 0x11, 0x12, 0x13, 0x00, //
    0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B, 0x1C, 0x1D, 0x1E, //
    0x1F, 0x20, 0x21, 0x22, 0x23, 0x24, 0x25, 0x26, 0x27, 0x28,
];

/// Parse whitespace-separated hex byte tokens.
///
/// Each token is exactly two hex digits, except that a single unbroken token of
/// even length (`"01020304"`) is split into pairs.
pub fn parse_hex_bytes(field: &str, text: &str) -> AppResult<Vec<u8>> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.is_empty() {
        return Err(DaqError::malformed(field, "no hex bytes given"));
    }

    let pairs: Vec<&str> = if tokens.len() == 1 && tokens[0].len() > 2 {
        let packed = tokens[0];
        if packed.len() % 2 != 0 || !packed.is_ascii() {
            return Err(DaqError::malformed(
                field,
                format!("'{}' is not a whole number of hex bytes", packed),
            ));
        }
        (0..packed.len())
            .step_by(2)
            .map(|i| &packed[i..i + 2])
            .collect()
    } else {
        tokens
    };

    pairs
        .iter()
        .map(|token| {
            if token.len() != 2 {
                return Err(DaqError::malformed(
                    field,
                    format!("'{}' is not a two-digit hex byte", token),
                ));
            }
            u8::from_str_radix(token, 16)
                .map_err(|_| DaqError::malformed(field, format!("'{}' is not hex", token)))
        })
        .collect()
}

/// Parse a field that must be exactly `len` bytes
pub fn parse_hex_field(field: &str, text: &str, len: usize) -> AppResult<Vec<u8>> {
    let bytes = parse_hex_bytes(field, text)?;
    if bytes.len() != len {
        return Err(DaqError::malformed(
            field,
            format!("expected {} byte(s), got {}", len, bytes.len()),
        ));
    }
    Ok(bytes)
}

/// Render bytes as spaced upper-case hex (`"0A FF 10"`)
pub fn to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fields of a UDP board frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFields {
    /// Spot byte
    pub spot: u8,
    /// Pulse width bytes, wire order
    pub pulse: [u8; PULSE_LEN],
    /// PRT bytes, wire order
    pub prt: [u8; PRT_LEN],
}

impl FrameFields {
    /// Validate hex tokens for each field
    pub fn parse(spot: &str, pulse: &str, prt: &str) -> AppResult<Self> {
        let spot = parse_hex_field("spot", spot, 1)?[0];
        let mut p = [0u8; PULSE_LEN];
        p.copy_from_slice(&parse_hex_field("pulse_width", pulse, PULSE_LEN)?);
        let mut r = [0u8; PRT_LEN];
        r.copy_from_slice(&parse_hex_field("prt", prt, PRT_LEN)?);
        Ok(Self {
            spot,
            pulse: p,
            prt: r,
        })
    }

    /// Splice into the template
    pub fn build(&self) -> [u8; UDP_FRAME_LEN] {
        let mut frame = UDP_TEMPLATE;
        frame[SPOT_OFFSET] = self.spot;
        frame[PULSE_OFFSET..PULSE_OFFSET + PULSE_LEN].copy_from_slice(&self.pulse);
        frame[PRT_OFFSET..PRT_OFFSET + PRT_LEN].copy_from_slice(&self.prt);
        frame
    }

    /// Read the fields back out of a frame
    pub fn extract(frame: &[u8]) -> AppResult<Self> {
        let frame = check_udp_frame(frame)?;
        let mut pulse = [0u8; PULSE_LEN];
        pulse.copy_from_slice(&frame[PULSE_OFFSET..PULSE_OFFSET + PULSE_LEN]);
        let mut prt = [0u8; PRT_LEN];
        prt.copy_from_slice(&frame[PRT_OFFSET..PRT_OFFSET + PRT_LEN]);
        Ok(Self {
            spot: frame[SPOT_OFFSET],
            pulse,
            prt,
        })
    }
}

/// Build a UDP board frame from hex tokens
pub fn build_udp_frame(spot: &str, pulse: &str, prt: &str) -> AppResult<[u8; UDP_FRAME_LEN]> {
    Ok(FrameFields::parse(spot, pulse, prt)?.build())
}

/// Accept exactly [`UDP_FRAME_LEN`] bytes
pub fn check_udp_frame(frame: &[u8]) -> AppResult<&[u8; UDP_FRAME_LEN]> {
    frame.try_into().map_err(|_| {
        DaqError::malformed(
            "payload",
            format!("UDP frame must be {} bytes, got {}", UDP_FRAME_LEN, frame.len()),
        )
    })
}

/// Accept exactly [`RS422_FRAME_LEN`] bytes
pub fn check_rs422_frame(frame: &[u8]) -> AppResult<&[u8; RS422_FRAME_LEN]> {
    frame.try_into().map_err(|_| {
        DaqError::malformed(
            "packet",
            format!("RS-422 frame must be {} bytes, got {}", RS422_FRAME_LEN, frame.len()),
        )
    })
}
