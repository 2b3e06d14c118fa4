//! CW signal generator driver (SMB100A command set).

use crate::error::{AppResult, DaqError};
use crate::hardware::InstrumentSession;
use serde::Serialize;
use tracing::debug;

/// Live readback of the generator
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeneratorReadback {
    /// CW frequency (Hz)
    pub frequency_hz: f64,
    /// Output level (dBm)
    pub power_dbm: f64,
    /// RF output state
    pub rf_on: bool,
}

/// Signal generator driver
pub struct Generator {
    session: InstrumentSession,
}

impl Generator {
    /// Wrap an attached session
    pub fn new(session: InstrumentSession) -> Self {
        Self { session }
    }

    /// Program CW frequency and level
    pub async fn set(&self, frequency_hz: f64, power_dbm: f64) -> AppResult<()> {
        if !frequency_hz.is_finite() || frequency_hz <= 0.0 {
            return Err(DaqError::malformed(
                "frequency_hz",
                format!("{} is not a valid frequency", frequency_hz),
            ));
        }
        if !power_dbm.is_finite() {
            return Err(DaqError::malformed("power_dbm", "level must be finite"));
        }
        self.session
            .write(&format!("SOUR:FREQ:CW {}", frequency_hz))
            .await?;
        self.session
            .write(&format!("SOUR:POW:LEV:IMM:AMPL {}", power_dbm))
            .await?;
        debug!(resource = %self.session.resource(), frequency_hz, power_dbm, "Generator tuned");
        Ok(())
    }

    /// RF output on/off
    pub async fn rf(&self, on: bool) -> AppResult<()> {
        self.session.write(if on { "OUTP ON" } else { "OUTP OFF" }).await
    }

    /// Programmed CW frequency
    pub async fn frequency(&self) -> AppResult<f64> {
        self.session.query_f64("SOUR:FREQ:CW?").await
    }

    /// Programmed output level
    pub async fn power(&self) -> AppResult<f64> {
        self.session.query_f64("SOUR:POW:LEV:IMM:AMPL?").await
    }

    /// RF output state
    pub async fn rf_state(&self) -> AppResult<bool> {
        let reply = self
            .session
            .query("OUTP:STAT?", self.session.default_timeout())
            .await?;
        match reply.trim().to_ascii_uppercase().as_str() {
            "1" | "ON" => Ok(true),
            "0" | "OFF" => Ok(false),
            other => Err(DaqError::malformed("OUTP:STAT?", format!("unexpected '{}'", other))),
        }
    }

    /// Frequency, level and RF state in one call
    pub async fn readback(&self) -> AppResult<GeneratorReadback> {
        Ok(GeneratorReadback {
            frequency_hz: self.frequency().await?,
            power_dbm: self.power().await?,
            rf_on: self.rf_state().await?,
        })
    }
}
