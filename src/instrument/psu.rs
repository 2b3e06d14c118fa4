//! DC power supply driver (N8739A command set).
//!
//! The voltage ceiling is enforced here, before anything reaches the wire. Callers
//! cannot bypass it by talking to the driver directly.

use crate::config::{ClampPolicy, InstrumentConfig};
use crate::error::{AppResult, DaqError};
use crate::hardware::InstrumentSession;
use serde::Serialize;
use tracing::{info, warn};

/// Highest save/recall slot
pub const MAX_STATE_SLOT: u8 = 15;

/// Live readback of a supply
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PsuReadback {
    /// Measured output voltage (V)
    pub voltage: f64,
    /// Measured output current (A)
    pub current: f64,
    /// Measured output power (W)
    pub power: f64,
}

/// Power supply driver
pub struct PowerSupply {
    session: InstrumentSession,
    ceiling: f64,
    policy: ClampPolicy,
}

impl PowerSupply {
    /// Wrap an attached session
    pub fn new(session: InstrumentSession, config: &InstrumentConfig) -> Self {
        Self {
            session,
            ceiling: config.psu_voltage_ceiling,
            policy: config.psu_clamp_policy,
        }
    }

    /// Voltage that would be transmitted for a request of `volts`
    ///
    /// Negative or non-finite values are always rejected. Values above the
    /// ceiling are clamped with a warning, or rejected under [`ClampPolicy::Reject`].
    pub fn safe_voltage(&self, volts: f64) -> AppResult<f64> {
        if !volts.is_finite() || volts < 0.0 {
            return Err(DaqError::malformed(
                "voltage",
                format!("{} V is not a valid setpoint", volts),
            ));
        }
        if volts <= self.ceiling {
            return Ok(volts);
        }
        match self.policy {
            ClampPolicy::Clamp => {
                warn!(
                    resource = %self.session.resource(),
                    requested = volts,
                    ceiling = self.ceiling,
                    "Voltage above safety ceiling, clamping"
                );
                Ok(self.ceiling)
            }
            ClampPolicy::Reject => Err(DaqError::malformed(
                "voltage",
                format!("{} V exceeds the {} V ceiling", volts, self.ceiling),
            )),
        }
    }

    /// Program voltage; returns the value actually sent
    pub async fn set_voltage(&self, volts: f64) -> AppResult<f64> {
        let volts = self.safe_voltage(volts)?;
        self.session.write(&format!("VOLT {}", volts)).await?;
        Ok(volts)
    }

    /// Program the current limit
    pub async fn set_current(&self, amps: f64) -> AppResult<()> {
        if !amps.is_finite() || amps < 0.0 {
            return Err(DaqError::malformed(
                "current",
                format!("{} A is not a valid limit", amps),
            ));
        }
        self.session.write(&format!("CURR {}", amps)).await
    }

    /// Program voltage and current together; returns the voltage actually sent
    pub async fn set(&self, volts: f64, amps: f64) -> AppResult<f64> {
        // validate both before touching the instrument
        let volts = self.safe_voltage(volts)?;
        if !amps.is_finite() || amps < 0.0 {
            return Err(DaqError::malformed(
                "current",
                format!("{} A is not a valid limit", amps),
            ));
        }
        self.set_voltage(volts).await?;
        self.set_current(amps).await?;
        info!(resource = %self.session.resource(), volts, amps, "Supply programmed");
        Ok(volts)
    }

    /// Output relay on/off
    pub async fn output(&self, on: bool) -> AppResult<()> {
        self.session
            .write(if on { "OUTP ON" } else { "OUTP OFF" })
            .await
    }

    /// Over-voltage protection trip level
    pub async fn set_ovp(&self, volts: f64) -> AppResult<()> {
        if !volts.is_finite() || volts <= 0.0 {
            return Err(DaqError::malformed("ovp", format!("{} V is not valid", volts)));
        }
        self.session.write(&format!("VOLT:PROT {}", volts)).await
    }

    /// Current OVP trip level
    pub async fn ovp(&self) -> AppResult<f64> {
        self.session.query_f64("VOLT:PROT?").await
    }

    /// Measured output voltage
    pub async fn measure_voltage(&self) -> AppResult<f64> {
        self.session.query_f64("MEAS:VOLT?").await
    }

    /// Measured output current
    pub async fn measure_current(&self) -> AppResult<f64> {
        self.session.query_f64("MEAS:CURR?").await
    }

    /// Measured output power
    pub async fn measure_power(&self) -> AppResult<f64> {
        self.session.query_f64("MEAS:POW?").await
    }

    /// Voltage, current and power in one call
    pub async fn readback(&self) -> AppResult<PsuReadback> {
        Ok(PsuReadback {
            voltage: self.measure_voltage().await?,
            current: self.measure_current().await?,
            power: self.measure_power().await?,
        })
    }

    /// Store the present setup in `slot`
    pub async fn save_state(&self, slot: u8) -> AppResult<()> {
        check_slot(slot)?;
        self.session.write(&format!("SAV {}", slot)).await
    }

    /// Restore the setup stored in `slot`
    pub async fn recall_state(&self, slot: u8) -> AppResult<()> {
        check_slot(slot)?;
        self.session.write(&format!("RCL {}", slot)).await
    }
}

fn check_slot(slot: u8) -> AppResult<()> {
    if slot > MAX_STATE_SLOT {
        return Err(DaqError::malformed(
            "slot",
            format!("{} is outside 0..={}", slot, MAX_STATE_SLOT),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{SimBench, SIM_PSU};
    use crate::hardware::ResourceManager;
    use std::time::Duration;
    use tracing_test::traced_test;

    async fn supply(config: &InstrumentConfig) -> (SimBench, PowerSupply) {
        let bench = SimBench::standard();
        let transport = bench.open(SIM_PSU).await.expect("open");
        let session = InstrumentSession::open(transport, Duration::from_secs(1));
        (bench, PowerSupply::new(session, config))
    }

    #[tokio::test]
    #[traced_test]
    async fn test_voltage_clamped_before_transmission() {
        let config = InstrumentConfig::default();
        let (bench, psu) = supply(&config).await;

        let sent = psu.set(48.0, 1.0).await.expect("set");
        assert_eq!(sent, 32.0);
        let sim = bench.instrument(SIM_PSU).expect("sim");
        assert_eq!(sim.voltage(), 32.0);
        assert!(sim.commands().iter().all(|c| c != "VOLT 48"));
        assert!(logs_contain("clamping"));
    }

    #[tokio::test]
    async fn test_reject_policy() {
        let config = InstrumentConfig {
            psu_clamp_policy: ClampPolicy::Reject,
            ..InstrumentConfig::default()
        };
        let (bench, psu) = supply(&config).await;

        let err = psu.set(40.0, 1.0).await.unwrap_err();
        assert!(matches!(err, DaqError::MalformedField { .. }));
        assert!(bench.instrument(SIM_PSU).expect("sim").commands().is_empty());
    }

    #[tokio::test]
    async fn test_output_and_measure() {
        let (_bench, psu) = supply(&InstrumentConfig::default()).await;
        psu.set(12.0, 2.0).await.expect("set");
        psu.output(true).await.expect("on");

        let rb = psu.readback().await.expect("readback");
        assert_eq!(rb.voltage, 12.0);
        assert!((rb.current - 1.2).abs() < 1e-9);
        assert!((rb.power - 14.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_save_recall() {
        let (bench, psu) = supply(&InstrumentConfig::default()).await;
        psu.set(5.0, 1.0).await.expect("set");
        psu.save_state(3).await.expect("save");
        psu.set(9.0, 1.0).await.expect("set");
        psu.recall_state(3).await.expect("recall");
        assert_eq!(bench.instrument(SIM_PSU).expect("sim").voltage(), 5.0);

        assert!(psu.save_state(16).await.is_err());
    }

    #[tokio::test]
    async fn test_negative_voltage_rejected() {
        let (_bench, psu) = supply(&InstrumentConfig::default()).await;
        assert!(psu.set_voltage(-1.0).await.is_err());
        assert!(psu.set_voltage(f64::NAN).await.is_err());
    }
}
