//! VISA resource manager for GPIB/USB/LAN instruments.
//!
//! Wraps the `visa-rs` crate. VISA calls are blocking, so every call runs on
//! Tokio's blocking pool. Supported resource strings look like:
//! - "GPIB0::1::INSTR"
//! - "USB0::0x2A8D::0x1A0B::MY57231104::INSTR"
//! - "TCPIP0::192.168.1.40::hislip0::INSTR"
//!
//! Without the `instrument_visa` feature every operation fails with
//! [`DaqError::FeatureNotEnabled`]; use the simulated bench instead.

use super::{ResourceManager, ScpiTransport};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;

#[cfg(feature = "instrument_visa")]
use std::sync::{Arc, Mutex};
#[cfg(feature = "instrument_visa")]
use tracing::debug;

/// System VISA resource manager
#[derive(Debug, Clone)]
pub struct VisaResourceManager {
    /// Search expression used by [`ResourceManager::list_resources`]
    pub search: String,
}

impl VisaResourceManager {
    /// Manager listing every `INSTR` resource
    pub fn new() -> Self {
        Self {
            search: "?*INSTR".to_string(),
        }
    }
}

impl Default for VisaResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "instrument_visa")]
fn visa_err(context: &str, err: impl std::fmt::Display) -> DaqError {
    DaqError::Connection(format!("{}: {}", context, err))
}

#[cfg(feature = "instrument_visa")]
fn visa_string(value: &str) -> AppResult<visa_rs::VisaString> {
    let c_string = std::ffi::CString::new(value)
        .map_err(|e| DaqError::malformed("resource", e.to_string()))?;
    Ok(visa_rs::VisaString::from(c_string))
}

#[cfg(feature = "instrument_visa")]
#[async_trait]
impl ResourceManager for VisaResourceManager {
    async fn list_resources(&self) -> AppResult<Vec<String>> {
        use visa_rs::prelude::*;

        let search = self.search.clone();
        tokio::task::spawn_blocking(move || {
            let rm = DefaultRM::new().map_err(|e| visa_err("VISA resource manager", e))?;
            let expr = visa_string(&search)?;
            let mut list = match rm.find_res_list(&expr) {
                Ok(list) => list,
                // VISA reports "no resources" as an error
                Err(e) => {
                    debug!("VISA search '{}' found nothing: {}", search, e);
                    return Ok(Vec::new());
                }
            };
            let mut found = Vec::new();
            while let Some(name) = list
                .find_next()
                .map_err(|e| visa_err("VISA resource list", e))?
            {
                found.push(name.to_string());
            }
            Ok(found)
        })
        .await
        .map_err(|e| DaqError::Connection(format!("VISA discovery task failed: {}", e)))?
    }

    async fn open(&self, resource: &str) -> AppResult<Box<dyn ScpiTransport>> {
        use visa_rs::prelude::*;

        let resource_owned = resource.to_string();
        let instrument = tokio::task::spawn_blocking(move || {
            let rm = DefaultRM::new().map_err(|e| visa_err("VISA resource manager", e))?;
            let name = visa_string(&resource_owned)?;
            let instr = rm
                .open(&name, AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)
                .map_err(|e| visa_err(&resource_owned, e))?;
            Ok::<_, DaqError>((rm, instr))
        })
        .await
        .map_err(|e| DaqError::Connection(format!("VISA open task failed: {}", e)))??;

        debug!(resource, "Opened VISA resource");
        Ok(Box::new(VisaTransport {
            resource: resource.to_string(),
            handle: Some(Arc::new(Mutex::new(instrument))),
        }))
    }
}

#[cfg(feature = "instrument_visa")]
type VisaHandle = Arc<Mutex<(visa_rs::DefaultRM, visa_rs::Instrument)>>;

#[cfg(feature = "instrument_visa")]
struct VisaTransport {
    resource: String,
    handle: Option<VisaHandle>,
}

#[cfg(feature = "instrument_visa")]
impl VisaTransport {
    fn handle(&self) -> AppResult<VisaHandle> {
        self.handle
            .clone()
            .ok_or_else(|| DaqError::Connection(format!("{} is closed", self.resource)))
    }
}

#[cfg(feature = "instrument_visa")]
#[async_trait]
impl ScpiTransport for VisaTransport {
    fn resource(&self) -> &str {
        &self.resource
    }

    async fn write(&mut self, command: &str) -> AppResult<()> {
        use std::io::Write;

        let handle = self.handle()?;
        let line = format!("{}\n", command);
        let resource = self.resource.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = handle
                .lock()
                .map_err(|_| DaqError::Connection(format!("{} handle poisoned", resource)))?;
            guard
                .1
                .write_all(line.as_bytes())
                .map_err(|e| visa_err(&resource, e))
        })
        .await
        .map_err(|e| DaqError::Connection(format!("VISA write task failed: {}", e)))?
    }

    async fn read_raw(&mut self) -> AppResult<Vec<u8>> {
        use std::io::Read;

        let handle = self.handle()?;
        let resource = self.resource.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = handle
                .lock()
                .map_err(|_| DaqError::Connection(format!("{} handle poisoned", resource)))?;
            let mut out = Vec::new();
            let mut chunk = vec![0u8; 64 * 1024];
            loop {
                let n = guard.1.read(&mut chunk).map_err(|e| visa_err(&resource, e))?;
                out.extend_from_slice(&chunk[..n]);
                // a short read means the instrument asserted END
                if n < chunk.len() {
                    break;
                }
            }
            Ok(out)
        })
        .await
        .map_err(|e| DaqError::Connection(format!("VISA read task failed: {}", e)))?
    }

    async fn close(&mut self) -> AppResult<()> {
        // dropping the last handle closes the VISA session
        self.handle.take();
        Ok(())
    }
}

#[cfg(not(feature = "instrument_visa"))]
#[async_trait]
impl ResourceManager for VisaResourceManager {
    async fn list_resources(&self) -> AppResult<Vec<String>> {
        Err(DaqError::FeatureNotEnabled("instrument_visa".to_string()))
    }

    async fn open(&self, _resource: &str) -> AppResult<Box<dyn ScpiTransport>> {
        Err(DaqError::FeatureNotEnabled("instrument_visa".to_string()))
    }
}
