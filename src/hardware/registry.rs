//! Session registry
//!
//! Maps logical instrument names (psu, psu2, gen, sa) to live sessions. A logical
//! name holds at most one session and a resource string is claimed by at most one
//! name at a time.
//!
//! Auto-attach walks the resource list, skips resources already claimed, probes
//! each remaining candidate with `*IDN?` under a short timeout and binds to the
//! first reply containing the expected vendor and model substrings.

use super::{InstrumentSession, ResourceManager};
use crate::config::InstrumentConfig;
use crate::error::{AppResult, DaqError};
use crate::instrument::InstrumentKind;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// What `attach` should bind to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachTarget {
    /// Scan for the first resource whose identity matches the expected family
    Auto,
    /// A specific resource string
    Resource(String),
}

impl From<&str> for AttachTarget {
    fn from(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("auto") {
            AttachTarget::Auto
        } else {
            AttachTarget::Resource(value.trim().to_string())
        }
    }
}

/// Identity of an attached instrument
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    /// Logical name
    pub kind: InstrumentKind,
    /// Resource string the session is open on
    pub resource: String,
    /// `*IDN?` reply
    pub idn: String,
}

struct Attached {
    identity: Identity,
    session: InstrumentSession,
}

/// Owner of every live instrument session
pub struct SessionRegistry {
    manager: Arc<dyn ResourceManager>,
    config: InstrumentConfig,
    attached: Mutex<BTreeMap<InstrumentKind, Attached>>,
}

impl SessionRegistry {
    /// Create an empty registry over `manager`
    pub fn new(manager: Arc<dyn ResourceManager>, config: InstrumentConfig) -> Self {
        Self {
            manager,
            config,
            attached: Mutex::new(BTreeMap::new()),
        }
    }

    /// Instrument configuration in effect
    pub fn config(&self) -> &InstrumentConfig {
        &self.config
    }

    /// Every resource string the manager can see, sorted
    pub async fn discover(&self) -> AppResult<Vec<String>> {
        let mut resources = self.manager.list_resources().await?;
        resources.sort();
        resources.dedup();
        debug!(count = resources.len(), "Discovered instrument resources");
        Ok(resources)
    }

    /// Bind `kind` to a resource
    ///
    /// # Errors
    /// - [`DaqError::Busy`] if `kind` already has a live session, or the requested
    ///   resource (or the only matching one) is held by another name
    /// - [`DaqError::NotFound`] if auto-attach found no matching identity
    /// - [`DaqError::Connection`] if a manual resource could not be opened
    pub async fn attach(&self, kind: InstrumentKind, target: AttachTarget) -> AppResult<Identity> {
        let mut attached = self.attached.lock().await;

        if let Some(existing) = attached.get(&kind) {
            if existing.session.is_open() {
                return Err(DaqError::Busy(format!(
                    "{} is already attached to {}",
                    kind, existing.identity.resource
                )));
            }
            debug!(name = %kind, "Dropping stale session before re-attach");
            attached.remove(&kind);
        }

        let identity = match target {
            AttachTarget::Resource(resource) => {
                if let Some(holder) = holder_of(&attached, &resource) {
                    return Err(DaqError::Busy(format!(
                        "{} is held by {}",
                        resource, holder
                    )));
                }
                let transport = self.manager.open(&resource).await?;
                let session = InstrumentSession::open(transport, self.config.query_timeout);
                let idn = match session.idn().await {
                    Ok(idn) => idn,
                    Err(e) => {
                        let _ = session.close().await;
                        return Err(e);
                    }
                };
                if !kind.matches_identity(&self.config, &idn) {
                    warn!(name = %kind, resource = %resource, idn = %idn,
                        "Attached resource does not report the expected family");
                }
                let identity = Identity {
                    kind,
                    resource,
                    idn,
                };
                attached.insert(
                    kind,
                    Attached {
                        identity: identity.clone(),
                        session,
                    },
                );
                identity
            }
            AttachTarget::Auto => {
                let (identity, session) = self.scan(kind, &attached).await?;
                attached.insert(
                    kind,
                    Attached {
                        identity: identity.clone(),
                        session,
                    },
                );
                identity
            }
        };

        info!(name = %kind, resource = %identity.resource, idn = %identity.idn, "Instrument attached");
        Ok(identity)
    }

    async fn scan(
        &self,
        kind: InstrumentKind,
        attached: &BTreeMap<InstrumentKind, Attached>,
    ) -> AppResult<(Identity, InstrumentSession)> {
        let (vendor, model) = kind.family(&self.config);
        let resources = self.discover().await?;

        for resource in &resources {
            if holder_of(attached, resource).is_some() {
                continue;
            }

            let transport = match self.manager.open(resource).await {
                Ok(t) => t,
                Err(e) => {
                    debug!(resource = %resource, "Skipping candidate: {}", e);
                    continue;
                }
            };
            let session = InstrumentSession::open(transport, self.config.query_timeout);
            match session.query("*IDN?", self.config.probe_timeout).await {
                Ok(idn) if kind.matches_identity(&self.config, &idn) => {
                    let identity = Identity {
                        kind,
                        resource: resource.clone(),
                        idn,
                    };
                    return Ok((identity, session));
                }
                Ok(idn) => debug!(resource = %resource, idn = %idn, "Identity does not match"),
                Err(e) => debug!(resource = %resource, "Probe failed: {}", e),
            }
            let _ = session.close().await;
        }

        let held: Vec<&Attached> = attached
            .values()
            .filter(|a| kind.matches_identity(&self.config, &a.identity.idn))
            .collect();
        if let Some(a) = held.first() {
            return Err(DaqError::Busy(format!(
                "every {} {} is already claimed ({} holds {})",
                vendor, model, a.identity.kind, a.identity.resource
            )));
        }

        Err(DaqError::NotFound(format!(
            "no resource among {} candidates identifies as {} {}",
            resources.len(),
            vendor,
            model
        )))
    }

    /// Session for `kind`
    ///
    /// Returns [`DaqError::Connection`] if nothing is attached or the session
    /// has been closed.
    pub async fn session(&self, kind: InstrumentKind) -> AppResult<InstrumentSession> {
        let attached = self.attached.lock().await;
        match attached.get(&kind) {
            Some(a) if a.session.is_open() => Ok(a.session.clone()),
            Some(_) => Err(DaqError::Connection(format!("{} session is closed", kind))),
            None => Err(DaqError::Connection(format!("{} is not attached", kind))),
        }
    }

    /// True if `kind` has a live session
    pub async fn is_attached(&self, kind: InstrumentKind) -> bool {
        self.attached
            .lock()
            .await
            .get(&kind)
            .is_some_and(|a| a.session.is_open())
    }

    /// Identities of every attached instrument
    pub async fn identities(&self) -> Vec<Identity> {
        self.attached
            .lock()
            .await
            .values()
            .map(|a| a.identity.clone())
            .collect()
    }

    /// Close the session for `kind` and release its resource
    pub async fn detach(&self, kind: InstrumentKind) -> AppResult<()> {
        let removed = self.attached.lock().await.remove(&kind);
        match removed {
            Some(a) => {
                info!(name = %kind, resource = %a.identity.resource, "Instrument detached");
                a.session.close().await
            }
            None => Ok(()),
        }
    }

    /// Close every session and forget every claimed resource
    pub async fn close_all(&self) {
        let drained: Vec<Attached> = {
            let mut attached = self.attached.lock().await;
            std::mem::take(&mut *attached).into_values().collect()
        };
        for a in drained {
            if let Err(e) = a.session.close().await {
                warn!(name = %a.identity.kind, "Error closing session: {}", e);
            }
        }
        info!("All instrument sessions closed");
    }
}

fn holder_of(attached: &BTreeMap<InstrumentKind, Attached>, resource: &str) -> Option<InstrumentKind> {
    attached
        .values()
        .find(|a| a.identity.resource == resource && a.session.is_open())
        .map(|a| a.identity.kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{SimBench, SimInstrumentKind, SIM_ANALYZER, SIM_PSU, SIM_PSU2};

    fn registry(bench: &SimBench) -> SessionRegistry {
        SessionRegistry::new(Arc::new(bench.clone()), InstrumentConfig::default())
    }

    #[tokio::test]
    async fn test_auto_attach_binds_matching_family() {
        let bench = SimBench::standard();
        let reg = registry(&bench);

        let sa = reg.attach(InstrumentKind::Analyzer, AttachTarget::Auto).await.expect("sa");
        assert_eq!(sa.resource, SIM_ANALYZER);
        assert!(sa.idn.contains("N9030"));
    }

    #[tokio::test]
    async fn test_two_supplies_get_distinct_resources() {
        let bench = SimBench::standard();
        let reg = registry(&bench);

        let a = reg.attach(InstrumentKind::Psu, AttachTarget::Auto).await.expect("psu");
        let b = reg.attach(InstrumentKind::Psu2, AttachTarget::Auto).await.expect("psu2");
        assert_eq!(a.resource, SIM_PSU);
        assert_eq!(b.resource, SIM_PSU2);
    }

    #[tokio::test]
    async fn test_auto_attach_not_found() {
        let bench = SimBench::new();
        bench.add("ASRL1::INSTR", SimInstrumentKind::Analyzer);
        let reg = registry(&bench);

        let err = reg.attach(InstrumentKind::Psu, AttachTarget::Auto).await.unwrap_err();
        assert!(matches!(err, DaqError::NotFound(_)));
        assert!(reg.identities().await.is_empty());
    }

    #[tokio::test]
    async fn test_auto_attach_busy_when_only_match_claimed() {
        let bench = SimBench::new();
        bench.add(SIM_PSU, SimInstrumentKind::PowerSupply);
        let reg = registry(&bench);

        reg.attach(InstrumentKind::Psu, AttachTarget::Auto).await.expect("psu");
        let err = reg.attach(InstrumentKind::Psu2, AttachTarget::Auto).await.unwrap_err();
        assert!(matches!(err, DaqError::Busy(_)));
    }

    #[tokio::test]
    async fn test_manual_attach_rejects_claimed_resource() {
        let bench = SimBench::standard();
        let reg = registry(&bench);

        reg.attach(InstrumentKind::Psu, SIM_PSU.into()).await.expect("psu");
        let err = reg.attach(InstrumentKind::Psu2, SIM_PSU.into()).await.unwrap_err();
        assert!(matches!(err, DaqError::Busy(_)));

        let err = reg.attach(InstrumentKind::Psu, SIM_PSU2.into()).await.unwrap_err();
        assert!(matches!(err, DaqError::Busy(_)), "name already held");
    }

    #[tokio::test]
    async fn test_auto_attach_skips_dead_candidates() {
        let bench = SimBench::new();
        bench.add("TCPIP0::10.0.0.1::INSTR", SimInstrumentKind::Analyzer).disconnect();
        bench.add("TCPIP0::10.0.0.2::INSTR", SimInstrumentKind::Analyzer);
        let reg = registry(&bench);

        let sa = reg.attach(InstrumentKind::Analyzer, AttachTarget::Auto).await.expect("sa");
        assert_eq!(sa.resource, "TCPIP0::10.0.0.2::INSTR");
    }

    #[tokio::test]
    async fn test_close_all_releases_resources() {
        let bench = SimBench::standard();
        let reg = registry(&bench);

        reg.attach(InstrumentKind::Psu, AttachTarget::Auto).await.expect("psu");
        let session = reg.session(InstrumentKind::Psu).await.expect("session");
        reg.close_all().await;

        assert!(!reg.is_attached(InstrumentKind::Psu).await);
        assert!(session.idn().await.is_err());
        // resource can be claimed again
        reg.attach(InstrumentKind::Psu, AttachTarget::Auto).await.expect("re-attach");
    }

    #[test]
    fn test_attach_target_parsing() {
        assert_eq!(AttachTarget::from("AUTO"), AttachTarget::Auto);
        assert_eq!(
            AttachTarget::from("GPIB0::5::INSTR"),
            AttachTarget::Resource("GPIB0::5::INSTR".to_string())
        );
    }
}
