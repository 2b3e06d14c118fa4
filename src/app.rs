//! Application context.
//!
//! [`DaqContext`] owns the process-wide state (session registry, automation
//! controller, FPGA supervisor, report store) and exposes every operation the
//! request layer may call. It is created once at startup and shared by reference.

use crate::automation::{AutomationController, RunRequest, RunState};
use crate::config::Settings;
use crate::data::{ReportStore, TracePayload};
use crate::error::{AppResult, DaqError};
use crate::events::{EventBus, Subscription};
use crate::fpga::{FpgaSupervisor, ProgramSession};
use crate::hardware::mock::{SimBench, SimBoard};
use crate::hardware::visa::VisaResourceManager;
use crate::hardware::{AttachTarget, Identity, ResourceManager, SessionRegistry};
use crate::instrument::analyzer::AnalyzerReadback;
use crate::instrument::generator::GeneratorReadback;
use crate::instrument::psu::PsuReadback;
use crate::instrument::{Analyzer, Generator, InstrumentKind, Marker, PowerSupply};
use crate::protocol::packet::parse_hex_bytes;
use crate::protocol::{BoardLink, LinkReport, Rs422Link, UdpLink};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Live readback of one attached instrument
///
/// A readback that failed is reported inline as `"err: <reason>"` so one
/// unresponsive instrument does not hide the others.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Readback {
    /// Power supply measurements
    Psu(PsuReadback),
    /// Generator settings
    Generator(GeneratorReadback),
    /// Analyzer settings
    Analyzer(AnalyzerReadback),
    /// Readback failed
    Error(String),
}

impl Readback {
    fn from_result<T>(result: AppResult<T>, wrap: impl FnOnce(T) -> Readback) -> Self {
        match result {
            Ok(value) => wrap(value),
            Err(e) => Readback::Error(format!("err: {}", e)),
        }
    }
}

/// Everything `status()` reports
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Automation run snapshot
    pub run: RunState,
    /// Attached instruments
    pub identities: Vec<Identity>,
    /// Live readback per attached instrument name
    pub readbacks: BTreeMap<String, Readback>,
    /// FPGA programming session
    pub fpga: ProgramSession,
}

/// Process-wide context shared by every operation
pub struct DaqContext {
    settings: Settings,
    registry: Arc<SessionRegistry>,
    controller: AutomationController,
    fpga: FpgaSupervisor,
    reports: ReportStore,
}

impl DaqContext {
    /// Context over an explicit instrument backend and board link
    pub fn new(
        settings: Settings,
        manager: Arc<dyn ResourceManager>,
        link: Arc<dyn BoardLink>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(manager, settings.instruments.clone()));
        let reports = ReportStore::new(settings.report.directory.clone());
        let controller = AutomationController::new(
            registry.clone(),
            link,
            EventBus::new(),
            reports.clone(),
            settings.analyzer.clone(),
            settings.automation.clone(),
        );
        let fpga = FpgaSupervisor::new(settings.fpga.clone());
        Self {
            settings,
            registry,
            controller,
            fpga,
            reports,
        }
    }

    /// Context on real hardware: VISA instruments and the configured UDP board link
    pub fn with_hardware(settings: Settings) -> AppResult<Self> {
        let link = UdpLink::from_config(&settings.udp)?;
        Ok(Self::new(
            settings,
            Arc::new(VisaResourceManager::new()),
            Arc::new(link),
        ))
    }

    /// Context on the standard simulated bench with an echoing board
    pub fn simulated(settings: Settings) -> Self {
        Self::new(
            settings,
            Arc::new(SimBench::standard()),
            Arc::new(SimBoard::new()),
        )
    }

    /// Settings in effect
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Session registry
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Automation controller
    pub fn controller(&self) -> &AutomationController {
        &self.controller
    }

    // ------------------------------------------------------------------
    // Instruments
    // ------------------------------------------------------------------

    /// Every visible instrument resource
    pub async fn discover(&self) -> AppResult<Vec<String>> {
        self.registry.discover().await
    }

    /// Attach logical `name` (psu, psu2, gen, sa) to a resource string or `"auto"`
    pub async fn attach(&self, name: &str, target: &str) -> AppResult<Identity> {
        let kind: InstrumentKind = name.parse()?;
        self.registry.attach(kind, AttachTarget::from(target)).await
    }

    /// Close every session
    pub async fn close_all(&self) {
        self.registry.close_all().await;
    }

    async fn psu(&self, name: &str) -> AppResult<PowerSupply> {
        let kind: InstrumentKind = name.parse()?;
        if !matches!(kind, InstrumentKind::Psu | InstrumentKind::Psu2) {
            return Err(DaqError::malformed("name", format!("{} is not a power supply", name)));
        }
        let session = self.registry.session(kind).await?;
        Ok(PowerSupply::new(session, &self.settings.instruments))
    }

    async fn generator(&self) -> AppResult<Generator> {
        Ok(Generator::new(self.registry.session(InstrumentKind::Generator).await?))
    }

    async fn analyzer(&self) -> AppResult<Analyzer> {
        let session = self.registry.session(InstrumentKind::Analyzer).await?;
        Ok(Analyzer::new(session, &self.settings.analyzer))
    }

    /// Program a supply; returns the voltage actually sent after the safety ceiling
    pub async fn psu_set(&self, name: &str, voltage: f64, current: f64) -> AppResult<f64> {
        self.psu(name).await?.set(voltage, current).await
    }

    /// Switch a supply output
    pub async fn psu_output(&self, name: &str, on: bool) -> AppResult<()> {
        self.psu(name).await?.output(on).await
    }

    /// Program the generator CW frequency and level
    pub async fn gen_set(&self, frequency_hz: f64, power_dbm: f64) -> AppResult<()> {
        self.generator().await?.set(frequency_hz, power_dbm).await
    }

    /// Switch generator RF output
    pub async fn gen_rf(&self, on: bool) -> AppResult<()> {
        self.generator().await?.rf(on).await
    }

    /// Set analyzer center, span and RBW
    pub async fn sa_set(&self, center_hz: f64, span_hz: f64, rbw_hz: f64) -> AppResult<()> {
        self.analyzer().await?.set(center_hz, span_hz, rbw_hz).await
    }

    /// Peak marker reading
    pub async fn sa_marker(&self) -> AppResult<Marker> {
        let timeout = self.settings.instruments.query_timeout;
        self.analyzer().await?.marker(timeout).await
    }

    /// Fetch and decode the current trace
    pub async fn sa_trace(&self) -> AppResult<TracePayload> {
        self.analyzer().await?.trace().await
    }

    /// Capture the analyzer screen; returns where the image was stored
    pub async fn sa_screenshot(&self) -> AppResult<PathBuf> {
        self.analyzer().await?.screenshot().await
    }

    /// Clear/write trace mode
    pub async fn sa_trace_clear(&self) -> AppResult<()> {
        self.analyzer().await?.trace_clear().await
    }

    /// Max-hold trace mode
    pub async fn sa_trace_max(&self) -> AppResult<()> {
        self.analyzer().await?.trace_max().await
    }

    // ------------------------------------------------------------------
    // Automation
    // ------------------------------------------------------------------

    /// Start a run; progress arrives on [`Self::subscribe`]
    pub async fn run(&self, request: RunRequest) -> AppResult<Uuid> {
        self.controller.start(request).await
    }

    /// A run over the configured default spot sweep
    pub fn default_request(&self, board_no: u32, channel_no: u32, pulse_width: &str, prt: &str) -> RunRequest {
        RunRequest {
            board_no,
            channel_no,
            pulse_width: pulse_width.to_string(),
            prt: prt.to_string(),
            spots: self.settings.automation.default_spots.clone(),
        }
    }

    /// Force the controller back to a startable state
    pub fn reset(&self) {
        self.controller.reset();
    }

    /// Run events, starting with the retained recent ones
    pub fn subscribe(&self) -> Subscription {
        self.controller.subscribe()
    }

    /// Run snapshot plus live readbacks of every attached instrument
    pub async fn status(&self) -> StatusReport {
        let identities = self.registry.identities().await;
        let mut readbacks = BTreeMap::new();

        for identity in &identities {
            let kind = identity.kind;
            let readback = match kind {
                InstrumentKind::Psu | InstrumentKind::Psu2 => match self.psu(kind.name()).await {
                    Ok(psu) => Readback::from_result(psu.readback().await, Readback::Psu),
                    Err(e) => Readback::Error(format!("err: {}", e)),
                },
                InstrumentKind::Generator => match self.generator().await {
                    Ok(gen) => Readback::from_result(gen.readback().await, Readback::Generator),
                    Err(e) => Readback::Error(format!("err: {}", e)),
                },
                InstrumentKind::Analyzer => match self.analyzer().await {
                    Ok(sa) => Readback::from_result(sa.readback().await, Readback::Analyzer),
                    Err(e) => Readback::Error(format!("err: {}", e)),
                },
            };
            readbacks.insert(kind.name().to_string(), readback);
        }

        StatusReport {
            run: self.controller.snapshot(),
            identities,
            readbacks,
            fpga: self.fpga.snapshot(),
        }
    }

    // ------------------------------------------------------------------
    // Board links
    // ------------------------------------------------------------------

    /// Send a raw 40-byte board frame from `src_ip:src_port` to `dst_ip:dst_port`
    pub async fn udp_send(
        &self,
        src_ip: &str,
        src_port: u16,
        dst_ip: &str,
        dst_port: u16,
        payload_hex: &str,
    ) -> AppResult<LinkReport> {
        let source = socket_addr("src_ip", src_ip, src_port)?;
        let destination = socket_addr("dst_ip", dst_ip, dst_port)?;
        let payload = parse_hex_bytes("payload", payload_hex)?;
        let link = UdpLink::new(source, destination, self.settings.udp.reply_wait);
        let report = link.send_frame(&payload).await?;
        info!(%destination, confirmed = report.confirmed(), "UDP frame sent");
        Ok(report)
    }

    /// Send a raw 9-byte frame on serial `port`
    pub async fn rs422_send(&self, port: &str, packet_hex: &str) -> AppResult<LinkReport> {
        let packet = parse_hex_bytes("packet", packet_hex)?;
        let link = Rs422Link::from_config(&self.settings.rs422).with_port(port);
        let report = link.send_frame(&packet).await?;
        info!(port, confirmed = report.confirmed(), "RS-422 frame sent");
        Ok(report)
    }

    // ------------------------------------------------------------------
    // FPGA and reports
    // ------------------------------------------------------------------

    /// Launch FPGA programming
    pub fn fpga_program(&self) -> AppResult<()> {
        self.fpga.program()
    }

    /// FPGA programming status
    pub fn fpga_status(&self) -> ProgramSession {
        self.fpga.snapshot()
    }

    /// Most recently modified daily report store
    pub fn report_latest(&self) -> AppResult<PathBuf> {
        self.reports.latest()
    }
}

fn socket_addr(field: &str, ip: &str, port: u16) -> AppResult<SocketAddr> {
    let ip: IpAddr = ip
        .trim()
        .parse()
        .map_err(|e| DaqError::malformed(field, format!("'{}': {}", ip, e)))?;
    Ok(SocketAddr::new(ip, port))
}
