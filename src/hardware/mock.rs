//! Simulated Bench
//!
//! Provides simulated SCPI instruments for testing and `--simulate` runs without
//! physical hardware. All simulated I/O is async-safe (no blocking sleeps).
//!
//! # Available Simulations
//!
//! - `PowerSupply` - N8739A-style DC supply with OVP and 16 save/recall slots
//! - `Generator` - SMB100A-style CW signal generator
//! - `Analyzer` - N9030-style spectrum analyzer with markers, binary traces and
//!   screen capture
//! - [`SimBoard`] - board under test that echoes every frame
//!
//! Generators and analyzers on one bench share an RF path: the analyzer peak
//! follows whatever the generator is emitting, with a frequency-dependent loss so
//! a spot sweep yields varying levels.
//!
//! # Fault Injection
//!
//! - [`SimInstrument::stall_marker_reads`] - the next N `:CALC:MARK:Y?` queries
//!   never answer, so the caller's timeout fires
//! - [`SimInstrument::disconnect`] - every further exchange fails with a
//!   connection error and new opens are refused
//! - [`SimInstrument::disable_screen_capture`] - the direct capture query goes
//!   unanswered, forcing the mass-memory fallback

use super::{ResourceManager, ScpiTransport};
use crate::error::{AppResult, DaqError};
use crate::protocol::packet::{check_udp_frame, to_hex};
use crate::protocol::{BoardLink, LinkReport};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Resource string of the first supply on the standard bench
pub const SIM_PSU: &str = "TCPIP0::192.168.1.21::inst0::INSTR";
/// Resource string of the second supply on the standard bench
pub const SIM_PSU2: &str = "TCPIP0::192.168.1.22::inst0::INSTR";
/// Resource string of the generator on the standard bench
pub const SIM_GENERATOR: &str = "TCPIP0::192.168.1.30::inst0::INSTR";
/// Resource string of the analyzer on the standard bench
pub const SIM_ANALYZER: &str = "TCPIP0::192.168.1.40::hislip0::INSTR";

const NOISE_FLOOR_DBM: f64 = -95.0;

/// A fake 1x1 PNG, enough for anything that only checks the signature.
const FAKE_PNG: &[u8] = &[
    0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, b'I', b'H', b'D',
    b'R', 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00,
];

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Which instrument class a simulated resource behaves like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimInstrumentKind {
    /// DC power supply
    PowerSupply,
    /// CW signal generator
    Generator,
    /// Spectrum analyzer
    Analyzer,
}

impl SimInstrumentKind {
    fn default_idn(self) -> &'static str {
        match self {
            Self::PowerSupply => "Agilent Technologies,N8739A,US13B2841R,A.01.09",
            Self::Generator => "Rohde&Schwarz,SMB100A,1406.6000k03/180421,3.1.19.15-3.50.124.73",
            Self::Analyzer => "Keysight Technologies,N9030B,MY57231104,A.33.03",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RfPath {
    frequency_hz: f64,
    power_dbm: f64,
    on: bool,
}

#[derive(Debug, Clone)]
struct SimState {
    voltage: f64,
    current: f64,
    ovp: f64,
    output: bool,
    saved: HashMap<u8, (f64, f64, f64)>,
    center_hz: f64,
    span_hz: f64,
    rbw_hz: f64,
    ref_level_dbm: f64,
    trace_type: String,
    data_format: String,
    stored_screen: Option<String>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            voltage: 0.0,
            current: 0.0,
            ovp: 36.0,
            output: false,
            saved: HashMap::new(),
            center_hz: 1.0e9,
            span_hz: 100.0e6,
            rbw_hz: 1.0e6,
            ref_level_dbm: 0.0,
            trace_type: "WRIT".to_string(),
            data_format: "ASC".to_string(),
            stored_screen: None,
        }
    }
}

// =============================================================================
// SimInstrument - one simulated resource
// =============================================================================

/// Simulated SCPI instrument
pub struct SimInstrument {
    kind: SimInstrumentKind,
    idn: String,
    rf: Arc<Mutex<RfPath>>,
    state: Mutex<SimState>,
    commands: Mutex<Vec<String>>,
    stalled_marker_reads: AtomicU32,
    disconnected: AtomicBool,
    screen_capture: AtomicBool,
    sweep_points: AtomicUsize,
    little_endian: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SimInstrument {
    fn new(kind: SimInstrumentKind, idn: String, rf: Arc<Mutex<RfPath>>) -> Self {
        Self {
            kind,
            idn,
            rf,
            state: Mutex::new(SimState::default()),
            commands: Mutex::new(Vec::new()),
            stalled_marker_reads: AtomicU32::new(0),
            disconnected: AtomicBool::new(false),
            screen_capture: AtomicBool::new(true),
            sweep_points: AtomicUsize::new(1001),
            little_endian: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Instrument class
    pub fn kind(&self) -> SimInstrumentKind {
        self.kind
    }

    /// The next `count` marker level queries go unanswered
    pub fn stall_marker_reads(&self, count: u32) {
        self.stalled_marker_reads.store(count, Ordering::SeqCst);
    }

    /// Drop the link; every later exchange fails
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    /// True after [`Self::disconnect`]
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Stop answering `:DISP:CAPT:DATA?`
    pub fn disable_screen_capture(&self) {
        self.screen_capture.store(false, Ordering::SeqCst);
    }

    /// Number of points returned by trace queries
    pub fn set_sweep_points(&self, points: usize) {
        self.sweep_points.store(points, Ordering::SeqCst);
    }

    /// Send binary traces little-endian instead of network order
    pub fn set_little_endian(&self, swapped: bool) {
        self.little_endian.store(swapped, Ordering::SeqCst);
    }

    /// Every command received so far, in order
    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }

    /// Highest number of overlapping exchanges ever observed
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Current programmed output voltage (supplies only)
    pub fn voltage(&self) -> f64 {
        lock(&self.state).voltage
    }

    fn handle(&self, command: &str) -> Option<Vec<u8>> {
        let (header, arg) = match command.trim().split_once(char::is_whitespace) {
            Some((h, a)) => (h.to_ascii_uppercase(), a.trim().to_string()),
            None => (command.trim().to_ascii_uppercase(), String::new()),
        };

        match header.as_str() {
            "*IDN?" => return Some(self.idn.clone().into_bytes()),
            "*OPC?" => return Some(b"1".to_vec()),
            "*RST" => {
                *lock(&self.state) = SimState::default();
                if self.kind == SimInstrumentKind::Generator {
                    lock(&self.rf).on = false;
                }
                return None;
            }
            "*CLS" => return None,
            _ => {}
        }

        match self.kind {
            SimInstrumentKind::PowerSupply => self.handle_supply(&header, &arg),
            SimInstrumentKind::Generator => self.handle_generator(&header, &arg),
            SimInstrumentKind::Analyzer => self.handle_analyzer(&header, &arg),
        }
    }

    fn handle_supply(&self, header: &str, arg: &str) -> Option<Vec<u8>> {
        let mut state = lock(&self.state);
        let value = arg.parse::<f64>().ok();
        let load_ohms = 10.0;
        match header {
            "VOLT" => state.voltage = value.unwrap_or(state.voltage),
            "CURR" => state.current = value.unwrap_or(state.current),
            "VOLT:PROT" => state.ovp = value.unwrap_or(state.ovp),
            "OUTP" => state.output = is_on(arg),
            "VOLT?" => return Some(number(state.voltage)),
            "CURR?" => return Some(number(state.current)),
            "VOLT:PROT?" => return Some(number(state.ovp)),
            "OUTP?" => return Some(flag(state.output)),
            "MEAS:VOLT?" => {
                let v = if state.output { state.voltage } else { 0.0 };
                return Some(number(v));
            }
            "MEAS:CURR?" => {
                let i = if state.output {
                    (state.voltage / load_ohms).min(state.current)
                } else {
                    0.0
                };
                return Some(number(i));
            }
            "MEAS:POW?" => {
                let p = if state.output {
                    state.voltage * (state.voltage / load_ohms).min(state.current)
                } else {
                    0.0
                };
                return Some(number(p));
            }
            "SAV" => {
                if let Ok(slot) = arg.parse::<u8>() {
                    let snapshot = (state.voltage, state.current, state.ovp);
                    state.saved.insert(slot, snapshot);
                }
            }
            "RCL" => {
                if let Some(&(v, i, ovp)) = arg.parse::<u8>().ok().and_then(|s| state.saved.get(&s)) {
                    state.voltage = v;
                    state.current = i;
                    state.ovp = ovp;
                }
            }
            _ => {}
        }
        None
    }

    fn handle_generator(&self, header: &str, arg: &str) -> Option<Vec<u8>> {
        let mut rf = lock(&self.rf);
        let value = arg.parse::<f64>().ok();
        match header {
            "SOUR:FREQ:CW" => rf.frequency_hz = value.unwrap_or(rf.frequency_hz),
            "SOUR:POW:LEV:IMM:AMPL" => rf.power_dbm = value.unwrap_or(rf.power_dbm),
            "OUTP" => rf.on = is_on(arg),
            "SOUR:FREQ:CW?" => return Some(number(rf.frequency_hz)),
            "SOUR:POW:LEV:IMM:AMPL?" => return Some(number(rf.power_dbm)),
            "OUTP:STAT?" => return Some(flag(rf.on)),
            _ => {}
        }
        None
    }

    fn handle_analyzer(&self, header: &str, arg: &str) -> Option<Vec<u8>> {
        let mut state = lock(&self.state);
        let value = arg.parse::<f64>().ok();
        match header {
            ":FREQ:CENT" => state.center_hz = value.unwrap_or(state.center_hz),
            ":FREQ:SPAN" => state.span_hz = value.unwrap_or(state.span_hz),
            ":BAND:RES" => state.rbw_hz = value.unwrap_or(state.rbw_hz),
            ":DISP:WIND:TRAC:Y:RLEV" => state.ref_level_dbm = value.unwrap_or(state.ref_level_dbm),
            ":FREQ:CENT?" => return Some(number(state.center_hz)),
            ":FREQ:SPAN?" => return Some(number(state.span_hz)),
            ":BAND:RES?" => return Some(number(state.rbw_hz)),
            ":DISP:WIND:TRAC:Y:RLEV?" => return Some(number(state.ref_level_dbm)),
            ":TRAC:TYPE" => state.trace_type = arg.to_ascii_uppercase(),
            ":TRAC:TYPE?" => return Some(state.trace_type.clone().into_bytes()),
            ":TRAC:MODE" | ":CALC:MARK:MAX" | ":DISP:CAPT" | ":DISP:CAPT:FORM" => {}
            ":FORM:DATA" => state.data_format = arg.to_ascii_uppercase().replace(' ', ""),
            ":CALC:MARK:X?" => {
                let (freq, _) = self.peak(&state);
                return Some(number(freq));
            }
            ":CALC:MARK:Y?" => {
                let stalled = self
                    .stalled_marker_reads
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if stalled {
                    return None;
                }
                let (_, level) = self.peak(&state);
                return Some(number(level));
            }
            ":TRAC:DATA?" => return Some(self.trace_block(&state)),
            ":DISP:CAPT:DATA?" => {
                if self.screen_capture.load(Ordering::SeqCst) {
                    return Some(block(FAKE_PNG));
                }
            }
            ":MMEM:STOR:SCR" => state.stored_screen = Some(arg.trim_matches('\'').to_string()),
            ":MMEM:DATA?" => {
                let name = arg.trim_matches('\'');
                if state.stored_screen.as_deref() == Some(name) {
                    return Some(block(FAKE_PNG));
                }
            }
            _ => {}
        }
        None
    }

    /// Peak the analyzer would find: (frequency, level)
    fn peak(&self, state: &SimState) -> (f64, f64) {
        let rf = *lock(&self.rf);
        let low = state.center_hz - state.span_hz / 2.0;
        let high = state.center_hz + state.span_hz / 2.0;
        if rf.on && rf.frequency_hz >= low && rf.frequency_hz <= high {
            // cable loss rises with distance from center
            let offset = (rf.frequency_hz - state.center_hz).abs() / state.span_hz.max(1.0);
            let level = rf.power_dbm - 3.0 - 6.0 * offset;
            (rf.frequency_hz, (level * 100.0).round() / 100.0)
        } else {
            (state.center_hz, NOISE_FLOOR_DBM)
        }
    }

    fn trace_block(&self, state: &SimState) -> Vec<u8> {
        let points = self.sweep_points.load(Ordering::SeqCst);
        let (peak_hz, peak_dbm) = self.peak(state);
        let start = state.center_hz - state.span_hz / 2.0;
        let step = if points > 1 {
            state.span_hz / (points - 1) as f64
        } else {
            0.0
        };
        let values: Vec<f64> = (0..points)
            .map(|i| {
                let f = start + step * i as f64;
                if (f - peak_hz).abs() <= state.rbw_hz {
                    peak_dbm
                } else {
                    NOISE_FLOOR_DBM + (i % 7) as f64 * 0.1
                }
            })
            .collect();

        let swapped = self.little_endian.load(Ordering::SeqCst);
        match state.data_format.as_str() {
            "REAL,32" => {
                let mut payload = Vec::with_capacity(points * 4);
                for v in values {
                    let b = if swapped {
                        (v as f32).to_le_bytes()
                    } else {
                        (v as f32).to_be_bytes()
                    };
                    payload.extend_from_slice(&b);
                }
                block(&payload)
            }
            "REAL,64" => {
                let mut payload = Vec::with_capacity(points * 8);
                for v in values {
                    let b = if swapped { v.to_le_bytes() } else { v.to_be_bytes() };
                    payload.extend_from_slice(&b);
                }
                block(&payload)
            }
            _ => values
                .iter()
                .map(|v| format!("{:E}", v))
                .collect::<Vec<_>>()
                .join(",")
                .into_bytes(),
        }
    }
}

fn is_on(arg: &str) -> bool {
    matches!(arg.trim().to_ascii_uppercase().as_str(), "ON" | "1")
}

fn number(value: f64) -> Vec<u8> {
    format!("{:E}", value).into_bytes()
}

fn flag(value: bool) -> Vec<u8> {
    if value { b"1".to_vec() } else { b"0".to_vec() }
}

/// Wrap `payload` in an IEEE 488.2 definite-length block.
fn block(payload: &[u8]) -> Vec<u8> {
    let len = payload.len().to_string();
    let mut out = format!("#{}{}", len.len(), len).into_bytes();
    out.extend_from_slice(payload);
    out.push(b'\n');
    out
}

// =============================================================================
// SimTransport - session-side view of a SimInstrument
// =============================================================================

struct SimTransport {
    resource: String,
    instrument: Arc<SimInstrument>,
    pending: VecDeque<Vec<u8>>,
}

impl SimTransport {
    fn check_link(&self) -> AppResult<()> {
        if self.instrument.is_disconnected() {
            return Err(DaqError::Connection(format!(
                "{}: link lost",
                self.resource
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ScpiTransport for SimTransport {
    fn resource(&self) -> &str {
        &self.resource
    }

    async fn write(&mut self, command: &str) -> AppResult<()> {
        self.check_link()?;

        let sim = &self.instrument;
        let now = sim.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        sim.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::task::yield_now().await;

        lock(&sim.commands).push(command.to_string());
        if let Some(reply) = sim.handle(command) {
            self.pending.push_back(reply);
        }

        sim.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_raw(&mut self) -> AppResult<Vec<u8>> {
        self.check_link()?;
        match self.pending.pop_front() {
            Some(reply) => Ok(reply),
            // an unanswered query never completes; the session timeout fires
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) -> AppResult<()> {
        self.pending.clear();
        Ok(())
    }
}

// =============================================================================
// SimBench - simulated resource manager
// =============================================================================

/// A set of simulated instruments reachable through [`ResourceManager`]
///
/// Clones share the same instruments, so a test can keep one handle for fault
/// injection while the registry owns another.
#[derive(Clone)]
pub struct SimBench {
    instruments: Arc<Mutex<BTreeMap<String, Arc<SimInstrument>>>>,
    rf: Arc<Mutex<RfPath>>,
}

impl SimBench {
    /// Empty bench
    pub fn new() -> Self {
        Self {
            instruments: Arc::new(Mutex::new(BTreeMap::new())),
            rf: Arc::new(Mutex::new(RfPath {
                frequency_hz: 1.0e9,
                power_dbm: -30.0,
                on: false,
            })),
        }
    }

    /// Two supplies, one generator and one analyzer with stock identities
    pub fn standard() -> Self {
        let bench = Self::new();
        bench.add(SIM_PSU, SimInstrumentKind::PowerSupply);
        bench.add(SIM_PSU2, SimInstrumentKind::PowerSupply);
        bench.add(SIM_GENERATOR, SimInstrumentKind::Generator);
        bench.add(SIM_ANALYZER, SimInstrumentKind::Analyzer);
        bench
    }

    /// Add an instrument with the stock identity for its kind
    pub fn add(&self, resource: &str, kind: SimInstrumentKind) -> Arc<SimInstrument> {
        self.add_with_idn(resource, kind, kind.default_idn())
    }

    /// Add an instrument answering `*IDN?` with `idn`
    pub fn add_with_idn(
        &self,
        resource: &str,
        kind: SimInstrumentKind,
        idn: &str,
    ) -> Arc<SimInstrument> {
        let sim = Arc::new(SimInstrument::new(kind, idn.to_string(), self.rf.clone()));
        lock(&self.instruments).insert(resource.to_string(), sim.clone());
        sim
    }

    /// Look up a simulated instrument by resource string
    pub fn instrument(&self, resource: &str) -> Option<Arc<SimInstrument>> {
        lock(&self.instruments).get(resource).cloned()
    }
}

impl Default for SimBench {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceManager for SimBench {
    async fn list_resources(&self) -> AppResult<Vec<String>> {
        Ok(lock(&self.instruments).keys().cloned().collect())
    }

    async fn open(&self, resource: &str) -> AppResult<Box<dyn ScpiTransport>> {
        let instrument = self
            .instrument(resource)
            .ok_or_else(|| DaqError::Connection(format!("{}: no such resource", resource)))?;
        if instrument.is_disconnected() {
            return Err(DaqError::Connection(format!("{}: not responding", resource)));
        }
        Ok(Box::new(SimTransport {
            resource: resource.to_string(),
            instrument,
            pending: VecDeque::new(),
        }))
    }
}

// =============================================================================
// SimBoard - simulated board under test
// =============================================================================

/// Board link that echoes every frame straight back
///
/// Used by `--simulate` runs in place of the UDP link.
#[derive(Clone, Default)]
pub struct SimBoard {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
    silent: Arc<AtomicBool>,
}

impl SimBoard {
    /// Board that echoes
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop (or resume) echoing frames
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// Every frame received so far
    pub fn frames(&self) -> Vec<Vec<u8>> {
        lock(&self.frames).clone()
    }
}

#[async_trait]
impl BoardLink for SimBoard {
    async fn send_frame(&self, frame: &[u8]) -> AppResult<LinkReport> {
        let frame = check_udp_frame(frame)?;
        lock(&self.frames).push(frame.to_vec());
        let hex = to_hex(frame);
        Ok(LinkReport {
            sent_bytes: frame.len(),
            received_hex: (!self.silent.load(Ordering::SeqCst)).then(|| hex.clone()),
            sent_hex: hex,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_board_echo_and_silence() {
        let board = SimBoard::new();
        let frame = crate::protocol::build_udp_frame("0A", "01 02", "01 02 03 04").expect("frame");
        assert!(board.send_frame(&frame).await.expect("send").confirmed());

        board.set_silent(true);
        assert!(!board.send_frame(&frame).await.expect("send").confirmed());
        assert_eq!(board.frames().len(), 2);
        assert!(board.send_frame(&frame[..9]).await.is_err());
    }

    async fn exchange(t: &mut Box<dyn ScpiTransport>, cmd: &str) -> String {
        t.write(cmd).await.expect("write");
        String::from_utf8(t.read_raw().await.expect("read")).expect("utf8")
    }

    #[tokio::test]
    async fn test_supply_state() {
        let bench = SimBench::standard();
        let mut t = bench.open(SIM_PSU).await.expect("open");
        t.write("VOLT 12.5").await.expect("volt");
        t.write("CURR 2").await.expect("curr");
        assert_eq!(exchange(&mut t, "MEAS:VOLT?").await.parse::<f64>().ok(), Some(0.0));

        t.write("OUTP ON").await.expect("on");
        assert_eq!(exchange(&mut t, "MEAS:VOLT?").await.parse::<f64>().ok(), Some(12.5));
        let amps: f64 = exchange(&mut t, "MEAS:CURR?").await.parse().expect("float");
        assert!((amps - 1.25).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_analyzer_follows_generator() {
        let bench = SimBench::standard();
        let mut gen = bench.open(SIM_GENERATOR).await.expect("gen");
        let mut sa = bench.open(SIM_ANALYZER).await.expect("sa");

        sa.write(":FREQ:CENT 3.1e9").await.expect("center");
        sa.write(":FREQ:SPAN 600e6").await.expect("span");
        gen.write("SOUR:FREQ:CW 3.0e9").await.expect("freq");
        gen.write("SOUR:POW:LEV:IMM:AMPL -10").await.expect("pow");
        gen.write("OUTP ON").await.expect("on");

        let x: f64 = exchange(&mut sa, ":CALC:MARK:X?").await.parse().expect("x");
        let y: f64 = exchange(&mut sa, ":CALC:MARK:Y?").await.parse().expect("y");
        assert_eq!(x, 3.0e9);
        assert!(y < -10.0 && y > -20.0);
    }

    #[tokio::test]
    async fn test_disconnect_refuses_open() {
        let bench = SimBench::standard();
        bench.instrument(SIM_PSU).expect("sim").disconnect();
        assert!(bench.open(SIM_PSU).await.is_err());
    }

    #[test]
    fn test_block_header() {
        let b = block(&[1, 2, 3]);
        assert_eq!(&b[..3], b"#13");
        assert_eq!(&b[3..6], &[1, 2, 3]);
    }
}
