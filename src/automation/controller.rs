//! Automation controller.
//!
//! Drives one measurement run at a time through `Idle -> Running -> {Completed, Error}`.
//! The run itself executes on a spawned task; the controller keeps the shared
//! [`RunState`] and publishes every transition on the [`EventBus`].
//!
//! Per spot the sequence is:
//!
//! 1. tune the generator to `base + spot * step` (skipped if no generator is attached)
//! 2. clear the analyzer trace and wait the settle delay
//! 3. send the board frame for this spot
//! 4. switch to max-hold and wait the hold delay
//! 5. read the peak marker, retrying a bounded number of times
//!
//! A lost instrument link aborts the run. Every other per-spot failure is recorded
//! as a fault with a NaN reading and the run carries on.
//!
//! A run started before a `reset()` is identified by its generation number. Once
//! the generation moves on, the stale task may finish its in-flight instrument
//! call but issues nothing further: no instrument commands, board frames, state
//! changes or events.

use super::request::{RunRequest, ValidatedRun};
use super::state::{RunState, RunStatus, SpotFault};
use crate::config::{AnalyzerConfig, AutomationConfig};
use crate::data::{MeasurementRecord, ReportStore};
use crate::error::{AppResult, DaqError};
use crate::events::{AutomationEvent, EventBus, Subscription};
use crate::hardware::SessionRegistry;
use crate::instrument::{Analyzer, Generator, InstrumentKind, Marker};
use crate::protocol::BoardLink;
use chrono::Local;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

struct Inner {
    registry: Arc<SessionRegistry>,
    link: Arc<dyn BoardLink>,
    bus: EventBus,
    store: ReportStore,
    analyzer: AnalyzerConfig,
    automation: AutomationConfig,
    state: Mutex<RunState>,
    generation: AtomicU64,
}

/// Process-wide run coordinator
#[derive(Clone)]
pub struct AutomationController {
    inner: Arc<Inner>,
}

/// Instruments and identifiers of the run being executed
struct RunContext {
    run_id: Uuid,
    generation: u64,
    run: ValidatedRun,
    analyzer: Analyzer,
    generator: Option<Generator>,
}

impl AutomationController {
    /// Controller over the given instruments, board link and report store
    pub fn new(
        registry: Arc<SessionRegistry>,
        link: Arc<dyn BoardLink>,
        bus: EventBus,
        store: ReportStore,
        analyzer: AnalyzerConfig,
        automation: AutomationConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                link,
                bus,
                store,
                analyzer,
                automation,
                state: Mutex::new(RunState::idle()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Event bus runs publish to
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Subscribe to run events, starting with the retained recent ones
    pub fn subscribe(&self) -> Subscription {
        self.inner.bus.subscribe_with_replay()
    }

    /// Copy of the current run state
    pub fn snapshot(&self) -> RunState {
        self.inner.state().clone()
    }

    /// Current lifecycle position
    pub fn status(&self) -> RunStatus {
        self.inner.state().status
    }

    /// Validate `request` and start it in the background
    ///
    /// A previous Completed or Error run is reset to Idle automatically.
    ///
    /// # Errors
    /// - [`DaqError::Busy`] if a run is in progress; its state is left untouched
    /// - [`DaqError::InvalidRequest`] / [`DaqError::MalformedField`] for a bad request
    /// - [`DaqError::Connection`] if no analyzer is attached
    pub async fn start(&self, request: RunRequest) -> AppResult<Uuid> {
        self.ensure_not_running()?;
        let run = request.validate()?;

        let analyzer = Analyzer::new(
            self.inner.registry.session(InstrumentKind::Analyzer).await?,
            &self.inner.analyzer,
        );
        let generator = match self.inner.registry.session(InstrumentKind::Generator).await {
            Ok(session) => Some(Generator::new(session)),
            Err(e) => {
                warn!("Running without a signal generator: {}", e);
                None
            }
        };

        let run_id = Uuid::new_v4();
        let total = run.spots.len();
        let generation = {
            let mut state = self.inner.state();
            // re-checked under the lock; two starts can race past the first check
            if state.status == RunStatus::Running {
                return Err(DaqError::Busy("a run is already in progress".to_string()));
            }
            let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *state = RunState {
                run_id: Some(run_id),
                status: RunStatus::Running,
                total,
                board_no: run.board_no,
                channel_no: run.channel_no,
                message: format!("Run started with {} spots", total),
                started_at: Some(Local::now()),
                ..RunState::idle()
            };
            self.inner.bus.publish(AutomationEvent::AutomationStart {
                board_no: run.board_no,
                channel_no: run.channel_no,
                total,
                message: state.message.clone(),
            });
            generation
        };

        info!(
            run_id = %run_id,
            board_no = run.board_no,
            channel_no = run.channel_no,
            spots = total,
            "Automation run started"
        );

        let ctx = RunContext {
            run_id,
            generation,
            run,
            analyzer,
            generator,
        };

        let worker = tokio::spawn(execute(self.inner.clone(), ctx));
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(e) = worker.await {
                inner.fail(generation, format!("Automation task stopped unexpectedly: {}", e));
            }
        });

        Ok(run_id)
    }

    /// Start `request` and wait for its terminal state
    pub async fn run_to_completion(&self, request: RunRequest) -> AppResult<RunState> {
        let mut events = self.inner.bus.subscribe();
        let run_id = self.start(request).await?;

        loop {
            match events.recv().await {
                Some(envelope) if envelope.event.is_terminal() => break,
                Some(_) => continue,
                None => {
                    // fell behind the bus; fall back to watching the state
                    while self.snapshot().run_id == Some(run_id) && self.status() == RunStatus::Running {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    break;
                }
            }
        }
        Ok(self.snapshot())
    }

    /// Force the controller back to a startable state
    ///
    /// A Running run is moved to Error and an `automation_error` is published;
    /// the in-flight instrument call is allowed to finish but its result is
    /// discarded. Any other state returns to Idle.
    pub fn reset(&self) -> RunStatus {
        let mut state = self.inner.state();
        if state.status == RunStatus::Running {
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            state.status = RunStatus::Error;
            state.message = "Run aborted by reset".to_string();
            state.finished_at = Some(Local::now());
            self.inner.bus.publish(AutomationEvent::AutomationError {
                message: state.message.clone(),
            });
            warn!(run_id = ?state.run_id, "Running automation reset");
        } else {
            *state = RunState::idle();
            debug!("Automation state reset to idle");
        }
        state.status
    }

    fn ensure_not_running(&self) -> AppResult<()> {
        if self.status() == RunStatus::Running {
            return Err(DaqError::Busy("a run is already in progress".to_string()));
        }
        Ok(())
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lock the state if `generation` is still the live, running one
    fn live_state(&self, generation: u64) -> Option<MutexGuard<'_, RunState>> {
        let state = self.state();
        if self.generation.load(Ordering::SeqCst) == generation && state.status == RunStatus::Running {
            Some(state)
        } else {
            None
        }
    }

    fn is_live(&self, generation: u64) -> bool {
        self.live_state(generation).is_some()
    }

    fn fail(&self, generation: u64, message: String) {
        if let Some(mut state) = self.live_state(generation) {
            error!(run_id = ?state.run_id, "{}", message);
            state.status = RunStatus::Error;
            state.message = message.clone();
            state.finished_at = Some(Local::now());
            self.bus.publish(AutomationEvent::AutomationError { message });
        }
    }

    fn record_spot(
        &self,
        generation: u64,
        record: MeasurementRecord,
        faults: Vec<String>,
        marker: Option<Marker>,
    ) -> bool {
        let Some(mut state) = self.live_state(generation) else {
            return false;
        };

        let spot = record.spot;
        state.records.push(record);
        state.current = state.records.len();
        for message in faults {
            state.faults.push(SpotFault { spot, message });
        }

        state.message = match marker {
            Some(m) => format!(
                "Spot 0x{:02X}: {:.2} dBm at {:.3} MHz",
                spot,
                m.power_dbm,
                m.freq_hz / 1e6
            ),
            None => format!("Spot 0x{:02X}: no reading", spot),
        };

        self.bus.publish(AutomationEvent::AutomationProgress {
            current: state.current,
            total: state.total,
            board_no: state.board_no,
            channel_no: state.channel_no,
            spot: format!("0x{:02X}", spot),
            freq: marker.map(|m| m.freq_hz),
            message: state.message.clone(),
        });
        true
    }
}

/// Split a step result into abort / fault / value
///
/// A disconnect is returned as `Err` and aborts the run; any other failure is
/// pushed onto `faults` and yields `Ok(None)`.
fn classify<T>(result: AppResult<T>, step: &str, faults: &mut Vec<String>) -> AppResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_disconnect() => Err(e),
        Err(e) => {
            warn!(step, "Spot step failed: {}", e);
            faults.push(format!("{}: {}", step, e));
            Ok(None)
        }
    }
}

async fn execute(inner: Arc<Inner>, ctx: RunContext) {
    let generation = ctx.generation;
    match measure(&inner, &ctx).await {
        Ok(true) => complete(&inner, &ctx).await,
        Ok(false) => debug!(run_id = %ctx.run_id, "Run superseded, worker exiting"),
        Err(e) => inner.fail(generation, format!("Automation aborted: {}", e)),
    }
}

/// Return `Ok(false)` from the enclosing fn once the run is no longer live
macro_rules! ensure_live {
    ($inner:ident, $ctx:ident) => {
        if !$inner.is_live($ctx.generation) {
            debug!(run_id = %$ctx.run_id, "Run superseded mid-spot");
            return Ok(false);
        }
    };
}

/// Walk every spot; `Ok(false)` if the run was reset underneath us
///
/// Liveness is re-checked after every awaited step, so once a reset lands the
/// worker sends no further instrument commands or board frames.
async fn measure(inner: &Inner, ctx: &RunContext) -> AppResult<bool> {
    let cfg = &inner.automation;

    ctx.analyzer
        .set(inner.analyzer.center_hz, inner.analyzer.span_hz, inner.analyzer.rbw_hz)
        .await?;
    ensure_live!(inner, ctx);
    if let Some(generator) = &ctx.generator {
        generator.rf(true).await?;
    }

    for &spot in &ctx.run.spots {
        ensure_live!(inner, ctx);

        let mut faults = Vec::new();

        if let Some(generator) = &ctx.generator {
            let freq = cfg.generator_base_hz + f64::from(spot) * cfg.generator_step_hz;
            classify(
                generator.set(freq, cfg.generator_power_dbm).await,
                "generator",
                &mut faults,
            )?;
            ensure_live!(inner, ctx);
        }

        classify(ctx.analyzer.trace_clear().await, "trace clear", &mut faults)?;
        ensure_live!(inner, ctx);
        tokio::time::sleep(cfg.settle_delay).await;
        ensure_live!(inner, ctx);

        // board link failures never abort; the next spot may get through
        let frame = ctx.run.frame_fields(spot).build();
        match inner.link.send_frame(&frame).await {
            Ok(report) if report.confirmed() => debug!(spot, "Board frame confirmed"),
            Ok(_) => debug!(spot, "Board frame unconfirmed"),
            Err(e) => {
                warn!(spot, "Board frame not sent: {}", e);
                faults.push(format!("board link: {}", e));
            }
        }
        ensure_live!(inner, ctx);

        classify(ctx.analyzer.trace_max().await, "max hold", &mut faults)?;
        ensure_live!(inner, ctx);
        tokio::time::sleep(cfg.hold_delay).await;
        ensure_live!(inner, ctx);

        let marker = read_marker(inner, ctx, spot, &mut faults).await?;
        ensure_live!(inner, ctx);

        let record = MeasurementRecord {
            board_no: ctx.run.board_no,
            channel_no: ctx.run.channel_no,
            spot,
            freq_hz: marker.map_or(f64::NAN, |m| m.freq_hz),
            power_dbm: marker.map_or(f64::NAN, |m| m.power_dbm),
            timestamp: Local::now(),
        };
        if !inner.record_spot(ctx.generation, record, faults, marker) {
            return Ok(false);
        }
    }

    if let Some(generator) = &ctx.generator {
        if let Err(e) = generator.rf(false).await {
            warn!("Could not switch generator RF off: {}", e);
        }
    }
    Ok(true)
}

/// Peak marker with up to `marker_attempts` reads
///
/// Stops early, without recording a fault, if the run stops being live.
async fn read_marker(
    inner: &Inner,
    ctx: &RunContext,
    spot: u8,
    faults: &mut Vec<String>,
) -> AppResult<Option<Marker>> {
    let cfg = &inner.automation;
    let attempts = cfg.marker_attempts.max(1);
    let mut last = None;
    for attempt in 1..=attempts {
        if !inner.is_live(ctx.generation) {
            return Ok(None);
        }
        match ctx.analyzer.marker(cfg.marker_timeout).await {
            Ok(marker) => return Ok(Some(marker)),
            Err(e) if e.is_disconnect() => return Err(e),
            Err(e) => {
                warn!(spot, attempt, attempts, "Marker read failed: {}", e);
                last = Some(e);
            }
        }
    }
    if let Some(e) = last {
        faults.push(format!("marker: {} after {} attempts", e, attempts));
    }
    Ok(None)
}

async fn complete(inner: &Inner, ctx: &RunContext) {
    let records = match inner.live_state(ctx.generation) {
        Some(state) => state.records.clone(),
        None => return,
    };
    let total = records.len();
    let successful = records.iter().filter(|r| r.is_valid()).count();

    let store = inner.store.clone();
    let run_id = ctx.run_id;
    let written = tokio::task::spawn_blocking(move || store.append(run_id, &records))
        .await
        .map_err(|e| DaqError::Write(format!("report task failed: {}", e)))
        .and_then(|result| result);

    let Some(mut state) = inner.live_state(ctx.generation) else {
        return;
    };
    state.finished_at = Some(Local::now());
    match written {
        Ok(report_ref) => {
            state.status = RunStatus::Completed;
            state.message = format!("{}/{} measurements successful", successful, total);
            state.report = Some(report_ref.clone());
            info!(run_id = %ctx.run_id, path = %report_ref.path.display(), "{}", state.message);
            inner.bus.publish(AutomationEvent::AutomationComplete {
                report_ref,
                message: state.message.clone(),
            });
        }
        Err(e) => {
            // records stay in the run state for a later retry or inspection
            state.status = RunStatus::Error;
            state.message = format!("Report not written: {}", e);
            error!(run_id = %ctx.run_id, "{}", state.message);
            inner.bus.publish(AutomationEvent::AutomationError {
                message: state.message.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstrumentConfig;
    use crate::hardware::mock::{SimBench, SIM_ANALYZER};
    use crate::hardware::AttachTarget;
    use crate::protocol::LinkReport;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    /// Board link that echoes every frame, or fails every send
    struct FakeLink {
        sent: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl BoardLink for FakeLink {
        async fn send_frame(&self, frame: &[u8]) -> AppResult<LinkReport> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DaqError::Connection("no route to board".to_string()));
            }
            let hex = crate::protocol::to_hex(frame);
            Ok(LinkReport {
                sent_bytes: frame.len(),
                sent_hex: hex.clone(),
                received_hex: Some(hex),
            })
        }
    }

    fn fast_config() -> AutomationConfig {
        AutomationConfig {
            settle_delay: Duration::from_millis(1),
            hold_delay: Duration::from_millis(1),
            marker_attempts: 2,
            marker_timeout: Duration::from_millis(50),
            ..AutomationConfig::default()
        }
    }

    async fn setup(
        bench: &SimBench,
        automation: AutomationConfig,
        fail_link: bool,
    ) -> (AutomationController, Arc<FakeLink>, TempDir) {
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(bench.clone()),
            InstrumentConfig::default(),
        ));
        for kind in [InstrumentKind::Generator, InstrumentKind::Analyzer] {
            registry.attach(kind, AttachTarget::Auto).await.expect("attach");
        }
        let link = Arc::new(FakeLink {
            sent: AtomicUsize::new(0),
            fail: fail_link,
        });
        let dir = TempDir::new().expect("tempdir");
        let controller = AutomationController::new(
            registry,
            link.clone(),
            EventBus::new(),
            ReportStore::new(dir.path()),
            AnalyzerConfig::default(),
            automation,
        );
        (controller, link, dir)
    }

    fn request(spots: &[&str]) -> RunRequest {
        RunRequest {
            board_no: 1,
            channel_no: 1,
            pulse_width: "01 02".to_string(),
            prt: "01 02 03 04".to_string(),
            spots: spots.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_completed_run_has_one_record_per_spot_in_order() {
        let bench = SimBench::standard();
        let (controller, link, _dir) = setup(&bench, fast_config(), false).await;
        let mut events = controller.subscribe();

        let state = controller
            .run_to_completion(request(&["00", "0A", "14"]))
            .await
            .expect("run");

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(
            state.records.iter().map(|r| r.spot).collect::<Vec<_>>(),
            vec![0x00, 0x0A, 0x14]
        );
        assert!(state.records.iter().all(|r| r.is_valid()));
        assert!(state.faults.is_empty());
        assert_eq!(state.message, "3/3 measurements successful");
        assert_eq!(link.sent.load(Ordering::SeqCst), 3);

        let mut kinds = Vec::new();
        while let Some(envelope) = events.recv().await {
            let terminal = envelope.event.is_terminal();
            kinds.push(serde_json::to_value(&envelope).expect("json")["type"].clone());
            if terminal {
                break;
            }
        }
        assert_eq!(
            kinds,
            vec![
                "automation_start",
                "automation_progress",
                "automation_progress",
                "automation_progress",
                "automation_complete"
            ]
        );
    }

    #[tokio::test]
    async fn test_second_start_is_busy_and_leaves_run_alone() {
        let bench = SimBench::standard();
        let automation = AutomationConfig {
            settle_delay: Duration::from_millis(200),
            ..fast_config()
        };
        let (controller, _link, _dir) = setup(&bench, automation, false).await;

        let first = controller.start(request(&["00", "05"])).await.expect("start");
        let before = controller.snapshot();

        let err = controller.start(request(&["0A"])).await.unwrap_err();
        assert!(matches!(err, DaqError::Busy(_)));

        let after = controller.snapshot();
        assert_eq!(after.run_id, Some(first));
        assert_eq!(after.total, before.total);
        assert_eq!(after.status, RunStatus::Running);
        controller.reset();
    }

    #[tokio::test]
    async fn test_invalid_request_leaves_idle() {
        let bench = SimBench::standard();
        let (controller, _link, _dir) = setup(&bench, fast_config(), false).await;

        let err = controller.start(request(&[])).await.unwrap_err();
        assert!(matches!(err, DaqError::InvalidRequest(_)));
        assert_eq!(controller.status(), RunStatus::Idle);
    }

    #[tokio::test]
    async fn test_marker_timeout_records_missing_value_and_completes() {
        let bench = SimBench::standard();
        let (controller, _link, _dir) = setup(&bench, fast_config(), false).await;
        bench
            .instrument(SIM_ANALYZER)
            .expect("analyzer")
            .stall_marker_reads(2);

        let state = controller
            .run_to_completion(request(&["0A", "0F"]))
            .await
            .expect("run");

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.records.len(), 2);
        assert!(state.records[0].power_dbm.is_nan());
        assert!(state.records[1].is_valid());
        assert_eq!(state.faults.len(), 1);
        assert_eq!(state.faults[0].spot, 0x0A);
        assert_eq!(state.message, "1/2 measurements successful");
        assert_eq!(state.report.expect("report").records, 2);
    }

    #[tokio::test]
    async fn test_board_link_failure_is_a_spot_fault() {
        let bench = SimBench::standard();
        let (controller, link, _dir) = setup(&bench, fast_config(), true).await;

        let state = controller
            .run_to_completion(request(&["00", "05"]))
            .await
            .expect("run");

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(link.sent.load(Ordering::SeqCst), 2);
        assert_eq!(state.faults.len(), 2);
        assert!(state.faults[0].message.starts_with("board link"));
    }

    #[tokio::test]
    async fn test_analyzer_disconnect_aborts() {
        let bench = SimBench::standard();
        let (controller, _link, _dir) = setup(&bench, fast_config(), false).await;
        bench.instrument(SIM_ANALYZER).expect("analyzer").disconnect();

        let state = controller
            .run_to_completion(request(&["00", "05"]))
            .await
            .expect("run");

        assert_eq!(state.status, RunStatus::Error);
        assert!(state.message.starts_with("Automation aborted"));
        assert!(state.records.is_empty());
    }

    #[tokio::test]
    async fn test_report_failure_keeps_records() {
        let bench = SimBench::standard();
        let (controller, _link, dir) = setup(&bench, fast_config(), false).await;
        let date = Local::now().date_naive();
        let store = ReportStore::new(dir.path());
        std::fs::write(
            format!("{}.lock", store.path_for(date).display()),
            b"held",
        )
        .expect("lock");

        let state = controller
            .run_to_completion(request(&["00"]))
            .await
            .expect("run");

        assert_eq!(state.status, RunStatus::Error);
        assert!(state.message.starts_with("Report not written"));
        assert_eq!(state.records.len(), 1);
    }

    #[tokio::test]
    async fn test_reset_stops_instrument_and_board_traffic() {
        let bench = SimBench::standard();
        let automation = AutomationConfig {
            settle_delay: Duration::from_millis(200),
            ..fast_config()
        };
        let (controller, link, _dir) = setup(&bench, automation, false).await;
        let analyzer = bench.instrument(SIM_ANALYZER).expect("analyzer");

        controller.start(request(&["00"])).await.expect("start");
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.reset();
        // the trace clear before the settle delay may still be in flight
        tokio::time::sleep(Duration::from_millis(20)).await;
        let commands_at_reset = analyzer.commands().len();

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(link.sent.load(Ordering::SeqCst), 0);
        assert_eq!(analyzer.commands().len(), commands_at_reset);
        assert!(controller.snapshot().records.is_empty());
    }

    #[tokio::test]
    async fn test_marker_attempts_counts_first_read() {
        let bench = SimBench::standard();
        let (controller, _link, _dir) = setup(&bench, fast_config(), false).await;
        let analyzer = bench.instrument(SIM_ANALYZER).expect("analyzer");
        analyzer.stall_marker_reads(2);

        let state = controller
            .run_to_completion(request(&["0A"]))
            .await
            .expect("run");

        // two attempts, both stalled
        assert!(state.records[0].power_dbm.is_nan());
        assert!(state.faults[0].message.ends_with("after 2 attempts"));
    }

    #[tokio::test]
    async fn test_reset_while_running_forces_error() {
        let bench = SimBench::standard();
        let automation = AutomationConfig {
            settle_delay: Duration::from_millis(100),
            ..fast_config()
        };
        let (controller, _link, _dir) = setup(&bench, automation, false).await;
        let mut events = controller.bus().subscribe();

        controller.start(request(&["00", "05", "0A"])).await.expect("start");
        assert_eq!(controller.reset(), RunStatus::Error);

        // start, then the reset error; the stale worker publishes nothing more
        assert!(events.recv().await.is_some());
        let terminal = events.recv().await.expect("terminal");
        assert!(matches!(terminal.event, AutomationEvent::AutomationError { .. }));
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(controller.bus().last().expect("last").event.is_terminal());
        assert!(controller.snapshot().records.is_empty());

        // a new run may start straight away
        controller.start(request(&["00"])).await.expect("restart");
        controller.reset();
        assert_eq!(controller.reset(), RunStatus::Idle);
    }
}
