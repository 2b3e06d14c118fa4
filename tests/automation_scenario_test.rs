//! End-to-end automation runs against the simulated bench and a real UDP echo.

use rf_daq::app::DaqContext;
use rf_daq::automation::{RunRequest, RunStatus};
use rf_daq::config::Settings;
use rf_daq::error::DaqError;
use rf_daq::events::AutomationEvent;
use rf_daq::hardware::mock::{SimBench, SimInstrumentKind, SIM_ANALYZER};
use rf_daq::protocol::packet::SPOT_OFFSET;
use rf_daq::protocol::UdpLink;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::UdpSocket;

/// Loopback board: echoes every datagram and remembers what it saw
async fn spawn_echo() -> (SocketAddr, Arc<Mutex<Vec<Vec<u8>>>>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            log.lock().unwrap().push(buf[..n].to_vec());
            let _ = socket.send_to(&buf[..n], peer).await;
        }
    });
    (addr, seen)
}

fn fast_settings(dir: &TempDir) -> Settings {
    let mut settings = Settings::default();
    settings.report.directory = dir.path().join("reports");
    settings.automation.settle_delay = Duration::from_millis(5);
    settings.automation.hold_delay = Duration::from_millis(5);
    settings.automation.marker_timeout = Duration::from_millis(100);
    settings
}

async fn context_with_echo(dir: &TempDir, bench: SimBench) -> (DaqContext, Arc<Mutex<Vec<Vec<u8>>>>) {
    let (board, seen) = spawn_echo().await;
    let link = UdpLink::new(
        "127.0.0.1:0".parse().unwrap(),
        board,
        Duration::from_millis(300),
    );
    let ctx = DaqContext::new(fast_settings(dir), Arc::new(bench), Arc::new(link));
    ctx.attach("gen", "auto").await.unwrap();
    ctx.attach("sa", "auto").await.unwrap();
    (ctx, seen)
}

fn scenario_request() -> RunRequest {
    RunRequest {
        board_no: 1,
        channel_no: 1,
        pulse_width: "01 02".to_string(),
        prt: "01 02 03 04".to_string(),
        spots: vec!["0A".to_string()],
    }
}

#[tokio::test]
async fn test_single_spot_run_produces_record_and_report() {
    let dir = TempDir::new().unwrap();
    let (ctx, seen) = context_with_echo(&dir, SimBench::standard()).await;
    let mut events = ctx.subscribe();

    ctx.run(scenario_request()).await.unwrap();

    let mut progress = 0;
    let report_ref = loop {
        let envelope = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .unwrap()
            .unwrap();
        match envelope.event {
            AutomationEvent::AutomationProgress { spot, freq, .. } => {
                progress += 1;
                assert_eq!(spot, "0x0A");
                assert!(freq.is_some());
            }
            AutomationEvent::AutomationComplete { report_ref, .. } => break report_ref,
            AutomationEvent::AutomationError { message } => panic!("run failed: {}", message),
            AutomationEvent::AutomationStart { total, .. } => assert_eq!(total, 1),
        }
    };
    assert_eq!(progress, 1);

    let state = ctx.controller().snapshot();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.records.len(), 1);
    assert!(state.records[0].is_valid());

    // the board saw the spot at its fixed offset
    let frames = seen.lock().unwrap().clone();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].len(), 40);
    assert_eq!(frames[0][SPOT_OFFSET], 0x0A);

    assert_eq!(report_ref.records, 1);
    assert_eq!(report_ref.chart.len(), 1);
    assert_eq!(report_ref.chart[0].spot, 0x0A);
    assert_eq!(report_ref.chart[0].power_dbm, state.records[0].power_dbm);
    assert!(report_ref.path.exists());
    assert_eq!(ctx.report_latest().unwrap(), report_ref.path);

    let text = std::fs::read_to_string(&report_ref.path).unwrap();
    assert!(text.lines().any(|l| l.starts_with("record,") && l.contains(",0A,")));
    assert!(text.lines().any(|l| l.starts_with("summary,") && l.contains("range_db")));
    assert!(text.lines().any(|l| l.starts_with("chart,") && l.contains(",0A,")));
}

#[tokio::test]
async fn test_marker_timeout_still_completes_with_missing_value() {
    let dir = TempDir::new().unwrap();
    let bench = SimBench::standard();
    bench.instrument(SIM_ANALYZER).unwrap().stall_marker_reads(3);
    let (ctx, _seen) = context_with_echo(&dir, bench).await;

    let state = ctx
        .controller()
        .run_to_completion(scenario_request())
        .await
        .unwrap();

    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.records.len(), 1);
    assert!(state.records[0].power_dbm.is_nan());
    assert_eq!(state.faults.len(), 1);
    assert_eq!(state.message, "0/1 measurements successful");
    assert!(state.report.unwrap().summary.is_none());
}

#[tokio::test]
async fn test_second_run_while_running_is_busy() {
    let dir = TempDir::new().unwrap();
    let (ctx, _seen) = context_with_echo(&dir, SimBench::standard()).await;

    let mut request = scenario_request();
    request.spots = vec!["00".into(), "05".into(), "0A".into(), "0F".into()];
    let first = ctx.run(request).await.unwrap();

    let err = ctx.run(scenario_request()).await.unwrap_err();
    assert!(matches!(err, DaqError::Busy(_)));
    let state = ctx.controller().snapshot();
    assert_eq!(state.run_id, Some(first));
    assert_eq!(state.total, 4);

    ctx.reset();
    assert_eq!(ctx.controller().status(), RunStatus::Error);
}

#[tokio::test]
async fn test_late_subscriber_still_sees_terminal_event() {
    let dir = TempDir::new().unwrap();
    let (ctx, _seen) = context_with_echo(&dir, SimBench::standard()).await;
    ctx.controller()
        .run_to_completion(scenario_request())
        .await
        .unwrap();

    let mut late = ctx.subscribe();
    let mut last = None;
    while let Ok(Some(envelope)) =
        tokio::time::timeout(Duration::from_millis(100), late.recv()).await
    {
        last = Some(envelope);
    }
    assert!(matches!(
        last.unwrap().event,
        AutomationEvent::AutomationComplete { .. }
    ));
}

#[tokio::test]
async fn test_auto_attach_without_match_leaves_run_state_alone() {
    let dir = TempDir::new().unwrap();
    let bench = SimBench::new();
    bench.add(SIM_ANALYZER, SimInstrumentKind::Analyzer);
    let ctx = DaqContext::new(
        fast_settings(&dir),
        Arc::new(bench),
        Arc::new(rf_daq::hardware::mock::SimBoard::new()),
    );

    let err = ctx.attach("psu", "auto").await.unwrap_err();
    assert!(matches!(err, DaqError::NotFound(_)));

    let state = ctx.controller().snapshot();
    assert_eq!(state.status, RunStatus::Idle);
    assert!(state.run_id.is_none());
    assert!(ctx.registry().identities().await.is_empty());
}

#[tokio::test]
async fn test_run_without_analyzer_is_rejected() {
    let dir = TempDir::new().unwrap();
    let ctx = DaqContext::simulated(fast_settings(&dir));

    let err = ctx.run(scenario_request()).await.unwrap_err();
    assert!(matches!(err, DaqError::Connection(_)));
    assert_eq!(ctx.controller().status(), RunStatus::Idle);
}

#[tokio::test]
async fn test_simulated_default_sweep() {
    let dir = TempDir::new().unwrap();
    let ctx = DaqContext::simulated(fast_settings(&dir));
    ctx.attach("gen", "auto").await.unwrap();
    ctx.attach("sa", "auto").await.unwrap();

    let request = ctx.default_request(3, 2, "00 01", "0A AB 00 00");
    let state = ctx.controller().run_to_completion(request).await.unwrap();

    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.records.len(), 17);
    let spots: Vec<u8> = state.records.iter().map(|r| r.spot).collect();
    let mut sorted = spots.clone();
    sorted.sort();
    assert_eq!(spots, sorted);

    let summary = state.report.unwrap().summary.unwrap();
    for r in &state.records {
        assert!(summary.max_dbm >= r.power_dbm);
        assert!(summary.min_dbm <= r.power_dbm);
    }
    assert!((summary.range_db - (summary.max_dbm - summary.min_dbm)).abs() < 1e-9);
}
