//! Instrument Session with Command Queueing
//!
//! An instrument connection is single-session: overlapping exchanges on one
//! connection are undefined. Every command sent through an [`InstrumentSession`]
//! is therefore queued FIFO and executed by one dedicated task that owns the
//! transport.
//!
//! # Design
//!
//! - One queue task per open resource
//! - Responses return via oneshot channels
//! - Every exchange carries its own timeout; an expired exchange answers
//!   [`DaqError::Timeout`] and the session stays open for the next command
//! - Handles are cheap clones of the queue sender
//!
//! # Example
//!
//! ```no_run
//! # use rf_daq::hardware::InstrumentSession;
//! # use std::time::Duration;
//! # async fn example(session: InstrumentSession) -> rf_daq::error::AppResult<()> {
//! let idn = session.query("*IDN?", Duration::from_secs(2)).await?;
//! session.write("*RST").await?;
//! # Ok(())
//! # }
//! ```

use super::ScpiTransport;
use crate::error::{AppResult, DaqError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Poll interval used by [`InstrumentSession::wait_opc`].
const OPC_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
enum Request {
    Write(String),
    Query(String),
    QueryBinary(String),
    Close,
}

#[derive(Debug)]
enum Reply {
    Done,
    Text(String),
    Bytes(Vec<u8>),
}

/// Command to be executed through the session queue
#[derive(Debug)]
struct SessionCommand {
    request: Request,
    timeout: Duration,
    response_tx: oneshot::Sender<AppResult<Reply>>,
}

/// Handle to an open instrument session
#[derive(Clone, Debug)]
pub struct InstrumentSession {
    resource: String,
    default_timeout: Duration,
    command_tx: mpsc::Sender<SessionCommand>,
}

impl InstrumentSession {
    /// Take ownership of `transport` and start its queue task.
    pub fn open(transport: Box<dyn ScpiTransport>, default_timeout: Duration) -> Self {
        let resource = transport.resource().to_string();
        let (command_tx, command_rx) = mpsc::channel(100);

        debug!(resource = %resource, "Starting instrument command queue");
        tokio::spawn(run_command_queue(resource.clone(), transport, command_rx));

        Self {
            resource,
            default_timeout,
            command_tx,
        }
    }

    /// Resource string this session is bound to
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Timeout used by the convenience helpers
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// True while the queue task is alive
    pub fn is_open(&self) -> bool {
        !self.command_tx.is_closed()
    }

    async fn submit(&self, request: Request, timeout: Duration) -> AppResult<Reply> {
        let (response_tx, response_rx) = oneshot::channel();
        let cmd = SessionCommand {
            request,
            timeout,
            response_tx,
        };

        self.command_tx.send(cmd).await.map_err(|_| {
            DaqError::Connection(format!("session for {} is closed", self.resource))
        })?;

        response_rx.await.map_err(|_| {
            DaqError::Connection(format!(
                "session for {} ended before replying",
                self.resource
            ))
        })?
    }

    /// Send a command and wait for its text response
    ///
    /// # Errors
    /// - [`DaqError::Timeout`] if no response arrived within `timeout`; the
    ///   session stays usable
    /// - [`DaqError::Connection`] if the session is closed or the link failed
    pub async fn query(&self, command: &str, timeout: Duration) -> AppResult<String> {
        match self.submit(Request::Query(command.to_string()), timeout).await? {
            Reply::Text(text) => Ok(text),
            other => Err(DaqError::Connection(format!(
                "unexpected reply {:?} to '{}'",
                other, command
            ))),
        }
    }

    /// Query with the session default timeout, parsing the answer as a float
    pub async fn query_f64(&self, command: &str) -> AppResult<f64> {
        let text = self.query(command, self.default_timeout).await?;
        text.trim()
            .parse::<f64>()
            .map_err(|e| DaqError::malformed(command, format!("'{}' is not a number: {}", text, e)))
    }

    /// Send a command that returns a binary block; the raw response is returned
    pub async fn query_binary(&self, command: &str, timeout: Duration) -> AppResult<Vec<u8>> {
        match self
            .submit(Request::QueryBinary(command.to_string()), timeout)
            .await?
        {
            Reply::Bytes(bytes) => Ok(bytes),
            other => Err(DaqError::Connection(format!(
                "unexpected reply {:?} to '{}'",
                other, command
            ))),
        }
    }

    /// Send a write-only command
    pub async fn write(&self, command: &str) -> AppResult<()> {
        self.submit(Request::Write(command.to_string()), self.default_timeout)
            .await
            .map(|_| ())
    }

    /// `*IDN?`
    pub async fn idn(&self) -> AppResult<String> {
        self.query("*IDN?", self.default_timeout).await
    }

    /// `*RST`
    pub async fn reset(&self) -> AppResult<()> {
        self.write("*RST").await
    }

    /// `*CLS`
    pub async fn clear_status(&self) -> AppResult<()> {
        self.write("*CLS").await
    }

    /// Poll `*OPC?` until the instrument reports completion or `deadline` passes.
    pub async fn wait_opc(&self, deadline: Duration) -> AppResult<()> {
        let start = tokio::time::Instant::now();
        loop {
            let remaining = deadline.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(DaqError::timeout("*OPC?", deadline));
            }
            match self.query("*OPC?", remaining.min(self.default_timeout)).await {
                Ok(reply) if reply.trim() == "1" => return Ok(()),
                Ok(_) => {}
                Err(e) if e.is_disconnect() => return Err(e),
                Err(e) => trace!(resource = %self.resource, "*OPC? not ready: {}", e),
            }
            tokio::time::sleep(OPC_POLL_INTERVAL).await;
        }
    }

    /// Close the session. Other handles see [`DaqError::Connection`] afterwards.
    pub async fn close(&self) -> AppResult<()> {
        if !self.is_open() {
            return Ok(());
        }
        match self.submit(Request::Close, self.default_timeout).await {
            Ok(_) => Ok(()),
            // the queue may already be gone, which is what we wanted
            Err(DaqError::Connection(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Run the command queue for one transport
///
/// Exchanges execute strictly one at a time. A write failure or read failure is
/// reported to the caller; the queue keeps running until a `Close` arrives or
/// every handle is dropped.
async fn run_command_queue(
    resource: String,
    mut transport: Box<dyn ScpiTransport>,
    mut command_rx: mpsc::Receiver<SessionCommand>,
) {
    while let Some(cmd) = command_rx.recv().await {
        let closing = matches!(cmd.request, Request::Close);
        let result = execute(&resource, transport.as_mut(), &cmd.request, cmd.timeout).await;
        let _ = cmd.response_tx.send(result);
        if closing {
            break;
        }
    }

    if let Err(e) = transport.close().await {
        warn!(resource = %resource, "Error closing transport: {}", e);
    }
    debug!(resource = %resource, "Instrument command queue ended");
}

async fn execute(
    resource: &str,
    transport: &mut dyn ScpiTransport,
    request: &Request,
    timeout: Duration,
) -> AppResult<Reply> {
    let exchange = async {
        match request {
            Request::Write(command) => {
                debug!(resource, "SCPI >> {}", command);
                transport.write(command).await?;
                Ok(Reply::Done)
            }
            Request::Query(command) => {
                debug!(resource, "SCPI ? {}", command);
                transport.write(command).await?;
                let raw = transport.read_raw().await?;
                let text = String::from_utf8_lossy(&raw).trim().to_string();
                debug!(resource, "SCPI << {}", text);
                Ok(Reply::Text(text))
            }
            Request::QueryBinary(command) => {
                debug!(resource, "SCPI (binary) ? {}", command);
                transport.write(command).await?;
                let raw = transport.read_raw().await?;
                debug!(resource, "SCPI (binary) << {} bytes", raw.len());
                Ok(Reply::Bytes(raw))
            }
            Request::Close => {
                transport.close().await?;
                Ok(Reply::Done)
            }
        }
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => {
            let operation = match request {
                Request::Write(c) | Request::Query(c) | Request::QueryBinary(c) => c.clone(),
                Request::Close => "close".to_string(),
            };
            warn!(resource, "Exchange timed out after {:?}: {}", timeout, operation);
            Err(DaqError::timeout(operation, timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{SimBench, SimInstrumentKind};
    use crate::hardware::ResourceManager;

    const SA: &str = "TCPIP0::10.0.0.3::INSTR";

    async fn open_analyzer() -> (SimBench, InstrumentSession) {
        let bench = SimBench::new();
        bench.add(SA, SimInstrumentKind::Analyzer);
        let transport = bench.open(SA).await.expect("open");
        let session = InstrumentSession::open(transport, Duration::from_millis(200));
        (bench, session)
    }

    #[tokio::test]
    async fn test_query_identity() {
        let (_bench, session) = open_analyzer().await;
        let idn = session.idn().await.expect("idn");
        assert!(idn.contains("N9030"));
        assert_eq!(session.resource(), SA);
    }

    #[tokio::test]
    async fn test_timeout_keeps_session_open() {
        let (bench, session) = open_analyzer().await;
        bench.instrument(SA).expect("sim").stall_marker_reads(1);

        let err = session
            .query(":CALC:MARK:Y?", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "expected timeout, got {err}");

        // next exchange on the same session still works
        assert!(session.is_open());
        let level = session.query_f64(":CALC:MARK:Y?").await.expect("second read");
        assert!(level.is_finite());
    }

    #[tokio::test]
    async fn test_concurrent_commands_are_serialized() {
        let (bench, session) = open_analyzer().await;

        let mut tasks = vec![];
        for i in 0..5 {
            let s = session.clone();
            tasks.push(tokio::spawn(async move {
                s.write(&format!(":FREQ:CENT {}", 1e9 + i as f64)).await
            }));
        }
        for task in tasks {
            task.await.expect("join").expect("write");
        }

        let sim = bench.instrument(SA).expect("sim");
        assert_eq!(sim.max_in_flight(), 1);
        assert_eq!(sim.commands().len(), 5);
    }

    #[tokio::test]
    async fn test_close_invalidates_clones() {
        let (_bench, session) = open_analyzer().await;
        let other = session.clone();
        session.close().await.expect("close");

        let err = other.idn().await.unwrap_err();
        assert!(matches!(err, DaqError::Connection(_)));
    }

    #[tokio::test]
    async fn test_wait_opc() {
        let (_bench, session) = open_analyzer().await;
        session
            .wait_opc(Duration::from_secs(1))
            .await
            .expect("opc");
    }
}
