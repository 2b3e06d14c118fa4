//! FPGA programming supervisor.
//!
//! Launches the vendor toolchain as a child process and tracks it through
//! `Idle -> Programming -> {Done, Error}`. Nothing is pushed: callers poll
//! [`FpgaSupervisor::status`], which only reads the shared state and never
//! launches anything.

use crate::config::FpgaConfig;
use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::process::Command;
use tracing::{error, info};

/// Where programming stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgramStatus {
    /// Never launched
    Idle,
    /// The toolchain process is alive
    Programming,
    /// The toolchain exited with status 0
    Done,
    /// The toolchain failed to start or exited non-zero
    Error,
}

/// Snapshot of the programming session
#[derive(Debug, Clone, Serialize)]
pub struct ProgramSession {
    /// Current status
    pub status: ProgramStatus,
    /// When the current or last launch happened
    pub started_at: Option<DateTime<Local>>,
    /// When the process exit was observed
    pub finished_at: Option<DateTime<Local>>,
    /// Exit code, if the process exited normally
    pub exit_code: Option<i32>,
    /// Captured stdout and stderr of the last run
    pub output: String,
}

impl ProgramSession {
    fn idle() -> Self {
        Self {
            status: ProgramStatus::Idle,
            started_at: None,
            finished_at: None,
            exit_code: None,
            output: String::new(),
        }
    }
}

/// Singleton owner of the toolchain process
#[derive(Clone)]
pub struct FpgaSupervisor {
    config: FpgaConfig,
    session: Arc<Mutex<ProgramSession>>,
}

impl FpgaSupervisor {
    /// Supervisor for the configured toolchain
    pub fn new(config: FpgaConfig) -> Self {
        Self {
            config,
            session: Arc::new(Mutex::new(ProgramSession::idle())),
        }
    }

    fn session(&self) -> MutexGuard<'_, ProgramSession> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Launch the toolchain in the background
    ///
    /// # Errors
    /// - [`DaqError::Busy`] while a previous launch is still programming
    /// - [`DaqError::ExternalTool`] if the process cannot be spawned; the
    ///   status moves to Error with the spawn failure as output
    pub fn program(&self) -> AppResult<()> {
        let mut session = self.session();
        if session.status == ProgramStatus::Programming {
            return Err(DaqError::Busy("FPGA programming already in progress".to_string()));
        }

        *session = ProgramSession {
            status: ProgramStatus::Programming,
            started_at: Some(Local::now()),
            ..ProgramSession::idle()
        };

        let child = Command::new(&self.config.command)
            .args(&self.config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                let message = format!("cannot launch '{}': {}", self.config.command, e);
                error!("{}", message);
                session.status = ProgramStatus::Error;
                session.finished_at = Some(Local::now());
                session.output = message.clone();
                return Err(DaqError::ExternalTool(message));
            }
        };
        info!(command = %self.config.command, pid = ?child.id(), "FPGA programming started");
        drop(session);

        let shared = self.session.clone();
        tokio::spawn(async move {
            let result = child.wait_with_output().await;
            let mut session = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            session.finished_at = Some(Local::now());
            match result {
                Ok(output) => {
                    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                    text.push_str(&String::from_utf8_lossy(&output.stderr));
                    session.output = text;
                    session.exit_code = output.status.code();
                    if output.status.success() {
                        info!("FPGA programming finished");
                        session.status = ProgramStatus::Done;
                    } else {
                        error!(status = %output.status, "FPGA programming failed");
                        session.status = ProgramStatus::Error;
                    }
                }
                Err(e) => {
                    error!("Lost track of FPGA toolchain: {}", e);
                    session.output = e.to_string();
                    session.status = ProgramStatus::Error;
                }
            }
        });

        Ok(())
    }

    /// Current status
    pub fn status(&self) -> ProgramStatus {
        self.session().status
    }

    /// Full snapshot including captured output
    pub fn snapshot(&self) -> ProgramSession {
        self.session().clone()
    }

    /// Diagnostic text of a failed run
    pub fn diagnostic(&self) -> Option<DaqError> {
        let session = self.session();
        (session.status == ProgramStatus::Error).then(|| {
            DaqError::ExternalTool(match session.exit_code {
                Some(code) => format!("exit code {}: {}", code, session.output.trim()),
                None => session.output.trim().to_string(),
            })
        })
    }
}
