//! `rf_daq` command-line front end.
//!
//! ```text
//! rf_daq --simulate run --board 1 --channel 1 --pulse-width "00 01" --prt "0A AB 00 00"
//! rf_daq discover
//! rf_daq udp-send --src-ip 192.168.1.5 --src-port 6005 --dst-ip 192.168.1.10 \
//!        --dst-port 5005 --payload "<40 hex bytes>"
//! ```
//!
//! Run events are printed to stdout as one JSON object per line.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rf_daq::app::DaqContext;
use rf_daq::automation::RunRequest;
use rf_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use rf_daq::fpga::ProgramStatus;
use rf_daq::instrument::InstrumentKind;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio_stream::StreamExt;

#[derive(Parser)]
#[command(name = "rf_daq", version, about = "RF board test automation")]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use the simulated bench and board instead of real hardware
    #[arg(long)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List visible instrument resources
    Discover,
    /// Attach instruments and print their identities
    Attach {
        /// `name=resource` pairs; resource may be "auto" (default: every name auto)
        targets: Vec<String>,
    },
    /// Auto-attach, run one automation sequence and stream its events
    Run {
        /// Board number
        #[arg(long)]
        board: u32,
        /// Channel number
        #[arg(long)]
        channel: u32,
        /// Pulse width, 2 hex bytes
        #[arg(long)]
        pulse_width: String,
        /// PRT, 4 hex bytes
        #[arg(long)]
        prt: String,
        /// Spot values; the configured sweep is used when omitted
        #[arg(long, value_delimiter = ',')]
        spots: Vec<String>,
    },
    /// Auto-attach and print run state with live readbacks
    Status,
    /// Send one raw UDP board frame
    UdpSend {
        #[arg(long)]
        src_ip: String,
        #[arg(long)]
        src_port: u16,
        #[arg(long)]
        dst_ip: String,
        #[arg(long)]
        dst_port: u16,
        /// 40 hex bytes
        #[arg(long)]
        payload: String,
    },
    /// Send one raw RS-422 frame
    Rs422Send {
        #[arg(long)]
        port: String,
        /// 9 hex bytes
        #[arg(long)]
        packet: String,
    },
    /// Program the FPGA and wait for the toolchain to finish
    FpgaProgram,
    /// Print the most recent report store
    ReportLatest,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value).context("Failed to serialize output")?);
    Ok(())
}

/// Attach every instrument name that can be found, skipping the rest
async fn attach_available(ctx: &DaqContext) {
    for kind in InstrumentKind::ALL {
        if let Err(e) = ctx.attach(kind.name(), "auto").await {
            tracing::warn!(name = %kind, "Not attached: {}", e);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    rf_daq::logging::init(&settings.application.log_level, settings.application.json_logs);

    let ctx = if cli.simulate {
        DaqContext::simulated(settings)
    } else {
        DaqContext::with_hardware(settings).context("Failed to set up hardware context")?
    };

    match cli.command {
        Command::Discover => print_json(&ctx.discover().await?)?,
        Command::Attach { targets } => {
            if targets.is_empty() {
                attach_available(&ctx).await;
                print_json(&ctx.registry().identities().await)?;
            }
            for target in &targets {
                let (name, resource) = target.split_once('=').unwrap_or((target.as_str(), "auto"));
                let identity = ctx
                    .attach(name, resource)
                    .await
                    .with_context(|| format!("Failed to attach {}", name))?;
                print_json(&identity)?;
            }
        }
        Command::Run {
            board,
            channel,
            pulse_width,
            prt,
            spots,
        } => {
            attach_available(&ctx).await;
            let request = if spots.is_empty() {
                ctx.default_request(board, channel, &pulse_width, &prt)
            } else {
                RunRequest {
                    board_no: board,
                    channel_no: channel,
                    pulse_width,
                    prt,
                    spots,
                }
            };

            let mut events = ctx.controller().bus().subscribe().into_stream();
            ctx.run(request).await.context("Run rejected")?;
            while let Some(envelope) = events.next().await {
                print_json(&envelope)?;
                if envelope.event.is_terminal() {
                    break;
                }
            }

            let state = ctx.controller().snapshot();
            ctx.close_all().await;
            if state.status != rf_daq::automation::RunStatus::Completed {
                bail!("Run ended in {:?}: {}", state.status, state.message);
            }
        }
        Command::Status => {
            attach_available(&ctx).await;
            print_json(&ctx.status().await)?;
            ctx.close_all().await;
        }
        Command::UdpSend {
            src_ip,
            src_port,
            dst_ip,
            dst_port,
            payload,
        } => print_json(&ctx.udp_send(&src_ip, src_port, &dst_ip, dst_port, &payload).await?)?,
        Command::Rs422Send { port, packet } => print_json(&ctx.rs422_send(&port, &packet).await?)?,
        Command::FpgaProgram => {
            ctx.fpga_program()?;
            while ctx.fpga_status().status == ProgramStatus::Programming {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            let session = ctx.fpga_status();
            print_json(&session)?;
            if session.status != ProgramStatus::Done {
                bail!("FPGA programming failed");
            }
        }
        Command::ReportLatest => println!("{}", ctx.report_latest()?.display()),
    }

    Ok(())
}
