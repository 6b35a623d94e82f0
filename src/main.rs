//! `frame_daq` binary.
//!
//! Loads configuration, starts the receive thread and pipeline, and serves
//! JSON control requests line-by-line on stdin until `shutdown` or Ctrl-C.
//!
//! ```bash
//! frame_daq --config config/frame_daq.toml
//! echo '{"msg_type":"cmd","msg_val":"status","id":1,"timestamp":"2026-01-01T00:00:00Z"}' | frame_daq
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use daq_core::verbs;
use daq_processor::ShutdownMode;
use frame_daq::app::FrameDaqApp;
use frame_daq::config::{FrameDaqConfig, DEFAULT_CONFIG_PATH};
use frame_daq::tracing_setup::{self, OutputFormat, TracingConfig};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "frame_daq")]
#[command(about = "Detector frame receiver and processing pipeline", long_about = None)]
struct Cli {
    /// Configuration file (TOML); `FRAME_DAQ_*` environment variables override it
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured log format (pretty, compact, json)
    #[arg(long)]
    log_format: Option<OutputFormat>,

    /// Drop queued frames on exit instead of draining them
    #[arg(long)]
    discard_on_exit: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = FrameDaqConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    let mut tracing_config = TracingConfig::from_config(&config).map_err(anyhow::Error::msg)?;
    if let Some(format) = cli.log_format {
        tracing_config = tracing_config.with_format(format);
    }
    tracing_setup::init(tracing_config).map_err(anyhow::Error::msg)?;
    info!(config = %cli.config.display(), name = %config.application.name, "Starting frame_daq");

    let app = FrameDaqApp::start(&config)?;
    serve(&app, config.application.status_interval_secs).await;

    let mode = if cli.discard_on_exit {
        ShutdownMode::Discard
    } else {
        ShutdownMode::Drain
    };
    tokio::task::block_in_place(|| app.shutdown(mode))?;
    info!("frame_daq stopped");
    Ok(())
}

async fn serve(app: &FrameDaqApp, status_interval_secs: u64) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut ticker = tokio::time::interval(Duration::from_secs(status_interval_secs.max(1)));
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received");
                return;
            }
            _ = ticker.tick(), if status_interval_secs > 0 => {
                log_status(app);
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    let handled = tokio::task::block_in_place(|| app.handle_control_json(&line));
                    match handled {
                        Ok((request, reply)) => {
                            if let Err(err) = write_reply(&mut stdout, &reply).await {
                                warn!(error = %err, "Failed to write control reply");
                            }
                            if request.msg_val == verbs::SHUTDOWN {
                                info!("Shutdown requested");
                                return;
                            }
                        }
                        Err(err) => warn!(error = %err, "Ignoring malformed control request"),
                    }
                }
                Ok(None) => {
                    info!("Control input closed - running until interrupted");
                    stdin_open = false;
                }
                Err(err) => {
                    error!(error = %err, "Control input failed");
                    stdin_open = false;
                }
            },
        }
    }
}

async fn write_reply(stdout: &mut tokio::io::Stdout, reply: &str) -> std::io::Result<()> {
    stdout.write_all(reply.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

fn log_status(app: &FrameDaqApp) {
    let stats: Vec<_> = app
        .pipeline()
        .stage_names()
        .into_iter()
        .filter_map(|name| app.pipeline().stage_stats(name).ok().map(|s| (name, s)))
        .collect();
    for (stage, s) in stats {
        info!(
            stage,
            processed = s.frames_processed,
            forwarded = s.frames_forwarded,
            errors = s.process_errors,
            "Stage status"
        );
    }
    match tokio::task::block_in_place(|| app.receiver().status()) {
        Ok(status) => info!(status = %status.as_value(), "Receiver status"),
        Err(err) => warn!(error = %err, "Receiver status unavailable"),
    }
}
