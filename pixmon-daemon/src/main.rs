//! Live readout monitor daemon.
//!
//! Accepts producer connections over TCP, runs the single-consumer monitor
//! loop, publishes one telemetry snapshot per second to an HTTP endpoint
//! (or stdout), and serves a small read-only HTTP API.
//!
//! Threads:
//!
//! - main: monitor loop (receive, ingest, tick, publish)
//! - `pixmon-conn`: one per producer connection, decoding envelopes
//! - `pixmon-publish`: delivers reports to the configured sink
//! - API: answers `/monitor/*` requests

mod api;
mod sink;
mod transport;

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use clap::Parser;
use pixmon::error::TransportError;
use pixmon::layout::LayoutCatalog;
use pixmon::monitor::{MessageSource, MonitorLoop};
use pixmon::publish::{HttpSink, HttpSinkConfig, JsonLinesSink, TelemetrySink};
use pixmon::{MonitorConfig, PixmonError, SystemClock};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::sink::ChannelSink;

/// The monitor loop as shared between the loop thread and the API.
pub type SharedMonitor = Arc<Mutex<MonitorLoop<ChannelSink, SystemClock>>>;

/// pixmon-daemon — Live readout monitor.
#[derive(Parser)]
#[command(name = "pixmon-daemon", version, about)]
struct Cli {
    /// Address producers connect to.
    #[arg(long, default_value = "127.0.0.1:5550")]
    listen: String,

    /// Telemetry endpoint URL, or `-` for JSON lines on stdout.
    #[arg(long, default_value = "http://localhost:5000/api/packets")]
    sink: String,

    /// Port for the HTTP monitor API.
    #[arg(long, default_value = "9100")]
    api_port: u16,

    /// Monitor config file (JSON). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding `layout-<name>.json` files.
    #[arg(long, default_value = "./layouts")]
    layout_dir: PathBuf,

    /// Layout to load at startup.
    #[arg(long)]
    layout: Option<String>,
}

/// Errors that stop the daemon.
#[derive(Error, Debug)]
enum DaemonError {
    /// A listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// A worker thread could not be started.
    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    Monitor(#[from] PixmonError),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        tracing::error!("monitor failed: {e}");
        std::process::exit(1);
    }
}

/// Opens the configured telemetry sink.
fn open_sink(cli: &Cli) -> pixmon::Result<Box<dyn TelemetrySink + Send>> {
    if cli.sink == "-" {
        return Ok(Box::new(JsonLinesSink::new(std::io::stdout())));
    }
    Ok(Box::new(HttpSink::new(HttpSinkConfig::new(&cli.sink))?))
}

/// Builds the monitor loop and loads the startup layout, if any.
fn build_monitor(
    cli: &Cli,
    catalog: &LayoutCatalog,
    sink: ChannelSink,
) -> pixmon::Result<MonitorLoop<ChannelSink, SystemClock>> {
    let config = match &cli.config {
        Some(path) => MonitorConfig::from_path(path)?,
        None => MonitorConfig::default(),
    };

    let mut monitor = MonitorLoop::new(config, sink, SystemClock)?;
    if let Some(name) = &cli.layout {
        monitor.aggregator_mut().load_layout(catalog.load(name)?)?;
    }
    Ok(monitor)
}

fn run(cli: Cli) -> Result<(), DaemonError> {
    let backend = open_sink(&cli)?;
    let (channel_sink, _publisher) = sink::spawn_publisher(backend).map_err(DaemonError::Spawn)?;

    let catalog = LayoutCatalog::new(&cli.layout_dir);
    let monitor = build_monitor(&cli, &catalog, channel_sink)?;
    let receive_timeout = monitor.receive_timeout();
    let monitor: SharedMonitor = Arc::new(Mutex::new(monitor));

    let (tx, mut rx) = mpsc::sync_channel(transport::INBOUND_QUEUE_DEPTH);
    let producers = TcpListener::bind(&cli.listen).map_err(|e| DaemonError::Bind {
        addr: cli.listen.clone(),
        source: e,
    })?;
    std::thread::Builder::new()
        .name("pixmon-transport".to_string())
        .spawn(move || transport::run_listener(producers, tx))
        .map_err(DaemonError::Spawn)?;

    let api_addr = format!("0.0.0.0:{}", cli.api_port);
    let api_listener = TcpListener::bind(&api_addr).map_err(|e| DaemonError::Bind {
        addr: api_addr.clone(),
        source: e,
    })?;
    let api_monitor = Arc::clone(&monitor);
    std::thread::Builder::new()
        .name("pixmon-api".to_string())
        .spawn(move || api::run_api_server(api_listener, api_monitor, catalog))
        .map_err(DaemonError::Spawn)?;

    tracing::info!(
        listen = %cli.listen,
        api = %api_addr,
        sink = %cli.sink,
        "monitor started"
    );

    // Receive outside the lock so the API is never blocked on an idle transport.
    loop {
        let message = match rx.receive(receive_timeout) {
            Ok(message) => message,
            Err(TransportError::Disconnected) => {
                tracing::info!("transport listener stopped");
                return Ok(());
            }
            Err(e) => return Err(PixmonError::from(e).into()),
        };

        match monitor.lock() {
            Ok(mut m) => m.process(message),
            Err(e) => {
                tracing::error!("monitor state poisoned: {e}");
                return Ok(());
            }
        }
    }
}
