//! Off-loop report delivery.
//!
//! The monitor loop must never wait on a slow telemetry endpoint, so it
//! publishes into a [`ChannelSink`]: a bounded queue drained by a publisher
//! thread that owns the real sink. A full queue drops the report (the next
//! second's snapshot supersedes it) and counts as a failed delivery.

use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};
use std::thread::{self, JoinHandle};

use pixmon::error::SinkError;
use pixmon::publish::{ReportPublisher, TelemetryReport, TelemetrySink};

/// Reports buffered between the loop and the publisher thread.
pub const QUEUE_DEPTH: usize = 8;

/// Hands reports to the publisher thread without blocking.
#[derive(Debug)]
pub struct ChannelSink {
    tx: SyncSender<TelemetryReport>,
}

impl TelemetrySink for ChannelSink {
    fn deliver(&mut self, report: &TelemetryReport) -> Result<(), SinkError> {
        self.tx.try_send(report.clone()).map_err(|e| match e {
            TrySendError::Full(_) => SinkError::Unavailable {
                reason: "publisher queue full".to_string(),
            },
            TrySendError::Disconnected(_) => SinkError::Unavailable {
                reason: "publisher thread stopped".to_string(),
            },
        })
    }
}

/// Starts the publisher thread over `sink`.
///
/// # Errors
///
/// Returns the I/O error if the thread cannot be spawned.
pub fn spawn_publisher<S>(sink: S) -> std::io::Result<(ChannelSink, JoinHandle<()>)>
where
    S: TelemetrySink + Send + 'static,
{
    let (tx, rx) = sync_channel(QUEUE_DEPTH);
    let handle = thread::Builder::new()
        .name("pixmon-publish".to_string())
        .spawn(move || drain(&rx, ReportPublisher::new(sink)))?;
    Ok((ChannelSink { tx }, handle))
}

fn drain<S: TelemetrySink>(rx: &Receiver<TelemetryReport>, mut publisher: ReportPublisher<S>) {
    for report in rx {
        match report {
            TelemetryReport::Snapshot(snapshot) => publisher.publish(snapshot),
            TelemetryReport::Messages(update) => publisher.publish_messages(update.messages),
        };
    }

    let health = publisher.health();
    tracing::info!(
        delivered = health.delivered,
        failed = health.failed,
        "publisher thread stopped"
    );
}
