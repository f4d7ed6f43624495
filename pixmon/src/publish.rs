//! Telemetry delivery.
//!
//! The [`ReportPublisher`] hands reports to a [`TelemetrySink`] and absorbs
//! every delivery failure: a sink outage is logged and counted, never
//! propagated, and the next report is attempted as usual.
//!
//! Sinks:
//!
//! - [`JsonLinesSink`] writes one JSON object per line to any `Write`
//! - [`MemorySink`] keeps reports in memory (tests, embedding)
//! - `HttpSink` POSTs reports as JSON (feature `http-sink`)

use std::io::Write;

use serde::Serialize;

use crate::aggregator::{LogMessage, TelemetrySnapshot};
use crate::error::SinkError;

/// A messages-only update, sent whenever a message arrives.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageUpdate {
    /// Most recent messages, newest first.
    pub messages: Vec<LogMessage>,
}

/// A report body as delivered to a sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TelemetryReport {
    /// The per-second full snapshot.
    Snapshot(TelemetrySnapshot),
    /// The messages-only update.
    Messages(MessageUpdate),
}

/// Destination for telemetry reports.
pub trait TelemetrySink {
    /// Delivers one report.
    ///
    /// # Errors
    ///
    /// Returns a [`SinkError`] if the report could not be delivered.
    fn deliver(&mut self, report: &TelemetryReport) -> Result<(), SinkError>;
}

impl<S: TelemetrySink + ?Sized> TelemetrySink for Box<S> {
    fn deliver(&mut self, report: &TelemetryReport) -> Result<(), SinkError> {
        (**self).deliver(report)
    }
}

/// Writes each report as one line of JSON.
#[derive(Debug)]
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    /// Wraps a writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Returns the wrapped writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> TelemetrySink for JsonLinesSink<W> {
    fn deliver(&mut self, report: &TelemetryReport) -> Result<(), SinkError> {
        serde_json::to_writer(&mut self.writer, report)
            .map_err(|e| SinkError::Serialize { source: e })?;
        self.writer
            .write_all(b"\n")
            .and_then(|()| self.writer.flush())
            .map_err(|e| SinkError::Io { source: e })
    }
}

/// Keeps every delivered report. Can be switched to fail on demand.
#[derive(Debug, Default)]
pub struct MemorySink {
    reports: Vec<TelemetryReport>,
    failing: bool,
}

impl MemorySink {
    /// Creates an empty, accepting sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent deliveries fail (or succeed again).
    pub fn set_failing(&mut self, failing: bool) {
        self.failing = failing;
    }

    /// Reports delivered so far.
    pub fn reports(&self) -> &[TelemetryReport] {
        &self.reports
    }
}

impl TelemetrySink for MemorySink {
    fn deliver(&mut self, report: &TelemetryReport) -> Result<(), SinkError> {
        if self.failing {
            return Err(SinkError::Unavailable {
                reason: "memory sink set to fail".to_string(),
            });
        }
        self.reports.push(report.clone());
        Ok(())
    }
}

#[cfg(feature = "http-sink")]
pub use http::{HttpSink, HttpSinkConfig};

#[cfg(feature = "http-sink")]
mod http {
    use std::time::Duration;

    use super::{TelemetryReport, TelemetrySink};
    use crate::error::SinkError;

    /// Configuration for an HTTP telemetry endpoint.
    #[derive(Debug, Clone)]
    pub struct HttpSinkConfig {
        /// Endpoint URL (e.g., `http://localhost:5000/api/packets`).
        pub endpoint: String,
        /// HTTP timeout per request.
        pub timeout: Duration,
        /// Maximum number of retry attempts on failure.
        pub max_retries: u32,
        /// Initial backoff between retries (doubles each attempt).
        pub retry_backoff: Duration,
        /// Extra HTTP headers (e.g., for authentication).
        pub headers: Vec<(String, String)>,
    }

    impl HttpSinkConfig {
        /// Creates a config with defaults sized for a 1 Hz cadence.
        ///
        /// Defaults: 500ms timeout, 1 retry, 50ms initial backoff.
        pub fn new(endpoint: impl Into<String>) -> Self {
            Self {
                endpoint: endpoint.into(),
                timeout: Duration::from_millis(500),
                max_retries: 1,
                retry_backoff: Duration::from_millis(50),
                headers: Vec::new(),
            }
        }

        /// Adds an HTTP header.
        #[must_use]
        pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
            self.headers.push((name.into(), value.into()));
            self
        }

        /// Sets the HTTP timeout.
        #[must_use]
        pub fn with_timeout(mut self, timeout: Duration) -> Self {
            self.timeout = timeout;
            self
        }

        /// Sets the maximum number of retries.
        #[must_use]
        pub fn with_max_retries(mut self, max_retries: u32) -> Self {
            self.max_retries = max_retries;
            self
        }
    }

    /// POSTs reports as JSON to an HTTP endpoint.
    #[derive(Debug)]
    pub struct HttpSink {
        config: HttpSinkConfig,
        client: reqwest::blocking::Client,
    }

    impl HttpSink {
        /// Builds the HTTP client.
        ///
        /// # Errors
        ///
        /// Returns [`SinkError::ClientCreate`] if the client cannot be built.
        pub fn new(config: HttpSinkConfig) -> Result<Self, SinkError> {
            let client = reqwest::blocking::Client::builder()
                .timeout(config.timeout)
                .build()
                .map_err(|e| SinkError::ClientCreate { source: e })?;
            Ok(Self { config, client })
        }

        /// The endpoint reports are sent to.
        pub fn endpoint(&self) -> &str {
            &self.config.endpoint
        }

        fn send_with_retry(&self, body: &[u8]) -> Result<(), SinkError> {
            let mut backoff = self.config.retry_backoff;
            let mut attempt = 0;

            loop {
                let mut request = self
                    .client
                    .post(&self.config.endpoint)
                    .header("Content-Type", "application/json");
                for (name, value) in &self.config.headers {
                    request = request.header(name, value);
                }

                let error = match request.body(body.to_vec()).send() {
                    Ok(resp) if resp.status().is_success() => return Ok(()),
                    Ok(resp) => {
                        let status = resp.status().as_u16();
                        let body = resp.text().unwrap_or_default();
                        SinkError::HttpStatus { status, body }
                    }
                    Err(e) => SinkError::RequestFailed { source: e },
                };

                if attempt >= self.config.max_retries {
                    return Err(error);
                }
                attempt += 1;
                std::thread::sleep(backoff);
                backoff *= 2;
            }
        }
    }

    impl TelemetrySink for HttpSink {
        fn deliver(&mut self, report: &TelemetryReport) -> Result<(), SinkError> {
            let body =
                serde_json::to_vec(report).map_err(|e| SinkError::Serialize { source: e })?;
            self.send_with_retry(&body)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_config_builder() {
            let config = HttpSinkConfig::new("http://localhost:5000/api/packets")
                .with_timeout(Duration::from_secs(2))
                .with_max_retries(0)
                .with_header("Authorization", "Bearer token");

            assert_eq!(config.timeout, Duration::from_secs(2));
            assert_eq!(config.max_retries, 0);
            assert_eq!(config.headers.len(), 1);
        }

        #[test]
        fn test_unreachable_endpoint_fails() {
            let config = HttpSinkConfig::new("http://127.0.0.1:1/api/packets")
                .with_timeout(Duration::from_millis(200))
                .with_max_retries(0);
            let mut sink = HttpSink::new(config).unwrap();
            let report = TelemetryReport::Messages(crate::publish::MessageUpdate {
                messages: Vec::new(),
            });
            assert!(sink.deliver(&report).is_err());
        }
    }
}

/// Delivery counters for a publisher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublisherHealth {
    /// Reports delivered.
    pub delivered: u64,
    /// Reports that failed to deliver.
    pub failed: u64,
    /// Failures since the last successful delivery.
    pub consecutive_failures: u64,
}

/// Delivers reports to a sink, containing every failure.
#[derive(Debug)]
pub struct ReportPublisher<S> {
    sink: S,
    health: PublisherHealth,
}

impl<S: TelemetrySink> ReportPublisher<S> {
    /// Creates a publisher over `sink`.
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            health: PublisherHealth::default(),
        }
    }

    /// Delivers a full snapshot. Returns whether delivery succeeded.
    pub fn publish(&mut self, snapshot: TelemetrySnapshot) -> bool {
        self.deliver(&TelemetryReport::Snapshot(snapshot))
    }

    /// Delivers a messages-only update. Returns whether delivery succeeded.
    pub fn publish_messages(&mut self, messages: Vec<LogMessage>) -> bool {
        self.deliver(&TelemetryReport::Messages(MessageUpdate { messages }))
    }

    fn deliver(&mut self, report: &TelemetryReport) -> bool {
        match self.sink.deliver(report) {
            Ok(()) => {
                if self.health.consecutive_failures > 0 {
                    tracing::info!(
                        failed = self.health.consecutive_failures,
                        "telemetry sink recovered"
                    );
                }
                self.health.delivered += 1;
                self.health.consecutive_failures = 0;
                true
            }
            Err(e) => {
                if self.health.consecutive_failures == 0 {
                    tracing::warn!(error = %e, "failed to deliver telemetry report");
                } else {
                    tracing::debug!(error = %e, "telemetry sink still failing");
                }
                self.health.failed += 1;
                self.health.consecutive_failures += 1;
                false
            }
        }
    }

    /// Delivery counters.
    pub fn health(&self) -> PublisherHealth {
        self.health
    }

    /// The underlying sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// The underlying sink, mutably.
    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }
}
