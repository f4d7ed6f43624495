//! The single-consumer monitor loop.
//!
//! [`MonitorLoop`] owns the aggregator, the run lifecycle and the publisher,
//! and alternates between two steps:
//!
//! 1. a bounded-wait receive from a [`MessageSource`], handling whatever
//!    arrived;
//! 2. a clock check: once the wall-clock second changes, tick the
//!    aggregator and publish a snapshot.
//!
//! All aggregator mutation happens on this loop. The receive wait is capped
//! by [`MonitorConfig::receive_timeout`] so an idle transport never starves
//! the per-second tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::aggregator::{TelemetrySnapshot, WindowedAggregator};
use crate::config::MonitorConfig;
use crate::error::{ConfigError, TransportError};
use crate::lifecycle::{DaqState, RunEvent, RunLifecycle};
use crate::publish::{ReportPublisher, TelemetrySink};

/// Source of wall-clock time in Unix seconds.
pub trait Clock {
    /// Current time in Unix seconds.
    fn now(&self) -> f64;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    bits: Arc<AtomicU64>,
}

impl ManualClock {
    /// Creates a clock reading `now`.
    pub fn new(now: f64) -> Self {
        Self {
            bits: Arc::new(AtomicU64::new(now.to_bits())),
        }
    }

    /// Sets the time.
    pub fn set(&self, now: f64) {
        self.bits.store(now.to_bits(), Ordering::Relaxed);
    }

    /// Moves the time forward by `secs`.
    pub fn advance(&self, secs: f64) {
        self.set(self.now() + secs);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Where a data payload came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMetadata {
    /// Producing component.
    pub origin: String,
    /// Producer sequence number, if the transport carries one.
    pub sequence: Option<u64>,
}

/// One message from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// A wire frame of records.
    Data {
        /// Where the frame came from.
        metadata: DataMetadata,
        /// The encoded frame.
        payload: Vec<u8>,
    },
    /// Free-form informational text.
    Info {
        /// Sending component.
        origin: String,
        /// Message text.
        text: String,
    },
    /// A structured run boundary.
    Run {
        /// Sending component.
        origin: String,
        /// The event.
        event: RunEvent,
    },
    /// A data-acquisition state change.
    State {
        /// The state now in effect.
        new_state: DaqState,
    },
}

/// Anything the monitor loop can receive messages from.
pub trait MessageSource {
    /// Waits up to `timeout` for the next message.
    ///
    /// Returns `Ok(None)` if nothing arrived in time.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Disconnected`] once no more messages can
    /// arrive, or any other transport failure.
    fn receive(&mut self, timeout: Duration) -> Result<Option<InboundMessage>, TransportError>;
}

impl MessageSource for Receiver<InboundMessage> {
    fn receive(&mut self, timeout: Duration) -> Result<Option<InboundMessage>, TransportError> {
        match self.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
        }
    }
}

/// Truncates Unix time to whole seconds.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // clamped to >= 0; Unix seconds fit u64
fn whole_second(now: f64) -> u64 {
    now.max(0.0).floor() as u64
}

/// Receive, ingest, tick, publish.
///
/// # Example
///
/// ```rust
/// use pixmon::config::MonitorConfig;
/// use pixmon::monitor::{InboundMessage, ManualClock, MonitorLoop};
/// use pixmon::publish::MemorySink;
///
/// let clock = ManualClock::new(100.0);
/// let mut monitor =
///     MonitorLoop::new(MonitorConfig::default(), MemorySink::new(), clock.clone()).unwrap();
///
/// monitor.process(Some(InboundMessage::Info {
///     origin: "operator".to_string(),
///     text: "hello".to_string(),
/// }));
/// clock.advance(1.0);
/// assert!(monitor.poll_tick());
/// assert_eq!(monitor.publisher().sink().reports().len(), 2);
/// ```
#[derive(Debug)]
pub struct MonitorLoop<S, C = SystemClock> {
    aggregator: WindowedAggregator,
    lifecycle: RunLifecycle,
    publisher: ReportPublisher<S>,
    clock: C,
    receive_timeout: Duration,
    last_second: u64,
}

impl<S: TelemetrySink, C: Clock> MonitorLoop<S, C> {
    /// Creates a loop publishing to `sink`.
    ///
    /// # Errors
    ///
    /// Returns any [`MonitorConfig::validate`] error.
    pub fn new(config: MonitorConfig, sink: S, clock: C) -> Result<Self, ConfigError> {
        let now = clock.now();
        let receive_timeout = config.receive_timeout();
        let aggregator = WindowedAggregator::new(config, now)?;

        Ok(Self {
            aggregator,
            lifecycle: RunLifecycle::new(),
            publisher: ReportPublisher::new(sink),
            clock,
            receive_timeout,
            last_second: whole_second(now),
        })
    }

    /// Handles one inbound message.
    pub fn handle(&mut self, message: InboundMessage) {
        let now = self.clock.now();

        match message {
            InboundMessage::Data { metadata, payload } => {
                let summary = self.aggregator.ingest_payload(&payload, whole_second(now));
                tracing::trace!(
                    origin = %metadata.origin,
                    sequence = ?metadata.sequence,
                    records = summary.ingested,
                    "data frame ingested"
                );
            }
            InboundMessage::Info { origin, text } => {
                let event = RunEvent::from_legacy(&origin, &text);
                self.aggregator.record_message(origin, text, now);
                if let Some(event) = event {
                    self.lifecycle.observe_event(event, &mut self.aggregator, now);
                }
                self.publish_messages();
            }
            InboundMessage::Run { origin, event } => {
                self.aggregator.record_message(origin, event.to_string(), now);
                self.lifecycle.observe_event(event, &mut self.aggregator, now);
                self.publish_messages();
            }
            InboundMessage::State { new_state } => {
                self.lifecycle.observe_state(new_state, &mut self.aggregator, now);
            }
        }
    }

    /// Ticks and publishes if the wall-clock second changed.
    ///
    /// Returns whether a tick happened.
    pub fn poll_tick(&mut self) -> bool {
        let now = self.clock.now();
        let second = whole_second(now);
        if second <= self.last_second {
            return false;
        }

        self.aggregator.tick(second);
        self.last_second = second;
        self.publisher.publish(self.aggregator.snapshot(now));
        true
    }

    /// Handles `message` (if any), then checks the clock.
    pub fn process(&mut self, message: Option<InboundMessage>) {
        if let Some(message) = message {
            self.handle(message);
        }
        self.poll_tick();
    }

    /// One bounded receive followed by [`process`](Self::process).
    ///
    /// # Errors
    ///
    /// Returns the source's error; the aggregator is left untouched.
    pub fn step<M: MessageSource>(&mut self, source: &mut M) -> Result<(), TransportError> {
        let message = source.receive(self.receive_timeout)?;
        self.process(message);
        Ok(())
    }

    /// Runs until `stop` is set or the source disconnects.
    ///
    /// # Errors
    ///
    /// Returns any source error other than a disconnect.
    pub fn run<M: MessageSource>(
        &mut self,
        source: &mut M,
        stop: &AtomicBool,
    ) -> Result<(), TransportError> {
        tracing::info!(timeout_ms = self.receive_timeout.as_millis(), "monitor loop started");

        while !stop.load(Ordering::Relaxed) {
            match self.step(source) {
                Ok(()) => {}
                Err(TransportError::Disconnected) => {
                    tracing::info!("message source disconnected");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!("monitor loop stopped");
        Ok(())
    }

    /// A snapshot at the current time.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.aggregator.snapshot(self.clock.now())
    }

    /// The aggregator.
    pub fn aggregator(&self) -> &WindowedAggregator {
        &self.aggregator
    }

    /// The aggregator, mutably (layout reloads).
    pub fn aggregator_mut(&mut self) -> &mut WindowedAggregator {
        &mut self.aggregator
    }

    /// The run lifecycle.
    pub fn lifecycle(&self) -> &RunLifecycle {
        &self.lifecycle
    }

    /// The run lifecycle, mutably (handler registration).
    pub fn lifecycle_mut(&mut self) -> &mut RunLifecycle {
        &mut self.lifecycle
    }

    /// The publisher.
    pub fn publisher(&self) -> &ReportPublisher<S> {
        &self.publisher
    }

    /// The publisher, mutably.
    pub fn publisher_mut(&mut self) -> &mut ReportPublisher<S> {
        &mut self.publisher
    }

    /// The bounded receive wait.
    pub fn receive_timeout(&self) -> Duration {
        self.receive_timeout
    }

    fn publish_messages(&mut self) {
        let messages = self.aggregator.recent_messages().cloned().collect();
        self.publisher.publish_messages(messages);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    use crate::codec;
    use crate::publish::{MemorySink, TelemetryReport};
    use crate::record::{Record, TimestampRecord};

    fn monitor(clock: &ManualClock) -> MonitorLoop<MemorySink, ManualClock> {
        MonitorLoop::new(MonitorConfig::default(), MemorySink::new(), clock.clone()).unwrap()
    }

    fn frame(count: usize) -> Vec<u8> {
        let records: Vec<Record> = (0..count)
            .map(|i| Record::Timestamp(TimestampRecord { clock_value: i as u64 }))
            .collect();
        codec::encode(&records).unwrap()
    }

    #[test]
    fn test_tick_once_per_second() {
        let clock = ManualClock::new(100.2);
        let mut monitor = monitor(&clock);

        assert!(!monitor.poll_tick());
        clock.set(100.9);
        assert!(!monitor.poll_tick());
        clock.set(101.0);
        assert!(monitor.poll_tick());
        assert!(!monitor.poll_tick());

        let reports = monitor.publisher().sink().reports();
        assert_eq!(reports.len(), 1);
        assert!(matches!(reports[0], TelemetryReport::Snapshot(_)));
    }

    #[test]
    fn test_data_lands_in_current_second() {
        let clock = ManualClock::new(100.5);
        let mut monitor = monitor(&clock);

        monitor.handle(InboundMessage::Data {
            metadata: DataMetadata::default(),
            payload: frame(3),
        });
        assert_eq!(monitor.aggregator().record_count(), 3);

        monitor.handle(InboundMessage::Data {
            metadata: DataMetadata::default(),
            payload: b"garbage".to_vec(),
        });
        assert_eq!(monitor.aggregator().stats().skipped_frames, 1);
    }

    #[test]
    fn test_legacy_info_becomes_run_event() {
        let clock = ManualClock::new(10.0);
        let mut monitor = monitor(&clock);

        monitor.handle(InboundMessage::Info {
            origin: "LArPix board".to_string(),
            text: "Beginning run".to_string(),
        });
        assert!(monitor.aggregator().run_state().is_running);
        let logged: Vec<&str> = monitor
            .aggregator()
            .recent_messages()
            .map(|m| m.text.as_str())
            .collect();
        assert_eq!(logged, vec!["Beginning run"]);

        clock.set(15.0);
        monitor.handle(InboundMessage::Run {
            origin: "LArPix board".to_string(),
            event: RunEvent::RunEnded,
        });
        assert!(!monitor.aggregator().run_state().is_running);
        assert_eq!(monitor.lifecycle().last_run().unwrap().duration_secs, 5.0);

        // one messages-only report per info/run message
        let reports = monitor.publisher().sink().reports();
        assert_eq!(reports.len(), 2);
        assert!(
            reports
                .iter()
                .all(|r| matches!(r, TelemetryReport::Messages(_)))
        );
    }

    #[test]
    fn test_state_ready_resets() {
        let clock = ManualClock::new(10.0);
        let mut monitor = monitor(&clock);
        monitor.handle(InboundMessage::Data {
            metadata: DataMetadata::default(),
            payload: frame(2),
        });

        monitor.handle(InboundMessage::State {
            new_state: DaqState::Ready,
        });
        assert_eq!(monitor.aggregator().record_count(), 0);
        assert_eq!(monitor.lifecycle().state(), DaqState::Ready);
    }

    #[test]
    fn test_step_with_channel_source() {
        let clock = ManualClock::new(10.0);
        let mut monitor = monitor(&clock);
        let (tx, mut rx) = mpsc::channel();

        tx.send(InboundMessage::Info {
            origin: "operator".to_string(),
            text: "note".to_string(),
        })
        .unwrap();
        monitor.step(&mut rx).unwrap();
        assert_eq!(monitor.aggregator().message_count(), 1);

        drop(tx);
        assert!(matches!(
            monitor.step(&mut rx),
            Err(TransportError::Disconnected)
        ));
    }

    #[test]
    fn test_run_stops_on_disconnect() {
        let clock = ManualClock::new(10.0);
        let mut monitor = monitor(&clock);
        let (tx, mut rx) = mpsc::channel();

        for _ in 0..3 {
            tx.send(InboundMessage::Data {
                metadata: DataMetadata::default(),
                payload: frame(1),
            })
            .unwrap();
        }
        drop(tx);

        let stop = AtomicBool::new(false);
        monitor.run(&mut rx, &stop).unwrap();
        assert_eq!(monitor.aggregator().record_count(), 3);
    }

    #[test]
    fn test_run_honors_stop_flag() {
        let clock = ManualClock::new(10.0);
        let mut monitor = monitor(&clock);
        let (_tx, mut rx) = mpsc::channel::<InboundMessage>();

        let stop = AtomicBool::new(true);
        monitor.run(&mut rx, &stop).unwrap();
        assert_eq!(monitor.publisher().health().delivered, 0);
    }

    #[test]
    fn test_sink_outage_does_not_stop_ingest() {
        let clock = ManualClock::new(10.0);
        let mut monitor = monitor(&clock);
        monitor.publisher_mut().sink_mut().set_failing(true);

        for second in 11..=15 {
            monitor.handle(InboundMessage::Data {
                metadata: DataMetadata::default(),
                payload: frame(2),
            });
            clock.set(f64::from(second));
            assert!(monitor.poll_tick());
        }

        assert_eq!(monitor.aggregator().record_count(), 10);
        assert_eq!(monitor.publisher().health().failed, 5);
        assert_eq!(monitor.snapshot().rate_list.len(), 5);
    }
}
