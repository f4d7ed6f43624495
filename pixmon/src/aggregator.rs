//! Windowed telemetry aggregation.
//!
//! The [`WindowedAggregator`] is the stateful core of the monitor. It folds
//! decoded records into per-second [`TimeBucket`]s, finalizes completed
//! buckets into bounded rolling history on [`tick`](WindowedAggregator::tick),
//! and assembles side-effect-free [`TelemetrySnapshot`]s for publishing.
//!
//! # Memory Bounds
//!
//! Every collection the aggregator owns is bounded:
//!
//! - raw records, rate history, ADC samples and messages are [`RingBuffer`]s
//!   sized by [`MonitorConfig`];
//! - per-pixel tables are fixed at `pixel_count` entries;
//! - live buckets only exist for seconds at or after the last tick. A tick
//!   at `now` removes every bucket older than `now`, so at most the current
//!   second (plus any records stamped ahead of the clock) is live.
//!
//! # Time
//!
//! The aggregator never reads the clock. Callers pass the arrival second to
//! [`ingest`](WindowedAggregator::ingest) and the current second to
//! [`tick`](WindowedAggregator::tick), which keeps every operation
//! deterministic under test.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::codec;
use crate::config::MonitorConfig;
use crate::error::{ConfigError, LayoutError};
use crate::layout::{LayoutDescription, PixelMap, PixelTables};
use crate::record::Record;
use crate::ring::RingBuffer;

/// Records received within one wall-clock second.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeBucket {
    /// Data records seen in this second, mapped or not.
    pub total: u64,
    /// Per-pixel hit counts. Allocated on the first mapped hit.
    pixel_counts: Vec<u32>,
}

impl TimeBucket {
    /// Counts a hit on `pixel` and returns the new in-progress count.
    fn record_pixel(&mut self, pixel: usize, pixel_count: usize) -> u32 {
        if self.pixel_counts.is_empty() {
            self.pixel_counts = vec![0; pixel_count];
        }
        match self.pixel_counts.get_mut(pixel) {
            Some(count) => {
                *count = count.saturating_add(1);
                *count
            }
            None => 0,
        }
    }

    /// Per-pixel counts; empty if no mapped hit arrived in this second.
    pub fn pixel_counts(&self) -> &[u32] {
        &self.pixel_counts
    }
}

/// An informational message kept for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogMessage {
    /// Component that sent the message.
    pub origin: String,
    /// Message text.
    pub text: String,
    /// Arrival time in Unix seconds.
    pub received_at: f64,
}

/// Bookkeeping for the current run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RunState {
    /// Incremented on every reset; never decremented.
    pub run_number: u64,
    /// Unix time of the last reset or run start.
    pub start_time: f64,
    /// Whether data taking is active.
    pub is_running: bool,
}

/// Counters describing what the aggregator has accepted and skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    /// Records ingested since startup.
    pub records: u64,
    /// Data records whose electronics address had no pixel.
    pub unmapped: u64,
    /// Records dropped because they failed to decode.
    pub skipped_records: u64,
    /// Frames dropped because their header failed to decode.
    pub skipped_frames: u64,
}

/// Outcome of ingesting one wire frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    /// Records decoded and ingested.
    pub ingested: usize,
    /// Records skipped as malformed.
    pub skipped: usize,
    /// Whether the whole frame was rejected.
    pub frame_rejected: bool,
}

/// A point-in-time read of every telemetry window.
///
/// Field names are the keys the display consumes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    /// Average record rate since the run start, formatted to two decimals.
    pub rate: String,
    /// Most recent records, newest first.
    pub packets: Vec<Record>,
    /// Most recent messages, newest first.
    pub messages: Vec<LogMessage>,
    /// Per-second record totals, oldest first.
    pub rate_list: Vec<u64>,
    /// Seconds matching `rate_list`.
    pub rate_times: Vec<u64>,
    /// Recent ADC samples, oldest first.
    pub adcs: Vec<u16>,
    /// Per-pixel counts of the last completed second.
    pub rate_bypixel: Vec<u32>,
    /// Per-pixel high-water marks for the run.
    pub maxrate_bypixel: Vec<u32>,
    /// Unformatted `rate`; `None` before any time has elapsed.
    #[serde(skip)]
    pub raw_rate: Option<f64>,
}

/// The stateful telemetry core.
///
/// # Example
///
/// ```rust
/// use pixmon::aggregator::WindowedAggregator;
/// use pixmon::config::MonitorConfig;
/// use pixmon::record::{Record, TimestampRecord};
///
/// let mut agg = WindowedAggregator::new(MonitorConfig::default(), 0.0).unwrap();
/// agg.ingest(Record::Timestamp(TimestampRecord { clock_value: 1 }), 10);
/// agg.tick(11);
///
/// let snapshot = agg.snapshot(11.0);
/// assert_eq!(snapshot.packets.len(), 1);
/// assert_eq!(snapshot.rate_list, vec![0]);
/// ```
#[derive(Debug, Clone)]
pub struct WindowedAggregator {
    config: MonitorConfig,
    pixels: PixelMap,
    records: RingBuffer<Record>,
    rate_history: RingBuffer<u64>,
    rate_timestamps: RingBuffer<u64>,
    adc_samples: RingBuffer<u16>,
    buckets: BTreeMap<u64, TimeBucket>,
    last_completed: Vec<u32>,
    max_rate: Vec<u32>,
    messages: RingBuffer<LogMessage>,
    last_tick: u64,
    run: RunState,
    stats: IngestStats,
}

impl WindowedAggregator {
    /// Creates an aggregator with no layout, starting its clock at `now`.
    ///
    /// # Errors
    ///
    /// Returns any [`MonitorConfig::validate`] error.
    pub fn new(config: MonitorConfig, now: f64) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            pixels: PixelMap::new(config.pixel_count),
            records: RingBuffer::new(config.raw_capacity),
            rate_history: RingBuffer::new(config.rate_history_capacity),
            rate_timestamps: RingBuffer::new(config.rate_history_capacity),
            adc_samples: RingBuffer::new(config.adc_capacity),
            buckets: BTreeMap::new(),
            last_completed: vec![0; config.pixel_count],
            max_rate: vec![0; config.pixel_count],
            messages: RingBuffer::new(config.message_capacity),
            last_tick: 0,
            run: RunState {
                run_number: 0,
                start_time: now,
                is_running: false,
            },
            stats: IngestStats::default(),
            config,
        })
    }

    /// Folds one record into the live windows.
    ///
    /// Data records count toward the bucket for `arrival_second`, their
    /// pixel (if mapped), the pixel's high-water mark and the ADC window.
    /// Every record lands in the raw record window. A record arriving for a
    /// second that has already been ticked counts toward the oldest live
    /// second instead.
    pub fn ingest(&mut self, record: Record, arrival_second: u64) {
        let second = arrival_second.max(self.last_tick);

        if let Record::Data(data) = &record {
            let bucket = self.buckets.entry(second).or_default();
            bucket.total += 1;

            match self.pixels.lookup_pixel(&data.chip_key(), data.channel) {
                Some(pixel) => {
                    let pixel = usize::from(pixel);
                    let count = bucket.record_pixel(pixel, self.config.pixel_count);
                    if let Some(max) = self.max_rate.get_mut(pixel) {
                        *max = (*max).max(count);
                    }
                }
                None => self.stats.unmapped += 1,
            }

            self.adc_samples.push(data.adc_value);
        }

        self.records.push(record);
        self.stats.records += 1;
    }

    /// Decodes a wire frame and ingests every well-formed record in it.
    ///
    /// Malformed records are skipped individually; a frame with a bad header
    /// is skipped whole. Neither is an error for the caller.
    pub fn ingest_payload(&mut self, payload: &[u8], arrival_second: u64) -> IngestSummary {
        let mut summary = IngestSummary::default();

        let records = match codec::decode_iter(payload) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, len = payload.len(), "skipping frame");
                self.stats.skipped_frames += 1;
                summary.frame_rejected = true;
                return summary;
            }
        };

        for result in records {
            match result {
                Ok(record) => {
                    self.ingest(record, arrival_second);
                    summary.ingested += 1;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "skipping record");
                    self.stats.skipped_records += 1;
                    summary.skipped += 1;
                }
            }
        }

        if summary.skipped > 0 {
            tracing::warn!(
                skipped = summary.skipped,
                ingested = summary.ingested,
                "frame contained malformed records"
            );
        }

        summary
    }

    /// Finalizes every second before `now_second` into the rate history.
    ///
    /// Each completed second since the last tick is pushed oldest first, as
    /// zero if nothing arrived in it, so `rate_times` has no gaps. Only the
    /// most recent `rate_history_capacity` seconds of a long gap are pushed;
    /// older ones would be evicted anyway. Completed buckets are deleted from
    /// the live table, and the per-pixel counts of `now_second - 1` become
    /// the reported per-pixel rate. Returns `false` (and does nothing)
    /// unless `now_second` is past the last tick.
    pub fn tick(&mut self, now_second: u64) -> bool {
        if now_second <= self.last_tick {
            return false;
        }

        let live = self.buckets.split_off(&now_second);
        let mut completed = std::mem::replace(&mut self.buckets, live);
        let previous = now_second - 1;

        // Before the first tick there is no last second; start at the
        // earliest bucket seen.
        let first = if self.last_tick == 0 {
            completed.keys().next().map_or(previous, |&s| s.min(previous))
        } else {
            self.last_tick
        };
        let window = u64::try_from(self.rate_history.capacity()).unwrap_or(u64::MAX);
        let first = first.max(now_second.saturating_sub(window));

        for bucket in completed.values() {
            for (max, &count) in self.max_rate.iter_mut().zip(bucket.pixel_counts()) {
                *max = (*max).max(count);
            }
        }

        for second in first..now_second {
            let total = completed.get(&second).map_or(0, |b| b.total);
            self.rate_history.push(total);
            self.rate_timestamps.push(second);
        }

        self.last_completed.fill(0);
        if let Some(bucket) = completed.remove(&previous) {
            for (slot, &count) in self.last_completed.iter_mut().zip(bucket.pixel_counts()) {
                *slot = count;
            }
        }

        self.last_tick = now_second;
        true
    }

    /// Clears every statistics window for a new run.
    ///
    /// The pixel layout and the message log survive; `run_number` is
    /// incremented and the rate clock restarts at `now`.
    pub fn reset(&mut self, now: f64) {
        self.records.clear();
        self.rate_history.clear();
        self.rate_timestamps.clear();
        self.buckets.clear();
        self.adc_samples.clear();
        self.last_completed.fill(0);
        self.max_rate.fill(0);

        self.run.start_time = now;
        self.run.run_number += 1;

        tracing::info!(run_number = self.run.run_number, "statistics reset");
    }

    /// Average record rate since the run clock started.
    ///
    /// Returns `None` if no time has elapsed.
    #[allow(clippy::cast_precision_loss)] // record counts are far below 2^52
    pub fn data_rate(&self, now: f64) -> Option<f64> {
        let elapsed = now - self.run.start_time;
        if elapsed <= 0.0 {
            return None;
        }
        Some(self.records.len() as f64 / elapsed)
    }

    /// Reads every window into a snapshot without changing any state.
    pub fn snapshot(&self, now: f64) -> TelemetrySnapshot {
        let raw_rate = self.data_rate(now);

        TelemetrySnapshot {
            rate: format!("{:.2}", raw_rate.unwrap_or(0.0)),
            packets: self.recent_records().copied().collect(),
            messages: self.recent_messages().cloned().collect(),
            rate_list: self.rate_history.to_vec(),
            rate_times: self.rate_timestamps.to_vec(),
            adcs: self.adc_samples.to_vec(),
            rate_bypixel: self.last_completed.clone(),
            maxrate_bypixel: self.max_rate.clone(),
            raw_rate,
        }
    }

    /// Most recent messages, newest first, up to `recent_messages`.
    pub fn recent_messages(&self) -> impl Iterator<Item = &LogMessage> {
        self.messages.newest_first(self.config.recent_messages)
    }

    /// Most recent records, newest first, up to `recent_records`.
    pub fn recent_records(&self) -> impl Iterator<Item = &Record> {
        self.records.newest_first(self.config.recent_records)
    }

    /// Appends an informational message to the message log.
    pub fn record_message(&mut self, origin: impl Into<String>, text: impl Into<String>, now: f64) {
        self.messages.push(LogMessage {
            origin: origin.into(),
            text: text.into(),
            received_at: now,
        });
    }

    /// Marks data taking as started and restarts the rate clock.
    pub fn begin_run(&mut self, now: f64) {
        self.run.is_running = true;
        self.run.start_time = now;
    }

    /// Marks data taking as stopped and returns the run's duration in seconds.
    pub fn end_run(&mut self, now: f64) -> f64 {
        self.run.is_running = false;
        (now - self.run.start_time).max(0.0)
    }

    /// Builds and activates a new pixel layout.
    ///
    /// The current layout stays active if the new one is invalid.
    ///
    /// # Errors
    ///
    /// See [`PixelTables::build`].
    pub fn load_layout(&mut self, layout: LayoutDescription) -> Result<Arc<PixelTables>, LayoutError> {
        self.pixels.load(layout)
    }

    /// Activates tables built elsewhere.
    pub fn replace_layout(&mut self, tables: Arc<PixelTables>) {
        self.pixels.replace(tables);
    }

    /// The active pixel map.
    pub fn pixels(&self) -> &PixelMap {
        &self.pixels
    }

    /// The current run bookkeeping.
    pub fn run_state(&self) -> RunState {
        self.run
    }

    /// Ingest counters since startup.
    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    /// The second of the last tick, or 0 before the first.
    pub fn last_tick(&self) -> u64 {
        self.last_tick
    }

    /// Number of seconds with live, unfinalized buckets.
    pub fn live_buckets(&self) -> usize {
        self.buckets.len()
    }

    /// The live bucket for `second`, if any.
    pub fn bucket(&self, second: u64) -> Option<&TimeBucket> {
        self.buckets.get(&second)
    }

    /// Records currently held in the raw window.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Messages currently held in the message log.
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// The configuration the aggregator was built with.
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }
}
