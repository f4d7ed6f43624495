//! # pixmon
//!
//! Online monitor for pixel-detector ASIC readout.
//!
//! pixmon decodes the binary record stream produced by a pixel-detector
//! readout board and keeps live, bounded-memory telemetry for a monitoring
//! display: per-second record rates, per-pixel rates and their high-water
//! marks, an ADC amplitude window, recent records and operator messages.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Versioned, fixed-width wire codec with explicit failure modes
//! - Every window is bounded by configuration, not by input rate
//! - Completed per-second buckets are evicted on every tick
//! - Pixel layouts are swapped atomically; a bad layout never replaces a good one
//! - No internal clock or threads: the caller drives time, which keeps tests deterministic
//!
//! ## Quick Start
//!
//! ```rust
//! use pixmon::{ChipAssignment, LayoutDescription, MonitorConfig, WindowedAggregator};
//! use pixmon::record::{DataFlags, DataRecord, Record};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut agg = WindowedAggregator::new(MonitorConfig::default(), 100.0)?;
//! agg.load_layout(LayoutDescription {
//!     name: "demo".to_string(),
//!     io_group: 1,
//!     io_channel: 1,
//!     chips: vec![ChipAssignment(3, vec![Some(7)])],
//! })?;
//!
//! let hit = Record::Data(DataRecord {
//!     chip_group: 1,
//!     chip_channel_id: 1,
//!     chip_id: 3,
//!     channel: 0,
//!     timestamp: 12_345,
//!     adc_value: 80,
//!     parity_ok: true,
//!     flags: DataFlags::default(),
//! });
//!
//! // Round-trip through the wire format and ingest.
//! let frame = pixmon::codec::encode(&[hit])?;
//! agg.ingest_payload(&frame, 100);
//!
//! // A new second: finalize the last one.
//! agg.tick(101);
//! let snapshot = agg.snapshot(101.0);
//! assert_eq!(snapshot.rate_list, vec![1]);
//! assert_eq!(snapshot.rate_bypixel[7], 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`codec`] — Frame encode/decode
//! - [`layout`] — [`PixelMap`] and layout files
//! - [`aggregator`] — [`WindowedAggregator`], buckets, snapshots
//! - [`lifecycle`] — [`RunLifecycle`] run-boundary handling
//! - [`publish`] — [`ReportPublisher`] and telemetry sinks
//! - [`monitor`] — [`MonitorLoop`] tying it together
//!
//! ## Modules
//!
//! - [`record`] — Typed records and chip keys
//! - [`ring`] — Bounded FIFO used by every window
//! - [`config`] — Capacities and timing
//! - [`error`] — Error types

pub mod aggregator;
pub mod codec;
pub mod config;
pub mod error;
pub mod layout;
pub mod lifecycle;
pub mod monitor;
pub mod publish;
pub mod record;
pub mod ring;

pub use aggregator::{TelemetrySnapshot, WindowedAggregator};
pub use config::MonitorConfig;
pub use error::{PixmonError, Result};
pub use layout::{ChipAssignment, LayoutCatalog, LayoutDescription, PixelMap};
pub use lifecycle::{DaqState, RunEvent, RunLifecycle};
pub use monitor::{Clock, InboundMessage, MessageSource, MonitorLoop, SystemClock};
pub use publish::{ReportPublisher, TelemetryReport, TelemetrySink};
pub use record::{ChipKey, Record};
