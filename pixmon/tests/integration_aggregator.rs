//! Integration tests for the aggregation flow.
//!
//! These tests drive the public API from encoded frames through ingest,
//! ticks and resets, checking the rolling windows a display would see.

#![allow(clippy::cast_possible_truncation)]

use pixmon::codec;
use pixmon::layout::{ChipAssignment, LayoutDescription};
use pixmon::record::{DataFlags, DataRecord, Record, TimestampRecord};
use pixmon::{MonitorConfig, WindowedAggregator};

/// Layout with chip 3 channel 0 on pixel 7 and chip 3 channel 1 on pixel 8.
fn layout() -> LayoutDescription {
    LayoutDescription {
        name: "integration".to_string(),
        io_group: 1,
        io_channel: 1,
        chips: vec![ChipAssignment(3, vec![Some(7), Some(8)])],
    }
}

fn hit(channel: u8, adc_value: u16) -> Record {
    Record::Data(DataRecord {
        chip_group: 1,
        chip_channel_id: 1,
        chip_id: 3,
        channel,
        timestamp: 1000,
        adc_value,
        parity_ok: true,
        flags: DataFlags::default(),
    })
}

fn aggregator(config: MonitorConfig) -> WindowedAggregator {
    let mut agg = WindowedAggregator::new(config, 0.0).unwrap();
    agg.load_layout(layout()).unwrap();
    agg
}

#[test]
fn test_end_to_end_pixel_rates() {
    let mut agg = aggregator(MonitorConfig::default());

    // Phase 1: five hits on pixel 7 during second 100
    let frame = codec::encode(&vec![hit(0, 50); 5]).unwrap();
    assert_eq!(agg.ingest_payload(&frame, 100).ingested, 5);
    agg.tick(101);

    // Phase 2: three hits during second 101
    let frame = codec::encode(&vec![hit(0, 60); 3]).unwrap();
    assert_eq!(agg.ingest_payload(&frame, 101).ingested, 3);
    agg.tick(102);

    let snapshot = agg.snapshot(102.0);
    assert_eq!(snapshot.rate_bypixel[7], 3);
    assert_eq!(snapshot.maxrate_bypixel[7], 5);
    assert_eq!(snapshot.rate_list, vec![5, 3]);
    assert_eq!(snapshot.rate_times, vec![100, 101]);
    assert_eq!(snapshot.adcs.len(), 8);
    assert_eq!(agg.live_buckets(), 0);
}

#[test]
fn test_eviction_order() {
    let mut agg = aggregator(MonitorConfig::default());
    for second in [10, 10, 10, 11, 11, 12] {
        agg.ingest(hit(1, 0), second);
    }

    agg.tick(11);
    agg.tick(12);
    agg.tick(13);

    assert_eq!(agg.snapshot(13.0).rate_list, vec![3, 2, 1]);
    for second in 10..=12 {
        assert!(agg.bucket(second).is_none(), "bucket {second} still live");
    }
}

#[test]
fn test_max_rate_is_monotonic() {
    let mut agg = aggregator(MonitorConfig::default());
    let per_second = [4u32, 9, 2, 0, 7, 9, 1];
    let mut previous_max = 0;

    for (offset, &count) in per_second.iter().enumerate() {
        let second = 1000 + offset as u64;
        for _ in 0..count {
            agg.ingest(hit(0, 0), second);
            let max = agg.snapshot(0.0).maxrate_bypixel[7];
            assert!(max >= previous_max);
            previous_max = max;
        }
        agg.tick(second + 1);

        let snapshot = agg.snapshot(0.0);
        assert!(snapshot.maxrate_bypixel[7] >= snapshot.rate_bypixel[7]);
        assert_eq!(snapshot.rate_bypixel[7], count);
    }

    assert_eq!(agg.snapshot(0.0).maxrate_bypixel[7], 9);
}

#[test]
fn test_bounded_memory() {
    let mut agg = aggregator(MonitorConfig::default());

    for i in 0..120_000u64 {
        agg.ingest(hit(0, (i % 1024) as u16), i / 1000);
    }
    assert_eq!(agg.record_count(), 100_000);

    for second in 1..=250u64 {
        agg.tick(second);
        assert!(agg.snapshot(0.0).rate_list.len() <= 100);
    }

    let snapshot = agg.snapshot(0.0);
    assert_eq!(snapshot.rate_list.len(), 100);
    assert_eq!(snapshot.adcs.len(), 1000);
    assert_eq!(agg.live_buckets(), 0);
}

#[test]
fn test_reset_mid_run() {
    let mut agg = aggregator(MonitorConfig::default());
    for second in 20..25 {
        agg.ingest(hit(0, 10), second);
        agg.ingest(hit(1, 20), second);
        agg.tick(second + 1);
    }
    agg.ingest(hit(0, 10), 25);
    let run_before = agg.run_state().run_number;

    agg.reset(30.0);

    let snapshot = agg.snapshot(31.0);
    assert!(snapshot.rate_list.is_empty());
    assert!(snapshot.adcs.is_empty());
    assert!(snapshot.maxrate_bypixel.iter().all(|&m| m == 0));
    assert_eq!(agg.live_buckets(), 0);
    assert_eq!(agg.run_state().run_number, run_before + 1);

    // layout survives the reset
    let tables = agg.pixels().tables();
    assert_eq!(tables.layout().map(|l| l.name.as_str()), Some("integration"));
    agg.ingest(hit(1, 0), 31);
    agg.tick(32);
    assert_eq!(agg.snapshot(32.0).rate_bypixel[8], 1);
}

#[test]
fn test_unmapped_channel() {
    let mut agg = aggregator(MonitorConfig::default());
    agg.ingest(hit(5, 0), 40);
    agg.tick(41);

    let snapshot = agg.snapshot(41.0);
    assert_eq!(snapshot.rate_list, vec![1]);
    assert!(snapshot.rate_bypixel.iter().all(|&c| c == 0));
    assert_eq!(agg.stats().unmapped, 1);
}

#[test]
fn test_mixed_frame_with_truncated_tail() {
    let mut agg = aggregator(MonitorConfig::default());
    let mut frame = codec::encode(&[
        hit(0, 1),
        Record::Timestamp(TimestampRecord { clock_value: 77 }),
        hit(1, 2),
    ])
    .unwrap();
    frame.extend_from_slice(&[0u8; 7]);

    assert!(matches!(
        codec::decode(&frame),
        Err(pixmon::error::FormatError::TruncatedRecord { remaining: 7, .. })
    ));

    let summary = agg.ingest_payload(&frame, 50);
    assert_eq!(summary.ingested, 3);
    assert_eq!(summary.skipped, 1);
    assert_eq!(agg.bucket(50).map(|b| b.total), Some(2));
}

#[test]
fn test_layout_reload_is_wholesale() {
    let mut agg = aggregator(MonitorConfig::default());

    let bad = LayoutDescription {
        name: "bad".to_string(),
        io_group: 1,
        io_channel: 1,
        chips: vec![
            ChipAssignment(3, vec![Some(1)]),
            ChipAssignment(4, vec![Some(1)]),
        ],
    };
    assert!(agg.load_layout(bad).is_err());

    agg.ingest(hit(0, 0), 60);
    agg.tick(61);
    assert_eq!(agg.snapshot(61.0).rate_bypixel[7], 1);
}
