//! CLI for the pixmon readout monitor.
//!
//! Provides commands for decoding captured frames, checking layout files,
//! and benchmarking the ingest path.

use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};
use pixmon::codec;
use pixmon::layout::{LayoutDescription, PixelTables};
use pixmon::record::{DataFlags, DataRecord, Record, TimestampRecord};
use pixmon::{MonitorConfig, WindowedAggregator};

/// pixmon — Pixel-detector readout monitor CLI.
#[derive(Parser)]
#[command(name = "pixmon", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Decode a captured wire frame and print its records.
    Decode {
        /// Path to a file holding one encoded frame.
        frame_path: PathBuf,

        /// Skip malformed records instead of failing on the first one.
        #[arg(long)]
        lossy: bool,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Validate a layout file and show its pixel assignments.
    Layout {
        /// Path to the layout JSON file.
        layout_path: PathBuf,

        /// Size of the per-pixel tables to validate against.
        #[arg(long, default_value = "832")]
        pixel_count: usize,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Run a decode-and-ingest microbenchmark.
    Bench {
        /// Number of records to ingest.
        #[arg(long, default_value = "10000000")]
        records: u64,

        /// Records per encoded frame.
        #[arg(long, default_value = "1000")]
        frame_size: usize,
    },
}

/// Output format for command results.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON document.
    Json,
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Decode {
            frame_path,
            lossy,
            format,
        } => cmd_decode(&frame_path, lossy, &format),
        Commands::Layout {
            layout_path,
            pixel_count,
            format,
        } => cmd_layout(&layout_path, pixel_count, &format),
        Commands::Bench {
            records,
            frame_size,
        } => cmd_bench(records, frame_size),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Implements `pixmon decode <frame_path>`.
fn cmd_decode(
    frame_path: &PathBuf,
    lossy: bool,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = std::fs::read(frame_path)?;
    let iter = codec::decode_iter(&bytes)?;
    let (major, minor) = iter.version();

    let mut records = Vec::new();
    let mut skipped = Vec::new();
    for result in iter {
        match result {
            Ok(record) => records.push(record),
            Err(e) if lossy => skipped.push(e.to_string()),
            Err(e) => return Err(e.into()),
        }
    }

    match format {
        OutputFormat::Csv => {
            println!(
                "# frame={}, version={major}.{minor}, records={}, skipped={}",
                frame_path.display(),
                records.len(),
                skipped.len()
            );
            println!("type,chip_key,channel,timestamp,adc,parity_ok,fifo_half,fifo_full,clock");
            for record in &records {
                match record {
                    Record::Data(d) => println!(
                        "data,{},{},{},{},{},{},{},",
                        d.chip_key(),
                        d.channel,
                        d.timestamp,
                        d.adc_value,
                        d.parity_ok,
                        d.flags.fifo_half,
                        d.flags.fifo_full
                    ),
                    Record::Timestamp(t) => println!("timestamp,,,,,,,,{}", t.clock_value),
                }
            }
            for reason in &skipped {
                eprintln!("skipped: {reason}");
            }
        }
        OutputFormat::Json => {
            let output = serde_json::json!({
                "frame": frame_path.display().to_string(),
                "version": format!("{major}.{minor}"),
                "count": records.len(),
                "records": records,
                "skipped": skipped,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Implements `pixmon layout <layout_path>`.
fn cmd_layout(
    layout_path: &PathBuf,
    pixel_count: usize,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let description = LayoutDescription::from_path(layout_path)?;
    let name = description.name.clone();
    let tables = PixelTables::build(description, pixel_count)?;

    match format {
        OutputFormat::Csv => {
            println!(
                "# layout={name}, chips={}, mapped_pixels={}, pixel_count={pixel_count}",
                tables.chip_count(),
                tables.mapped_pixels()
            );
            println!("pixel,chip_key,channel");
            for (pixel, address) in tables.report().lookup {
                println!("{pixel},{},{}", address.chip, address.channel);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&tables.report())?);
        }
    }

    Ok(())
}

/// Implements `pixmon bench`.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)] // Benchmark stats are fine with f64 precision
fn cmd_bench(records: u64, frame_size: usize) -> Result<(), Box<dyn std::error::Error>> {
    if frame_size == 0 {
        return Err("frame size must be greater than zero".into());
    }

    println!("pixmon decode+ingest benchmark");
    println!("  Records: {records}");
    println!("  Frame size: {frame_size}");
    println!();

    let frame_records: Vec<Record> = (0..frame_size)
        .map(|i| {
            if i % 64 == 0 {
                Record::Timestamp(TimestampRecord {
                    clock_value: i as u64,
                })
            } else {
                Record::Data(DataRecord {
                    chip_group: 1,
                    chip_channel_id: 1,
                    chip_id: (i % 8) as u16 + 1,
                    channel: (i % 64) as u8,
                    timestamp: (i % (1 << 24)) as u32,
                    adc_value: (i % 1024) as u16,
                    parity_ok: true,
                    flags: DataFlags::default(),
                })
            }
        })
        .collect();
    let frame = codec::encode(&frame_records)?;

    let mut agg = WindowedAggregator::new(MonitorConfig::default(), 0.0)?;
    let frames = records.div_ceil(frame_size as u64);

    println!("Ingesting {frames} frames...");

    let start = Instant::now();
    let mut ingested = 0u64;
    let mut second = 1u64;

    for i in 0..frames {
        ingested += agg.ingest_payload(&frame, second).ingested as u64;
        // advance one second every 100 frames
        if i % 100 == 99 {
            second += 1;
            agg.tick(second);
        }
    }

    let elapsed = start.elapsed();
    let ns_per_record = elapsed.as_nanos() as f64 / ingested as f64;
    let records_per_sec = ingested as f64 / elapsed.as_secs_f64();

    println!();
    println!("Results:");
    println!("  Total records: {ingested}");
    println!("  Elapsed: {elapsed:.3?}");
    println!("  Avg latency: {ns_per_record:.1} ns/record");
    println!("  Throughput: {records_per_sec:.0} records/sec");
    println!("  Seconds ticked: {}", agg.snapshot(0.0).rate_list.len());
    println!();

    Ok(())
}
