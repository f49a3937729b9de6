//! Demo driver: generate synthetic events and stream them to an event file.
//!
//! Useful for eyeballing throughput and for producing sample files, e.g.:
//!
//! ```text
//! rust_evio -n 100000 -s 2048 --compression lz4 --threads 4 \
//!     --output "run_%06d.evio" --split 2000000000
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::RngCore;
use tracing::info;

use rust_evio::{ByteOrder, CompressionType, EventWriter, WriterOptions};

#[derive(Parser, Debug)]
#[command(
    name = "rust_evio",
    about = "Write synthetic events into a version-6 event-data file"
)]
struct Args {
    /// Base file name; may contain run/split int specifiers like %06d.
    #[arg(short, long, default_value = "events_%d.evio")]
    output: String,

    /// Directory the output files are placed in.
    #[arg(short, long, default_value = "")]
    directory: String,

    /// Number of events to write.
    #[arg(short = 'n', long, default_value_t = 100_000)]
    events: u64,

    /// Size of each event in bytes.
    #[arg(short = 's', long, default_value_t = 1024)]
    event_size: usize,

    /// Payload codec: none, lz4, lz4best or gzip.
    #[arg(short, long, default_value = "none")]
    compression: String,

    /// Compression threads; 1 keeps everything on this thread.
    #[arg(short, long, default_value_t = 1)]
    threads: u32,

    /// Split files at this size in bytes; 0 writes one file.
    #[arg(long, default_value_t = 0)]
    split: u64,

    /// Byte order: little or big.
    #[arg(long, default_value = "little")]
    byte_order: String,

    /// Run number substituted into the file name.
    #[arg(long, default_value_t = 1)]
    run: u32,

    /// Overwrite existing output files.
    #[arg(long)]
    overwrite: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let compression = match args.compression.as_str() {
        "none" => CompressionType::None,
        "lz4" => CompressionType::Lz4,
        "lz4best" => CompressionType::Lz4Best,
        "gzip" => CompressionType::Gzip,
        other => bail!("unknown compression type '{other}'"),
    };
    let byte_order = match args.byte_order.as_str() {
        "little" => ByteOrder::Little,
        "big" => ByteOrder::Big,
        other => bail!("unknown byte order '{other}'"),
    };

    let options = WriterOptions {
        byte_order,
        compression,
        compression_threads: args.threads,
        split: args.split,
        directory: args.directory.clone(),
        run_number: args.run,
        overwrite_ok: args.overwrite,
        ..Default::default()
    };

    let mut writer =
        EventWriter::to_file(&args.output, options).context("could not create event writer")?;

    // Each event carries its sequence number up front so files written with
    // many compression threads can be checked for ordering, followed by
    // random (incompressible) filler.
    let mut rng = rand::thread_rng();
    let mut payload = vec![0u8; args.event_size.max(8)];
    let started = std::time::Instant::now();
    for sequence in 0..args.events {
        payload[..8].copy_from_slice(&sequence.to_le_bytes());
        rng.fill_bytes(&mut payload[8..]);
        writer
            .write_event(&payload)
            .with_context(|| format!("failed writing event {sequence}"))?;
    }
    writer.close().context("close failed")?;

    let elapsed = started.elapsed();
    let total_bytes = args.events * payload.len() as u64;
    info!(
        events = args.events,
        files = writer.split_count(),
        mb_per_s = format!(
            "{:.1}",
            total_bytes as f64 / 1.0e6 / elapsed.as_secs_f64().max(1e-9)
        ),
        "done in {:.2?}",
        elapsed
    );
    Ok(())
}
