//! # rust_evio
//!
//! A writer for the self-describing, version-6 binary event-data format
//! used by nuclear physics data-acquisition pipelines. Producers hand the
//! writer opaque event byte blobs; the writer packs them into records of a
//! fixed target size, optionally compresses each record on a pool of worker
//! threads, and streams the records to automatically split output files or
//! into a caller-supplied buffer.
//!
//! ## Crate Structure
//!
//! - **`writer`**: the [`writer::EventWriter`] facade producers call:
//!   `write_event`, splitting, forced syncs, append mode, `close()`.
//! - **`config`**: [`config::WriterOptions`] with every tunable and its
//!   validation rules.
//! - **`record`**: [`record::RecordBuffer`], the in-memory accumulator
//!   that frames events into self-contained record blocks.
//! - **`ring`**: the bounded supply ring coordinating the producer,
//!   compressor workers and the writer via sequence barriers.
//! - **`workers`**: the compressor and writer threads of the
//!   multi-threaded pipeline.
//! - **`file_io`**: asynchronous positioned writes, per-file lifecycle
//!   state (header, trailer, append scan) and split-file closers.
//! - **`file_name`**: run/split/stream substitution in output file names.
//! - **`format`**: the on-disk word layouts of file and record headers.
//! - **`compression`**: LZ4 and gzip payload codecs behind one interface.
//! - **`error`**: the [`error::EvioError`] classification used throughout.
//!
//! ## Writing a file
//!
//! ```no_run
//! use rust_evio::{EventWriter, WriterOptions};
//!
//! # fn main() -> rust_evio::error::EvioResult<()> {
//! let mut writer = EventWriter::to_file("run_%06d.evio", WriterOptions::default())?;
//! writer.write_event(&[0u8; 64])?;
//! writer.close()?;
//! # Ok(())
//! # }
//! ```

pub mod compression;
pub mod config;
pub mod error;
pub mod file_io;
pub mod file_name;
pub mod format;
pub mod record;
pub mod ring;
pub mod workers;
pub mod writer;

pub use compression::CompressionType;
pub use config::WriterOptions;
pub use error::{EvioError, EvioResult};
pub use format::ByteOrder;
pub use writer::EventWriter;
