//! Writer configuration.
//!
//! [`WriterOptions`] collects every tunable of the event writer in one
//! serde-friendly struct. Fields are plain and public; [`Default`] encodes
//! the documented defaults and [`WriterOptions::validate`] rejects
//! incompatible combinations up front so that failures surface as
//! configuration errors instead of half-written files.
//!
//! The `effective_*` accessors apply the clamping rules (minimum buffer
//! size, ring sizing, default event cap) so the rest of the crate never
//! re-implements them.

use serde::{Deserialize, Serialize};

use crate::compression::CompressionType;
use crate::error::{EvioError, EvioResult};
use crate::format::ByteOrder;

/// Default per-record internal buffer capacity: 9 MB.
pub const DEFAULT_BUFFER_SIZE: u32 = 9_437_184;
/// Smallest allowed per-record buffer capacity: 1 MB.
pub const MIN_BUFFER_SIZE: u32 = 1_000_000;
/// Default soft target for uncompressed bytes per record: 8 MB.
pub const DEFAULT_RECORD_SIZE: u32 = 8 * 1024 * 1024;
/// Default cap on events per record.
pub const DEFAULT_MAX_EVENT_COUNT: u32 = 1_000_000;
/// Smallest ring the multi-threaded pipeline will run with.
pub const MIN_RING_SIZE: u32 = 16;

/// All tunables of an [`crate::writer::EventWriter`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterOptions {
    /// Byte order for everything written. Ignored when appending: the
    /// existing file's order wins.
    pub byte_order: ByteOrder,

    /// Payload codec for data records. The common record is never
    /// compressed.
    pub compression: CompressionType,

    /// Number of threads compressing records. `1` (or `0`) runs the whole
    /// fill/compress/write cycle on the caller's thread.
    pub compression_threads: u32,

    /// Number of in-flight records in the supply ring. Rounded up to a
    /// power of two at least `max(16, compression_threads + 2)`.
    pub ring_size: u32,

    /// Per-record internal buffer capacity in bytes. `0` selects the 9 MB
    /// default; anything smaller than 1 MB is raised to 1 MB.
    pub buffer_size: u32,

    /// Soft target for uncompressed data bytes per record. A record stops
    /// accepting events past this size, but a single oversized event is
    /// always accepted.
    pub max_record_size: u32,

    /// Cap on events per record. `0` selects the default of one million.
    pub max_event_count: u32,

    /// Target file size in bytes at which the output file is closed and a
    /// new one started. `0` disables splitting.
    pub split: u64,

    /// Directory the output files are placed in; empty means the base name
    /// is used as given.
    pub directory: String,

    /// Allow overwriting an existing file.
    pub overwrite_ok: bool,

    /// Append to an existing file instead of creating one.
    pub append: bool,

    /// Write the per-record index after the trailer header.
    pub add_trailer_index: bool,

    /// Run number substituted into the first file-name int specifier.
    pub run_number: u32,

    /// Run type substituted for `%s` in the base file name.
    pub run_type: String,

    /// Id of this output stream, used in split file naming.
    pub stream_id: u32,

    /// Split number of the first file written.
    pub split_number: u32,

    /// Amount the split number grows for each new file.
    pub split_increment: u32,

    /// Total number of parallel output streams in the DAQ.
    pub stream_count: u32,

    /// XML dictionary embedded in every file's common record.
    pub dictionary: Option<String>,

    /// Event bytes placed in every file's common record, ahead of data.
    pub first_event: Option<Vec<u8>>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        WriterOptions {
            byte_order: ByteOrder::Little,
            compression: CompressionType::None,
            compression_threads: 1,
            ring_size: MIN_RING_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_record_size: DEFAULT_RECORD_SIZE,
            max_event_count: DEFAULT_MAX_EVENT_COUNT,
            split: 0,
            directory: String::new(),
            overwrite_ok: false,
            append: false,
            add_trailer_index: true,
            run_number: 1,
            run_type: String::new(),
            stream_id: 0,
            split_number: 0,
            split_increment: 1,
            stream_count: 1,
            dictionary: None,
            first_event: None,
        }
    }
}

impl WriterOptions {
    /// Check option compatibility, reporting the first violation found.
    pub fn validate(&self) -> EvioResult<()> {
        if self.split_increment < 1 {
            return Err(EvioError::Config("splitIncrement < 1".into()));
        }
        if self.append {
            if self.split > 0 {
                return Err(EvioError::Config(
                    "cannot specify split when appending".into(),
                ));
            }
            if self.dictionary.is_some() || self.first_event.is_some() {
                return Err(EvioError::Config(
                    "cannot specify dictionary or first event when appending".into(),
                ));
            }
        }
        if let Some(dict) = &self.dictionary {
            // 56 is the minimum number of characters for a valid xml dictionary.
            if dict.len() < 56 {
                return Err(EvioError::Config(
                    "dictionary improper format, too few characters".into(),
                ));
            }
        }
        Ok(())
    }

    /// Buffer capacity after applying the default and the 1 MB floor.
    pub fn effective_buffer_size(&self) -> u32 {
        if self.buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            self.buffer_size.max(MIN_BUFFER_SIZE)
        }
    }

    /// Record size target after applying the default.
    pub fn effective_record_size(&self) -> u32 {
        if self.max_record_size == 0 {
            DEFAULT_RECORD_SIZE
        } else {
            self.max_record_size
        }
    }

    /// Event cap after applying the default.
    pub fn effective_max_event_count(&self) -> u32 {
        if self.max_event_count == 0 {
            DEFAULT_MAX_EVENT_COUNT
        } else {
            self.max_event_count
        }
    }

    /// Number of compression threads, at least 1.
    pub fn effective_compression_threads(&self) -> u32 {
        self.compression_threads.max(1)
    }

    /// Ring capacity: a power of two, at least `max(16, threads + 2)` so
    /// one record can be filled and one written while every compressor
    /// holds its own.
    pub fn effective_ring_size(&self) -> usize {
        let threads = self.effective_compression_threads();
        let floor = MIN_RING_SIZE.max(threads + 2).max(self.ring_size);
        floor.next_power_of_two() as usize
    }

    /// True when the fill/compress/write cycle runs on the caller thread.
    pub fn single_threaded(&self) -> bool {
        self.effective_compression_threads() == 1
    }
}
