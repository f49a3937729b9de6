//! The public event-writing facade.
//!
//! An [`EventWriter`] accepts opaque event byte blobs and streams them, in
//! order, into version-6 record-framed output: either a growing set of
//! split files or a single caller-supplied memory buffer.
//!
//! # Targets
//!
//! - **File, single-threaded compression** (`compression_threads <= 1`):
//!   the caller's thread fills, builds and writes records itself, with a
//!   bounded asynchronous write keeping the file I/O off the critical path.
//! - **File, multi-threaded compression**: filled records are published to
//!   a supply ring; compressor threads build them in parallel and a writer
//!   thread streams them out in publish order (see [`crate::ring`] and
//!   [`crate::workers`]).
//! - **Buffer**: one data record plus a trailer are written into a
//!   caller-provided `Vec<u8>` whose starting capacity is the hard limit.
//!
//! Any dictionary and/or first event live in an uncompressed *common
//! record* embedded as the file header's user header, so every split file
//! carries its own copy.
//!
//! # Example
//!
//! ```no_run
//! use rust_evio::config::WriterOptions;
//! use rust_evio::writer::EventWriter;
//!
//! # fn main() -> rust_evio::error::EvioResult<()> {
//! let options = WriterOptions {
//!     directory: "/daq/output".into(),
//!     split: 2_000_000_000,
//!     ..Default::default()
//! };
//! let mut writer = EventWriter::to_file("run_%06d", options)?;
//! writer.write_event(&[0u8; 40])?;
//! writer.close()?;
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::compression::CompressionType;
use crate::config::WriterOptions;
use crate::error::{EvioError, EvioResult};
use crate::file_io::{
    disk_is_full, AsyncFileWriter, CommonState, FileCloser, FileFactory, FileOutput, WriteHandle,
};
use crate::file_name::FileNaming;
use crate::format::record_header::build_trailer;
use crate::format::ByteOrder;
use crate::record::RecordBuffer;
use crate::ring::RecordSupply;
use crate::workers::{RecordCompressor, RecordWriter, WriterControl};

/// Writes events into record-framed files or a caller-supplied buffer.
#[derive(Debug)]
pub struct EventWriter {
    options: WriterOptions,
    byte_order: ByteOrder,
    compression: CompressionType,
    /// Rough compressed-size percentage, for the split threshold estimate.
    compression_factor: u64,
    target: Target,
    closed: bool,
    /// Next record number to assign; reset to 1 on every split.
    record_number: u32,
    /// Events accepted across all files of this writer.
    events_written_total: u64,
    /// Events in the multi-threaded path's currently claimed record.
    current_record_events: u32,
    /// Records flushed into the current file (producer view).
    records_in_current_file: u64,
    /// Uncompressed event bytes attributed to the current split file.
    split_event_bytes: u64,
    /// Events attributed to the current split file.
    split_event_count: u64,
    common: Arc<Mutex<CommonState>>,
    dictionary: Option<String>,
    first_event: Option<Vec<u8>>,
    event_type: u8,
    source_id: u64,
    force_id_counter: u64,
}

#[derive(Debug)]
enum Target {
    Buffer(BufferTarget),
    FileSingle(SingleTarget),
    FileMulti(MultiTarget),
}

#[derive(Debug)]
struct BufferTarget {
    buffer: Vec<u8>,
    /// Capacity the caller handed over; never exceeded.
    limit: usize,
    record: RecordBuffer,
    finalized: bool,
}

#[derive(Debug)]
struct SingleTarget {
    io: Arc<AsyncFileWriter>,
    factory: FileFactory,
    file: Option<FileOutput>,
    record: RecordBuffer,
    previous: Option<WriteHandle>,
    closer: FileCloser,
    disk_check_bytes: u64,
    disk_full: bool,
}

#[derive(Debug)]
struct MultiTarget {
    supply: Arc<RecordSupply>,
    compressors: Vec<RecordCompressor>,
    writer: Option<RecordWriter>,
    control: Arc<WriterControl>,
    /// Sequence of the ring slot currently being filled.
    current_seq: i64,
    disk_dir: PathBuf,
    disk_check_bytes: u64,
}

/// Set the per-record header fields the producer owns. The dictionary and
/// first-event bits only go on the first record of a file.
fn stamp_record(
    record: &mut RecordBuffer,
    number: u32,
    common: &CommonState,
    event_type: u8,
    source_id: u64,
) {
    let header = record.header_mut();
    header.record_number = number;
    let first = number == 1;
    header.has_dictionary = first && common.has_dictionary;
    header.has_first_event = first && common.has_first_event;
    header.event_type = event_type;
    header.user_register1 = source_id;
}

/// Rebuild the shared common record from the dictionary and first event.
fn build_common(
    common: &Arc<Mutex<CommonState>>,
    byte_order: ByteOrder,
    dictionary: &Option<String>,
    first_event: &Option<Vec<u8>>,
) -> EvioResult<()> {
    let mut state = CommonState::default();
    if dictionary.is_some() || first_event.is_some() {
        // The common record is never compressed and never full.
        let mut record =
            RecordBuffer::new(byte_order, CompressionType::None, u32::MAX, u32::MAX);
        if let Some(dict) = dictionary {
            record.add_event(dict.as_bytes());
            state.has_dictionary = true;
        }
        if let Some(event) = first_event {
            record.add_event(event);
            state.has_first_event = true;
        }
        record.build()?;
        state.bytes = record.binary_bytes();
    }
    if let Ok(mut guard) = common.lock() {
        *guard = state;
    }
    Ok(())
}

fn common_snapshot(common: &Arc<Mutex<CommonState>>) -> CommonState {
    common
        .lock()
        .map(|guard| guard.clone())
        .unwrap_or_default()
}

/// Bytes a trailer occupies in buffer mode: header plus one index pair for
/// the single data record.
fn buffer_trailer_bytes(add_index: bool) -> usize {
    crate::format::HEADER_SIZE_BYTES + if add_index { 8 } else { 0 }
}

/// Build the current single-threaded record and write it out.
///
/// With `check_disk` set and no file yet created, refuses with `Ok(false)`
/// when the partition cannot hold a whole further split. A `force` write
/// waits for its own completion and syncs.
#[allow(clippy::too_many_arguments)]
fn st_write_current(
    st: &mut SingleTarget,
    record_number: &mut u32,
    common: &CommonState,
    event_type: u8,
    source_id: u64,
    force: bool,
    check_disk: bool,
) -> EvioResult<bool> {
    if st.record.is_empty() {
        // Nothing buffered. A forced call still makes prior writes durable.
        if force {
            if let Some(previous) = st.previous.take() {
                previous.wait()?;
            }
            if let Some(out) = &st.file {
                out.sync()?;
            }
        }
        return Ok(true);
    }

    stamp_record(&mut st.record, *record_number, common, event_type, source_id);
    st.record.build()?;

    if st.file.is_none() {
        if check_disk && !force {
            let dir = st.factory.peek_directory();
            if disk_is_full(&dir, st.disk_check_bytes) {
                st.disk_full = true;
                return Ok(false);
            }
            st.disk_full = false;
        }
        st.file = Some(st.factory.create_next()?);
    }
    let Some(out) = st.file.as_mut() else {
        return Err(EvioError::State("file vanished during write".into()));
    };

    let handle = out.write_record(&st.io, st.record.binary_bytes(), st.record.header().event_count);
    if let Some(previous) = st.previous.take() {
        previous.wait()?;
    }
    st.previous = Some(handle);

    if force {
        if let Some(handle) = st.previous.take() {
            handle.wait()?;
        }
        out.sync()?;
    }

    *record_number += 1;
    st.record.reset();
    Ok(true)
}

/// Hand the current single-threaded file to a closer thread and reset
/// record numbering for the next file.
fn st_split(st: &mut SingleTarget, record_number: &mut u32, add_trailer_index: bool) {
    if let Some(out) = st.file.take() {
        debug!(path = %out.path.display(), records = out.records_written, "splitting file");
        st.closer
            .close_async(out, st.previous.take(), add_trailer_index);
    }
    *record_number = 1;
}

/// Publish the currently claimed ring slot and claim a fresh one, stamped
/// with the next record number.
fn mt_publish_and_claim(
    mt: &mut MultiTarget,
    record_number: &mut u32,
    common: &CommonState,
    event_type: u8,
    source_id: u64,
    current_events: &mut u32,
) -> EvioResult<()> {
    let item = mt.supply.item(mt.current_seq);
    mt.supply.publish(item);

    let item = mt.supply.get()?;
    // SAFETY: the producer owns a slot from get() until publish().
    #[allow(unsafe_code)]
    let record = unsafe { item.record_mut() };
    stamp_record(record, *record_number, common, event_type, source_id);
    *record_number += 1;
    mt.current_seq = item.sequence();
    *current_events = 0;
    Ok(())
}

/// Write the buffered record (if any) and the trailer into the caller's
/// buffer. Used by both `flush()` and `close()` in buffer mode.
fn finalize_buffer(
    bt: &mut BufferTarget,
    common: &CommonState,
    record_number: &mut u32,
    add_index: bool,
    byte_order: ByteOrder,
    event_type: u8,
    source_id: u64,
) -> EvioResult<()> {
    if bt.finalized {
        return Ok(());
    }

    let mut record_index: Vec<(u32, u32)> = Vec::new();
    if !bt.record.is_empty() {
        stamp_record(&mut bt.record, *record_number, common, event_type, source_id);
        bt.record.build_with_user_header(&common.bytes)?;
        let block = bt.record.binary_bytes();
        record_index.push((block.len() as u32, bt.record.header().event_count));

        if bt.buffer.len() + block.len() + buffer_trailer_bytes(add_index) > bt.limit {
            return Err(EvioError::Capacity(
                "buffer cannot hold the record and trailer".into(),
            ));
        }
        bt.buffer.extend_from_slice(&block);
        *record_number += 1;
    }

    let trailer = build_trailer(
        byte_order,
        *record_number,
        add_index.then_some(record_index.as_slice()),
    );
    if bt.buffer.len() + trailer.len() > bt.limit {
        return Err(EvioError::Capacity("not enough room in buffer".into()));
    }
    bt.buffer.extend_from_slice(&trailer);
    bt.finalized = true;
    Ok(())
}

impl EventWriter {
    /// Create a writer streaming records into one or more files.
    ///
    /// `base_name` may carry the naming specifiers described in
    /// [`crate::file_name`]; everything else comes from `options`. When
    /// appending, the existing file's byte order wins over the configured
    /// one, and split/dictionary/first-event options are rejected.
    pub fn to_file(base_name: &str, options: WriterOptions) -> EvioResult<EventWriter> {
        options.validate()?;

        let mut naming = FileNaming::new(
            base_name,
            &options.directory,
            &options.run_type,
            options.run_number,
            options.split > 0,
            options.split_number,
            options.split_increment,
            options.stream_id,
            options.stream_count,
        )?;

        let mut byte_order = options.byte_order;
        let mut append_output = None;
        if options.append {
            let (path, _) = naming.next_path()?;
            let existing_bytes = std::fs::metadata(&path)
                .map_err(|e| {
                    EvioError::Io(std::io::Error::new(
                        e.kind(),
                        format!("error opening file {}: {e}", path.display()),
                    ))
                })?
                .len();
            if existing_bytes > 0 {
                let output = FileOutput::open_append(path)?;
                // From here on the file's byte order is authoritative.
                byte_order = output.header.byte_order;
                append_output = Some(output);
            } else {
                // An existing but empty file appends like a fresh create.
                let header = crate::format::file_header::FileHeader::new(byte_order);
                append_output = Some(FileOutput::create(path, header, &[], true)?);
            }
        }

        let dictionary = options.dictionary.clone();
        let first_event = options.first_event.clone();
        let common = Arc::new(Mutex::new(CommonState::default()));
        build_common(&common, byte_order, &dictionary, &first_event)?;

        let factory = FileFactory::new(
            naming,
            byte_order,
            Arc::clone(&common),
            options.overwrite_ok,
        );

        if !options.append && !options.overwrite_ok {
            let path = factory.peek_next_path()?;
            if path.is_file() {
                return Err(EvioError::Config(format!(
                    "file {} exists, but user requested no over-writing",
                    path.display()
                )));
            }
        }

        let compression = options.compression;
        let mut record_number = 1u32;
        let mut events_written_total = 0u64;
        let mut records_in_current_file = 0u64;
        if let Some(output) = &append_output {
            record_number = output.records_written + 1;
            events_written_total = output.events_written;
            records_in_current_file = u64::from(output.records_written);
        }

        let target = if options.single_threaded() {
            let record = RecordBuffer::with_capacity(
                byte_order,
                compression,
                options.effective_max_event_count(),
                options.effective_record_size(),
                options.effective_buffer_size() as usize,
            );
            Target::FileSingle(SingleTarget {
                io: Arc::new(AsyncFileWriter::new()),
                factory,
                file: append_output,
                record,
                previous: None,
                closer: FileCloser::new(),
                disk_check_bytes: options.split,
                disk_full: false,
            })
        } else {
            let supply = Arc::new(RecordSupply::new(
                options.effective_ring_size(),
                byte_order,
                options.effective_compression_threads(),
                options.effective_max_event_count(),
                options.effective_record_size(),
                compression,
            )?);
            let disk_check_bytes = options.split + supply.max_ring_bytes();
            let disk_dir = factory.peek_directory();
            if append_output.is_none() && disk_is_full(&disk_dir, disk_check_bytes) {
                // Not enough room to even start; writers see the flag.
                supply.set_disk_full(true);
            }

            let io = Arc::new(AsyncFileWriter::new());
            let control = Arc::new(WriterControl::new());
            let compressors = (0..options.effective_compression_threads())
                .map(|id| RecordCompressor::spawn(id, compression, Arc::clone(&supply)))
                .collect();
            let writer = RecordWriter::spawn(
                Arc::clone(&supply),
                io,
                factory,
                append_output,
                options.split,
                disk_check_bytes,
                options.add_trailer_index,
                Arc::clone(&control),
            );

            // Claim the first blank record to fill.
            let item = supply.get()?;
            // SAFETY: the producer owns a slot from get() until publish().
            #[allow(unsafe_code)]
            let record = unsafe { item.record_mut() };
            stamp_record(
                record,
                record_number,
                &common_snapshot(&common),
                0,
                0,
            );
            let current_seq = item.sequence();
            record_number += 1;

            Target::FileMulti(MultiTarget {
                supply,
                compressors,
                writer: Some(writer),
                control,
                current_seq,
                disk_dir,
                disk_check_bytes,
            })
        };

        Ok(EventWriter {
            compression_factor: compression.expected_ratio_percent(),
            byte_order,
            compression,
            target,
            closed: false,
            record_number,
            events_written_total,
            current_record_events: 0,
            records_in_current_file,
            split_event_bytes: 0,
            split_event_count: 0,
            common,
            dictionary,
            first_event,
            event_type: 0,
            source_id: 0,
            force_id_counter: 0,
            options,
        })
    }

    /// Create a writer targeting `buffer`; its current capacity is the hard
    /// limit. After [`EventWriter::close`] the buffer holds one data record
    /// (if any events were written) followed by a trailer.
    pub fn to_buffer(mut buffer: Vec<u8>, options: WriterOptions) -> EvioResult<EventWriter> {
        let mut options = options;
        // A buffer is never appended to or split.
        options.append = false;
        options.split = 0;
        options.validate()?;

        let byte_order = options.byte_order;
        let compression = options.compression;
        let dictionary = options.dictionary.clone();
        let first_event = options.first_event.clone();
        let common = Arc::new(Mutex::new(CommonState::default()));
        build_common(&common, byte_order, &dictionary, &first_event)?;

        buffer.clear();
        let limit = buffer.capacity();
        let mut record = RecordBuffer::new(
            byte_order,
            compression,
            options.effective_max_event_count(),
            options.effective_record_size(),
        );
        let reserved = buffer_trailer_bytes(options.add_trailer_index)
            + common_snapshot(&common).bytes.len();
        record.set_hard_limit(Some(limit.saturating_sub(reserved)));

        Ok(EventWriter {
            compression_factor: compression.expected_ratio_percent(),
            byte_order,
            compression,
            target: Target::Buffer(BufferTarget {
                buffer,
                limit,
                record,
                finalized: false,
            }),
            closed: false,
            record_number: 1,
            events_written_total: 0,
            current_record_events: 0,
            records_in_current_file: 0,
            split_event_bytes: 0,
            split_event_count: 0,
            common,
            dictionary,
            first_event,
            event_type: 0,
            source_id: 0,
            force_id_counter: 0,
            options,
        })
    }

    /// Write one event.
    ///
    /// Returns `Ok(false)` only in buffer mode, when the event does not fit
    /// next to what the buffer already holds; call [`EventWriter::close`]
    /// to finalize. File modes always accept the event (a fresh record
    /// grows to any size) and block while the pipeline is saturated.
    pub fn write_event(&mut self, event: &[u8]) -> EvioResult<bool> {
        self.write_event_ext(event, false, false)
    }

    /// [`EventWriter::write_event`] with explicit force / own-record flags.
    ///
    /// `force` makes the event durable on disk before further events are
    /// accepted; `own_record` gives the event a record of its own, never
    /// packing it with others.
    pub fn write_event_ext(
        &mut self,
        event: &[u8],
        force: bool,
        own_record: bool,
    ) -> EvioResult<bool> {
        if self.closed {
            return Err(EvioError::State("close() has already been called".into()));
        }
        if let Target::Buffer(bt) = &mut self.target {
            let fits = bt.record.add_event(event);
            if fits {
                self.events_written_total += 1;
            }
            return Ok(fits);
        }
        if matches!(self.target, Target::FileSingle(_)) {
            self.write_file_st(event, force, own_record, false)
        } else {
            self.write_file_mt(event, force, own_record, false)
        }
    }

    /// Like [`EventWriter::write_event_ext`], but returns `Ok(false)`
    /// without writing when the disk partition is known to be full and
    /// `force` is unset. Do not mix with `write_event` on one writer.
    pub fn write_event_to_file(
        &mut self,
        event: &[u8],
        force: bool,
        own_record: bool,
    ) -> EvioResult<bool> {
        if self.closed {
            return Err(EvioError::State("close() has already been called".into()));
        }
        if matches!(self.target, Target::Buffer(_)) {
            return Err(EvioError::State(
                "cannot write to buffer with this method".into(),
            ));
        }

        if let Target::FileSingle(st) = &mut self.target {
            if st.disk_full && !force {
                // Re-probe: space may have been freed since.
                let dir = st.factory.peek_directory();
                if disk_is_full(&dir, st.disk_check_bytes) {
                    return Ok(false);
                }
                st.disk_full = false;
            }
        }
        if let Target::FileMulti(mt) = &mut self.target {
            if mt.supply.have_error() {
                mt.supply.error_alert();
                return Err(mt.supply.async_error());
            }
            if mt.supply.is_disk_full() && !force {
                if disk_is_full(&mt.disk_dir, mt.disk_check_bytes) {
                    return Ok(false);
                }
                mt.supply.set_disk_full(false);
            }
        }

        if matches!(self.target, Target::FileSingle(_)) {
            self.write_file_st(event, force, own_record, true)
        } else {
            self.write_file_mt(event, force, own_record, true)
        }
    }

    /// Would adding `bytes` more event bytes push the current file past the
    /// split threshold (with the expected compression factored in)?
    fn split_due(&self, bytes: usize) -> bool {
        self.options.split > 0
            && self.split_event_count > 0
            && (bytes as u64 + self.split_event_bytes) * self.compression_factor / 100
                > self.options.split
    }

    fn write_file_st(
        &mut self,
        event: &[u8],
        force: bool,
        own_record: bool,
        disk_checked: bool,
    ) -> EvioResult<bool> {
        let common = common_snapshot(&self.common);
        let splitting = self.split_due(event.len());
        self.split_event_bytes += event.len() as u64;
        self.split_event_count += 1;

        let Target::FileSingle(st) = &mut self.target else {
            return Err(EvioError::State("not a single-threaded file writer".into()));
        };

        if splitting {
            st_write_current(
                st,
                &mut self.record_number,
                &common,
                self.event_type,
                self.source_id,
                force,
                false,
            )?;
            st_split(st, &mut self.record_number, self.options.add_trailer_index);
            self.records_in_current_file = 0;
            self.split_event_bytes = event.len() as u64;
            self.split_event_count = 1;
        }

        if own_record && !st.record.is_empty() {
            if st_write_current(
                st,
                &mut self.record_number,
                &common,
                self.event_type,
                self.source_id,
                false,
                false,
            )? {
                self.records_in_current_file += 1;
            }
        }

        if !st.record.add_event(event) {
            // Flush what we have; a fresh record takes any event.
            let wrote = st_write_current(
                st,
                &mut self.record_number,
                &common,
                self.event_type,
                self.source_id,
                force,
                disk_checked,
            )?;
            if !wrote {
                // Disk full on the first record of a new file: undo and
                // report, the event was never added.
                self.split_event_bytes -= event.len() as u64;
                self.split_event_count -= 1;
                return Ok(false);
            }
            self.records_in_current_file += 1;
            let added = st.record.add_event(event);
            debug_assert!(added, "a fresh record must accept any event");
        }
        self.events_written_total += 1;

        if force || own_record {
            let wrote = st_write_current(
                st,
                &mut self.record_number,
                &common,
                self.event_type,
                self.source_id,
                force,
                disk_checked,
            )?;
            if !wrote {
                self.split_event_bytes -= event.len() as u64;
                self.split_event_count -= 1;
                return Ok(false);
            }
            self.records_in_current_file += 1;
        }
        Ok(true)
    }

    fn write_file_mt(
        &mut self,
        event: &[u8],
        force: bool,
        own_record: bool,
        disk_checked: bool,
    ) -> EvioResult<bool> {
        let common = common_snapshot(&self.common);

        {
            let Target::FileMulti(mt) = &self.target else {
                return Err(EvioError::State("not a multi-threaded file writer".into()));
            };
            // Surface any error a worker hit since the last call.
            if mt.supply.have_error() {
                mt.supply.error_alert();
                return Err(mt.supply.async_error());
            }
        }

        let splitting = self.split_due(event.len());
        self.split_event_bytes += event.len() as u64;
        self.split_event_count += 1;

        let Target::FileMulti(mt) = &mut self.target else {
            return Err(EvioError::State("not a multi-threaded file writer".into()));
        };

        if splitting {
            let item = mt.supply.item(mt.current_seq);
            item.set_split_file_after_write(true);
            if disk_checked {
                // The pending split was budgeted for; let it through even
                // on a "full" disk.
                item.set_check_disk(false);
            }
            // Record numbering restarts in the next file.
            self.record_number = 1;
            mt_publish_and_claim(
                mt,
                &mut self.record_number,
                &common,
                self.event_type,
                self.source_id,
                &mut self.current_record_events,
            )?;
            self.records_in_current_file = 0;
            self.split_event_bytes = event.len() as u64;
            self.split_event_count = 1;
        }

        if own_record && self.current_record_events > 0 {
            mt_publish_and_claim(
                mt,
                &mut self.record_number,
                &common,
                self.event_type,
                self.source_id,
                &mut self.current_record_events,
            )?;
            self.records_in_current_file += 1;
        }

        {
            let item = mt.supply.item(mt.current_seq);
            // SAFETY: the producer owns a slot from get() until publish().
            #[allow(unsafe_code)]
            let record = unsafe { item.record_mut() };
            if !record.add_event(event) {
                if disk_checked {
                    // First record of a possible new file: have the writer
                    // verify free space before creating it.
                    item.set_check_disk(true);
                }
                mt_publish_and_claim(
                    mt,
                    &mut self.record_number,
                    &common,
                    self.event_type,
                    self.source_id,
                    &mut self.current_record_events,
                )?;
                self.records_in_current_file += 1;
                let item = mt.supply.item(mt.current_seq);
                // SAFETY: freshly claimed by the producer just above.
                #[allow(unsafe_code)]
                let record = unsafe { item.record_mut() };
                let added = record.add_event(event);
                debug_assert!(added, "a fresh record must accept any event");
            }
        }
        self.events_written_total += 1;
        self.current_record_events += 1;

        if force {
            let item = mt.supply.item(mt.current_seq);
            if disk_checked {
                // Tag the record so the writer syncs exactly when it lands
                // and flushes everything ahead of it.
                self.force_id_counter += 1;
                item.set_id(self.force_id_counter);
                mt.control.set_forced_record_id(self.force_id_counter);
            } else {
                item.set_force_to_disk(true);
            }
            mt_publish_and_claim(
                mt,
                &mut self.record_number,
                &common,
                self.event_type,
                self.source_id,
                &mut self.current_record_events,
            )?;
            self.records_in_current_file += 1;
        } else if own_record {
            mt_publish_and_claim(
                mt,
                &mut self.record_number,
                &common,
                self.event_type,
                self.source_id,
                &mut self.current_record_events,
            )?;
            self.records_in_current_file += 1;
        }
        Ok(true)
    }

    /// Set (or replace) the event placed ahead of data in every file.
    ///
    /// If nothing has been written into the current file yet, the event
    /// only joins the common record and so lands in this file's header.
    /// Otherwise it is also written immediately as a regular event here,
    /// and future split files carry it in their headers. `None` removes
    /// the first event, keeping any dictionary.
    pub fn set_first_event(&mut self, event: Option<&[u8]>) -> EvioResult<()> {
        if self.closed {
            return Err(EvioError::State("close() has already been called".into()));
        }
        self.first_event = event.filter(|e| !e.is_empty()).map(<[u8]>::to_vec);
        build_common(&self.common, self.byte_order, &self.dictionary, &self.first_event)?;

        let file_has_content = match &self.target {
            Target::Buffer(_) => false,
            Target::FileSingle(st) => st
                .file
                .as_ref()
                .map(|f| f.records_written > 0)
                .unwrap_or(false),
            Target::FileMulti(_) => self.records_in_current_file > 0,
        };
        if file_has_content {
            if let Some(event) = self.first_event.clone() {
                self.write_event_ext(&event, false, false)?;
            }
        }
        Ok(())
    }

    /// Re-arm a closed buffer-mode writer against a new buffer, restarting
    /// record numbers at 1.
    pub fn set_buffer(&mut self, buffer: Vec<u8>) -> EvioResult<()> {
        self.set_buffer_with(buffer, 1)
    }

    /// Re-arm a closed buffer-mode writer against a new buffer, with an
    /// explicit starting record number.
    pub fn set_buffer_with(&mut self, mut buffer: Vec<u8>, record_number: u32) -> EvioResult<()> {
        let Target::Buffer(bt) = &mut self.target else {
            return Err(EvioError::State("writer is writing to a file".into()));
        };
        if !self.closed {
            return Err(EvioError::State(
                "close the writer before changing buffers".into(),
            ));
        }

        buffer.clear();
        bt.limit = buffer.capacity();
        bt.buffer = buffer;
        bt.finalized = false;
        bt.record.reset();
        let reserved = buffer_trailer_bytes(self.options.add_trailer_index)
            + common_snapshot(&self.common).bytes.len();
        bt.record
            .set_hard_limit(Some(bt.limit.saturating_sub(reserved)));

        self.closed = false;
        self.record_number = record_number;
        self.events_written_total = 0;
        Ok(())
    }

    /// Flush any partially filled record toward the target.
    ///
    /// In file modes the pending record is published/written and forced to
    /// disk; in buffer mode the buffer is finalized with a trailer (as
    /// `close()` would, but the writer stays usable for `close()` only).
    pub fn flush(&mut self) -> EvioResult<()> {
        if self.closed {
            return Ok(());
        }
        let common = common_snapshot(&self.common);
        match &mut self.target {
            Target::Buffer(bt) => finalize_buffer(
                bt,
                &common,
                &mut self.record_number,
                self.options.add_trailer_index,
                self.byte_order,
                self.event_type,
                self.source_id,
            ),
            Target::FileSingle(st) => {
                let had_events = !st.record.is_empty();
                if st_write_current(
                    st,
                    &mut self.record_number,
                    &common,
                    self.event_type,
                    self.source_id,
                    true,
                    false,
                )? && had_events
                {
                    self.records_in_current_file += 1;
                }
                Ok(())
            }
            Target::FileMulti(mt) => {
                if self.current_record_events > 0 {
                    let item = mt.supply.item(mt.current_seq);
                    item.set_force_to_disk(true);
                    mt_publish_and_claim(
                        mt,
                        &mut self.record_number,
                        &common,
                        self.event_type,
                        self.source_id,
                        &mut self.current_record_events,
                    )?;
                    self.records_in_current_file += 1;
                }
                Ok(())
            }
        }
    }

    /// Flush remaining data, write the trailer, patch the file header and
    /// release every thread and file handle. Idempotent; the first error is
    /// reported but cleanup always runs to completion.
    pub fn close(&mut self) -> EvioResult<()> {
        if self.closed {
            return Ok(());
        }
        let common = common_snapshot(&self.common);
        let mut first_error: Option<EvioError> = None;
        // Keep only the first error; cleanup always runs to completion.
        fn note(result: EvioResult<()>, first_error: &mut Option<EvioError>) {
            if let Err(e) = result {
                if first_error.is_none() {
                    *first_error = Some(e);
                }
            }
        }

        match &mut self.target {
            Target::Buffer(bt) => {
                note(
                    finalize_buffer(
                        bt,
                        &common,
                        &mut self.record_number,
                        self.options.add_trailer_index,
                        self.byte_order,
                        self.event_type,
                        self.source_id,
                    ),
                    &mut first_error,
                );
            }
            Target::FileSingle(st) => {
                note(
                    st_write_current(
                        st,
                        &mut self.record_number,
                        &common,
                        self.event_type,
                        self.source_id,
                        false,
                        false,
                    )
                    .map(|_| ()),
                    &mut first_error,
                );
                if st.file.is_none() {
                    // No events ever written: the file still gets a valid
                    // header and trailer.
                    match st.factory.create_next() {
                        Ok(out) => st.file = Some(out),
                        Err(e) => note(Err(e), &mut first_error),
                    }
                }
                if let Some(previous) = st.previous.take() {
                    note(previous.wait(), &mut first_error);
                }
                if let Some(out) = st.file.as_mut() {
                    note(
                        out.write_trailer(self.options.add_trailer_index),
                        &mut first_error,
                    );
                }
                st.file = None;
                st.closer.close();
            }
            Target::FileMulti(mt) => {
                if mt.supply.have_error() && first_error.is_none() {
                    first_error = Some(mt.supply.async_error());
                }
                if self.current_record_events > 0 {
                    let item = mt.supply.item(mt.current_seq);
                    mt.supply.publish(item);
                }
                if let Some(writer) = mt.writer.take() {
                    writer.wait_for_last_item(&mt.supply);
                    mt.supply.error_alert();
                    for compressor in &mut mt.compressors {
                        compressor.join();
                    }
                    if let Some(mut exit) = writer.into_exit() {
                        if let Some(handle) = exit.in_flight.take() {
                            note(handle.wait(), &mut first_error);
                        }
                        if exit.file.is_none() {
                            match exit.factory.create_next() {
                                Ok(out) => exit.file = Some(out),
                                Err(e) => note(Err(e), &mut first_error),
                            }
                        }
                        if let Some(out) = exit.file.as_mut() {
                            note(
                                out.write_trailer(self.options.add_trailer_index),
                                &mut first_error,
                            );
                        }
                        exit.closer.close();
                    }
                } else {
                    mt.supply.error_alert();
                }
            }
        }

        self.closed = true;
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Number with which the next record will be stamped.
    pub fn record_number(&self) -> u32 {
        self.record_number
    }

    /// Override the starting record number; ignored once events have been
    /// written.
    pub fn set_starting_record_number(&mut self, number: u32) {
        if self.events_written_total > 0 {
            return;
        }
        match &mut self.target {
            Target::FileMulti(mt) => {
                let item = mt.supply.item(mt.current_seq);
                // SAFETY: the producer owns the currently claimed slot.
                #[allow(unsafe_code)]
                let record = unsafe { item.record_mut() };
                record.header_mut().record_number = number;
                self.record_number = number + 1;
            }
            _ => self.record_number = number,
        }
    }

    /// Store the DAQ source id in record header user register 1 of records
    /// built from now on.
    pub fn set_source_id(&mut self, source_id: u64) {
        self.source_id = source_id;
        if let Target::FileMulti(mt) = &mut self.target {
            let item = mt.supply.item(mt.current_seq);
            // SAFETY: the producer owns the currently claimed slot.
            #[allow(unsafe_code)]
            let record = unsafe { item.record_mut() };
            record.header_mut().user_register1 = source_id;
        }
    }

    /// Tag the event-type bits (0-15) of record headers built from now on.
    pub fn set_event_type(&mut self, event_type: u8) {
        self.event_type = event_type & 0xf;
        if let Target::FileMulti(mt) = &mut self.target {
            let item = mt.supply.item(mt.current_seq);
            // SAFETY: the producer owns the currently claimed slot.
            #[allow(unsafe_code)]
            let record = unsafe { item.record_mut() };
            record.header_mut().event_type = self.event_type;
        }
    }

    /// Has `close()` been called (without re-arming via `set_buffer`)?
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Is this writer writing to files (as opposed to a buffer)?
    pub fn writing_to_file(&self) -> bool {
        !matches!(self.target, Target::Buffer(_))
    }

    /// Byte order of everything this writer produces.
    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    /// Codec applied to record payloads.
    pub fn compression(&self) -> CompressionType {
        self.compression
    }

    /// Events accepted so far, including those still in the current record
    /// and events recovered by an append scan.
    pub fn events_written(&self) -> u64 {
        self.events_written_total
    }

    /// Bytes written to the current target so far.
    pub fn bytes_written(&self) -> u64 {
        match &self.target {
            Target::Buffer(bt) => bt.buffer.len() as u64,
            Target::FileSingle(st) => st.file.as_ref().map(|f| f.position).unwrap_or(0),
            Target::FileMulti(mt) => mt
                .control
                .bytes_written
                .load(std::sync::atomic::Ordering::Acquire),
        }
    }

    /// Split number the next file will carry.
    pub fn split_number(&self) -> u32 {
        match &self.target {
            Target::Buffer(_) => 0,
            Target::FileSingle(st) => st.factory.split_number(),
            Target::FileMulti(mt) => mt
                .control
                .split_number
                .load(std::sync::atomic::Ordering::Acquire),
        }
    }

    /// Number of files created so far.
    pub fn split_count(&self) -> u32 {
        match &self.target {
            Target::Buffer(_) => 0,
            Target::FileSingle(st) => st.factory.split_count(),
            Target::FileMulti(mt) => mt
                .control
                .split_count
                .load(std::sync::atomic::Ordering::Acquire),
        }
    }

    /// Path of the file currently being written, if any.
    pub fn current_file_path(&self) -> Option<PathBuf> {
        match &self.target {
            Target::Buffer(_) => None,
            Target::FileSingle(st) => st.file.as_ref().map(|f| f.path.clone()),
            Target::FileMulti(mt) => mt
                .control
                .current_path
                .lock()
                .ok()
                .and_then(|guard| guard.clone()),
        }
    }

    /// Has writing stopped because the disk partition is full?
    pub fn is_disk_full(&self) -> bool {
        match &self.target {
            Target::Buffer(_) => false,
            Target::FileSingle(st) => st.disk_full,
            Target::FileMulti(mt) => mt.supply.is_disk_full(),
        }
    }

    /// The buffer contents written so far (buffer mode only).
    pub fn buffer(&self) -> Option<&[u8]> {
        match &self.target {
            Target::Buffer(bt) => Some(&bt.buffer),
            _ => None,
        }
    }

    /// Take the finished buffer out of a closed buffer-mode writer.
    pub fn take_buffer(&mut self) -> Option<Vec<u8>> {
        match &mut self.target {
            Target::Buffer(bt) => Some(std::mem::take(&mut bt.buffer)),
            _ => None,
        }
    }
}

impl Drop for EventWriter {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close();
        }
    }
}
