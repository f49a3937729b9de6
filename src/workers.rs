//! Worker threads of the multi-threaded writing pipeline.
//!
//! [`RecordCompressor`] threads claim every Nth published ring slot, build
//! (and compress) the record in place and release it toward the write
//! barrier. The single [`RecordWriter`] thread consumes slots in strict
//! sequence order, issues asynchronous file writes, maintains the trailer
//! index, performs splits and forced syncs, and implements the full-disk
//! hold protocol.
//!
//! Workers never panic across the pipeline: any failure is recorded on the
//! supply and all barriers are alerted, so the producer re-raises the error
//! on its next call and every blocked thread wakes up and exits.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::compression::CompressionType;
use crate::file_io::{
    disk_is_full, AsyncFileWriter, FileCloser, FileFactory, FileOutput, WriteHandle,
};
use crate::ring::RecordSupply;

/// How long the writer sleeps between free-space probes while holding a
/// record on a full disk.
const DISK_FULL_POLL: Duration = Duration::from_secs(1);

/// One compression worker.
#[derive(Debug)]
pub struct RecordCompressor {
    thread_number: u32,
    handle: Option<JoinHandle<()>>,
}

impl RecordCompressor {
    /// Spawn worker `thread_number`, which takes published sequences
    /// `thread_number, thread_number + n, ...`.
    pub fn spawn(
        thread_number: u32,
        compression: CompressionType,
        supply: Arc<RecordSupply>,
    ) -> Self {
        let spawned = thread::Builder::new()
            .name(format!("evio-compressor-{thread_number}"))
            .spawn(move || {
                while let Some(item) = supply.get_to_compress(thread_number) {
                    // SAFETY: between get_to_compress and release_compressor
                    // this worker is the slot's only owner.
                    #[allow(unsafe_code)]
                    let record = unsafe { item.record_mut() };
                    record.header_mut().compression = compression;
                    if let Err(e) = record.build() {
                        supply.set_error(format!("compressor thread {thread_number}: {e}"));
                        supply.error_alert();
                        return;
                    }
                    supply.release_compressor(thread_number, item);
                }
                // Barrier alerted: clean exit.
            })
            .ok();
        RecordCompressor {
            thread_number,
            handle: spawned,
        }
    }

    /// Wait for the worker to exit (after the supply was alerted).
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(thread = self.thread_number, "compressor thread panicked");
            }
        }
    }
}

/// State shared between the facade and the writer thread.
#[derive(Debug)]
pub struct WriterControl {
    /// Highest sequence the writer has finished processing.
    pub last_seq_processed: AtomicI64,
    /// A forced write is pending somewhere in the pipeline.
    pub force_to_disk: AtomicBool,
    /// Id of the record that triggered the pending force.
    pub forced_record_id: AtomicU64,
    /// Bytes written to the current file, for introspection.
    pub bytes_written: AtomicU64,
    /// Split number the next file will carry.
    pub split_number: AtomicU32,
    /// Number of files created so far.
    pub split_count: AtomicU32,
    /// Path of the file currently being written.
    pub current_path: Mutex<Option<std::path::PathBuf>>,
}

impl WriterControl {
    /// Fresh control block.
    pub fn new() -> Self {
        WriterControl {
            last_seq_processed: AtomicI64::new(-1),
            force_to_disk: AtomicBool::new(false),
            forced_record_id: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            split_number: AtomicU32::new(0),
            split_count: AtomicU32::new(0),
            current_path: Mutex::new(None),
        }
    }

    /// Mark `id` as the record that must reach physical disk. The writer
    /// syncs when that record is written and clears the flag; every record
    /// ahead of it in the pipeline is flushed along the way.
    pub fn set_forced_record_id(&self, id: u64) {
        self.forced_record_id.store(id, Ordering::Release);
        self.force_to_disk.store(true, Ordering::Release);
    }

    fn set_current_path(&self, path: Option<std::path::PathBuf>) {
        if let Ok(mut guard) = self.current_path.lock() {
            *guard = path;
        }
    }
}

impl Default for WriterControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the writer thread still owns when it exits, recovered by the
/// facade through `join` to finish the last file.
#[derive(Debug)]
pub struct WriterExit {
    /// The file still being written, if any.
    pub file: Option<FileOutput>,
    /// The not-yet-awaited previous write.
    pub in_flight: Option<WriteHandle>,
    /// Closer threads for split-off files.
    pub closer: FileCloser,
    /// Naming/header state for files of this stream.
    pub factory: FileFactory,
}

/// A record held privately by the writer while the disk is full.
struct HeldRecord {
    data: Bytes,
    event_count: u32,
    split_after: bool,
    /// The producer flagged this record itself as force-to-disk.
    force_item: bool,
}

/// The single writing worker.
#[derive(Debug)]
pub struct RecordWriter {
    handle: Option<JoinHandle<WriterExit>>,
    control: Arc<WriterControl>,
}

struct WriterState {
    supply: Arc<RecordSupply>,
    io: Arc<AsyncFileWriter>,
    control: Arc<WriterControl>,
    factory: FileFactory,
    file: Option<FileOutput>,
    previous: Option<WriteHandle>,
    closer: FileCloser,
    split: u64,
    disk_check_bytes: u64,
    add_trailer_index: bool,
}

impl RecordWriter {
    /// Spawn the writer thread.
    ///
    /// `existing` carries a pre-opened file when appending; otherwise the
    /// first record write creates the first file. `disk_check_bytes` is the
    /// projected size of one full split plus a full supply ring, the amount
    /// of free space required before a new file is started.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        supply: Arc<RecordSupply>,
        io: Arc<AsyncFileWriter>,
        factory: FileFactory,
        existing: Option<FileOutput>,
        split: u64,
        disk_check_bytes: u64,
        add_trailer_index: bool,
        control: Arc<WriterControl>,
    ) -> Self {
        control.set_current_path(existing.as_ref().map(|f| f.path.clone()));
        let state = WriterState {
            supply,
            io,
            control: Arc::clone(&control),
            factory,
            file: existing,
            previous: None,
            closer: FileCloser::new(),
            split,
            disk_check_bytes,
            add_trailer_index,
        };
        let spawned = thread::Builder::new()
            .name("evio-record-writer".into())
            .spawn(move || run_writer(state))
            .ok();
        RecordWriter {
            handle: spawned,
            control,
        }
    }

    /// Spin until the writer has processed every published sequence. Called
    /// by `close()` before alerting the barriers.
    pub fn wait_for_last_item(&self, supply: &RecordSupply) {
        while supply.last_published() > self.control.last_seq_processed.load(Ordering::Acquire) {
            if supply.have_error() {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Join the thread (the supply must already be alerted) and recover the
    /// file state it owned.
    pub fn into_exit(mut self) -> Option<WriterExit> {
        self.handle.take().and_then(|handle| handle.join().ok())
    }
}

fn run_writer(mut state: WriterState) -> WriterExit {
    loop {
        let supply = Arc::clone(&state.supply);
        let Some(item) = supply.get_to_write() else {
            break; // barriers alerted, shut down
        };
        let seq = item.sequence();

        // Snapshot the record's built block and flags; the block is
        // reference counted, so the slot can be released before the write
        // completes.
        // SAFETY: between get_to_write and release_writer the writer is the
        // slot's only owner.
        #[allow(unsafe_code)]
        let record = unsafe { item.record_mut() };
        let held = HeldRecord {
            data: record.binary_bytes(),
            event_count: record.header().event_count,
            split_after: item.split_file_after_write(),
            force_item: item.force_to_disk(),
        };
        if record.header().compression != CompressionType::None {
            debug!(
                seq,
                ratio = format!("{:.2}", record.compression_ratio()),
                "record compressed"
            );
        }
        let check_disk = item.check_disk();
        let item_id = item.id();
        let mut released_early = false;

        // Only check the disk when about to create a new file, when asked
        // to, and when nothing is forcing writes through.
        if state.file.is_none()
            && check_disk
            && !state.control.force_to_disk.load(Ordering::Acquire)
        {
            let dir = state.factory.peek_directory();
            if disk_is_full(&dir, state.disk_check_bytes) {
                // Hold a private copy and release the slot so the producer
                // does not stall at get(); write_event_to_file callers see
                // the flag and back off.
                state.supply.set_disk_full(true);
                state.supply.release_writer(item);
                released_early = true;
                warn!(dir = %dir.display(), "disk full, holding record until space appears");
                loop {
                    thread::sleep(DISK_FULL_POLL);
                    if state.control.force_to_disk.load(Ordering::Acquire)
                        || !disk_is_full(&dir, state.disk_check_bytes)
                    {
                        break;
                    }
                }
                state.supply.set_disk_full(false);
            }
        }

        if let Err(e) = write_held(&mut state, &held, item_id) {
            state.supply.set_error(format!("record writer: {e}"));
            state.supply.error_alert();
            if !released_early {
                state.supply.release_writer(item);
            }
            break;
        }

        state.control.last_seq_processed.store(seq, Ordering::Release);
        if !released_early {
            state.supply.release_writer(item);
        }
    }

    WriterExit {
        file: state.file,
        in_flight: state.previous,
        closer: state.closer,
        factory: state.factory,
    }
}

/// Write one record block: create the file if needed, issue the
/// asynchronous write, then handle split / force / handle rotation.
fn write_held(
    state: &mut WriterState,
    held: &HeldRecord,
    item_id: u64,
) -> crate::error::EvioResult<()> {
    if state.file.is_none() {
        let output = state.factory.create_next()?;
        state.control.set_current_path(Some(output.path.clone()));
        state.control.bytes_written.store(output.position, Ordering::Release);
        state
            .control
            .split_number
            .store(state.factory.split_number(), Ordering::Release);
        state
            .control
            .split_count
            .store(state.factory.split_count(), Ordering::Release);
        state.file = Some(output);
    }
    let Some(output) = state.file.as_mut() else {
        return Err(crate::error::EvioError::State(
            "no open file to write into".into(),
        ));
    };

    let handle = output.write_record(&state.io, held.data.clone(), held.event_count);
    state
        .control
        .bytes_written
        .store(output.position, Ordering::Release);

    let forced_by_id = state.control.force_to_disk.load(Ordering::Acquire)
        && state.control.forced_record_id.load(Ordering::Acquire) == item_id;
    let forced = forced_by_id || held.force_item;

    if held.split_after {
        // The closer drains this file's last write, writes the trailer and
        // patches its header; the next record will open a fresh file.
        if let Some(previous) = state.previous.take() {
            previous.wait()?;
        }
        let finished = state.file.take();
        state.control.set_current_path(None);
        if let Some(finished) = finished {
            debug!(path = %finished.path.display(), records = finished.records_written, "splitting file");
            state
                .closer
                .close_async(finished, Some(handle), state.add_trailer_index);
        }
        state.control.bytes_written.store(0, Ordering::Release);
    } else if forced {
        // Make this record durable before clearing the force flag. Waiting
        // on this handle implies every earlier write has completed.
        if let Some(previous) = state.previous.take() {
            previous.wait()?;
        }
        handle.wait()?;
        output.sync()?;
        if forced_by_id {
            // Only the record that armed the force clears it again.
            state.control.force_to_disk.store(false, Ordering::Release);
        }
    } else {
        // Keep at most two writes in flight: wait out the previous one
        // before this handle takes its place.
        if let Some(previous) = state.previous.take() {
            previous.wait()?;
        }
        state.previous = Some(handle);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_name::FileNaming;
    use crate::format::ByteOrder;

    fn factory(dir: &std::path::Path) -> FileFactory {
        let naming = FileNaming::new(
            dir.join("events_%d").to_str().unwrap_or("events_%d"),
            "",
            "",
            1,
            false,
            0,
            1,
            0,
            1,
        )
        .unwrap();
        let common = Arc::new(Mutex::new(crate::file_io::CommonState::default()));
        FileFactory::new(naming, ByteOrder::Little, common, true)
    }

    #[test]
    fn pipeline_writes_published_records_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let supply = Arc::new(
            RecordSupply::new(
                8,
                ByteOrder::Little,
                2,
                100,
                1 << 20,
                CompressionType::Lz4,
            )
            .unwrap(),
        );
        let io = Arc::new(AsyncFileWriter::new());
        let control = Arc::new(WriterControl::new());

        let mut compressors: Vec<_> = (0..2)
            .map(|id| RecordCompressor::spawn(id, CompressionType::Lz4, Arc::clone(&supply)))
            .collect();
        let writer = RecordWriter::spawn(
            Arc::clone(&supply),
            io,
            factory(dir.path()),
            None,
            0,
            0,
            true,
            Arc::clone(&control),
        );

        for i in 0..20u32 {
            let item = supply.get().unwrap();
            // SAFETY: producer owns the slot until publish.
            #[allow(unsafe_code)]
            let record = unsafe { item.record_mut() };
            record.header_mut().record_number = i + 1;
            assert!(record.add_event(&i.to_le_bytes()));
            supply.publish(item);
        }

        writer.wait_for_last_item(&supply);
        supply.error_alert();
        for compressor in &mut compressors {
            compressor.join();
        }
        let mut exit = writer.into_exit().unwrap();
        if let Some(handle) = exit.in_flight.take() {
            handle.wait().unwrap();
        }
        let output = exit.file.as_ref().unwrap();
        assert_eq!(output.records_written, 20);
        assert_eq!(output.events_written, 20);
        assert_eq!(control.last_seq_processed.load(Ordering::Acquire), 19);
    }

    #[test]
    fn compressor_failure_surfaces_on_the_supply() {
        let supply = Arc::new(
            RecordSupply::new(
                4,
                ByteOrder::Little,
                1,
                100,
                1 << 20,
                CompressionType::None,
            )
            .unwrap(),
        );
        supply.set_error("compressor thread 0: synthetic".into());
        supply.error_alert();
        assert!(supply.have_error());
        assert!(supply.get_to_compress(0).is_none());
        assert!(supply.async_error().to_string().contains("synthetic"));
    }
}
