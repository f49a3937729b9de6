//! Asynchronous file writing and per-file lifecycle state.
//!
//! Record blocks are written by a dedicated I/O thread fed through a
//! channel; each submission returns a [`WriteHandle`] the caller can block
//! on. Payloads are reference-counted [`Bytes`], so the submitting side may
//! recycle its record slot while the write is still in flight. The writer
//! thread keeps at most two writes outstanding by waiting on the previous
//! handle before releasing a slot.
//!
//! [`FileOutput`] owns everything belonging to one output file: the handle,
//! the header as written, the single tracked write position, and the
//! record-length list that becomes the trailer index. On a split the whole
//! `FileOutput` is handed to a [`FileCloser`] thread, which drains the last
//! in-flight write, writes the trailer, patches the file header and closes,
//! while the writer moves on to the next file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use tracing::{debug, error, warn};

use crate::error::{EvioError, EvioResult};
use crate::format::file_header::{
    FileHeader, BIT_INFO_OFFSET, RECORD_COUNT_OFFSET, TRAILER_POSITION_OFFSET,
};
use crate::format::record_header::{self, RecordHeader, APPEND_SCAN_BYTES};
use crate::format::{ByteOrder, HEADER_SIZE_BYTES};

/// Safety margin of free space kept beyond the projected next file: 10 MB.
pub const DISK_FULL_MARGIN: u64 = 10_000_000;

struct WriteRequest {
    file: Arc<File>,
    offset: u64,
    data: Bytes,
    done: Sender<std::io::Result<()>>,
}

/// Completion handle for one submitted write.
#[derive(Debug)]
pub struct WriteHandle {
    rx: Receiver<std::io::Result<()>>,
}

impl WriteHandle {
    /// Block until the write finishes, surfacing any I/O failure.
    pub fn wait(self) -> EvioResult<()> {
        match self.rx.recv() {
            Ok(result) => result.map_err(EvioError::from),
            Err(_) => Err(EvioError::Async("file writing task terminated".into())),
        }
    }
}

/// The background write task: one thread draining a request channel.
#[derive(Debug)]
pub struct AsyncFileWriter {
    tx: Option<Sender<WriteRequest>>,
    worker: Option<JoinHandle<()>>,
}

impl AsyncFileWriter {
    /// Spawn the I/O thread.
    pub fn new() -> Self {
        let (tx, rx): (Sender<WriteRequest>, Receiver<WriteRequest>) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("evio-file-io".into())
            .spawn(move || {
                for request in rx {
                    let result = write_all_at(&request.file, request.offset, &request.data);
                    // The submitter may already be gone; nothing to do then.
                    let _ = request.done.send(result);
                }
            })
            .ok();
        AsyncFileWriter {
            tx: Some(tx),
            worker,
        }
    }

    /// Queue one positioned write and return its completion handle.
    ///
    /// Requests are processed in submission order.
    pub fn submit(&self, file: Arc<File>, offset: u64, data: Bytes) -> WriteHandle {
        let (done, rx) = mpsc::channel();
        if let Some(tx) = &self.tx {
            // A closed channel surfaces through the handle as a terminated
            // task, so the send result needs no separate handling.
            let _ = tx.send(WriteRequest {
                file,
                offset,
                data,
                done,
            });
        }
        WriteHandle { rx }
    }
}

impl Default for AsyncFileWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AsyncFileWriter {
    fn drop(&mut self) {
        // Closing the channel lets the thread drain pending requests and
        // exit; completion handles stay valid because results are buffered.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn write_all_at(file: &Arc<File>, offset: u64, data: &[u8]) -> std::io::Result<()> {
    let mut handle: &File = file;
    handle.seek(SeekFrom::Start(offset))?;
    handle.write_all(data)
}

/// Everything owned per open output file.
#[derive(Debug)]
pub struct FileOutput {
    /// Path of the file being written.
    pub path: PathBuf,
    file: Arc<File>,
    /// The file header exactly as written at offset 0 (patched at close).
    pub header: FileHeader,
    /// The single tracked write position; every write seeks to it.
    pub position: u64,
    /// `(length bytes, event count)` per data record, for the trailer index.
    pub record_lengths: Vec<(u32, u32)>,
    /// Data records written so far (excludes the trailer).
    pub records_written: u32,
    /// Events written into this file so far.
    pub events_written: u64,
}

impl FileOutput {
    /// Create (or truncate) the file and synchronously write the file
    /// header with the common record embedded as its user header.
    ///
    /// Fails with a configuration error if the file exists and neither
    /// overwriting nor appending was requested.
    pub fn create(
        path: PathBuf,
        mut header: FileHeader,
        common_record: &[u8],
        overwrite_ok: bool,
    ) -> EvioResult<FileOutput> {
        if !overwrite_ok && path.is_file() {
            return Err(EvioError::Config(format!(
                "file {} exists, but user requested no over-writing",
                path.display()
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        header.user_header_length = common_record.len() as u32;
        let pad = header.user_header_padding();
        let total = HEADER_SIZE_BYTES + common_record.len() + pad;

        let mut block = vec![0u8; total];
        header.write(&mut block);
        block[HEADER_SIZE_BYTES..HEADER_SIZE_BYTES + common_record.len()]
            .copy_from_slice(common_record);
        (&file).write_all(&block)?;

        debug!(
            path = %path.display(),
            file_number = header.file_number,
            user_header = common_record.len(),
            "created event file"
        );

        Ok(FileOutput {
            path,
            file: Arc::new(file),
            header,
            position: total as u64,
            record_lengths: Vec::new(),
            records_written: 0,
            events_written: 0,
        })
    }

    /// Open an existing file for appending.
    ///
    /// Reads the file header (detecting byte order from the magic word),
    /// then walks record headers until a trailer, a record with the is-last
    /// bit, or EOF. Data-bearing records are added to the trailer-index
    /// list; a terminal trailer or empty last record is backed over and
    /// truncated away; a terminal data record has its is-last bit cleared
    /// in place.
    pub fn open_append(path: PathBuf) -> EvioResult<FileOutput> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_size = file.metadata()?.len();

        if file_size == 0 {
            // An empty file appends like a fresh create; caller writes the
            // header itself in that case.
            return Err(EvioError::Format(format!(
                "cannot append to empty file {}",
                path.display()
            )));
        }

        let mut header_bytes = [0u8; HEADER_SIZE_BYTES];
        let mut handle: &File = &file;
        handle.seek(SeekFrom::Start(0))?;
        handle.read_exact(&mut header_bytes).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                EvioError::Format(format!(
                    "{} is too short for a file header",
                    path.display()
                ))
            } else {
                EvioError::Io(e)
            }
        })?;
        let header = FileHeader::read(&header_bytes)?;
        let order = header.byte_order;

        // Jump over the file header, index array, and user header + padding.
        let mut position = (HEADER_SIZE_BYTES
            + header.index_length as usize
            + header.user_header_length as usize
            + header.user_header_padding()) as u64;

        let mut record_lengths = Vec::new();
        let mut records_written = 0u32;
        let mut events_written = 0u64;
        let mut scan = [0u8; APPEND_SCAN_BYTES];

        loop {
            handle.seek(SeekFrom::Start(position))?;
            let n = read_up_to(handle, &mut scan)?;
            if n == 0 {
                // Normally terminated file missing its empty last record.
                break;
            }
            if n < APPEND_SCAN_BYTES {
                return Err(EvioError::Format(format!(
                    "premature EOF inside a record header of {}",
                    path.display()
                )));
            }

            let record_words = order.get_u32(&scan[record_header::RECORD_LENGTH_OFFSET..]);
            let event_count = order.get_u32(&scan[record_header::EVENT_COUNT_OFFSET..]);
            let bit_info = order.get_u32(&scan[record_header::BIT_INFO_OFFSET..]);
            if bit_info & 0xff != crate::format::FORMAT_VERSION {
                return Err(EvioError::Format(format!(
                    "record header with version {} while appending",
                    bit_info & 0xff
                )));
            }
            if record_words < crate::format::HEADER_SIZE_WORDS {
                return Err(EvioError::Format(format!(
                    "impossible record length of {record_words} words while appending"
                )));
            }
            let record_bytes = u64::from(record_words) * 4;
            let is_trailer = RecordHeader::is_trailer(bit_info);
            let is_last = RecordHeader::is_last_record(bit_info);

            if is_trailer || (is_last && event_count == 0) {
                // Back up so the next record overwrites it, and drop any
                // stale trailer/index bytes past this point.
                file.set_len(position)?;
                break;
            }

            record_lengths.push((record_bytes as u32, event_count));
            records_written += 1;
            events_written += u64::from(event_count);

            if is_last {
                // Terminal record with data: clear its is-last bit in place
                // and position past it.
                let cleared = RecordHeader::clear_last_record_bit(bit_info);
                let mut word = [0u8; 4];
                order.put_u32(&mut word, cleared);
                handle.seek(SeekFrom::Start(
                    position + record_header::BIT_INFO_OFFSET as u64,
                ))?;
                handle.write_all(&word)?;
                position += record_bytes;
                file.set_len(position)?;
                break;
            }

            if position + record_bytes > file_size {
                return Err(EvioError::Format(format!(
                    "record length runs past EOF in {}",
                    path.display()
                )));
            }
            position += record_bytes;
        }

        debug!(
            path = %path.display(),
            records = records_written,
            events = events_written,
            position,
            "positioned for append"
        );

        Ok(FileOutput {
            path,
            file: Arc::new(file),
            header,
            position,
            record_lengths,
            records_written,
            events_written,
        })
    }

    /// Shared handle for submitting asynchronous writes.
    pub fn file(&self) -> Arc<File> {
        Arc::clone(&self.file)
    }

    /// Queue an asynchronous write of one built record block at the current
    /// write position and account for it.
    pub fn write_record(
        &mut self,
        io: &AsyncFileWriter,
        data: Bytes,
        event_count: u32,
    ) -> WriteHandle {
        let length = data.len() as u32;
        self.record_lengths.push((length, event_count));
        let handle = io.submit(self.file(), self.position, data);
        self.position += u64::from(length);
        self.records_written += 1;
        self.events_written += u64::from(event_count);
        handle
    }

    /// Synchronously write the trailer and patch the file header's
    /// trailer-position, bit-info and record-count words.
    ///
    /// The caller must have drained any in-flight writes to this file.
    pub fn write_trailer(&mut self, add_index: bool) -> EvioResult<()> {
        let trailer_position = self.position;
        let order = self.header.byte_order;
        let index = add_index.then_some(self.record_lengths.as_slice());
        let block =
            record_header::build_trailer(order, self.records_written + 1, index);

        let mut handle: &File = &self.file;
        handle.seek(SeekFrom::Start(trailer_position))?;
        handle.write_all(&block)?;
        self.position += block.len() as u64;

        // Patch the file header words filled in at close time.
        let mut word64 = [0u8; 8];
        order.put_u64(&mut word64, trailer_position);
        handle.seek(SeekFrom::Start(TRAILER_POSITION_OFFSET))?;
        handle.write_all(&word64)?;
        self.header.trailer_position = trailer_position;

        if add_index {
            self.header.has_trailer_with_index = true;
            let mut word = [0u8; 4];
            order.put_u32(&mut word, self.header.bit_info_word());
            handle.seek(SeekFrom::Start(BIT_INFO_OFFSET))?;
            handle.write_all(&word)?;
        }

        let mut word = [0u8; 4];
        order.put_u32(&mut word, self.records_written);
        handle.seek(SeekFrom::Start(RECORD_COUNT_OFFSET))?;
        handle.write_all(&word)?;
        self.header.record_count = self.records_written;

        handle.flush()?;
        debug!(
            path = %self.path.display(),
            records = self.records_written,
            trailer_position,
            "wrote trailer"
        );
        Ok(())
    }

    /// Force written data to physical disk.
    pub fn sync(&self) -> EvioResult<()> {
        self.file.sync_data().map_err(EvioError::from)
    }
}

fn read_up_to(mut handle: &File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = handle.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Is there too little free space in `dir` to hold `needed` more bytes plus
/// the safety margin?
///
/// A failing probe is logged and treated as "not full" so a transient
/// statvfs error cannot wedge the writer.
pub fn disk_is_full(dir: &Path, needed: u64) -> bool {
    let probe_dir = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };
    match fs2::available_space(probe_dir) {
        Ok(free) => free < needed + DISK_FULL_MARGIN,
        Err(e) => {
            warn!(dir = %probe_dir.display(), "free-space probe failed: {e}");
            false
        }
    }
}

/// The common record (dictionary + first event) and its header flags,
/// shared between the facade and the writer thread: `set_first_event` may
/// rebuild it while split files are still being created.
#[derive(Debug, Clone, Default)]
pub struct CommonState {
    /// Built, uncompressed common-record block; empty when there is
    /// neither dictionary nor first event.
    pub bytes: Bytes,
    /// The common record holds a dictionary.
    pub has_dictionary: bool,
    /// The common record holds a first event.
    pub has_first_event: bool,
}

/// Creates the successive files of one output stream.
///
/// Bundles the naming state with the header template (byte order plus the
/// shared common record embedded in every file header), so the
/// single-threaded path and the writer thread create files the same way.
#[derive(Debug)]
pub struct FileFactory {
    naming: crate::file_name::FileNaming,
    byte_order: ByteOrder,
    common: Arc<std::sync::Mutex<CommonState>>,
    overwrite_ok: bool,
}

impl FileFactory {
    /// Capture the naming state and header template.
    pub fn new(
        naming: crate::file_name::FileNaming,
        byte_order: ByteOrder,
        common: Arc<std::sync::Mutex<CommonState>>,
        overwrite_ok: bool,
    ) -> Self {
        FileFactory {
            naming,
            byte_order,
            common,
            overwrite_ok,
        }
    }

    fn common_state(&self) -> CommonState {
        self.common
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Name of the next file without advancing the split number.
    pub fn peek_next_path(&self) -> EvioResult<PathBuf> {
        self.naming.clone().next_path().map(|(path, _)| path)
    }

    /// Directory of the next file (used by the disk-full probe).
    pub fn peek_directory(&self) -> PathBuf {
        self.peek_next_path()
            .map(|path| path.parent().map(Path::to_path_buf).unwrap_or_default())
            .unwrap_or_default()
    }

    /// Create the next file of the stream, header and common record
    /// included.
    pub fn create_next(&mut self) -> EvioResult<FileOutput> {
        let (path, split_number) = self.naming.next_path()?;
        let common = self.common_state();
        let mut header = FileHeader::new(self.byte_order);
        header.file_number = split_number;
        header.has_dictionary = common.has_dictionary;
        header.has_first_event = common.has_first_event;
        FileOutput::create(path, header, &common.bytes, self.overwrite_ok)
    }

    /// Split number the next file will carry.
    pub fn split_number(&self) -> u32 {
        self.naming.split_number()
    }

    /// Number of files created so far.
    pub fn split_count(&self) -> u32 {
        self.naming.split_count()
    }

    /// Events in the embedded common record (dictionary counts as one).
    pub fn common_event_count(&self) -> u32 {
        let common = self.common_state();
        if common.bytes.is_empty() {
            0
        } else {
            RecordHeader::read(&common.bytes, self.byte_order)
                .map(|h| h.event_count)
                .unwrap_or(0)
        }
    }
}

/// Closes split-off files, each in its own thread, so a split never stalls
/// the producer.
#[derive(Debug, Default)]
pub struct FileCloser {
    threads: Vec<JoinHandle<()>>,
}

impl FileCloser {
    /// New closer with no pending work.
    pub fn new() -> Self {
        FileCloser::default()
    }

    /// Finish `output` on a background thread: wait for its last in-flight
    /// write, write the trailer, patch the header, close the file.
    pub fn close_async(
        &mut self,
        mut output: FileOutput,
        in_flight: Option<WriteHandle>,
        add_trailer_index: bool,
    ) {
        let spawned = thread::Builder::new()
            .name("evio-file-closer".into())
            .spawn(move || {
                if let Some(handle) = in_flight {
                    if let Err(e) = handle.wait() {
                        error!(path = %output.path.display(), "last write of split file failed: {e}");
                    }
                }
                if let Err(e) = output.write_trailer(add_trailer_index) {
                    error!(path = %output.path.display(), "trailer of split file failed: {e}");
                }
                // Dropping output closes the file.
            });
        match spawned {
            Ok(handle) => self.threads.push(handle),
            Err(e) => error!("could not spawn file closer thread: {e}"),
        }
    }

    /// Wait for every pending close to finish.
    pub fn close(&mut self) {
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for FileCloser {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::MAGIC;

    fn header(order: ByteOrder) -> FileHeader {
        FileHeader::new(order)
    }

    #[test]
    fn create_writes_header_and_positions_after_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.evio");
        let out =
            FileOutput::create(path.clone(), header(ByteOrder::Little), &[], false).unwrap();
        assert_eq!(out.position, HEADER_SIZE_BYTES as u64);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE_BYTES);
        assert_eq!(ByteOrder::Little.get_u32(&bytes[28..]), MAGIC);
    }

    #[test]
    fn create_refuses_existing_file_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.evio");
        std::fs::write(&path, b"old").unwrap();

        match FileOutput::create(path.clone(), header(ByteOrder::Little), &[], false) {
            Err(EvioError::Config(msg)) => assert!(msg.contains("over-writing")),
            other => panic!("unexpected: {:?}", other),
        }
        // With overwrite allowed it truncates.
        let out = FileOutput::create(path, header(ByteOrder::Little), &[], true).unwrap();
        assert_eq!(out.position, HEADER_SIZE_BYTES as u64);
    }

    #[test]
    fn async_writes_land_at_their_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.evio");
        let mut out =
            FileOutput::create(path.clone(), header(ByteOrder::Little), &[], false).unwrap();

        let io = AsyncFileWriter::new();
        let first = out.write_record(&io, Bytes::from(vec![0xaa; 64]), 2);
        let second = out.write_record(&io, Bytes::from(vec![0xbb; 32]), 1);
        first.wait().unwrap();
        second.wait().unwrap();

        assert_eq!(out.records_written, 2);
        assert_eq!(out.events_written, 3);
        assert_eq!(out.record_lengths, vec![(64, 2), (32, 1)]);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE_BYTES + 96);
        assert!(bytes[HEADER_SIZE_BYTES..HEADER_SIZE_BYTES + 64]
            .iter()
            .all(|&b| b == 0xaa));
        assert!(bytes[HEADER_SIZE_BYTES + 64..].iter().all(|&b| b == 0xbb));
    }

    #[test]
    fn trailer_patches_header_words() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.evio");
        let mut out =
            FileOutput::create(path.clone(), header(ByteOrder::Little), &[], false).unwrap();

        let io = AsyncFileWriter::new();
        out.write_record(&io, Bytes::from(vec![0u8; 56]), 4)
            .wait()
            .unwrap();
        out.write_trailer(true).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let parsed = FileHeader::read(&bytes).unwrap();
        assert_eq!(parsed.record_count, 1);
        assert_eq!(parsed.trailer_position, (HEADER_SIZE_BYTES + 56) as u64);
        assert!(parsed.has_trailer_with_index);

        let trailer =
            RecordHeader::read(&bytes[parsed.trailer_position as usize..], ByteOrder::Little)
                .unwrap();
        assert!(trailer.is_last);
        assert_eq!(trailer.event_count, 0);
        // One index pair follows the trailer header.
        assert_eq!(trailer.uncompressed_length, 8);
    }

    #[test]
    fn disk_probe_does_not_trip_on_tiny_margin() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!disk_is_full(dir.path(), 0));
    }
}
