//! Test-support reader: walks written files or buffers and recovers the
//! original event payloads, decompressing where needed.

// Not every test binary uses every helper.
#![allow(dead_code)]

use rust_evio::compression::{self, CompressionType};
use rust_evio::format::file_header::FileHeader;
use rust_evio::format::record_header::RecordHeader;
use rust_evio::format::{ByteOrder, HeaderType, HEADER_SIZE_BYTES};

/// One parsed record with its events split back apart.
pub struct ReadRecord {
    pub header: RecordHeader,
    pub events: Vec<Vec<u8>>,
    /// Raw user-header bytes (unpadded).
    pub user_header: Vec<u8>,
}

/// A fully parsed output file.
pub struct ReadFile {
    pub header: FileHeader,
    /// Events recovered from the common record in the file header's user
    /// header (dictionary first, then first event).
    pub common_events: Vec<Vec<u8>>,
    pub records: Vec<ReadRecord>,
    pub trailer: Option<ReadRecord>,
    /// `(record length bytes, event count)` pairs following the trailer.
    pub trailer_index: Vec<(u32, u32)>,
}

/// Parse one record starting at `offset`; returns the record and the offset
/// just past it.
pub fn read_record(bytes: &[u8], offset: usize, order: ByteOrder) -> (ReadRecord, usize) {
    let header = RecordHeader::read(&bytes[offset..], order).expect("record header");
    let index_start = offset + HEADER_SIZE_BYTES;
    let index_len = header.index_length as usize;

    let mut event_lengths = Vec::new();
    for i in 0..index_len / 4 {
        event_lengths.push(order.get_u32(&bytes[index_start + 4 * i..]) as usize);
    }

    let user_start = index_start + index_len;
    let user_len = header.user_header_length as usize;
    let user_header = bytes[user_start..user_start + user_len].to_vec();
    let payload_start = user_start + user_len + header.user_header_padding as usize;

    let payload = if header.header_type == HeaderType::Trailer {
        Vec::new()
    } else {
        let compressed =
            &bytes[payload_start..payload_start + header.compressed_length as usize];
        compression::decompress(
            header.compression,
            compressed,
            header.uncompressed_length as usize,
        )
        .expect("payload decompression")
    };

    let mut events = Vec::new();
    let mut position = 0;
    for length in event_lengths {
        events.push(payload[position..position + length].to_vec());
        position += length;
    }

    let end = offset + header.record_length_bytes() as usize;
    (
        ReadRecord {
            header,
            events,
            user_header,
        },
        end,
    )
}

/// Walk the records of a body (no file header) until past `len` or a
/// trailer.
pub fn read_records(
    bytes: &[u8],
    mut offset: usize,
    order: ByteOrder,
) -> (Vec<ReadRecord>, Option<ReadRecord>, Vec<(u32, u32)>) {
    let mut records = Vec::new();
    let mut trailer = None;
    let mut trailer_index = Vec::new();

    while offset + HEADER_SIZE_BYTES <= bytes.len() {
        let (record, end) = read_record(bytes, offset, order);
        if record.header.header_type == HeaderType::Trailer {
            // Index pairs are the trailer's payload region.
            let count = record.header.uncompressed_length as usize / 8;
            let start = offset + HEADER_SIZE_BYTES;
            for i in 0..count {
                trailer_index.push((
                    order.get_u32(&bytes[start + 8 * i..]),
                    order.get_u32(&bytes[start + 8 * i + 4..]),
                ));
            }
            trailer = Some(record);
            break;
        }
        records.push(record);
        offset = end;
    }
    (records, trailer, trailer_index)
}

/// Parse a whole file from disk.
pub fn read_file(path: &std::path::Path) -> ReadFile {
    let bytes = std::fs::read(path).expect("read file");
    let header = FileHeader::read(&bytes).expect("file header");
    let order = header.byte_order;

    let common_events = if header.user_header_length > 0 {
        let (common, _) = read_record(&bytes, HEADER_SIZE_BYTES, order);
        common.events
    } else {
        Vec::new()
    };

    let body_start = HEADER_SIZE_BYTES
        + header.index_length as usize
        + header.user_header_length as usize
        + header.user_header_padding();
    let (records, trailer, trailer_index) = read_records(&bytes, body_start, order);

    ReadFile {
        header,
        common_events,
        records,
        trailer,
        trailer_index,
    }
}

impl ReadFile {
    /// All data-record events in file order.
    pub fn all_events(&self) -> Vec<Vec<u8>> {
        self.records
            .iter()
            .flat_map(|r| r.events.iter().cloned())
            .collect()
    }

    /// Sum of data-record event counts.
    pub fn event_count(&self) -> u64 {
        self.records
            .iter()
            .map(|r| u64::from(r.header.event_count))
            .sum()
    }
}

/// Sanity-check the structural invariants every written file must hold.
pub fn assert_file_invariants(file: &ReadFile) {
    // Record numbers are 1, 2, 3, ... and lengths add up section by section.
    for (i, record) in file.records.iter().enumerate() {
        assert_eq!(record.header.record_number, i as u32 + 1, "record number");
        let h = &record.header;
        let expected_words = (HEADER_SIZE_BYTES as u32
            + h.index_length
            + h.user_header_length
            + u32::from(h.user_header_padding)
            + h.compressed_length
            + u32::from(h.data_padding))
            / 4;
        assert_eq!(h.record_length_words, expected_words, "record length");
        if h.compression == CompressionType::None {
            assert_eq!(h.compressed_length, h.uncompressed_length);
        }
    }

    // The header's record count covers data records only.
    assert_eq!(u64::from(file.header.record_count), file.records.len() as u64);

    // The trailer is flagged and empty.
    let trailer = file.trailer.as_ref().expect("file has a trailer");
    assert_eq!(trailer.header.header_type, HeaderType::Trailer);
    assert!(trailer.header.is_last);
    assert_eq!(trailer.header.event_count, 0);
    assert_eq!(
        trailer.header.record_number,
        file.records.len() as u32 + 1
    );

    // With an index, one (length, count) pair per data record.
    if file.header.has_trailer_with_index {
        assert_eq!(file.trailer_index.len(), file.records.len());
        for (record, (length, count)) in file.records.iter().zip(&file.trailer_index) {
            assert_eq!(*length, record.header.record_length_bytes());
            assert_eq!(*count, record.header.event_count);
        }
    }
}

/// Check that the 64-bit trailer position in the file header points at the
/// trailer record.
pub fn assert_trailer_position(path: &std::path::Path) {
    let bytes = std::fs::read(path).expect("read file");
    let header = FileHeader::read(&bytes).expect("file header");
    let trailer_header = RecordHeader::read(
        &bytes[header.trailer_position as usize..],
        header.byte_order,
    )
    .expect("trailer header at trailer position");
    assert_eq!(trailer_header.header_type, HeaderType::Trailer);
    assert!(trailer_header.is_last);
}
