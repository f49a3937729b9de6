//! The 56-byte header framing every record, including the trailer.
//!
//! Word layout (4-byte words, file byte order):
//! ```text
//!  w0   record length in words (header + index + user header + payload, padded)
//!  w1   record number (1, 2, 3, ... within a file)
//!  w2   header length in words (14)
//!  w3   event count
//!  w4   index array length in bytes (4 per event)
//!  w5   bit-info | version
//!  w6   user header length in bytes
//!  w7   magic word
//!  w8   uncompressed payload length in bytes
//!  w9   compression type in bits 28-31, compressed payload length in bits 0-27
//!  w10  user register 1, 64 bits
//!  w12  user register 2, 64 bits
//! ```
//! Bit-info: version in bits 0-7, has-dictionary bit 8, is-last bit 9,
//! event type bits 10-13, has-first-event bit 14, data pad bits 24-25,
//! user-header pad bits 26-27, header type bits 28-31.

use super::{ByteOrder, HeaderType, FORMAT_VERSION, HEADER_SIZE_BYTES, HEADER_SIZE_WORDS, MAGIC};
use crate::compression::CompressionType;
use crate::error::{EvioError, EvioResult};

/// Byte offset of the record-length word within a record header.
pub const RECORD_LENGTH_OFFSET: usize = 0;
/// Byte offset of the event-count word.
pub const EVENT_COUNT_OFFSET: usize = 12;
/// Byte offset of the bit-info word.
pub const BIT_INFO_OFFSET: usize = 20;
/// Bytes of a record header the append scan must read to make progress.
pub const APPEND_SCAN_BYTES: usize = BIT_INFO_OFFSET + 4;

const DICTIONARY_BIT: u32 = 1 << 8;
const LAST_RECORD_BIT: u32 = 1 << 9;
const FIRST_EVENT_BIT: u32 = 1 << 14;
const EVENT_TYPE_SHIFT: u32 = 10;
const DATA_PAD_SHIFT: u32 = 24;
const USER_PAD_SHIFT: u32 = 26;

/// Largest payload length storable in the 28 low bits of word 9.
pub const MAX_PAYLOAD_BYTES: u32 = (1 << 28) - 1;

/// In-memory form of a record header.
#[derive(Debug, Clone)]
pub struct RecordHeader {
    /// Byte order this header will be serialized in.
    pub byte_order: ByteOrder,
    /// Full record length in words, set by the build step.
    pub record_length_words: u32,
    /// Record number within its file, starting at 1.
    pub record_number: u32,
    /// Number of events in the record (0 for a trailer).
    pub event_count: u32,
    /// Length in bytes of the per-event index array.
    pub index_length: u32,
    /// Unpadded user-header length in bytes.
    pub user_header_length: u32,
    /// Unpadded payload length in bytes before compression.
    pub uncompressed_length: u32,
    /// Unpadded payload length in bytes after compression; equals
    /// `uncompressed_length` when the type is `None`.
    pub compressed_length: u32,
    /// Codec applied to the payload.
    pub compression: CompressionType,
    /// Pad bytes after the payload (0-3).
    pub data_padding: u8,
    /// Pad bytes after the user header (0-3).
    pub user_header_padding: u8,
    /// Data record or trailer.
    pub header_type: HeaderType,
    /// First record of a file with a dictionary sets this.
    pub has_dictionary: bool,
    /// First record of a file with a first event sets this.
    pub has_first_event: bool,
    /// Set on the final record of a file (the trailer).
    pub is_last: bool,
    /// Application-defined event type tag (0-15).
    pub event_type: u8,
    /// First 64-bit user register.
    pub user_register1: u64,
    /// Second 64-bit user register.
    pub user_register2: u64,
}

impl RecordHeader {
    /// A blank data-record header in the given byte order.
    pub fn new(byte_order: ByteOrder) -> Self {
        RecordHeader {
            byte_order,
            record_length_words: HEADER_SIZE_WORDS,
            record_number: 1,
            event_count: 0,
            index_length: 0,
            user_header_length: 0,
            uncompressed_length: 0,
            compressed_length: 0,
            compression: CompressionType::None,
            data_padding: 0,
            user_header_padding: 0,
            header_type: HeaderType::DataRecord,
            has_dictionary: false,
            has_first_event: false,
            is_last: false,
            event_type: 0,
            user_register1: 0,
            user_register2: 0,
        }
    }

    /// Clear the per-build fields, keeping byte order, compression type,
    /// bit-info flags and user registers.
    pub fn reset(&mut self) {
        self.record_length_words = HEADER_SIZE_WORDS;
        self.event_count = 0;
        self.index_length = 0;
        self.user_header_length = 0;
        self.uncompressed_length = 0;
        self.compressed_length = 0;
        self.data_padding = 0;
        self.user_header_padding = 0;
    }

    /// Full record length in bytes.
    pub fn record_length_bytes(&self) -> u32 {
        self.record_length_words * 4
    }

    /// Assemble the bit-info word, version in the low 8 bits.
    pub fn bit_info_word(&self) -> u32 {
        let mut word = FORMAT_VERSION;
        if self.has_dictionary {
            word |= DICTIONARY_BIT;
        }
        if self.is_last {
            word |= LAST_RECORD_BIT;
        }
        if self.has_first_event {
            word |= FIRST_EVENT_BIT;
        }
        word |= u32::from(self.event_type & 0xf) << EVENT_TYPE_SHIFT;
        word |= u32::from(self.data_padding & 0x3) << DATA_PAD_SHIFT;
        word |= u32::from(self.user_header_padding & 0x3) << USER_PAD_SHIFT;
        word | (self.header_type as u32) << 28
    }

    /// Serialize into the first 56 bytes of `dst`.
    pub fn write(&self, dst: &mut [u8]) {
        let o = self.byte_order;
        o.put_u32(&mut dst[0..], self.record_length_words);
        o.put_u32(&mut dst[4..], self.record_number);
        o.put_u32(&mut dst[8..], HEADER_SIZE_WORDS);
        o.put_u32(&mut dst[12..], self.event_count);
        o.put_u32(&mut dst[16..], self.index_length);
        o.put_u32(&mut dst[20..], self.bit_info_word());
        o.put_u32(&mut dst[24..], self.user_header_length);
        o.put_u32(&mut dst[28..], MAGIC);
        o.put_u32(&mut dst[32..], self.uncompressed_length);
        o.put_u32(&mut dst[36..], self.compression_word());
        o.put_u64(&mut dst[40..], self.user_register1);
        o.put_u64(&mut dst[48..], self.user_register2);
    }

    /// Word 9: compression type in the top nibble, compressed length below.
    fn compression_word(&self) -> u32 {
        (self.compression as u32) << 28 | (self.compressed_length & MAX_PAYLOAD_BYTES)
    }

    /// Parse a header from `src` using a byte order already learned from the
    /// file header.
    pub fn read(src: &[u8], byte_order: ByteOrder) -> EvioResult<RecordHeader> {
        if src.len() < HEADER_SIZE_BYTES {
            return Err(EvioError::Format(format!(
                "record header needs {} bytes, got {}",
                HEADER_SIZE_BYTES,
                src.len()
            )));
        }
        let o = byte_order;
        if o.get_u32(&src[28..]) != MAGIC {
            return Err(EvioError::Format(format!(
                "bad record magic word 0x{:08x}",
                o.get_u32(&src[28..])
            )));
        }
        let bit_info = o.get_u32(&src[20..]);
        let version = bit_info & 0xff;
        if version != FORMAT_VERSION {
            return Err(EvioError::Format(format!(
                "unsupported record version {}",
                version
            )));
        }
        let header_type = HeaderType::from_bits(bit_info >> 28).ok_or_else(|| {
            EvioError::Format(format!("unknown header type {}", bit_info >> 28))
        })?;
        let comp_word = o.get_u32(&src[36..]);
        let compression = CompressionType::from_bits(comp_word >> 28).ok_or_else(|| {
            EvioError::Format(format!("unknown compression type {}", comp_word >> 28))
        })?;

        Ok(RecordHeader {
            byte_order,
            record_length_words: o.get_u32(&src[0..]),
            record_number: o.get_u32(&src[4..]),
            event_count: o.get_u32(&src[12..]),
            index_length: o.get_u32(&src[16..]),
            user_header_length: o.get_u32(&src[24..]),
            uncompressed_length: o.get_u32(&src[32..]),
            compressed_length: comp_word & MAX_PAYLOAD_BYTES,
            compression,
            data_padding: ((bit_info >> DATA_PAD_SHIFT) & 0x3) as u8,
            user_header_padding: ((bit_info >> USER_PAD_SHIFT) & 0x3) as u8,
            header_type,
            has_dictionary: bit_info & DICTIONARY_BIT != 0,
            has_first_event: bit_info & FIRST_EVENT_BIT != 0,
            is_last: bit_info & LAST_RECORD_BIT != 0,
            event_type: ((bit_info >> EVENT_TYPE_SHIFT) & 0xf) as u8,
            user_register1: o.get_u64(&src[40..]),
            user_register2: o.get_u64(&src[48..]),
        })
    }

    /// True if a raw bit-info word carries the is-last bit.
    pub fn is_last_record(bit_info: u32) -> bool {
        bit_info & LAST_RECORD_BIT != 0
    }

    /// True if a raw bit-info word describes a trailer.
    pub fn is_trailer(bit_info: u32) -> bool {
        HeaderType::from_bits(bit_info >> 28) == Some(HeaderType::Trailer)
    }

    /// Clear the is-last bit of a raw bit-info word (append mode re-opens a
    /// finished file).
    pub fn clear_last_record_bit(bit_info: u32) -> u32 {
        bit_info & !LAST_RECORD_BIT
    }
}

/// Build a complete trailer block: an empty last record, optionally followed
/// by the `(length bytes, event count)` index of every data record written.
///
/// The trailer takes the next unused record number and is never compressed.
pub fn build_trailer(
    byte_order: ByteOrder,
    record_number: u32,
    record_index: Option<&[(u32, u32)]>,
) -> Vec<u8> {
    let index_bytes = record_index.map_or(0, |idx| idx.len() * 8);
    let mut header = RecordHeader::new(byte_order);
    header.record_number = record_number;
    header.header_type = HeaderType::Trailer;
    header.is_last = true;
    header.record_length_words = HEADER_SIZE_WORDS + (index_bytes / 4) as u32;
    header.uncompressed_length = index_bytes as u32;
    header.compressed_length = index_bytes as u32;

    let mut block = vec![0u8; HEADER_SIZE_BYTES + index_bytes];
    header.write(&mut block);
    if let Some(idx) = record_index {
        let mut pos = HEADER_SIZE_BYTES;
        for &(length_bytes, event_count) in idx {
            byte_order.put_u32(&mut block[pos..], length_bytes);
            byte_order.put_u32(&mut block[pos + 4..], event_count);
            pos += 8;
        }
    }
    block
}
