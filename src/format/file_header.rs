//! The 56-byte header at byte 0 of every event file.
//!
//! Word layout (4-byte words, file byte order):
//! ```text
//!  w0   file type id ("EVIO" = 0x4556494f)
//!  w1   file (split) number
//!  w2   header length in words (14)
//!  w3   record count                      <- patched at close
//!  w4   index array length in bytes (unused, 0)
//!  w5   bit-info | version                <- patched at close
//!  w6   user header length in bytes
//!  w7   magic word
//!  w8   trailer position, 64 bits         <- patched at close
//!  w10  user register 1, 64 bits
//!  w12  user register 2, 64 bits
//! ```
//! The user header that follows is the embedded common record holding any
//! dictionary and first event, padded to a 4-byte boundary.

use super::{ByteOrder, HeaderType, FILE_TYPE_ID, FORMAT_VERSION, HEADER_SIZE_BYTES, HEADER_SIZE_WORDS, MAGIC};
use crate::error::{EvioError, EvioResult};

/// Byte offset of the record-count word, rewritten at close.
pub const RECORD_COUNT_OFFSET: u64 = 12;
/// Byte offset of the bit-info word, rewritten when a trailer index is added.
pub const BIT_INFO_OFFSET: u64 = 20;
/// Byte offset of the 64-bit trailer-position word, rewritten at close.
pub const TRAILER_POSITION_OFFSET: u64 = 32;

// Bit positions inside the bit-info word (above the 8 version bits).
const DICTIONARY_BIT: u32 = 1 << 8;
const FIRST_EVENT_BIT: u32 = 1 << 9;
const TRAILER_INDEX_BIT: u32 = 1 << 10;
const LITTLE_ENDIAN_BIT: u32 = 1 << 11;

/// In-memory form of the file header.
#[derive(Debug, Clone)]
pub struct FileHeader {
    /// Byte order everything in this file is written in.
    pub byte_order: ByteOrder,
    /// Split sequence number of this file within its stream.
    pub file_number: u32,
    /// Number of data records in the file (excludes the trailer).
    pub record_count: u32,
    /// Length in bytes of the index array section (always 0 when writing).
    pub index_length: u32,
    /// Unpadded length in bytes of the user header (the common record).
    pub user_header_length: u32,
    /// Absolute byte offset of the trailer record, 0 until close.
    pub trailer_position: u64,
    /// First 64-bit user register.
    pub user_register1: u64,
    /// Second 64-bit user register.
    pub user_register2: u64,
    /// File carries an XML dictionary in its common record.
    pub has_dictionary: bool,
    /// File carries a first event in its common record.
    pub has_first_event: bool,
    /// The trailer is followed by a record-length index.
    pub has_trailer_with_index: bool,
}

impl FileHeader {
    /// A blank header for a new file in the given byte order.
    pub fn new(byte_order: ByteOrder) -> Self {
        FileHeader {
            byte_order,
            file_number: 1,
            record_count: 0,
            index_length: 0,
            user_header_length: 0,
            trailer_position: 0,
            user_register1: 0,
            user_register2: 0,
            has_dictionary: false,
            has_first_event: false,
            has_trailer_with_index: false,
        }
    }

    /// Pad bytes following the user header.
    pub fn user_header_padding(&self) -> usize {
        super::padding_for(self.user_header_length as usize)
    }

    /// Total bytes of header plus padded user header.
    pub fn total_length(&self) -> usize {
        HEADER_SIZE_BYTES + super::padded_length(self.user_header_length as usize)
    }

    /// Assemble the bit-info word, version in the low 8 bits.
    pub fn bit_info_word(&self) -> u32 {
        let mut word = FORMAT_VERSION;
        if self.has_dictionary {
            word |= DICTIONARY_BIT;
        }
        if self.has_first_event {
            word |= FIRST_EVENT_BIT;
        }
        if self.has_trailer_with_index {
            word |= TRAILER_INDEX_BIT;
        }
        if self.byte_order == ByteOrder::Little {
            word |= LITTLE_ENDIAN_BIT;
        }
        word | (HeaderType::FileHeader as u32) << 28
    }

    /// Serialize into the first 56 bytes of `dst`.
    pub fn write(&self, dst: &mut [u8]) {
        let o = self.byte_order;
        o.put_u32(&mut dst[0..], FILE_TYPE_ID);
        o.put_u32(&mut dst[4..], self.file_number);
        o.put_u32(&mut dst[8..], HEADER_SIZE_WORDS);
        o.put_u32(&mut dst[12..], self.record_count);
        o.put_u32(&mut dst[16..], self.index_length);
        o.put_u32(&mut dst[20..], self.bit_info_word());
        o.put_u32(&mut dst[24..], self.user_header_length);
        o.put_u32(&mut dst[28..], MAGIC);
        o.put_u64(&mut dst[32..], self.trailer_position);
        o.put_u64(&mut dst[40..], self.user_register1);
        o.put_u64(&mut dst[48..], self.user_register2);
    }

    /// Parse a header from `src`, detecting the byte order from the magic
    /// word's observed byte pattern.
    ///
    /// Fails with [`EvioError::Format`] on a bad magic word, a version other
    /// than the one this crate writes, or an inconsistent header length.
    pub fn read(src: &[u8]) -> EvioResult<FileHeader> {
        if src.len() < HEADER_SIZE_BYTES {
            return Err(EvioError::Format(format!(
                "file header needs {} bytes, got {}",
                HEADER_SIZE_BYTES,
                src.len()
            )));
        }

        let byte_order = if ByteOrder::Little.get_u32(&src[28..]) == MAGIC {
            ByteOrder::Little
        } else if ByteOrder::Big.get_u32(&src[28..]) == MAGIC {
            ByteOrder::Big
        } else {
            return Err(EvioError::Format(format!(
                "bad magic word 0x{:08x}",
                ByteOrder::Little.get_u32(&src[28..])
            )));
        };

        let o = byte_order;
        let bit_info = o.get_u32(&src[20..]);
        let version = bit_info & 0xff;
        if version != FORMAT_VERSION {
            return Err(EvioError::Format(format!(
                "unsupported file version {} (expected {})",
                version, FORMAT_VERSION
            )));
        }
        let header_words = o.get_u32(&src[8..]);
        if header_words != HEADER_SIZE_WORDS {
            return Err(EvioError::Format(format!(
                "bad file header length: {} words",
                header_words
            )));
        }

        Ok(FileHeader {
            byte_order,
            file_number: o.get_u32(&src[4..]),
            record_count: o.get_u32(&src[12..]),
            index_length: o.get_u32(&src[16..]),
            user_header_length: o.get_u32(&src[24..]),
            trailer_position: o.get_u64(&src[32..]),
            user_register1: o.get_u64(&src[40..]),
            user_register2: o.get_u64(&src[48..]),
            has_dictionary: bit_info & DICTIONARY_BIT != 0,
            has_first_event: bit_info & FIRST_EVENT_BIT != 0,
            has_trailer_with_index: bit_info & TRAILER_INDEX_BIT != 0,
        })
    }
}
