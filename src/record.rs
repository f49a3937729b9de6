//! In-memory record accumulation and building.
//!
//! A [`RecordBuffer`] collects opaque event byte blobs plus a per-event
//! length index, then `build()` emits the self-contained record block:
//!
//! ```text
//! [RecordHeader 56 B][index: 4 B x events][user header + pad][payload + pad]
//! ```
//!
//! Events are treated as opaque: no alignment or content checks are made,
//! and events are concatenated unpadded. Only the user-header and payload
//! *sections* are padded to 4-byte boundaries, with the pad counts recorded
//! in the header bit-info word so a reader can strip them.
//!
//! The built block is handed out as reference-counted [`Bytes`], so a ring
//! slot can be reset and refilled while an asynchronous file write still
//! holds the previous block.

use bytes::{BufMut, Bytes, BytesMut};

use crate::compression::{self, CompressionType};
use crate::error::{EvioError, EvioResult};
use crate::format::record_header::{RecordHeader, MAX_PAYLOAD_BYTES};
use crate::format::{self, ByteOrder, HEADER_SIZE_BYTES};

/// Accumulates events and produces a framed, optionally compressed record.
#[derive(Debug)]
pub struct RecordBuffer {
    header: RecordHeader,
    /// Per-event uncompressed byte lengths, in add order.
    index: Vec<u32>,
    /// Concatenated raw event bytes.
    events: Vec<u8>,
    /// Output of the last `build()`.
    built: Bytes,
    max_event_count: u32,
    /// Soft target for uncompressed payload bytes; a lone first event may
    /// exceed it.
    size_target: u32,
    /// Hard cap on the whole built block, set when the final destination is
    /// a caller-provided buffer that cannot grow.
    hard_limit: Option<usize>,
}

impl RecordBuffer {
    /// New empty record.
    pub fn new(
        byte_order: ByteOrder,
        compression: CompressionType,
        max_event_count: u32,
        size_target: u32,
    ) -> Self {
        let mut header = RecordHeader::new(byte_order);
        header.compression = compression;
        RecordBuffer {
            header,
            index: Vec::new(),
            events: Vec::new(),
            built: Bytes::new(),
            max_event_count,
            size_target,
            hard_limit: None,
        }
    }

    /// New empty record with the event store preallocated.
    pub fn with_capacity(
        byte_order: ByteOrder,
        compression: CompressionType,
        max_event_count: u32,
        size_target: u32,
        capacity: usize,
    ) -> Self {
        let mut record = Self::new(byte_order, compression, max_event_count, size_target);
        record.events = Vec::with_capacity(capacity);
        record
    }

    /// Cap the total built block size; adding an event that would exceed the
    /// cap is refused even if the record is empty.
    pub fn set_hard_limit(&mut self, limit: Option<usize>) {
        self.hard_limit = limit;
    }

    /// The header, as filled by the last `build()`.
    pub fn header(&self) -> &RecordHeader {
        &self.header
    }

    /// Mutable header access, for record number and bit-info stamping.
    pub fn header_mut(&mut self) -> &mut RecordHeader {
        &mut self.header
    }

    /// Number of events added since the last reset.
    pub fn event_count(&self) -> u32 {
        self.index.len() as u32
    }

    /// True if no events have been added since the last reset.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Raw event bytes accumulated so far.
    pub fn uncompressed_bytes(&self) -> usize {
        self.events.len()
    }

    /// Block size the record would occupy, uncompressed, after adding one
    /// more event of `extra` bytes.
    fn projected_block_size(&self, extra: usize) -> usize {
        HEADER_SIZE_BYTES
            + 4 * (self.index.len() + 1)
            + format::padded_length(self.events.len() + extra)
    }

    /// Try to add one event.
    ///
    /// Returns `false`, leaving the record untouched, when the record
    /// already holds at least one event and this one would push it past the
    /// event-count cap or the size target. A first event is always accepted
    /// no matter its size, unless a hard limit is set (caller-provided
    /// output buffer), in which case an event that cannot fit is refused
    /// outright.
    pub fn add_event(&mut self, event: &[u8]) -> bool {
        if let Some(limit) = self.hard_limit {
            if self.projected_block_size(event.len()) > limit {
                return false;
            }
        }
        if !self.index.is_empty() {
            if self.index.len() as u32 + 1 > self.max_event_count {
                return false;
            }
            if self.events.len() + event.len() > self.size_target as usize {
                return false;
            }
        }

        self.index.push(event.len() as u32);
        self.events.extend_from_slice(event);
        true
    }

    /// Build the record block with no user header.
    pub fn build(&mut self) -> EvioResult<()> {
        self.build_with_user_header(&[])
    }

    /// Build the record block, embedding `user_header` between the index
    /// array and the payload.
    ///
    /// Fills in every length field of the header, compresses the payload if
    /// the record's compression type says so, and stores the finished block
    /// for [`RecordBuffer::binary_bytes`].
    pub fn build_with_user_header(&mut self, user_header: &[u8]) -> EvioResult<()> {
        let order = self.header.byte_order;
        let index_bytes = 4 * self.index.len();
        let user_pad = format::padding_for(user_header.len());

        let compressed;
        let payload: &[u8] = if self.header.compression == CompressionType::None {
            &self.events
        } else {
            compressed = compression::compress(self.header.compression, &self.events)?;
            &compressed
        };

        if payload.len() as u64 > u64::from(MAX_PAYLOAD_BYTES)
            || self.events.len() as u64 > u64::from(MAX_PAYLOAD_BYTES)
        {
            return Err(EvioError::Capacity(format!(
                "record payload of {} bytes exceeds the format maximum",
                payload.len().max(self.events.len())
            )));
        }

        let data_pad = format::padding_for(payload.len());
        let total = HEADER_SIZE_BYTES
            + index_bytes
            + user_header.len()
            + user_pad
            + payload.len()
            + data_pad;

        self.header.record_length_words = (total / 4) as u32;
        self.header.event_count = self.index.len() as u32;
        self.header.index_length = index_bytes as u32;
        self.header.user_header_length = user_header.len() as u32;
        self.header.user_header_padding = user_pad as u8;
        self.header.uncompressed_length = self.events.len() as u32;
        self.header.compressed_length = payload.len() as u32;
        self.header.data_padding = data_pad as u8;

        let mut block = BytesMut::with_capacity(total);
        block.resize(HEADER_SIZE_BYTES, 0);
        self.header.write(&mut block[..]);
        for &len in &self.index {
            let mut word = [0u8; 4];
            order.put_u32(&mut word, len);
            block.put_slice(&word);
        }
        block.put_slice(user_header);
        block.put_bytes(0, user_pad);
        block.put_slice(payload);
        block.put_bytes(0, data_pad);

        self.built = block.freeze();
        Ok(())
    }

    /// The block produced by the last `build()`, cheap to clone.
    pub fn binary_bytes(&self) -> Bytes {
        self.built.clone()
    }

    /// Uncompressed-to-compressed size ratio of the last build.
    pub fn compression_ratio(&self) -> f64 {
        compression::compression_ratio(
            self.header.uncompressed_length as usize,
            self.header.compressed_length as usize,
        )
    }

    /// Clear events, index and built output; keep byte order, compression
    /// type, limits, bit-info flags and user registers.
    pub fn reset(&mut self) {
        self.index.clear();
        self.events.clear();
        self.built = Bytes::new();
        self.header.reset();
    }
}
