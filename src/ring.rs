//! Supply ring coordinating the producer, compressor and writer threads.
//!
//! A [`RecordSupply`] owns a power-of-two ring of [`RecordRingItem`] slots,
//! each wrapping one [`RecordBuffer`]. Coordination follows the classic
//! sequence-barrier scheme:
//!
//! - the **producer** (the thread calling `write_event`) claims slots with
//!   [`RecordSupply::get`] and hands filled ones over with
//!   [`RecordSupply::publish`];
//! - **compressor** `k` of `n` consumes published sequences `k, k+n,
//!   k+2n, ...` behind the publish cursor;
//! - the single **writer** consumes sequences in strict order behind *all*
//!   compressor sequences, so records reach the file in producer-publish
//!   order even though compression runs in parallel;
//! - a released write sequence gates the producer, which blocks when every
//!   slot is in flight.
//!
//! # Thread Safety
//!
//! A slot is owned by exactly one role at a time, determined by its sequence
//! relative to each barrier: the producer between `get` and `publish`, one
//! compressor between `get_to_compress` and `release_compressor`, the writer
//! between `get_to_write` and `release_writer`. Record access goes through
//! an `UnsafeCell` under that discipline; everything else on a slot is
//! atomic. Blocking waits share one mutex/condvar pair, and
//! [`RecordSupply::error_alert`] wakes every waiter so blocked workers can
//! exit after a failure.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

use crate::compression::CompressionType;
use crate::error::{EvioError, EvioResult};
use crate::format::ByteOrder;
use crate::record::RecordBuffer;

/// One slot of the supply ring.
///
/// Carries the record plus the writer-directed flags the producer sets when
/// publishing: split the file after this record, force it to disk, check
/// free disk space before creating the next file.
#[derive(Debug)]
pub struct RecordRingItem {
    record: UnsafeCell<RecordBuffer>,
    sequence: AtomicI64,
    split_file_after_write: AtomicBool,
    force_to_disk: AtomicBool,
    check_disk: AtomicBool,
    already_released: AtomicBool,
    id: AtomicU64,
}

// SAFETY: the record inside the UnsafeCell is only ever accessed by the one
// role whose barrier currently owns this slot's sequence (see module docs);
// all other fields are atomics.
#[allow(unsafe_code)]
unsafe impl Sync for RecordRingItem {}

impl RecordRingItem {
    fn new(record: RecordBuffer) -> Self {
        RecordRingItem {
            record: UnsafeCell::new(record),
            sequence: AtomicI64::new(-1),
            split_file_after_write: AtomicBool::new(false),
            force_to_disk: AtomicBool::new(false),
            check_disk: AtomicBool::new(false),
            already_released: AtomicBool::new(false),
            id: AtomicU64::new(0),
        }
    }

    /// Sequence this slot was claimed under.
    pub fn sequence(&self) -> i64 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Exclusive access to the slot's record.
    ///
    /// # Safety
    ///
    /// The caller must be the role that currently owns this slot's sequence
    /// (producer after `get`, compressor after `get_to_compress`, writer
    /// after `get_to_write`) and must drop the reference before releasing
    /// the slot.
    #[allow(unsafe_code)]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn record_mut(&self) -> &mut RecordBuffer {
        &mut *self.record.get()
    }

    /// Mark that the writer must split the file after writing this record.
    pub fn set_split_file_after_write(&self, split: bool) {
        self.split_file_after_write.store(split, Ordering::Release);
    }

    /// Should the writer split the file after writing this record?
    pub fn split_file_after_write(&self) -> bool {
        self.split_file_after_write.load(Ordering::Acquire)
    }

    /// Mark that this record must be synced to physical disk once written.
    pub fn set_force_to_disk(&self, force: bool) {
        self.force_to_disk.store(force, Ordering::Release);
    }

    /// Must this record be synced to physical disk?
    pub fn force_to_disk(&self) -> bool {
        self.force_to_disk.load(Ordering::Acquire)
    }

    /// Mark that the writer should check free disk space before creating
    /// the file this record would start.
    pub fn set_check_disk(&self, check: bool) {
        self.check_disk.store(check, Ordering::Release);
    }

    /// Should the writer check free disk space first?
    pub fn check_disk(&self) -> bool {
        self.check_disk.load(Ordering::Acquire)
    }

    /// Guard against double release (used by the disk-full hold path).
    pub fn set_already_released(&self, released: bool) {
        self.already_released.store(released, Ordering::Release);
    }

    /// Id tying a forced record to the writer's forced-record marker.
    pub fn set_id(&self, id: u64) {
        self.id.store(id, Ordering::Release);
    }

    /// Id assigned by the producer for forced writes.
    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Acquire)
    }

    fn reset_flags(&self) {
        self.split_file_after_write.store(false, Ordering::Relaxed);
        self.force_to_disk.store(false, Ordering::Relaxed);
        self.check_disk.store(false, Ordering::Relaxed);
        self.already_released.store(false, Ordering::Relaxed);
        self.id.store(0, Ordering::Relaxed);
    }
}

/// Bookkeeping for in-order writer releases (see `release_writer`).
#[derive(Debug)]
struct ReleaseWindow {
    /// The last sequence to have actually been released.
    last_released: i64,
    /// The highest sequence asked to be released so far.
    max_sequence: i64,
    /// Sequences between the two that have asked but not been released.
    between: u32,
}

/// Bounded supply of records shared by producer, compressors and writer.
#[derive(Debug)]
pub struct RecordSupply {
    items: Box<[RecordRingItem]>,
    mask: i64,
    compression_threads: u32,
    byte_order: ByteOrder,
    size_target: u32,

    /// Highest sequence published by the producer.
    cursor: AtomicI64,
    /// Highest sequence claimed by the producer (producer thread only).
    claim: AtomicI64,
    /// Next sequence each compressor wants (each written by its owner only).
    next_compress: Vec<AtomicI64>,
    /// Highest sequence each compressor has released.
    compress_seqs: Vec<AtomicI64>,
    /// Next sequence the writer wants (writer thread only).
    next_write: AtomicI64,
    /// Highest sequence released back to the producer.
    write_released: AtomicI64,

    release_window: Mutex<ReleaseWindow>,
    wait_lock: Mutex<()>,
    wait_cond: Condvar,
    alerted: AtomicBool,

    have_error: AtomicBool,
    error_message: Mutex<Option<String>>,
    disk_full: AtomicBool,
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RecordSupply {
    /// Create a supply of `ring_size` records.
    ///
    /// `ring_size` must be a power of two and at least `threads`; each
    /// record caps out at `max_event_count` events or `size_target`
    /// uncompressed bytes, whichever comes first.
    pub fn new(
        ring_size: usize,
        byte_order: ByteOrder,
        threads: u32,
        max_event_count: u32,
        size_target: u32,
        compression: CompressionType,
    ) -> EvioResult<Self> {
        if !ring_size.is_power_of_two() {
            return Err(EvioError::Config("ringSize must be a power of 2".into()));
        }
        if ring_size < threads as usize {
            return Err(EvioError::Config("threadCount must be <= ringSize".into()));
        }
        let threads = threads.max(1);

        let items = (0..ring_size)
            .map(|_| {
                RecordRingItem::new(RecordBuffer::new(
                    byte_order,
                    compression,
                    max_event_count,
                    size_target,
                ))
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        // Compressor k starts at sequence k. Its release sequence starts at
        // k - 1 so sequences this worker never handles (those before its
        // first) don't hold the write barrier back.
        let next_compress = (0..threads).map(|k| AtomicI64::new(i64::from(k))).collect();
        let compress_seqs = (0..threads)
            .map(|k| AtomicI64::new(i64::from(k) - 1))
            .collect();

        Ok(RecordSupply {
            items,
            mask: ring_size as i64 - 1,
            compression_threads: threads,
            byte_order,
            size_target,
            cursor: AtomicI64::new(-1),
            claim: AtomicI64::new(-1),
            next_compress,
            compress_seqs,
            next_write: AtomicI64::new(0),
            write_released: AtomicI64::new(-1),
            release_window: Mutex::new(ReleaseWindow {
                last_released: -1,
                max_sequence: -1,
                between: 0,
            }),
            wait_lock: Mutex::new(()),
            wait_cond: Condvar::new(),
            alerted: AtomicBool::new(false),
            have_error: AtomicBool::new(false),
            error_message: Mutex::new(None),
            disk_full: AtomicBool::new(false),
        })
    }

    /// Number of slots in the ring.
    pub fn ring_size(&self) -> usize {
        self.items.len()
    }

    /// Byte order of every record in this supply.
    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    /// Worst-case bytes the whole ring can hold, used for the disk-space
    /// margin before creating a new file.
    pub fn max_ring_bytes(&self) -> u64 {
        (self.items.len() as u64) * (u64::from(self.size_target) * 11 / 10)
    }

    /// Sequence of the last published item, -1 if none yet.
    pub fn last_published(&self) -> i64 {
        self.cursor.load(Ordering::Acquire)
    }

    /// Slot holding `seq`. Only meaningful for sequences the caller
    /// currently owns under the barrier discipline.
    pub(crate) fn item(&self, seq: i64) -> &RecordRingItem {
        &self.items[(seq & self.mask) as usize]
    }

    fn signal(&self) {
        // Taking the lock pairs the notify with any waiter's condition
        // check, closing the missed-wakeup window.
        let _guard = lock_ignoring_poison(&self.wait_lock);
        self.wait_cond.notify_all();
    }

    /// Block until `ready()` holds. Returns `Err` if alerted.
    fn wait_until(&self, ready: impl Fn() -> bool) -> Result<(), Alerted> {
        if ready() {
            return Ok(());
        }
        let mut guard = lock_ignoring_poison(&self.wait_lock);
        loop {
            if self.alerted.load(Ordering::Acquire) {
                return Err(Alerted);
            }
            if ready() {
                return Ok(());
            }
            guard = self
                .wait_cond
                .wait(guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Producer: claim the next free slot, reset its record, return it.
    ///
    /// Blocks while every slot is in flight. Fails with the supply's stored
    /// error if the barriers were alerted while waiting.
    pub fn get(&self) -> EvioResult<&RecordRingItem> {
        let seq = self.claim.load(Ordering::Relaxed) + 1;
        let wrap_point = seq - self.items.len() as i64;
        self.wait_until(|| self.write_released.load(Ordering::Acquire) >= wrap_point)
            .map_err(|_| self.async_error())?;
        self.claim.store(seq, Ordering::Relaxed);

        let item = self.item(seq);
        // SAFETY: the write barrier has released this sequence range, so no
        // other role holds the slot; the producer owns it until publish().
        #[allow(unsafe_code)]
        let record = unsafe { item.record_mut() };
        record.reset();
        item.reset_flags();
        item.sequence.store(seq, Ordering::Release);
        Ok(item)
    }

    /// Producer: hand a filled slot to the compressors.
    pub fn publish(&self, item: &RecordRingItem) {
        self.cursor.store(item.sequence(), Ordering::Release);
        self.signal();
    }

    /// Compressor `thread_id`: claim the next sequence assigned to it.
    ///
    /// Returns `None` if the barriers were alerted, which tells the worker
    /// to exit.
    pub fn get_to_compress(&self, thread_id: u32) -> Option<&RecordRingItem> {
        let idx = thread_id as usize;
        let seq = self.next_compress[idx].load(Ordering::Relaxed);
        self.wait_until(|| self.cursor.load(Ordering::Acquire) >= seq)
            .ok()?;
        // Different compression threads get different items.
        self.next_compress[idx].store(
            seq + i64::from(self.compression_threads),
            Ordering::Relaxed,
        );
        Some(self.item(seq))
    }

    /// Compressor `thread_id`: release a compressed slot to the writer.
    ///
    /// Also releases, in advance, the `n - 1` sequences this worker will
    /// skip before its next claim, so `close()` never waits on a worker
    /// that happens to have no more work.
    pub fn release_compressor(&self, thread_id: u32, item: &RecordRingItem) {
        let released = item.sequence() + i64::from(self.compression_threads) - 1;
        self.compress_seqs[thread_id as usize].store(released, Ordering::Release);
        self.signal();
    }

    /// Writer: claim the next sequence, in strict order, once every
    /// compressor is past it.
    ///
    /// Returns `None` if the barriers were alerted.
    pub fn get_to_write(&self) -> Option<&RecordRingItem> {
        let seq = self.next_write.load(Ordering::Relaxed);
        self.wait_until(|| {
            self.compress_seqs
                .iter()
                .all(|s| s.load(Ordering::Acquire) >= seq)
        })
        .ok()?;
        self.next_write.store(seq + 1, Ordering::Relaxed);
        Some(self.item(seq))
    }

    /// Writer: release a written slot back to the producer.
    ///
    /// Releases are folded through a small reordering window so a higher
    /// sequence is never exposed to the producer before a lower one, which
    /// tolerates asynchronous writes completing out of issue order. Returns
    /// `false` if the slot was already released.
    pub fn release_writer(&self, item: &RecordRingItem) -> bool {
        if item.already_released.swap(true, Ordering::AcqRel) {
            return false;
        }

        let mut window = lock_ignoring_poison(&self.release_window);
        let seq = item.sequence();

        if seq > window.max_sequence {
            // If the old max was above the last released, another sequence
            // now sits in between.
            if window.max_sequence > window.last_released {
                window.between += 1;
            }
            window.max_sequence = seq;
        } else if seq > window.last_released {
            window.between += 1;
        }

        // Once everything between last and max has asked, release it all.
        if window.max_sequence - window.last_released - 1 == i64::from(window.between) {
            window.last_released = window.max_sequence;
            window.between = 0;
            self.write_released
                .store(window.max_sequence, Ordering::Release);
            drop(window);
            self.signal();
        }
        true
    }

    /// Wake every thread blocked on a barrier; they observe the alert and
    /// exit. Called on any worker error and during shutdown.
    pub fn error_alert(&self) {
        self.alerted.store(true, Ordering::Release);
        self.signal();
    }

    /// Has a worker recorded an error?
    pub fn have_error(&self) -> bool {
        self.have_error.load(Ordering::Acquire)
    }

    /// Record a worker error; the producer re-raises it on its next call.
    pub fn set_error(&self, message: String) {
        *lock_ignoring_poison(&self.error_message) = Some(message);
        self.have_error.store(true, Ordering::Release);
    }

    /// The recorded worker error, if any.
    pub fn error(&self) -> Option<String> {
        lock_ignoring_poison(&self.error_message).clone()
    }

    /// The stored error as an `EvioError::Async`.
    pub fn async_error(&self) -> EvioError {
        EvioError::Async(
            self.error()
                .unwrap_or_else(|| "record pipeline alerted".into()),
        )
    }

    /// Has writing stopped because the disk partition is full?
    pub fn is_disk_full(&self) -> bool {
        self.disk_full.load(Ordering::Acquire)
    }

    /// Set by the writer thread when it finds too little free space.
    pub fn set_disk_full(&self, full: bool) {
        self.disk_full.store(full, Ordering::Release);
    }
}

/// Marker: a barrier wait was interrupted by [`RecordSupply::error_alert`].
#[derive(Debug)]
struct Alerted;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn supply(ring: usize, threads: u32) -> Arc<RecordSupply> {
        Arc::new(
            RecordSupply::new(
                ring,
                ByteOrder::Little,
                threads,
                100,
                1 << 20,
                CompressionType::None,
            )
            .unwrap(),
        )
    }

    #[test]
    fn rejects_non_power_of_two() {
        assert!(matches!(
            RecordSupply::new(
                12,
                ByteOrder::Little,
                1,
                10,
                1024,
                CompressionType::None
            ),
            Err(EvioError::Config(_))
        ));
    }

    #[test]
    fn single_threaded_pass_through() {
        let supply = supply(4, 1);

        for round in 0..10i64 {
            let item = supply.get().unwrap();
            assert_eq!(item.sequence(), round);
            // SAFETY: producer owns the slot between get() and publish().
            #[allow(unsafe_code)]
            let record = unsafe { item.record_mut() };
            assert!(record.is_empty());
            assert!(record.add_event(&[round as u8; 8]));
            supply.publish(item);

            let item = supply.get_to_compress(0).unwrap();
            assert_eq!(item.sequence(), round);
            supply.release_compressor(0, item);

            let item = supply.get_to_write().unwrap();
            assert_eq!(item.sequence(), round);
            assert!(supply.release_writer(item));
        }
    }

    #[test]
    fn writer_sees_publish_order_with_parallel_compressors() {
        let threads = 4u32;
        let supply = supply(16, threads);
        let total = 200i64;

        let mut workers = Vec::new();
        for id in 0..threads {
            let sup = Arc::clone(&supply);
            workers.push(thread::spawn(move || {
                while let Some(item) = sup.get_to_compress(id) {
                    // SAFETY: this compressor owns the slot until release.
                    #[allow(unsafe_code)]
                    unsafe { item.record_mut() }.build().unwrap();
                    sup.release_compressor(id, item);
                }
            }));
        }

        let sup = Arc::clone(&supply);
        let writer = thread::spawn(move || {
            let mut seen = Vec::new();
            for _ in 0..total {
                let item = sup.get_to_write().expect("alerted early");
                seen.push(item.sequence());
                assert!(sup.release_writer(item));
            }
            seen
        });

        for i in 0..total {
            let item = supply.get().unwrap();
            // SAFETY: producer owns the slot between get() and publish().
            #[allow(unsafe_code)]
            unsafe { item.record_mut() }.add_event(&i.to_le_bytes());
            supply.publish(item);
        }

        let seen = writer.join().unwrap();
        assert_eq!(seen, (0..total).collect::<Vec<_>>());

        supply.error_alert();
        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn release_window_holds_higher_sequences() {
        let supply = supply(8, 1);

        // Move three items through to the writer.
        let mut seqs = Vec::new();
        for _ in 0..3 {
            let item = supply.get().unwrap();
            seqs.push(item.sequence());
            supply.publish(item);
            let item = supply.get_to_compress(0).unwrap();
            supply.release_compressor(0, item);
            let _ = supply.get_to_write().unwrap();
        }

        // Release out of order: 1 then 2 must wait for 0.
        assert!(supply.release_writer(supply.item(1)));
        assert_eq!(supply.write_released.load(Ordering::Acquire), -1);
        assert!(supply.release_writer(supply.item(2)));
        assert_eq!(supply.write_released.load(Ordering::Acquire), -1);
        assert!(supply.release_writer(supply.item(0)));
        assert_eq!(supply.write_released.load(Ordering::Acquire), 2);

        // Double release reports false.
        assert!(!supply.release_writer(supply.item(2)));
    }

    #[test]
    fn alert_wakes_blocked_consumer() {
        let supply = supply(4, 1);
        let sup = Arc::clone(&supply);
        let consumer = thread::spawn(move || sup.get_to_compress(0).is_none());

        // Give the consumer time to block on the empty supply, then alert.
        thread::sleep(std::time::Duration::from_millis(50));
        supply.error_alert();
        assert!(consumer.join().unwrap(), "consumer should see the alert");
    }

    #[test]
    fn error_is_stored_for_the_producer() {
        let supply = supply(4, 1);
        assert!(!supply.have_error());
        supply.set_error("compression failed on record 7".into());
        assert!(supply.have_error());
        assert!(supply
            .async_error()
            .to_string()
            .contains("compression failed"));
    }
}
