//! Many-producer, single-consumer request ring (N→1).
//!
//! Producers reserve a run of records by compare-and-swapping the
//! shared `write_index` forward, then publish by atomically adding the
//! record count into the run's leading `data_count`. Zero `data_count`
//! is the publication sentinel: the consumer probes it to find the next
//! message and stores zeroes back after draining, returning records to
//! the producers. A failed CAS or a momentarily full ring surfaces as
//! `None`; the caller retries.

use std::slice;
use std::sync::atomic::Ordering;

use log::debug;

use super::{lines_for, RingPtr, CACHE_LINE_SIZE, WORD_SIZE};

pub struct Producer {
    ring: RingPtr,
    // (leading record index, record count) of the open reservation
    reserved: Option<(u64, u64)>,
}

impl Producer {
    pub fn new(queue_size: u64) -> Producer {
        Producer {
            ring: RingPtr::new(queue_size),
            reserved: None,
        }
    }

    pub fn queue_size(&self) -> u64 {
        self.ring.queue_size()
    }

    pub fn memory_size(&self) -> usize {
        self.ring.memory_size()
    }

    /// # Safety
    ///
    /// `ptr` must reference [`memory_size`](Producer::memory_size)
    /// bytes of cache-line-aligned memory outliving this producer.
    /// Pass `clear` on the side that initializes the region.
    pub unsafe fn set_memory(&mut self, ptr: *mut u8, clear: bool) {
        self.ring.set(ptr, clear);
    }

    /// Tries to reserve a contiguous block for `len` payload bytes.
    /// `None` means another producer won the race (or the ring is
    /// momentarily full); retry.
    pub fn reserve(&mut self, len: usize) -> Option<&mut [u8]> {
        assert!(self.ring.is_set(), "no memory attached");
        assert!(self.reserved.is_none(), "reserve called twice without publish");

        let number_of_lines = lines_for(len);
        let queue_size = self.ring.queue_size();

        // the write index may change under our feet, cache it
        let acquire_index = self.ring.header().write_index.load(Ordering::Acquire);

        let normalized = acquire_index % queue_size;
        let mut goal_index = acquire_index.wrapping_add(number_of_lines);
        let mut skip_count = 0u64;

        if normalized + number_of_lines > queue_size {
            skip_count = queue_size - normalized;
            goal_index = goal_index.wrapping_add(skip_count);
        }

        let consume_index = self.ring.header().consume_index.load(Ordering::Acquire);
        if goal_index.wrapping_sub(consume_index) >= queue_size {
            return None;
        }

        if self
            .ring
            .header()
            .write_index
            .compare_exchange(acquire_index, goal_index, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(
                "race condition reserving block {} {}",
                acquire_index, goal_index
            );
            return None;
        }

        let record = self.ring.record(acquire_index);

        // the consumer zeroes records before releasing them; a non-zero
        // count here means the cursors are corrupt
        assert_eq!(
            record.data_count.load(Ordering::Acquire),
            0,
            "reserved a record still owned by the consumer"
        );

        record.skip_count.store(skip_count as u32, Ordering::Relaxed);

        self.reserved = Some((acquire_index, number_of_lines));

        let payload_record = if skip_count != 0 {
            self.ring.record(acquire_index.wrapping_add(skip_count))
        } else {
            record
        };

        Some(unsafe { slice::from_raw_parts_mut(payload_record.payload_ptr(), len) })
    }

    /// Publishes the reservation. Space was already claimed by the
    /// CAS; the non-zero `data_count` is what hands the message to the
    /// consumer.
    pub fn publish(&mut self) {
        let (index, number_of_lines) = match self.reserved.take() {
            Some(reserved) => reserved,
            None => panic!("publish without a reservation"),
        };

        self.ring
            .record(index)
            .data_count
            .fetch_add(number_of_lines as u32, Ordering::Release);
    }
}

pub struct Consumer {
    ring: RingPtr,
    // index of the message handed out by `next`, pending `consume`
    reserved: Option<u64>,
}

impl Consumer {
    pub fn new(queue_size: u64) -> Consumer {
        Consumer {
            ring: RingPtr::new(queue_size),
            reserved: None,
        }
    }

    pub fn queue_size(&self) -> u64 {
        self.ring.queue_size()
    }

    pub fn memory_size(&self) -> usize {
        self.ring.memory_size()
    }

    /// # Safety
    ///
    /// Same contract as [`Producer::set_memory`].
    pub unsafe fn set_memory(&mut self, ptr: *mut u8, clear: bool) {
        self.ring.set(ptr, clear);
    }

    /// The oldest published message, or `None` when the slot at the
    /// consume cursor has not been published yet. Must be released
    /// with [`consume`](Consumer::consume) before the next call.
    pub fn next(&mut self) -> Option<&[u8]> {
        assert!(self.ring.is_set(), "no memory attached");
        assert!(self.reserved.is_none(), "next called again before consume");

        let last_index = self.ring.header().write_index.load(Ordering::Acquire);
        let consume_index = self.ring.header().consume_index.load(Ordering::Relaxed);

        if consume_index == last_index {
            return None;
        }

        let record = self.ring.record(consume_index);

        let data_count = record.data_count.load(Ordering::Acquire) as u64;
        if data_count == 0 {
            // reserved but not yet published
            return None;
        }

        self.reserved = Some(consume_index);

        let skip_count = record.skip_count.load(Ordering::Relaxed) as u64;
        let payload_record = if skip_count != 0 {
            self.ring.record(consume_index.wrapping_add(skip_count))
        } else {
            record
        };

        let len = data_count as usize * CACHE_LINE_SIZE - WORD_SIZE;
        Some(unsafe { slice::from_raw_parts(payload_record.payload_ptr(), len) })
    }

    /// Returns the message's records to the producers: every skipped
    /// and data record gets its zero sentinel back, then the shared
    /// cursor advances.
    pub fn consume(&mut self) {
        let consume_index = match self.reserved.take() {
            Some(reserved) => reserved,
            None => panic!("consume without a pending message"),
        };

        let record = self.ring.record(consume_index);
        let data_count = record.data_count.load(Ordering::Relaxed) as u64;
        let skip_count = record.skip_count.load(Ordering::Relaxed) as u64;

        for ii in 0..skip_count {
            self.ring
                .record(consume_index.wrapping_add(ii))
                .data_count
                .store(0, Ordering::Relaxed);
        }

        // data records start over at the ring head after a skip
        let data_start = if skip_count != 0 {
            consume_index.wrapping_add(skip_count)
        } else {
            consume_index
        };

        for ii in 0..data_count {
            self.ring
                .record(data_start.wrapping_add(ii))
                .data_count
                .store(0, Ordering::Relaxed);
        }

        self.ring
            .header()
            .consume_index
            .fetch_add(data_count + skip_count, Ordering::Release);
    }
}
