//! Single-producer broadcast ring (1→N).
//!
//! Strictly speaking 1→1: one consumer advances the shared
//! `consume_index`, any number of further consumers piggy-back with a
//! private cursor and never consume. Nothing protects a piggy-back
//! reader from falling more than a ring behind the writer except a
//! sufficiently large ring.

use std::slice;
use std::sync::atomic::Ordering;

use super::{lines_for, RingPtr, CACHE_LINE_SIZE, WORD_SIZE};

pub struct Producer {
    ring: RingPtr,
    // private write cursor, saves re-reading the shared atomic
    acquire_index: u64,
    reserved: bool,
}

impl Producer {
    pub fn new(queue_size: u64) -> Producer {
        Producer {
            ring: RingPtr::new(queue_size),
            acquire_index: 0,
            reserved: false,
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
        self.acquire_index = self.ring.header().write_index.load(Ordering::Acquire);
    }

    /// Reserves a contiguous block for `len` payload bytes.
    ///
    /// Panics when the reservation would overrun the consumer: the
    /// broadcast ring treats overflow as a programming error, the
    /// producer must be paced by its consumer.
    pub fn reserve(&mut self, len: usize) -> &mut [u8] {
        assert!(self.ring.is_set(), "no memory attached");
        assert!(!self.reserved, "reserve called twice without publish");

        let number_of_lines = lines_for(len);
        let queue_size = self.ring.queue_size();

        let normalized = self.acquire_index % queue_size;
        let mut goal_index = self.acquire_index.wrapping_add(number_of_lines);
        let mut skip_count = 0u64;

        // a message is one contiguous run of records; pad out the tail
        // of the ring rather than straddle the wrap
        if normalized + number_of_lines > queue_size {
            skip_count = queue_size - normalized;
            goal_index = goal_index.wrapping_add(skip_count);
        }

        let consume_index = self.ring.header().consume_index.load(Ordering::Acquire);
        if goal_index.wrapping_sub(consume_index) >= queue_size {
            panic!("broadcast ring is full, the producer overran its consumer");
        }

        let record = self.ring.record(self.acquire_index);
        record
            .data_count
            .store(number_of_lines as u32, Ordering::Relaxed);
        record.skip_count.store(skip_count as u32, Ordering::Relaxed);

        let payload_record = if skip_count != 0 {
            debug_assert_eq!(self.acquire_index.wrapping_add(skip_count) % queue_size, 0);
            self.ring.record(self.acquire_index.wrapping_add(skip_count))
        } else {
            record
        };

        self.acquire_index = goal_index;
        self.reserved = true;

        unsafe { slice::from_raw_parts_mut(payload_record.payload_ptr(), len) }
    }

    /// Makes the reservation visible to consumers.
    pub fn publish(&mut self) {
        assert!(self.reserved, "publish without a reservation");

        self.ring
            .header()
            .write_index
            .store(self.acquire_index, Ordering::Release);
        self.reserved = false;
    }
}

pub struct Consumer {
    ring: RingPtr,
    // private read cursor; only written back on consuming reads
    internal_consume_index: u64,
}

impl Consumer {
    pub fn new(queue_size: u64) -> Consumer {
        Consumer {
            ring: RingPtr::new(queue_size),
            internal_consume_index: 0,
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
    /// Same contract as [`Producer::set_memory`]. The private cursor
    /// starts from the shared `consume_index` at attach time; nothing
    /// protects a reader that later falls a full ring behind.
    pub unsafe fn set_memory(&mut self, ptr: *mut u8, clear: bool) {
        self.ring.set(ptr, clear);
        self.internal_consume_index = self.ring.header().consume_index.load(Ordering::Acquire);
    }

    /// The next unread message, or `None` when caught up with the
    /// producer. With `consume` the shared cursor advances too,
    /// releasing ring space; piggy-back readers always pass `false`.
    pub fn next(&mut self, consume: bool) -> Option<&[u8]> {
        assert!(self.ring.is_set(), "no memory attached");

        let last_index = self.ring.header().write_index.load(Ordering::Acquire);
        let internal = self.internal_consume_index;

        // nothing to read
        if last_index == internal {
            return None;
        }

        let record = self.ring.record(internal);
        let data_count = record.data_count.load(Ordering::Relaxed) as u64;
        let skip_count = record.skip_count.load(Ordering::Relaxed) as u64;

        self.internal_consume_index = internal.wrapping_add(data_count + skip_count);

        let payload_record = if skip_count != 0 {
            self.ring.record(internal.wrapping_add(skip_count))
        } else {
            record
        };

        if consume {
            self.ring
                .header()
                .consume_index
                .store(self.internal_consume_index, Ordering::Release);
        }

        let len = data_count as usize * CACHE_LINE_SIZE - WORD_SIZE;
        Some(unsafe { slice::from_raw_parts(payload_record.payload_ptr(), len) })
    }

    /// Releases everything read so far in one shot.
    pub fn consume_all(&mut self) {
        assert!(self.ring.is_set(), "no memory attached");

        self.ring
            .header()
            .consume_index
            .store(self.internal_consume_index, Ordering::Release);
    }
}

#[cfg(test)]
mod test {
    use super::super::testutil::AlignedMem;
    use super::*;

    fn setup(queue_size: u64) -> (AlignedMem, Producer, Consumer) {
        let mut producer = Producer::new(queue_size);
        let mut consumer = Consumer::new(queue_size);

        let mem = AlignedMem::new(producer.memory_size());
        unsafe {
            producer.set_memory(mem.ptr(), true);
            consumer.set_memory(mem.ptr(), false);
        }

        (mem, producer, consumer)
    }

    #[test]
    fn publish_and_read_in_order() {
        let (_mem, mut producer, mut consumer) = setup(64);

        for ii in 0..10u64 {
            let buf = producer.reserve(8);
            buf.copy_from_slice(&ii.to_ne_bytes());
            producer.publish();
        }

        for ii in 0..10u64 {
            let msg = consumer.next(true).unwrap();
            assert_eq!(u64::from_ne_bytes(msg[..8].try_into().unwrap()), ii);
        }

        assert!(consumer.next(true).is_none());
    }

    #[test]
    fn piggy_back_reader_sees_the_same_stream() {
        let mut producer = Producer::new(64);
        let mut consumer = Consumer::new(64);
        let mut reader = Consumer::new(64);

        let mem = AlignedMem::new(producer.memory_size());
        unsafe {
            producer.set_memory(mem.ptr(), true);
            consumer.set_memory(mem.ptr(), false);
            reader.set_memory(mem.ptr(), false);
        }

        for ii in 0..10u32 {
            let buf = producer.reserve(4);
            buf.copy_from_slice(&ii.to_ne_bytes());
            producer.publish();
        }

        for ii in 0..10u32 {
            let consumed = consumer.next(true).unwrap();
            assert_eq!(u32::from_ne_bytes(consumed[..4].try_into().unwrap()), ii);
        }

        // the piggy-back cursor is unaffected by the shared one
        for ii in 0..10u32 {
            let seen = reader.next(false).unwrap();
            assert_eq!(u32::from_ne_bytes(seen[..4].try_into().unwrap()), ii);
        }

        assert!(reader.next(false).is_none());
    }

    #[test]
    fn wrap_inserts_skip_records() {
        let (_mem, mut producer, mut consumer) = setup(8);

        // seven single-record messages leave one record before the wrap
        for ii in 0..7u8 {
            let buf = producer.reserve(1);
            buf[0] = ii;
            producer.publish();
        }

        for ii in 0..7u8 {
            let msg = consumer.next(true).unwrap();
            assert_eq!(msg[0], ii);
        }

        // two records needed: must skip the last record and restart at 0
        let buf = producer.reserve(100);
        buf.fill(0xab);
        producer.publish();

        let wrapped = consumer.next(true).unwrap();
        assert_eq!(wrapped.len(), 2 * CACHE_LINE_SIZE - WORD_SIZE);
        assert!(wrapped[..100].iter().all(|&b| b == 0xab));
    }

    #[test]
    fn many_wraps_round_trip() {
        let (_mem, mut producer, mut consumer) = setup(8);

        let mut rng_state = 0x12345u64;
        for ii in 0..200u64 {
            // cheap deterministic pseudo-random sizes
            rng_state = rng_state.wrapping_mul(6364136223846793005).wrapping_add(1);
            let len = 1 + (rng_state % 100) as usize;

            let buf = producer.reserve(len);
            buf.fill(ii as u8);
            producer.publish();

            let msg = consumer.next(true).unwrap();
            assert!(msg[..len].iter().all(|&b| b == ii as u8), "message {}", ii);
            assert!(consumer.next(true).is_none());
        }
    }

    #[test]
    #[should_panic(expected = "full")]
    fn overrunning_the_consumer_panics() {
        let (_mem, mut producer, _consumer) = setup(8);

        for _ in 0..9 {
            producer.reserve(1);
            producer.publish();
        }
    }
}
