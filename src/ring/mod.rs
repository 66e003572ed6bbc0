//! Lock-free shared-memory ring buffers laid out in cache-line-sized
//! records, usable across processes.
//!
//! Both variants share one layout: two padded atomic cursors followed
//! by a power-of-two count of 64-byte records. A record spends its
//! first eight bytes on a `data_count`/`skip_count` pair; a message
//! longer than one payload occupies a contiguous run of records, with
//! padding ("skip") records inserted at the tail of the ring when the
//! run would otherwise straddle the wrap.
//!
//! The memory itself usually comes from
//! [`SharedMemory`](crate::sys::shm::SharedMemory); any 64-byte-aligned
//! region of [`ring_bytes`] bytes works.

use std::cell::UnsafeCell;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64};

pub mod mpsc;
pub mod spmc;

pub const CACHE_LINE_SIZE: usize = 64;

const WORD_SIZE: usize = 8;

/// Payload bytes carried by a single record.
pub const RECORD_PAYLOAD_SIZE: usize = CACHE_LINE_SIZE - WORD_SIZE;

#[repr(C, align(64))]
pub(crate) struct Header {
    pub(crate) write_index: AtomicU64,
    _pad0: [u8; CACHE_LINE_SIZE - WORD_SIZE],
    pub(crate) consume_index: AtomicU64,
    _pad1: [u8; CACHE_LINE_SIZE - WORD_SIZE],
}

#[repr(C)]
pub(crate) struct Record {
    pub(crate) data_count: AtomicU32,
    pub(crate) skip_count: AtomicU32,
    payload: UnsafeCell<[u8; RECORD_PAYLOAD_SIZE]>,
}

// records are only ever touched through the cursor protocols
unsafe impl Sync for Record {}

impl Record {
    pub(crate) fn payload_ptr(&self) -> *mut u8 {
        self.payload.get() as *mut u8
    }
}

const _: () = assert!(mem::size_of::<Header>() == 2 * CACHE_LINE_SIZE);
const _: () = assert!(mem::size_of::<Record>() == CACHE_LINE_SIZE);
const _: () = assert!(CACHE_LINE_SIZE.is_power_of_two());

/// Bytes of memory a ring of `queue_size` records occupies.
pub fn ring_bytes(queue_size: u64) -> usize {
    mem::size_of::<Header>() + queue_size as usize * CACHE_LINE_SIZE
}

/// Records needed for `len` payload bytes; the first record donates
/// eight bytes to its header fields.
pub(crate) fn lines_for(len: usize) -> u64 {
    ((len + WORD_SIZE - 1) / CACHE_LINE_SIZE) as u64 + 1
}

/// An attachable view over ring memory. Cursor comparisons rely on
/// unsigned modular arithmetic and the power-of-two record count.
pub(crate) struct RingPtr {
    mem: *mut u8,
    queue_size: u64,
}

unsafe impl Send for RingPtr {}

impl RingPtr {
    pub(crate) fn new(queue_size: u64) -> RingPtr {
        assert!(
            queue_size.is_power_of_two(),
            "ring size must be a power of two"
        );

        RingPtr {
            mem: ptr::null_mut(),
            queue_size,
        }
    }

    pub(crate) fn queue_size(&self) -> u64 {
        self.queue_size
    }

    pub(crate) fn memory_size(&self) -> usize {
        ring_bytes(self.queue_size)
    }

    /// # Safety
    ///
    /// `ptr` must reference at least [`memory_size`](RingPtr::memory_size)
    /// bytes, aligned to the cache line size, valid for the lifetime of
    /// this view.
    pub(crate) unsafe fn set(&mut self, ptr: *mut u8, clear: bool) {
        debug_assert_eq!(ptr as usize % CACHE_LINE_SIZE, 0);

        if clear {
            ptr::write_bytes(ptr, 0, self.memory_size());
        }

        self.mem = ptr;
    }

    pub(crate) fn is_set(&self) -> bool {
        !self.mem.is_null()
    }

    pub(crate) fn header(&self) -> &Header {
        debug_assert!(self.is_set());
        unsafe { &*(self.mem as *const Header) }
    }

    /// The record at `index mod queue_size`.
    pub(crate) fn record(&self, index: u64) -> &Record {
        debug_assert!(self.is_set());

        let idx = (index % self.queue_size) as usize;
        unsafe { &*(self.mem.add(mem::size_of::<Header>()).cast::<Record>().add(idx)) }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    use super::CACHE_LINE_SIZE;

    /// Cache-line aligned zeroed heap memory standing in for a shared
    /// mapping in unit tests.
    pub(crate) struct AlignedMem {
        ptr: *mut u8,
        layout: Layout,
    }

    unsafe impl Send for AlignedMem {}
    unsafe impl Sync for AlignedMem {}

    impl AlignedMem {
        pub(crate) fn new(size: usize) -> AlignedMem {
            let layout = Layout::from_size_align(size, CACHE_LINE_SIZE).unwrap();
            let ptr = unsafe { alloc_zeroed(layout) };
            assert!(!ptr.is_null());

            AlignedMem { ptr, layout }
        }

        pub(crate) fn ptr(&self) -> *mut u8 {
            self.ptr
        }
    }

    impl Drop for AlignedMem {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr, self.layout) };
        }
    }
}
