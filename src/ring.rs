//! Bounded MPMC index ring in shared memory
//!
//! Carries slot ids between processes: the free-slot registry is a ring with
//! no payload, the order queue is a ring whose entries also carry a small
//! metadata blob.
//!
//! # Design
//! - Fixed-size cells, each with a sequence number acting as its state
//! - Producers: claim tail -> write -> publish (sequence = pos + 1)
//! - Consumers: claim head -> read -> recycle (sequence = pos + capacity)
//! - Positions are monotonic u64 counters, so FIFO order is the order in
//!   which producers claimed the tail

use crate::wait::Deadline;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Cache line size
pub(crate) const CACHE_LINE_SIZE: usize = 64;

/// Padding to cache line
#[repr(C, align(64))]
struct CachePadded<T>(T);

/// Per-cell bookkeeping; payload bytes follow directly
#[repr(C)]
struct CellHeader {
    /// `pos` = writable for lap `pos`, `pos + 1` = readable
    sequence: AtomicU64,
    /// Slot id carried by this entry
    slot: AtomicU32,
    /// Length of the payload
    len: AtomicU32,
}

const CELL_HEADER_SIZE: usize = std::mem::size_of::<CellHeader>();

/// How long `try_pop` waits on a cell whose producer claimed it but has not
/// published yet
const IN_FLIGHT_SPINS: u32 = 1 << 12;

#[inline]
pub(crate) const fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

/// Ring header in shared memory
#[repr(C)]
pub struct RingHeader {
    /// Enqueue position (producers increment this to claim cells)
    tail: CachePadded<AtomicU64>,
    /// Dequeue position (consumers increment this to claim cells)
    head: CachePadded<AtomicU64>,
    /// Number of cells
    capacity: u64,
    /// Maximum payload per entry
    payload_capacity: u64,
    /// Bytes between consecutive cells
    cell_stride: u64,
    /// Padding
    _pad: [u8; CACHE_LINE_SIZE - 24],
}

impl RingHeader {
    const fn cell_stride(payload_capacity: usize) -> usize {
        align_up(CELL_HEADER_SIZE + payload_capacity, CACHE_LINE_SIZE)
    }

    /// Size of the ring in bytes (header + cells)
    pub const fn size_for(capacity: usize, payload_capacity: usize) -> usize {
        std::mem::size_of::<RingHeader>() + capacity * Self::cell_stride(payload_capacity)
    }

    /// Initialize an empty ring
    ///
    /// # Safety
    /// `ptr` must be valid for `size_for(capacity, payload_capacity)` bytes,
    /// aligned to a cache line, and not yet shared with other handles.
    pub unsafe fn init(ptr: *mut Self, capacity: usize, payload_capacity: usize) {
        let stride = Self::cell_stride(payload_capacity);
        (*ptr).tail.0 = AtomicU64::new(0);
        (*ptr).head.0 = AtomicU64::new(0);
        (*ptr).capacity = capacity as u64;
        (*ptr).payload_capacity = payload_capacity as u64;
        (*ptr).cell_stride = stride as u64;

        let cells = (ptr as *mut u8).add(std::mem::size_of::<RingHeader>());
        for i in 0..capacity {
            let cell = cells.add(i * stride) as *mut CellHeader;
            cell.write(CellHeader {
                sequence: AtomicU64::new(i as u64),
                slot: AtomicU32::new(0),
                len: AtomicU32::new(0),
            });
        }
    }
}

/// Handle onto a ring; any number of handles may push and pop concurrently
pub struct IndexRing {
    header: *const RingHeader,
    cells: *mut u8,
}

// SAFETY: cells are claimed through atomic CAS on head/tail before any
// non-atomic payload access, so a cell is touched by one handle at a time
unsafe impl Send for IndexRing {}
unsafe impl Sync for IndexRing {}

impl IndexRing {
    /// Create a handle from a raw pointer
    ///
    /// # Safety
    /// Pointer must be valid for the ring's full size and point to a ring
    /// initialized with [`RingHeader::init`].
    pub unsafe fn from_raw(header: *const RingHeader) -> Self {
        let cells = (header as *mut u8).add(std::mem::size_of::<RingHeader>());
        Self { header, cells }
    }

    #[inline(always)]
    fn header(&self) -> &RingHeader {
        unsafe { &*self.header }
    }

    #[inline(always)]
    fn cell_ptr(&self, pos: u64) -> *mut CellHeader {
        let header = self.header();
        let idx = (pos % header.capacity) as usize;
        unsafe { self.cells.add(idx * header.cell_stride as usize) as *mut CellHeader }
    }

    /// Number of cells
    #[inline]
    pub fn capacity(&self) -> usize {
        self.header().capacity as usize
    }

    /// Maximum payload length per entry
    #[inline]
    pub fn payload_capacity(&self) -> usize {
        self.header().payload_capacity as usize
    }

    /// Try to push an entry (non-blocking)
    ///
    /// Returns `true` if successful, `false` if the ring is full or the
    /// payload does not fit
    #[inline]
    pub fn try_push(&self, slot: u32, payload: &[u8]) -> bool {
        if payload.len() > self.payload_capacity() {
            return false;
        }

        let header = self.header();
        let mut pos = header.tail.0.load(Ordering::Relaxed);

        loop {
            let cell_ptr = self.cell_ptr(pos);
            let cell = unsafe { &*cell_ptr };
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as i64;

            if diff == 0 {
                // Claim the cell
                match header.tail.0.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        cell.slot.store(slot, Ordering::Relaxed);
                        cell.len.store(payload.len() as u32, Ordering::Relaxed);
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                payload.as_ptr(),
                                (cell_ptr as *mut u8).add(CELL_HEADER_SIZE),
                                payload.len(),
                            );
                        }

                        // Publish
                        cell.sequence.store(pos.wrapping_add(1), Ordering::Release);
                        return true;
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                // Cell from the previous lap is still unread
                return false;
            } else {
                pos = header.tail.0.load(Ordering::Relaxed);
            }
        }
    }

    /// Try to pop the oldest entry (non-blocking)
    ///
    /// Returns `Some((slot, payload_len))` if an entry was read.
    /// The payload is copied into the provided buffer, truncated to its length.
    ///
    /// If the head cell is claimed but not yet published while later cells
    /// may be, spins briefly for the producer before reporting empty.
    #[inline]
    pub fn try_pop(&self, buf: &mut [u8]) -> Option<(u32, usize)> {
        let header = self.header();
        let mut pos = header.head.0.load(Ordering::Relaxed);
        let mut spins = 0u32;

        loop {
            let cell_ptr = self.cell_ptr(pos);
            let cell = unsafe { &*cell_ptr };
            let seq = cell.sequence.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos.wrapping_add(1)) as i64;

            if diff == 0 {
                match header.head.0.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let slot = cell.slot.load(Ordering::Relaxed);
                        let len = cell.len.load(Ordering::Relaxed) as usize;
                        let copy_len = len.min(buf.len());
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                (cell_ptr as *const u8).add(CELL_HEADER_SIZE),
                                buf.as_mut_ptr(),
                                copy_len,
                            );
                        }

                        // Hand the cell to the producer one lap ahead
                        cell.sequence
                            .store(pos.wrapping_add(header.capacity), Ordering::Release);
                        return Some((slot, len));
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                let tail = header.tail.0.load(Ordering::Acquire);
                if tail.wrapping_sub(pos) as i64 <= 0 || spins == IN_FLIGHT_SPINS {
                    return None;
                }
                // A push is in flight at `pos`
                spins += 1;
                core::hint::spin_loop();
                pos = header.head.0.load(Ordering::Relaxed);
            } else {
                pos = header.head.0.load(Ordering::Relaxed);
            }
        }
    }

    /// Push, waiting until `deadline` for a free cell
    #[inline]
    pub fn push(&self, slot: u32, payload: &[u8], deadline: Deadline) -> bool {
        deadline
            .poll(|| self.try_push(slot, payload).then_some(()))
            .is_some()
    }

    /// Pop, waiting until `deadline` for a published entry
    #[inline]
    pub fn pop(&self, buf: &mut [u8], deadline: Deadline) -> Option<(u32, usize)> {
        deadline.poll(|| self.try_pop(buf))
    }

    /// Snapshot: is the oldest entry not yet readable?
    pub fn is_empty(&self) -> bool {
        let header = self.header();
        loop {
            let pos = header.head.0.load(Ordering::Acquire);
            let seq = unsafe { &*self.cell_ptr(pos) }
                .sequence
                .load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos.wrapping_add(1)) as i64;
            if diff <= 0 {
                return diff < 0;
            }
            // Head moved past this cell while we looked; retry
            core::hint::spin_loop();
        }
    }

    /// Snapshot of claimed-but-not-consumed entries
    pub fn len(&self) -> usize {
        let header = self.header();
        let head = header.head.0.load(Ordering::Acquire);
        let tail = header.tail.0.load(Ordering::Acquire);
        (tail.saturating_sub(head) as usize).min(self.capacity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wait::Wait;
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    /// Heap-backed ring standing in for a shared mapping
    struct TestRing {
        ptr: *mut u8,
        layout: std::alloc::Layout,
        ring: IndexRing,
    }

    unsafe impl Send for TestRing {}
    unsafe impl Sync for TestRing {}

    impl TestRing {
        fn new(capacity: usize, payload_capacity: usize) -> Self {
            let size = RingHeader::size_for(capacity, payload_capacity);
            let layout = std::alloc::Layout::from_size_align(size, CACHE_LINE_SIZE).unwrap();
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            let header = ptr as *mut RingHeader;
            unsafe {
                RingHeader::init(header, capacity, payload_capacity);
            }
            let ring = unsafe { IndexRing::from_raw(header) };
            Self { ptr, layout, ring }
        }
    }

    impl Drop for TestRing {
        fn drop(&mut self) {
            unsafe {
                std::alloc::dealloc(self.ptr, self.layout);
            }
        }
    }

    #[test]
    fn test_ring_basic() {
        let t = TestRing::new(4, 32);
        let ring = &t.ring;
        assert!(ring.is_empty());

        assert!(ring.try_push(7, b"boxes"));
        assert!(!ring.is_empty());
        assert_eq!(ring.len(), 1);

        let mut buf = [0u8; 32];
        let (slot, len) = ring.try_pop(&mut buf).unwrap();
        assert_eq!(slot, 7);
        assert_eq!(&buf[..len], b"boxes");
        assert!(ring.is_empty());
        assert!(ring.try_pop(&mut buf).is_none());
    }

    #[test]
    fn test_ring_full_and_fifo_across_laps() {
        let t = TestRing::new(3, 0);
        let ring = &t.ring;
        let mut buf = [0u8; 0];

        for lap in 0..5u32 {
            for i in 0..3 {
                assert!(ring.try_push(lap * 10 + i, &[]));
            }
            assert!(!ring.try_push(99, &[]), "fourth push must fail");
            for i in 0..3 {
                assert_eq!(ring.try_pop(&mut buf), Some((lap * 10 + i, 0)));
            }
        }
    }

    /// Claim the tail cell the way a producer does, without publishing
    fn claim_without_publish(ring: &IndexRing) -> u64 {
        ring.header().tail.0.fetch_add(1, Ordering::Relaxed)
    }

    fn publish(ring: &IndexRing, pos: u64, slot: u32) {
        let cell = unsafe { &*ring.cell_ptr(pos) };
        cell.slot.store(slot, Ordering::Relaxed);
        cell.len.store(0, Ordering::Relaxed);
        cell.sequence.store(pos + 1, Ordering::Release);
    }

    #[test]
    fn test_pop_behind_unpublished_cell_gives_up() {
        let t = TestRing::new(4, 0);
        let ring = &t.ring;
        let mut buf = [0u8; 0];

        let stalled = claim_without_publish(ring);
        assert!(ring.try_push(5, &[]));

        // Bounded wait on the stalled cell, never skips past it
        assert!(ring.try_pop(&mut buf).is_none());
        assert_eq!(ring.len(), 2);

        publish(ring, stalled, 4);
        assert_eq!(ring.try_pop(&mut buf), Some((4, 0)));
        assert_eq!(ring.try_pop(&mut buf), Some((5, 0)));
        assert!(ring.try_pop(&mut buf).is_none());
    }

    #[test]
    fn test_pop_waits_out_in_flight_push() {
        let t = Arc::new(TestRing::new(4, 0));
        let stalled = claim_without_publish(&t.ring);
        assert!(t.ring.try_push(9, &[]));

        let publisher = {
            let t = Arc::clone(&t);
            thread::spawn(move || publish(&t.ring, stalled, 8))
        };

        // Non-blocking pops see both entries once the producer catches up;
        // an empty result only means the short spin ran out first
        let mut buf = [0u8; 0];
        let mut got = Vec::new();
        while got.len() < 2 {
            if let Some((slot, _)) = t.ring.try_pop(&mut buf) {
                got.push(slot);
            }
        }
        publisher.join().unwrap();
        assert_eq!(got, vec![8, 9]);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let t = TestRing::new(2, 4);
        assert!(!t.ring.try_push(0, b"too long"));
        assert!(t.ring.is_empty());
    }

    #[test]
    fn test_pop_times_out() {
        let t = TestRing::new(2, 0);
        let mut buf = [0u8; 0];
        let deadline = Wait::Timeout(Duration::from_millis(10)).deadline();
        assert!(t.ring.pop(&mut buf, deadline).is_none());
    }

    #[test]
    fn test_concurrent_pops_hand_out_unique_ids() {
        const CAPACITY: usize = 64;
        const THREADS: usize = 8;

        let t = Arc::new(TestRing::new(CAPACITY, 0));
        for id in 0..CAPACITY as u32 {
            assert!(t.ring.try_push(id, &[]));
        }

        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let t = Arc::clone(&t);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let mut got = Vec::new();
                    let mut buf = [0u8; 0];
                    while let Some((id, _)) = t.ring.try_pop(&mut buf) {
                        got.push(id);
                    }
                    got
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(seen.insert(id), "slot {id} handed out twice");
            }
        }
        assert_eq!(seen.len(), CAPACITY);
    }

    #[test]
    fn test_mpmc_preserves_per_producer_order() {
        const PRODUCERS: u32 = 4;
        const PER_PRODUCER: u32 = 2_000;

        let t = Arc::new(TestRing::new(8, 4));
        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let t = Arc::clone(&t);
                thread::spawn(move || {
                    for seq in 0..PER_PRODUCER {
                        assert!(t.ring.push(p, &seq.to_le_bytes(), Wait::Forever.deadline()));
                    }
                })
            })
            .collect();

        let mut last = vec![None::<u32>; PRODUCERS as usize];
        let mut buf = [0u8; 4];
        for _ in 0..PRODUCERS * PER_PRODUCER {
            let (p, len) = t.ring.pop(&mut buf, Wait::Forever.deadline()).unwrap();
            assert_eq!(len, 4);
            let seq = u32::from_le_bytes(buf);
            if let Some(prev) = last[p as usize] {
                assert!(seq > prev, "producer {p} reordered");
            }
            last[p as usize] = Some(seq);
        }

        for h in producers {
            h.join().unwrap();
        }
        assert!(t.ring.is_empty());
    }
}
