//
// Shared Buffer View (spec §4.B): a cached in-emulator mapping of a ring
// region, giving byte-slice and atomic access with writeback hints.
//
// The underlying bytes are shared between however many `BufferView`
// clones exist (the guest's own mmap is a separate mapping of the same
// pages in the real system; here, within one process, all views of a
// region point at the same backing allocation). Synchronization across
// readers/writers is the caller's job — the serialization protocol in
// `engine.rs` plus the discipline that the guest never writes fields the
// engine owns (and vice versa) — matching how a real mmap's coherence
// relies on the protocol above it, not on the mapping itself.
//

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Backing byte storage for a region. The boxed slice is allocated once
/// and never moved or resized, so raw pointers into it stay valid for the
/// lifetime of the `Arc`.
struct SharedBytes {
    cell: std::cell::UnsafeCell<Box<[u8]>>,
}

// SAFETY: all mutation goes through raw pointers and, for the fields the
// guest and the engine coordinate on, atomic operations. Concurrent plain
// byte writes to disjoint SQE/CQE slots are benign races in the same sense
// they would be for a real mmap shared with guest code.
unsafe impl Send for SharedBytes {}
unsafe impl Sync for SharedBytes {}

impl SharedBytes {
    fn new(len: usize) -> SharedBytes {
        SharedBytes {
            cell: std::cell::UnsafeCell::new(vec![0u8; len].into_boxed_slice()),
        }
    }

    fn ptr(&self) -> *mut u8 {
        unsafe { (*self.cell.get()).as_mut_ptr() }
    }

    fn len(&self) -> usize {
        unsafe { (*self.cell.get()).len() }
    }
}

/// A cached byte view over a backing region.
#[derive(Clone)]
pub struct BufferView {
    bytes: Arc<SharedBytes>,
    stale: Arc<AtomicBool>,
}

impl BufferView {
    /// Allocates a fresh, zeroed backing buffer of `len` bytes. Used by
    /// production `MemoryRange` implementations that own their storage
    /// directly; a real mmap-backed implementation would instead wrap the
    /// mapped pages, but the access pattern below is unchanged either way.
    pub fn new(len: usize) -> BufferView {
        BufferView {
            bytes: Arc::new(SharedBytes::new(len)),
            stale: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns a byte slice over `bytes[0..n]`. Panics if `n` exceeds the
    /// region length — callers are expected to have validated lengths
    /// against the region size before calling (mirroring the mapping
    /// adapter's own bounds check in `mapping.rs`).
    pub fn view(&self, n: usize) -> &[u8] {
        assert!(n <= self.bytes.len(), "view out of bounds");
        unsafe { std::slice::from_raw_parts(self.bytes.ptr(), n) }
    }

    /// Writes `data` at `offset`, overwriting whatever was there. Used for
    /// whole-SQE/CQE-sized writes; ordering for indices that the guest
    /// observes is established separately via the atomic accessors below.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.bytes.len(), "write out of bounds");
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.bytes.ptr().add(offset), data.len());
        }
    }

    /// Reads `len` bytes at `offset` into a freshly allocated vector.
    pub fn read_at(&self, offset: usize, len: usize) -> Vec<u8> {
        self.view(offset + len)[offset..offset + len].to_vec()
    }

    /// Reads a `#[repr(C)]` `Copy` struct at `offset`. Unaligned-safe: SQE
    /// and CQE offsets are multiples of their size, but this also holds
    /// when that's not guaranteed by a caller.
    pub fn read_struct<T: Copy>(&self, offset: usize) -> T {
        assert!(offset + std::mem::size_of::<T>() <= self.bytes.len(), "read_struct out of bounds");
        unsafe { (self.bytes.ptr().add(offset) as *const T).read_unaligned() }
    }

    /// Writes a `#[repr(C)]` `Copy` struct at `offset`.
    pub fn write_struct<T: Copy>(&self, offset: usize, value: &T) {
        let len = std::mem::size_of::<T>();
        assert!(offset + len <= self.bytes.len(), "write_struct out of bounds");
        unsafe {
            std::ptr::copy_nonoverlapping(value as *const T as *const u8, self.bytes.ptr().add(offset), len);
        }
    }

    /// Ensures writes to `bytes[0..n]` have propagated. In this
    /// single-process model there is no separate flush step, so this
    /// always succeeds; it returns whether the next `view` must be
    /// re-fetched (only true after a prior `invalidate`).
    pub fn writeback(&self, _n: usize) -> bool {
        self.take_stale()
    }

    /// Partial-range variant of `writeback`.
    pub fn writeback_window(&self, _off: usize, _n: usize) -> bool {
        self.take_stale()
    }

    /// Marks this cached view stale (the spec's `drop()` operation,
    /// renamed to avoid colliding with `Drop::drop`). Used when a
    /// snapshot/restore remap requires callers to re-fetch their view.
    pub fn invalidate(&self) -> bool {
        self.stale.store(true, Ordering::SeqCst);
        true
    }

    fn take_stale(&self) -> bool {
        self.stale.swap(false, Ordering::SeqCst)
    }

    /// Non-consuming staleness check, used to decide whether a cached
    /// `BufferView` must be re-fetched before further use.
    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        assert!(offset + 4 <= self.bytes.len(), "atomic access out of bounds");
        assert_eq!(offset % 4, 0, "misaligned atomic access");
        unsafe { &*(self.bytes.ptr().add(offset) as *const AtomicU32) }
    }

    pub fn load_u32(&self, offset: usize, order: Ordering) -> u32 {
        self.atomic_u32(offset).load(order)
    }

    pub fn store_u32(&self, offset: usize, value: u32, order: Ordering) {
        self.atomic_u32(offset).store(value, order)
    }

    /// Fetch-and-add; returns the value *before* the add, matching
    /// `AtomicU32::fetch_add`.
    pub fn add_u32(&self, offset: usize, delta: u32, order: Ordering) -> u32 {
        self.atomic_u32(offset).fetch_add(delta, order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_reflects_writes() {
        let v = BufferView::new(64);
        v.write_at(0, &[1, 2, 3, 4]);
        assert_eq!(v.view(4), &[1, 2, 3, 4]);
    }

    #[test]
    fn atomic_roundtrip() {
        let v = BufferView::new(64);
        v.store_u32(8, 42, Ordering::Release);
        assert_eq!(v.load_u32(8, Ordering::Acquire), 42);
        let prev = v.add_u32(8, 1, Ordering::Release);
        assert_eq!(prev, 42);
        assert_eq!(v.load_u32(8, Ordering::Acquire), 43);
    }

    #[test]
    fn invalidate_is_observed_once() {
        let v = BufferView::new(16);
        assert!(!v.writeback(16));
        v.invalidate();
        assert!(v.writeback(16));
        assert!(!v.writeback(16));
    }
}
