//
// Narrow contracts toward the external collaborators this crate does not
// implement: the page allocator / memory-file, the VFS mmap plumbing, and
// the task / address-space / FD-table abstraction. Production code plugs
// in real implementations; tests use `platform::fake`.
//

use std::io;
use std::sync::Arc;

use crate::error::Error;
use crate::view::BufferView;

/// Memory-cgroup-style accounting hint passed to `MemoryFile::allocate`.
/// The reference allocator threads this through to its own accounting;
/// this crate only needs to pass it along.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryUsage {
    Anonymous,
}

/// A page allocator / memory-file, i.e. the collaborator that backs ring
/// regions with real pages and tracks references to them.
pub trait MemoryFile: Send + Sync {
    /// Allocates `len` bytes (already page-rounded by the caller) and
    /// returns a handle to the range. Fails with `Error::NoMemory` on
    /// allocator exhaustion.
    fn allocate(&self, len: usize, usage: MemoryUsage) -> Result<Box<dyn MemoryRange>, Error>;
}

/// A reference-counted range of a `MemoryFile`. `Clone` increments the
/// file's refcount for this range; `Drop` decrements it. `map` returns a
/// fresh cached `BufferView` over the whole range.
pub trait MemoryRange: Send + Sync {
    fn len(&self) -> usize;
    fn map(&self) -> io::Result<BufferView>;
    fn clone_range(&self) -> Box<dyn MemoryRange>;
}

/// A guest task: the goroutine-equivalent unit of execution that may enter
/// `process_submissions`. Interruptible, owns an address space and an FD
/// table.
pub trait Task: Send + Sync {
    fn interrupted(&self) -> bool;
    fn address_space(&self) -> &dyn AddressSpace;
    fn fd_table(&self) -> &dyn FdTable;
}

/// Guest memory access used to materialize iovecs for READV/WRITEV.
pub trait AddressSpace: Send + Sync {
    fn copy_in(&self, addr: u64, buf: &mut [u8]) -> io::Result<usize>;
    fn copy_out(&self, addr: u64, buf: &[u8]) -> io::Result<usize>;
}

/// The generic per-task FD table, mapping small integers to open files.
pub trait FdTable: Send + Sync {
    fn get(&self, fd: i32) -> Option<Arc<dyn GuestFile>>;
}

/// A generic open file as seen by opcode handlers: positional read/write
/// only (no seeking, no splice — out of scope per spec).
pub trait GuestFile: Send + Sync {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;
}

/// Options passed down from the generic VFS `mmap` syscall handler, after
/// `configure_mmap` has resolved which backing region `opts.offset`
/// selects and reset it to 0 (spec §4.C).
#[derive(Clone, Copy, Debug)]
pub struct MmapOpts {
    pub offset: i64,
    pub length: usize,
}

/// A region of guest-visible address space, covering one backing range
/// (rings buffer or SQE array), as exposed to the VFS mmap plumbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub file_offset: usize,
    pub length: usize,
}

#[cfg(any(test, feature = "fake-platform"))]
pub mod fake {
    use super::*;
    use crate::view::BufferView;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Mutex, RwLock};

    /// In-memory `MemoryFile`: each `allocate` call hands out a
    /// `Vec<u8>`-backed range. Good enough to drive the engine end to end
    /// in tests without a real page allocator.
    #[derive(Default)]
    pub struct FakeMemoryFile;

    impl MemoryFile for FakeMemoryFile {
        fn allocate(&self, len: usize, _usage: MemoryUsage) -> Result<Box<dyn MemoryRange>, Error> {
            Ok(Box::new(MemoryRangeHandle::new(len)))
        }
    }

    /// Shared, reference-counted backing storage for a `FakeMemoryFile`
    /// allocation. `BufferView` is itself `Clone` and shares its backing
    /// bytes across clones, so every `map()` call (and every
    /// `clone_range()`) just hands out another clone of the same view.
    pub struct MemoryRangeHandle {
        view: BufferView,
        refcount: Arc<AtomicUsize>,
        len: usize,
    }

    impl MemoryRangeHandle {
        pub fn new(len: usize) -> MemoryRangeHandle {
            MemoryRangeHandle {
                view: BufferView::new(len),
                refcount: Arc::new(AtomicUsize::new(1)),
                len,
            }
        }

        /// Marks the cached view of this range stale, simulating a
        /// snapshot/restore remap requirement.
        pub fn mark_remap(&self) {
            self.view.invalidate();
        }
    }

    impl MemoryRange for MemoryRangeHandle {
        fn len(&self) -> usize {
            self.len
        }

        fn map(&self) -> io::Result<BufferView> {
            Ok(self.view.clone())
        }

        fn clone_range(&self) -> Box<dyn MemoryRange> {
            self.refcount.fetch_add(1, Ordering::SeqCst);
            Box::new(MemoryRangeHandle {
                view: self.view.clone(),
                refcount: self.refcount.clone(),
                len: self.len,
            })
        }
    }

    impl Drop for MemoryRangeHandle {
        fn drop(&mut self) {
            self.refcount.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Test `Task`: interruptible via a shared flag, backed by a single
    /// address space and FD table.
    pub struct FakeTask {
        interrupted: Arc<AtomicBool>,
        addr_space: FakeAddressSpace,
        fds: FakeFdTable,
    }

    impl FakeTask {
        pub fn new() -> FakeTask {
            FakeTask {
                interrupted: Arc::new(AtomicBool::new(false)),
                addr_space: FakeAddressSpace::default(),
                fds: FakeFdTable::default(),
            }
        }

        /// Like `new`, but with an addressable guest memory region of
        /// `capacity` bytes instead of the empty default.
        pub fn with_capacity(capacity: usize) -> FakeTask {
            FakeTask {
                interrupted: Arc::new(AtomicBool::new(false)),
                addr_space: FakeAddressSpace::with_capacity(capacity),
                fds: FakeFdTable::default(),
            }
        }

        pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
            self.interrupted.clone()
        }

        pub fn fds_mut(&mut self) -> &mut FakeFdTable {
            &mut self.fds
        }
    }

    impl Task for FakeTask {
        fn interrupted(&self) -> bool {
            self.interrupted.load(Ordering::SeqCst)
        }

        fn address_space(&self) -> &dyn AddressSpace {
            &self.addr_space
        }

        fn fd_table(&self) -> &dyn FdTable {
            &self.fds
        }
    }

    /// Test address space: a flat byte buffer addressed directly by the
    /// "guest address" (no real paging).
    #[derive(Default)]
    pub struct FakeAddressSpace {
        mem: Mutex<Vec<u8>>,
    }

    impl FakeAddressSpace {
        pub fn with_capacity(n: usize) -> FakeAddressSpace {
            FakeAddressSpace {
                mem: Mutex::new(vec![0u8; n]),
            }
        }
    }

    impl AddressSpace for FakeAddressSpace {
        fn copy_in(&self, addr: u64, buf: &mut [u8]) -> io::Result<usize> {
            let mem = self.mem.lock().unwrap();
            let start = addr as usize;
            let end = start
                .checked_add(buf.len())
                .filter(|&e| e <= mem.len())
                .ok_or_else(|| io::Error::from_raw_os_error(libc::EFAULT))?;
            buf.copy_from_slice(&mem[start..end]);
            Ok(buf.len())
        }

        fn copy_out(&self, addr: u64, buf: &[u8]) -> io::Result<usize> {
            let mut mem = self.mem.lock().unwrap();
            let start = addr as usize;
            let end = start
                .checked_add(buf.len())
                .filter(|&e| e <= mem.len())
                .ok_or_else(|| io::Error::from_raw_os_error(libc::EFAULT))?;
            mem[start..end].copy_from_slice(buf);
            Ok(buf.len())
        }
    }

    #[derive(Default)]
    pub struct FakeFdTable {
        files: Mutex<std::collections::HashMap<i32, Arc<dyn GuestFile>>>,
    }

    impl FakeFdTable {
        pub fn insert(&self, fd: i32, file: Arc<dyn GuestFile>) {
            self.files.lock().unwrap().insert(fd, file);
        }
    }

    impl FdTable for FakeFdTable {
        fn get(&self, fd: i32) -> Option<Arc<dyn GuestFile>> {
            self.files.lock().unwrap().get(&fd).cloned()
        }
    }

    /// Test file backed by an in-memory byte buffer.
    pub struct FakeFile {
        data: RwLock<Vec<u8>>,
    }

    impl FakeFile {
        pub fn new(data: Vec<u8>) -> FakeFile {
            FakeFile {
                data: RwLock::new(data),
            }
        }
    }

    impl GuestFile for FakeFile {
        fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
            let data = self.data.read().unwrap();
            let start = offset as usize;
            if start >= data.len() {
                return Ok(0);
            }
            let n = std::cmp::min(buf.len(), data.len() - start);
            buf[..n].copy_from_slice(&data[start..start + n]);
            Ok(n)
        }

        fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
            let mut data = self.data.write().unwrap();
            let start = offset as usize;
            if data.len() < start + buf.len() {
                data.resize(start + buf.len(), 0);
            }
            data[start..start + buf.len()].copy_from_slice(buf);
            Ok(buf.len())
        }
    }
}
