//
// Wire-level structures and constants for the io_uring ABI.
//
// These types MUST match the reference Linux `io_uring` layout byte-for-byte:
// guest programs mmap these regions directly and read/write them without
// going through this crate.
//

use std::mem;

/// Magic mmap offsets the guest passes to `configure_mmap` to reach the two
/// backing regions. Matches `IORING_OFF_*` in the Linux header.
pub const OFF_SQ_RING: i64 = 0;
pub const OFF_CQ_RING: i64 = 0x0800_0000;
pub const OFF_SQES: i64 = 0x1000_0000;

/// `features` bit advertised by this emulator: SQ ring, CQ ring and SQE
/// array all live in a single mmap-able allocation pair (we still use two
/// allocations internally, see `region.rs`, but never more than one mmap
/// per `OFF_*`).
pub const FEAT_SINGLE_MMAP: u32 = 1 << 0;

/// Cache line size assumed for alignment of the rings header and padding
/// between its sections. Matches `L1_CACHE_BYTES` on the architectures the
/// reference kernel supports.
pub const CACHELINE: usize = 64;

pub const MAX_ENTRIES: u32 = 32 * 1024;
pub const MAX_CQ_ENTRIES: u32 = 2 * MAX_ENTRIES;

bitflags::bitflags! {
    /// Bits accepted in `RingParams::flags` on `new_ring`.
    pub struct SetupFlags: u32 {
        /// `cq_entries` is taken from the caller instead of derived from
        /// `sq_entries`.
        const CQSIZE = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Per-SQE flags. Only the zero value is accepted by the opcode
    /// handlers in this minimal core (see spec READV validation rules);
    /// the bit is still named so callers can detect why a nonzero value
    /// was rejected.
    pub struct SqeFlags: u8 {
        const FIXED_FILE = 1 << 0;
        const IO_DRAIN   = 1 << 1;
        const IO_LINK    = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Flags accepted by `process_submissions`. `GETEVENTS` is accepted
    /// and ignored beyond being a valid bit: `min_complete` is not honored
    /// in this core (see spec §9).
    pub struct EnterFlags: u32 {
        const GETEVENTS = 1 << 0;
    }
}

pub const IORING_OP_NOP: u8 = 0;
pub const IORING_OP_READV: u8 = 1;
pub const IORING_OP_WRITEV: u8 = 2;

/// Submission queue entry. 64 bytes, matching `struct io_uring_sqe`.
///
/// The spec's abstract field names (`off_or_addr_or_cmd`,
/// `addr_or_splice_off`) refer to the same storage as `off` and `addr`
/// below: the real ABI reuses these fields across opcodes via a union,
/// but since this core supports only NOP/READV/WRITEV we keep them as
/// plain fields with doc comments noting the reuse.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Sqe {
    pub opcode: u8,
    pub flags: u8,
    pub ioprio: u16,
    pub fd: i32,
    /// File offset for positional ops; reused as a command field by other
    /// opcodes in the full ABI (not exercised here).
    pub off: u64,
    /// Pointer to a guest iovec array for READV/WRITEV; reused as a splice
    /// offset by other opcodes in the full ABI (not exercised here).
    pub addr: u64,
    /// iovec count for READV/WRITEV.
    pub len: u32,
    pub rw_flags: i32,
    pub user_data: u64,
    pub buf_index: u16,
    pub personality: u16,
    pub _pad: [u64; 2],
}

const _: () = assert!(mem::size_of::<Sqe>() == 64, "Sqe must be 64 bytes");

/// Completion queue entry. 16 bytes, matching `struct io_uring_cqe`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Cqe {
    pub user_data: u64,
    pub res: i32,
    pub flags: u32,
}

const _: () = assert!(mem::size_of::<Cqe>() == 16, "Cqe must be 16 bytes");

/// Offsets of the submission-queue fields within the rings buffer, as
/// returned to the guest by `new_ring`. Matches `struct io_sqring_offsets`.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct SqOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub flags: u32,
    pub dropped: u32,
    pub array: u32,
    pub resv1: u32,
    pub resv2: u64,
}

/// Offsets of the completion-queue fields within the rings buffer, as
/// returned to the guest by `new_ring`. Matches `struct io_cqring_offsets`.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct CqOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub overflow: u32,
    pub cqes: u32,
    pub resv: [u64; 2],
}

/// Input/output of `new_ring`. Matches `struct io_uring_params`.
#[derive(Clone, Copy, Default)]
pub struct RingParams {
    pub sq_entries: u32,
    pub cq_entries: u32,
    pub flags: u32,
    pub sq_off: SqOffsets,
    pub cq_off: CqOffsets,
    pub features: u32,
}

impl RingParams {
    pub fn setup_flags(&self) -> SetupFlags {
        SetupFlags::from_bits_truncate(self.flags)
    }
}

/// Cache-line-aligned round up, used to place the CQE array and the SQ
/// index array on cache line boundaries within the rings buffer.
pub fn round_up_cacheline(n: usize) -> usize {
    round_up(n, CACHELINE)
}

/// Page-aligned round up, used to size the two backing allocations.
pub fn round_up_page(n: usize, page_size: usize) -> usize {
    round_up(n, page_size)
}

fn round_up(n: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (n + align - 1) & !(align - 1)
}

/// Next power of two `>= n`, `n >= 1`.
pub fn round_up_pow2(n: u32) -> u32 {
    if n <= 1 {
        1
    } else {
        n.next_power_of_two()
    }
}

/// Layout of the rings buffer header, shared between the guest (read-only
/// after setup, except `sq_tail`/`cq_head`) and the engine. Fields are laid
/// out in the same order as the reference kernel's `struct io_rings` so
/// that `SqOffsets`/`CqOffsets` above line up with real offsets.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct IoRingsHeader {
    pub sq_head: u32,
    pub sq_tail: u32,
    pub cq_head: u32,
    pub cq_tail: u32,
    pub sq_ring_mask: u32,
    pub cq_ring_mask: u32,
    pub sq_ring_entries: u32,
    pub cq_ring_entries: u32,
    pub sq_dropped: u32,
    pub sq_flags: u32,
    pub cq_flags: u32,
    pub cq_overflow: u32,
}

/// Byte offsets of each `IoRingsHeader` field, precomputed since all fields
/// are naturally aligned `u32`s with no inter-field padding.
pub mod header_offset {
    pub const SQ_HEAD: u32 = 0;
    pub const SQ_TAIL: u32 = 4;
    pub const CQ_HEAD: u32 = 8;
    pub const CQ_TAIL: u32 = 12;
    pub const SQ_RING_MASK: u32 = 16;
    pub const CQ_RING_MASK: u32 = 20;
    pub const SQ_RING_ENTRIES: u32 = 24;
    pub const CQ_RING_ENTRIES: u32 = 28;
    pub const SQ_DROPPED: u32 = 32;
    pub const SQ_FLAGS: u32 = 36;
    pub const CQ_FLAGS: u32 = 40;
    pub const CQ_OVERFLOW: u32 = 44;
    pub const HEADER_SIZE: u32 = 48;
}

const _: () = assert!(
    mem::size_of::<IoRingsHeader>() == header_offset::HEADER_SIZE as usize,
    "IoRingsHeader size must match precomputed offsets"
);

/// Computes `SqOffsets`/`CqOffsets`/layout sizes for a given `(sq_entries,
/// cq_entries)` pair. Both must already be powers of two.
pub struct RingLayout {
    pub sq_off: SqOffsets,
    pub cq_off: CqOffsets,
    /// Offset of the SQ index array (`uint32[sq_entries]`) within the
    /// rings buffer.
    pub sq_array_off: u32,
    /// Total size of the rings buffer, unpadded to a page.
    pub rings_buffer_len: usize,
    /// Total size of the SQE array, unpadded to a page.
    pub sqe_array_len: usize,
}

impl RingLayout {
    pub fn compute(sq_entries: u32, cq_entries: u32) -> Result<RingLayout, crate::error::Error> {
        use crate::error::Error;

        let cqes_off = round_up_cacheline(header_offset::HEADER_SIZE as usize);
        let cqes_bytes = (cq_entries as usize)
            .checked_mul(mem::size_of::<Cqe>())
            .ok_or(Error::Overflow)?;
        let sq_array_off_usize = cqes_off.checked_add(cqes_bytes).ok_or(Error::Overflow)?;
        let sq_array_off = round_up_cacheline(sq_array_off_usize);

        let sq_array_bytes = (sq_entries as usize)
            .checked_mul(mem::size_of::<u32>())
            .ok_or(Error::Overflow)?;
        let rings_buffer_len = sq_array_off.checked_add(sq_array_bytes).ok_or(Error::Overflow)?;

        let sqe_array_len = (sq_entries as usize)
            .checked_mul(mem::size_of::<Sqe>())
            .ok_or(Error::Overflow)?;

        let sq_off = SqOffsets {
            head: header_offset::SQ_HEAD,
            tail: header_offset::SQ_TAIL,
            ring_mask: header_offset::SQ_RING_MASK,
            ring_entries: header_offset::SQ_RING_ENTRIES,
            flags: header_offset::SQ_FLAGS,
            dropped: header_offset::SQ_DROPPED,
            array: u32::try_from(sq_array_off).map_err(|_| Error::Overflow)?,
            resv1: 0,
            resv2: 0,
        };

        let cq_off = CqOffsets {
            head: header_offset::CQ_HEAD,
            tail: header_offset::CQ_TAIL,
            ring_mask: header_offset::CQ_RING_MASK,
            ring_entries: header_offset::CQ_RING_ENTRIES,
            overflow: header_offset::CQ_OVERFLOW,
            cqes: u32::try_from(cqes_off).map_err(|_| Error::Overflow)?,
            resv: [0, 0],
        };

        Ok(RingLayout {
            sq_off,
            cq_off,
            sq_array_off: sq_off.array,
            rings_buffer_len,
            sqe_array_len,
        })
    }
}
