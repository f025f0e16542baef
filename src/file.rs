//
// The io_uring file object (spec §6): ties together ring regions, the
// ring header, the mappable adapters, and the submission engine into the
// file operations a guest syscall handler would dispatch to.
//

use std::sync::Arc;

use log::{debug, info};

use crate::abi::{
    header_offset, round_up_pow2, IoRingsHeader, RingLayout, RingParams, SetupFlags, FEAT_SINGLE_MMAP, MAX_CQ_ENTRIES,
    MAX_ENTRIES,
};
use crate::engine::{self, RingState};
use crate::error::Error;
use crate::mapping::{configure_mmap as mapping_configure_mmap, MmapTarget, RingsMappable, SqesMappable};
use crate::platform::{MemoryFile, MmapOpts, Task, Translation};
use crate::region::RingRegions;

/// The io_uring file object. One instance per `new_ring` call.
pub struct IoUringFile {
    state: RingState,
    rings_mappable: RingsMappable,
    sqes_mappable: SqesMappable,
}

impl IoUringFile {
    /// `new_ring` (spec §4.A, §6): validates `entries`/`params`, allocates
    /// both backing regions, and writes the initial ring header.
    pub fn new_ring(
        memfile: &Arc<dyn MemoryFile>,
        entries: u32,
        mut params: RingParams,
        page_size: usize,
    ) -> Result<(IoUringFile, RingParams), Error> {
        if entries == 0 || entries > MAX_ENTRIES {
            return Err(Error::Invalid);
        }
        let sq_entries = round_up_pow2(entries);

        let cq_entries = if params.setup_flags().contains(SetupFlags::CQSIZE) {
            let requested = round_up_pow2(params.cq_entries);
            if requested < sq_entries || requested > MAX_CQ_ENTRIES {
                return Err(Error::Invalid);
            }
            requested
        } else {
            sq_entries.checked_mul(2).ok_or(Error::Overflow)?
        };

        let layout = RingLayout::compute(sq_entries, cq_entries)?;
        let regions = RingRegions::allocate(memfile, &layout, page_size)?;

        let state = RingState::new(regions, layout, sq_entries, cq_entries).map_err(|_| Error::NoMemory)?;
        write_initial_header(&state, sq_entries, cq_entries);

        let rings_len = state.layout.rings_buffer_len;
        let sqes_len = state.layout.sqe_array_len;

        params.sq_entries = sq_entries;
        params.cq_entries = cq_entries;
        params.sq_off = state.layout.sq_off;
        params.cq_off = state.layout.cq_off;
        params.features = FEAT_SINGLE_MMAP;

        let file = IoUringFile {
            state,
            rings_mappable: RingsMappable::new(rings_len),
            sqes_mappable: SqesMappable::new(sqes_len),
        };

        info!(
            "io_uring: new ring sq_entries={} cq_entries={}",
            sq_entries, cq_entries
        );

        Ok((file, params))
    }

    /// `configure_mmap` (spec §4.C): dispatches by `opts.offset`, resets
    /// it to 0, and returns which backing region and translation the
    /// generic mmap configurator (out of scope) should wire up.
    pub fn configure_mmap(&self, opts: &mut MmapOpts) -> Result<Translation, Error> {
        let required = crate::mapping::Range {
            start: 0,
            end: opts.length,
        };
        let target = mapping_configure_mmap(opts, &self.rings_mappable, &self.sqes_mappable)?;
        match target {
            MmapTarget::Rings(m) => m.translate(required, required, crate::mapping::AccessType::READ | crate::mapping::AccessType::WRITE),
            MmapTarget::Sqes(m) => m.translate(required, required, crate::mapping::AccessType::READ | crate::mapping::AccessType::WRITE),
        }
    }

    /// `process_submissions` (spec §4.E, §6). Returns the boundary-level
    /// `(submitted, error)` pair: `submitted == -1` iff `error` is
    /// `Some(Error::Interrupted)`.
    pub fn process_submissions(
        &self,
        task: &dyn Task,
        to_submit: u32,
        _min_complete: u32,
        _flags: u32,
    ) -> (i32, Option<Error>) {
        match engine::process_submissions(&self.state, task, to_submit) {
            Ok(n) => (n as i32, None),
            Err(e) => (-1, Some(e)),
        }
    }

    /// Signals that the cached mappings of both regions must be
    /// re-established on next entry, per spec §9 (snapshot/restore).
    /// Must only be invoked by the restore orchestrator while no task is
    /// active inside the critical section.
    pub fn mark_remap(&self) {
        self.state.mark_remap();
    }

    pub fn sq_entries(&self) -> u32 {
        self.state.sq_entries
    }

    pub fn cq_entries(&self) -> u32 {
        self.state.cq_entries
    }

    pub fn layout(&self) -> &RingLayout {
        &self.state.layout
    }

    /// Returns a view of the rings buffer as the guest would see it
    /// through its own mmap of the same backing region. Production guest
    /// access goes through `configure_mmap` and the VFS mmap plumbing
    /// (out of scope here); this is the seam tests use to drive the ring
    /// protocol directly.
    pub fn guest_rings_view(&self) -> crate::view::BufferView {
        self.state.rings()
    }

    /// See `guest_rings_view`; same seam for the SQE array.
    pub fn guest_sqes_view(&self) -> crate::view::BufferView {
        self.state.sqes()
    }
}

impl Drop for IoUringFile {
    fn drop(&mut self) {
        // Region refcounts drop with `self.state.regions`; nothing else
        // to release explicitly (matching spec §3's lifecycle: the
        // regions stay allocated until the file object is dropped).
        debug!("io_uring: file object released");
    }
}

fn write_initial_header(state: &RingState, sq_entries: u32, cq_entries: u32) {
    let rings = state.rings();

    let header = IoRingsHeader {
        sq_head: 0,
        sq_tail: 0,
        cq_head: 0,
        cq_tail: 0,
        sq_ring_mask: sq_entries - 1,
        cq_ring_mask: cq_entries - 1,
        sq_ring_entries: sq_entries,
        cq_ring_entries: cq_entries,
        sq_dropped: 0,
        sq_flags: 0,
        cq_flags: 0,
        cq_overflow: 0,
    };
    rings.write_struct(0, &header);
    debug_assert_eq!(
        rings.load_u32(header_offset::SQ_RING_MASK as usize, std::sync::atomic::Ordering::Relaxed),
        sq_entries - 1
    );
}
