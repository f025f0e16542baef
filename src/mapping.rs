//
// Mappable Adapters (spec §4.C): the two objects that expose ring memory
// to the guest address space through the VFS mmap plumbing.
//
// Both regions are pinned for the file's lifetime, so `add_mapping`,
// `remove_mapping`, and `copy_mapping` are no-ops: there is nothing to
// track per-mapping beyond what the VFS layer itself already does.
//

use crate::abi::{OFF_CQ_RING, OFF_SQ_RING, OFF_SQES};
use crate::error::Error;
use crate::platform::{MmapOpts, Translation};

/// Byte range `[start, end)` requested of a `Mappable`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Range {
    pub start: usize,
    pub end: usize,
}

bitflags::bitflags! {
    pub struct AccessType: u8 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// A mappable region (one of the two backing ranges behind an io_uring
/// file). Matches the VFS mmap contract the reference kernel uses for
/// anything backed by a fixed, pinned allocation.
pub trait Mappable: Send + Sync {
    fn add_mapping(&self, _required: Range, _writable: bool) {}
    fn remove_mapping(&self, _required: Range) {}
    fn copy_mapping(&self, _from: Range, _to: Range) {}

    /// Translates `optional` (clamped to `required`, both already
    /// validated non-empty by the caller) against the backing region.
    /// `required.end` past the region length faults; out-of-range parts
    /// of `optional` are clamped away rather than faulting, same as a
    /// real file-backed mapping extending past EOF.
    fn translate(&self, required: Range, optional: Range, access: AccessType) -> Result<Translation, Error>;

    fn invalidate_unsavable(&self) {}
}

/// Shared translate() body for both adapters: identical except for the
/// region length each closes over.
fn translate_within(len: usize, required: Range, optional: Range) -> Result<Translation, Error> {
    if required.end > len {
        return Err(Error::Fault);
    }
    let start = optional.start.min(len);
    let end = optional.end.min(len);
    Ok(Translation {
        file_offset: start,
        length: end.saturating_sub(start),
    })
}

/// Adapter over the rings buffer (SQ ring header + CQE array + SQ index
/// array), reachable at both `OFF_SQ_RING` and `OFF_CQ_RING`.
pub struct RingsMappable {
    len: usize,
}

impl RingsMappable {
    pub fn new(len: usize) -> RingsMappable {
        RingsMappable { len }
    }
}

impl Mappable for RingsMappable {
    fn translate(&self, required: Range, optional: Range, _access: AccessType) -> Result<Translation, Error> {
        // §9: translate returns full access regardless of the requested
        // access type; the caller enforces protection via the page table
        // built from configure_mmap's result.
        translate_within(self.len, required, optional)
    }
}

/// Adapter over the SQE array, reachable at `OFF_SQES`.
pub struct SqesMappable {
    len: usize,
}

impl SqesMappable {
    pub fn new(len: usize) -> SqesMappable {
        SqesMappable { len }
    }
}

impl Mappable for SqesMappable {
    fn translate(&self, required: Range, optional: Range, _access: AccessType) -> Result<Translation, Error> {
        translate_within(self.len, required, optional)
    }
}

/// Which backing region a `configure_mmap` call resolved to.
pub enum MmapTarget<'a> {
    Rings(&'a RingsMappable),
    Sqes(&'a SqesMappable),
}

/// Dispatches `opts.offset` to the rings or SQEs adapter and resets the
/// offset to 0 before the generic mmap configurator (out of scope here)
/// would take over. Any other offset is rejected.
pub fn configure_mmap<'a>(
    opts: &mut MmapOpts,
    rings: &'a RingsMappable,
    sqes: &'a SqesMappable,
) -> Result<MmapTarget<'a>, Error> {
    let target = match opts.offset {
        OFF_SQ_RING | OFF_CQ_RING => MmapTarget::Rings(rings),
        OFF_SQES => MmapTarget::Sqes(sqes),
        _ => return Err(Error::Invalid),
    };
    opts.offset = 0;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_faults_past_region_end() {
        let m = RingsMappable::new(4096);
        let required = Range { start: 0, end: 8192 };
        let optional = Range { start: 0, end: 8192 };
        assert!(matches!(m.translate(required, optional, AccessType::READ), Err(Error::Fault)));
    }

    #[test]
    fn translate_clamps_optional_to_region() {
        let m = RingsMappable::new(4096);
        let required = Range { start: 0, end: 4096 };
        let optional = Range { start: 0, end: 8192 };
        let t = m.translate(required, optional, AccessType::READ).unwrap();
        assert_eq!(t.file_offset, 0);
        assert_eq!(t.length, 4096);
    }

    #[test]
    fn configure_mmap_dispatches_and_resets_offset() {
        let rings = RingsMappable::new(4096);
        let sqes = SqesMappable::new(4096);
        let mut opts = MmapOpts { offset: OFF_CQ_RING, length: 4096 };
        let target = configure_mmap(&mut opts, &rings, &sqes).unwrap();
        assert!(matches!(target, MmapTarget::Rings(_)));
        assert_eq!(opts.offset, 0);

        let mut opts = MmapOpts { offset: OFF_SQES, length: 4096 };
        let target = configure_mmap(&mut opts, &rings, &sqes).unwrap();
        assert!(matches!(target, MmapTarget::Sqes(_)));
        assert_eq!(opts.offset, 0);
    }

    #[test]
    fn configure_mmap_rejects_unknown_offset() {
        let rings = RingsMappable::new(4096);
        let sqes = SqesMappable::new(4096);
        let mut opts = MmapOpts { offset: 0x2000_0000, length: 4096 };
        assert!(matches!(
            configure_mmap(&mut opts, &rings, &sqes),
            Err(Error::Invalid)
        ));
    }
}
