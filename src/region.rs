//
// Ring Memory Region (spec §4.A): the two page-aligned allocations backing
// a ring pair, and the page-rounding helper shared by both.
//

use std::sync::Arc;

use crate::abi::RingLayout;
use crate::error::Error;
use crate::platform::{MemoryFile, MemoryRange, MemoryUsage};
use crate::view::BufferView;

/// The two backing allocations for one io_uring ring pair.
pub struct RingRegions {
    pub rings_buffer: Box<dyn MemoryRange>,
    pub sqe_array: Box<dyn MemoryRange>,
}

impl RingRegions {
    /// Allocates both regions for the given layout from `memfile`. Sizes
    /// are rounded up to `page_size`; allocator failure maps to
    /// `Error::NoMemory`.
    pub fn allocate(
        memfile: &Arc<dyn MemoryFile>,
        layout: &RingLayout,
        page_size: usize,
    ) -> Result<RingRegions, Error> {
        let rings_len = crate::abi::round_up_page(layout.rings_buffer_len, page_size);
        let sqes_len = crate::abi::round_up_page(layout.sqe_array_len, page_size);

        let rings_buffer = memfile.allocate(rings_len, MemoryUsage::Anonymous)?;
        let sqe_array = memfile.allocate(sqes_len, MemoryUsage::Anonymous)?;

        Ok(RingRegions {
            rings_buffer,
            sqe_array,
        })
    }

    pub fn map_rings(&self) -> std::io::Result<BufferView> {
        self.rings_buffer.map()
    }

    pub fn map_sqes(&self) -> std::io::Result<BufferView> {
        self.sqe_array.map()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fake::FakeMemoryFile;

    #[test]
    fn allocates_page_rounded_regions() {
        let memfile: Arc<dyn MemoryFile> = Arc::new(FakeMemoryFile);
        let layout = RingLayout::compute(8, 16).unwrap();
        let regions = RingRegions::allocate(&memfile, &layout, 4096).unwrap();
        assert_eq!(regions.rings_buffer.len() % 4096, 0);
        assert_eq!(regions.sqe_array.len() % 4096, 0);
        assert!(regions.rings_buffer.len() >= layout.rings_buffer_len);
        assert!(regions.sqe_array.len() >= layout.sqe_array_len);
    }
}
