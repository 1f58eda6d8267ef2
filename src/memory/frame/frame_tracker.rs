//! `Tracker` 就是指向物理页面的智能指针,
//! 对接物理内存管理器, 自动析构

use super::allocator::FRAME_ALLOCATOR;
use crate::memory::address::{PhysicalAddress, PhysicalPageNumber};
use crate::memory::config::PAGE_SIZE;

pub struct FrameTracker(pub(super) PhysicalPageNumber);

impl FrameTracker {
    /// 物理地址
    pub fn address(&self) -> PhysicalAddress {
        self.0.into()
    }
    /// 物理页号
    pub fn page_number(&self) -> PhysicalPageNumber {
        self.0
    }
    /// 申请一个清零的物理页
    pub fn new_zeroed() -> crate::memory::MemoryResult<Self> {
        let mut frame = FRAME_ALLOCATOR.lock().alloc()?;
        frame.fill(0);
        Ok(frame)
    }
}

impl core::fmt::Debug for FrameTracker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "FrameTracker({:#x})", self.address())
    }
}

impl core::ops::Deref for FrameTracker {
    type Target = [u8; PAGE_SIZE];
    fn deref(&self) -> &Self::Target {
        self.page_number().deref_kernel()
    }
}

impl core::ops::DerefMut for FrameTracker {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.page_number().deref_kernel()
    }
}

impl Drop for FrameTracker {
    fn drop(&mut self) {
        FRAME_ALLOCATOR.lock().dealloc(self);
    }
}
