use super::frame_tracker::FrameTracker;
use super::stacked_allocator::StackedAllocator;
use crate::memory::address::PhysicalPageNumber;
use crate::memory::config::FRAME_RANGE;
use crate::memory::{MemoryError, MemoryResult};
use crate::sync::Lock;
use lazy_static::lazy_static;

/// 默认使用的分配器
pub type AllocImpl = StackedAllocator;

lazy_static! {
    pub static ref FRAME_ALLOCATOR: Lock<FrameAllocator<AllocImpl>> = {
        let (start, end) = *FRAME_RANGE;
        Lock::new(FrameAllocator::new(start, end - start))
    };
}

/// 分配器：固定容量，每次分配 / 回收一个元素
pub trait Allocator {
    /// 给定容量，创建分配器
    fn new(capacity: usize) -> Self;
    /// 分配一个元素，无法分配则返回 `None`
    fn alloc(&mut self) -> Option<usize>;
    /// 回收一个元素
    fn dealloc(&mut self, index: usize);
}

pub struct FrameAllocator<T: Allocator> {
    /// 起始页号
    start_ppn: PhysicalPageNumber,
    capacity: usize,
    allocated: usize,
    /// 分配器
    allocator: T,
}

impl<T: Allocator> FrameAllocator<T> {
    pub fn new(start_ppn: PhysicalPageNumber, capacity: usize) -> Self {
        FrameAllocator {
            start_ppn,
            capacity,
            allocated: 0,
            allocator: T::new(capacity),
        }
    }

    pub fn alloc(&mut self) -> MemoryResult<FrameTracker> {
        let offset = self.allocator.alloc().ok_or(MemoryError::OutOfMemory)?;
        self.allocated += 1;
        Ok(FrameTracker(self.start_ppn + offset))
    }

    pub fn free_count(&self) -> usize {
        self.capacity - self.allocated
    }

    /// 只由 FrameTracker 调用
    pub(super) fn dealloc(&mut self, frame: &FrameTracker) {
        let offset = frame.page_number() - self.start_ppn;
        assert!(offset < self.capacity, "freeing foreign frame {:#x}", frame.page_number());
        self.allocated -= 1;
        self.allocator.dealloc(offset);
    }
}
