//! 向外部的物理页分配器申请物理页

mod allocator;
mod frame_tracker;
mod stacked_allocator;

pub use allocator::{Allocator, FrameAllocator, FRAME_ALLOCATOR};
pub use frame_tracker::FrameTracker;
pub use stacked_allocator::StackedAllocator;
