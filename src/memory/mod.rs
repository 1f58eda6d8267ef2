//! 虚拟内存管理
//!
//! 自底向上：slab 与内核堆、物理页、虚拟区间分配、页表与页目录、
//! 后备内存对象、区域与缺页处理、地址空间。

pub mod address;
pub mod address_space;
pub mod config;
pub mod fault;
pub mod frame;
pub mod heap;
pub mod mapping;
pub mod range;
pub mod range_allocator;
pub mod region;
pub mod slab;
pub mod vm_object;

use core::fmt;

/// 可以交还给调用者的分配类错误
///
/// 不变量被破坏（重复释放、页表损坏等）不在这里，检测到时直接 panic
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemoryError {
    /// 没有放得下的空闲虚拟区间
    OutOfVirtualMemory,
    /// 指定的位置和已有映射重叠
    RangeUnavailable,
    /// 物理页（包括中间页表）耗尽
    OutOfMemory,
    /// 大小、对齐或偏移不合法
    InvalidArgument,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            MemoryError::OutOfVirtualMemory => "out of virtual memory",
            MemoryError::RangeUnavailable => "requested range is unavailable",
            MemoryError::OutOfMemory => "out of physical memory",
            MemoryError::InvalidArgument => "invalid argument",
        };
        f.write_str(message)
    }
}

pub type MemoryResult<T> = Result<T, MemoryError>;

pub use address_space::{
    allocate_kernel_region, allocate_kernel_region_for_physical_range, AddressSpace,
    AllocationStrategy,
};
pub use fault::{FaultAccess, FaultType, PageFault, PageFaultResponse, Privilege};
pub use mapping::{kernel_page_directory, PageDirectory};
pub use range::VirtualRange;
pub use range_allocator::RangeAllocator;
pub use region::{Access, InheritMode, Region};
pub use vm_object::{AnonymousVmObject, ContiguousVmObject, VmObject};

/// 启动时调用：先建立通用堆，再切出各个 slab
pub fn init() {
    heap::init();
    slab::init();
    log::info!("memory: heap and slab allocators initialized");
    let kernel = kernel_page_directory();
    log::info!(
        "memory: kernel page directory at {:#x}, {} frames free",
        kernel.root_physical_address(),
        frame::FRAME_ALLOCATOR.lock().free_count()
    );
}
