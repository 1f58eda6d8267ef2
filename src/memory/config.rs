use super::address::{PhysicalAddress, PhysicalPageNumber, VirtualAddress};
use lazy_static::lazy_static;

pub const PAGE_SIZE: usize = 4096;

/// 通用内核堆（伙伴系统）的大小
pub const KERNEL_HEAP_SIZE: usize = 0x80_0000;

/// slab 从这块静态内存里切出各自的 arena
pub const SLAB_POOL_SIZE: usize = 0x20_0000;

/// 各 slab 大小类在启动时占用的 arena 大小
pub const SLAB_ARENA_SIZES: [(usize, usize); 4] = [
    (16, 128 * 1024),
    (32, 128 * 1024),
    (64, 512 * 1024),
    (128, 512 * 1024),
];

/// 可以访问的内存区域结束地址
pub const MEMORY_END_ADDRESS: PhysicalAddress = PhysicalAddress(0x8800_0000);

/// 内核线性映射的偏移量；主机测试里物理页就是进程里的普通内存，偏移为 0
#[cfg(not(test))]
pub const KERNEL_MAP_OFFSET: usize = 0xffff_ffff_0000_0000;
#[cfg(test)]
pub const KERNEL_MAP_OFFSET: usize = 0;

/// 用户地址空间窗口 [USER_SPACE_BASE, USER_SPACE_END)
pub const USER_SPACE_BASE: VirtualAddress = VirtualAddress(0x0001_0000);
pub const USER_SPACE_END: VirtualAddress = VirtualAddress(0x0000_003f_ffff_f000);

/// 内核窗口，所有地址空间共享这部分的顶级页表项
pub const KERNEL_SPACE_BASE: VirtualAddress = VirtualAddress(0xffff_ffff_8000_0000);
pub const KERNEL_SPACE_END: VirtualAddress = VirtualAddress(0xffff_ffff_ffff_f000);

/// 内核动态映射（由内核页目录的区间分配器管理）
pub const KERNEL_VM_BASE: VirtualAddress = VirtualAddress(0xffff_ffff_c000_0000);

/// 随机化分配的最大尝试次数
pub const MAX_RANDOMIZATION_ATTEMPTS: usize = 1000;

#[cfg(not(test))]
extern "C" {
    fn kernel_end();
}

#[cfg(test)]
const TEST_FRAME_COUNT: usize = 8192;

lazy_static! {
    /// 可以分配给页表和匿名内存的物理页区间
    pub static ref FRAME_RANGE: (PhysicalPageNumber, PhysicalPageNumber) = frame_range();
}

#[cfg(not(test))]
fn frame_range() -> (PhysicalPageNumber, PhysicalPageNumber) {
    let kernel_end = PhysicalAddress::from(VirtualAddress(kernel_end as usize));
    (
        PhysicalPageNumber::ceil(kernel_end),
        PhysicalPageNumber::floor(MEMORY_END_ADDRESS),
    )
}

/// 测试时向主机借一块按页对齐的内存当作物理内存
#[cfg(test)]
fn frame_range() -> (PhysicalPageNumber, PhysicalPageNumber) {
    let layout = core::alloc::Layout::from_size_align(TEST_FRAME_COUNT * PAGE_SIZE, PAGE_SIZE)
        .expect("bad test arena layout");
    let start = unsafe { std::alloc::alloc_zeroed(layout) } as usize;
    assert!(start != 0, "cannot reserve test arena");
    let start = PhysicalPageNumber::floor(PhysicalAddress(start));
    (start, start + TEST_FRAME_COUNT)
}
