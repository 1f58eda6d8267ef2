//! 每个地址空间一个的页目录 [`PageDirectory`]
//!
//! 持有根页表和这个地址空间的虚拟区间分配器。内核只有一个常驻的页目录，
//! 用户页目录创建时复制内核窗口的根表项，于是内核映射在所有地址空间里可见。

use super::mapping::{Mapping, PageTableImpl};
use super::page_table::ENTRY_COUNT;
use super::page_table_entry::{Flags, PageTableEntry};
use super::paging::{ArchPaging, PagingMode};
use crate::arch;
use crate::memory::address::*;
use crate::memory::config::{
    KERNEL_SPACE_BASE, KERNEL_SPACE_END, KERNEL_VM_BASE, USER_SPACE_BASE, USER_SPACE_END,
};
use crate::memory::range_allocator::RangeAllocator;
use crate::memory::MemoryResult;
use crate::sync::{ReentrantGuard, ReentrantLock};
use alloc::sync::Arc;
use core::cell::RefCell;
use core::ops::RangeInclusive;
use lazy_static::lazy_static;

pub type ArchMapping = Mapping<ArchPaging>;

lazy_static! {
    static ref KERNEL_PAGE_DIRECTORY: Arc<PageDirectory> = match PageDirectory::create_kernel() {
        Ok(directory) => Arc::new(directory),
        Err(error) => panic!("cannot build kernel page directory: {}", error),
    };
}

/// 常驻的内核页目录，第一次访问时建立
pub fn kernel_page_directory() -> &'static Arc<PageDirectory> {
    &KERNEL_PAGE_DIRECTORY
}

/// 内核窗口占用的根表下标
fn kernel_root_indices() -> RangeInclusive<usize> {
    ArchPaging::index(VirtualPageNumber::floor(KERNEL_SPACE_BASE), 0)
        ..=ArchPaging::index(VirtualPageNumber::floor(KERNEL_SPACE_END - 1), 0)
}

pub struct PageDirectory {
    mapping: ReentrantLock<RefCell<ArchMapping>>,
    range_allocator: RangeAllocator,
    is_kernel: bool,
}

/// 持有页目录的锁；同一个核上可以继续调用页目录的方法
pub struct PageDirectoryGuard<'a> {
    _guard: ReentrantGuard<'a, RefCell<ArchMapping>>,
}

impl PageDirectory {
    fn create_kernel() -> MemoryResult<Self> {
        let mut mapping = ArchMapping::new()?;
        mapping.populate_root_entries(kernel_root_indices())?;
        log::debug!(
            "kernel page directory: root {:#x}, {} shared tables",
            mapping.root_address(),
            mapping.table_count() - 1
        );
        Ok(Self {
            mapping: ReentrantLock::new(RefCell::new(mapping)),
            range_allocator: RangeAllocator::with_range(
                KERNEL_VM_BASE,
                KERNEL_SPACE_END - KERNEL_VM_BASE,
            ),
            is_kernel: true,
        })
    }

    /// 新建用户页目录
    ///
    /// 区间分配器管理整个用户窗口，或者复制 `parent` 的空闲集合（fork）
    pub fn create_for_userspace(parent: Option<&RangeAllocator>) -> MemoryResult<Arc<Self>> {
        let mut mapping = ArchMapping::new()?;
        {
            let kernel = kernel_page_directory();
            let guard = kernel.mapping.lock();
            mapping.share_root_entries(&guard.borrow(), kernel_root_indices());
        }
        let range_allocator = RangeAllocator::new();
        match parent {
            Some(parent) => range_allocator.initialize_from_parent(parent),
            None => range_allocator.initialize(USER_SPACE_BASE, USER_SPACE_END - USER_SPACE_BASE),
        }
        log::trace!("user page directory: root {:#x}", mapping.root_address());
        Ok(Arc::new(Self {
            mapping: ReentrantLock::new(RefCell::new(mapping)),
            range_allocator,
            is_kernel: false,
        }))
    }

    pub fn range_allocator(&self) -> &RangeAllocator {
        &self.range_allocator
    }

    pub fn is_kernel(&self) -> bool {
        self.is_kernel
    }

    /// 把多次修改合成一个临界区
    pub fn lock(&self) -> PageDirectoryGuard<'_> {
        PageDirectoryGuard {
            _guard: self.mapping.lock(),
        }
    }

    pub fn is_locked_by_current(&self) -> bool {
        self.mapping.is_locked_by_current()
    }

    /// 写入一个叶子项，中间页表按需分配
    pub fn map(&self, va: VirtualAddress, pa: PhysicalAddress, flags: Flags) -> MemoryResult<()> {
        assert!(
            va.is_page_aligned() && pa.is_page_aligned(),
            "unaligned mapping {:#x} -> {:#x}",
            va,
            pa
        );
        let guard = self.mapping.lock();
        let previous = guard.borrow_mut().map(
            VirtualPageNumber::from(va),
            PhysicalPageNumber::from(pa),
            flags,
        )?;
        if previous.is_some() {
            arch::flush_tlb(va);
        }
        Ok(())
    }

    /// 清除一个叶子项，返回被清除的项
    pub fn unmap(&self, va: VirtualAddress) -> Option<PageTableEntry> {
        let guard = self.mapping.lock();
        let previous = guard.borrow_mut().unmap(VirtualPageNumber::floor(va));
        if previous.is_some() {
            arch::flush_tlb(va.page_base());
        }
        previous
    }

    pub fn entry(&self, va: VirtualAddress) -> Option<PageTableEntry> {
        let guard = self.mapping.lock();
        let entry = guard.borrow().entry(VirtualPageNumber::floor(va));
        entry
    }

    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let guard = self.mapping.lock();
        let address = guard.borrow().translate(va);
        address
    }

    pub fn root_physical_address(&self) -> PhysicalAddress {
        let guard = self.mapping.lock();
        let address = guard.borrow().root_address();
        address
    }

    /// 切换到这个页目录
    pub fn activate(&self) {
        let guard = self.mapping.lock();
        let satp = guard.borrow().satp();
        log::trace!("activating page directory, satp = {:#x}", satp);
        arch::activate_page_table(satp);
    }

    /// 本页目录自己的叶子项数：内核页目录只算内核窗口，用户页目录不算内核窗口
    pub fn mapped_page_count(&self) -> usize {
        let kernel = kernel_root_indices();
        let guard = self.mapping.lock();
        let mapping = guard.borrow();
        let is_kernel = self.is_kernel;
        let count =
            mapping.leaf_count((0..ENTRY_COUNT).filter(|index| kernel.contains(index) == is_kernel));
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::config::PAGE_SIZE;
    use crate::memory::frame::FrameTracker;
    use crate::memory::range::VirtualRange;

    #[test]
    fn map_translate_unmap() {
        let directory = PageDirectory::create_for_userspace(None).unwrap();
        let frame = FrameTracker::new_zeroed().unwrap();
        let va = VirtualAddress(0x20_0000);

        directory
            .map(va, frame.address(), Flags::READABLE | Flags::USER)
            .unwrap();
        assert_eq!(directory.translate(va + 8), Some(frame.address() + 8));
        assert_eq!(directory.mapped_page_count(), 1);
        assert!(directory.entry(va).unwrap().flags().contains(Flags::USER));

        let entry = directory.unmap(va).unwrap();
        assert_eq!(entry.page_number(), frame.page_number());
        assert!(directory.entry(va).is_none());
        assert_eq!(directory.mapped_page_count(), 0);
    }

    #[test]
    fn concurrent_map_and_unmap() {
        use std::sync::Arc;
        use std::thread;

        const THREADS: usize = 4;
        const PAGES: usize = 32;
        let directory = PageDirectory::create_for_userspace(None).unwrap();
        let workers: Vec<_> = (0..THREADS)
            .map(|id| {
                let directory = Arc::clone(&directory);
                thread::spawn(move || {
                    // 每个线程用自己的 2 MiB 窗口，中间级页表也会被并发创建
                    let base = 0x4000_0000 + id * 0x20_0000;
                    let frames: Vec<_> = (0..PAGES).map(|_| FrameTracker::new_zeroed().unwrap()).collect();
                    for (page, frame) in frames.iter().enumerate() {
                        let va = VirtualAddress(base + page * PAGE_SIZE);
                        directory.map(va, frame.address(), Flags::READABLE | Flags::USER).unwrap();
                    }
                    for (page, frame) in frames.iter().enumerate() {
                        let va = VirtualAddress(base + page * PAGE_SIZE);
                        assert_eq!(directory.translate(va), Some(frame.address()));
                    }
                    for (page, frame) in frames.iter().enumerate().filter(|(page, _)| page % 2 == 0) {
                        let va = VirtualAddress(base + page * PAGE_SIZE);
                        assert_eq!(directory.unmap(va).unwrap().page_number(), frame.page_number());
                    }
                    frames
                })
            })
            .collect();
        let frames: Vec<_> = workers.into_iter().map(|worker| worker.join().unwrap()).collect();
        assert_eq!(directory.mapped_page_count(), THREADS * PAGES / 2);
        for id in 0..THREADS {
            let base = 0x4000_0000 + id * 0x20_0000;
            for page in (1..PAGES).step_by(2) {
                directory.unmap(VirtualAddress(base + page * PAGE_SIZE)).unwrap();
            }
        }
        assert_eq!(directory.mapped_page_count(), 0);
        drop(frames);
    }

    #[test]
    fn user_directories_share_kernel_window() {
        let first = PageDirectory::create_for_userspace(None).unwrap();
        let second = PageDirectory::create_for_userspace(None).unwrap();
        assert_ne!(first.root_physical_address(), second.root_physical_address());

        let kernel = kernel_page_directory();
        let range = kernel
            .range_allocator()
            .allocate_anywhere(PAGE_SIZE, PAGE_SIZE)
            .unwrap();
        let frame = FrameTracker::new_zeroed().unwrap();
        kernel
            .map(range.base(), frame.address(), Flags::READABLE | Flags::WRITABLE)
            .unwrap();

        // 在内核页目录里新建的映射，之前创建的用户页目录也能看到
        assert_eq!(first.translate(range.base()), Some(frame.address()));
        assert_eq!(second.translate(range.base()), Some(frame.address()));
        assert_eq!(first.mapped_page_count(), 0);

        kernel.unmap(range.base());
        kernel.range_allocator().deallocate(range);
        assert_eq!(first.translate(range.base()), None);
    }

    #[test]
    fn user_allocator_covers_user_window_or_copies_parent() {
        let parent = PageDirectory::create_for_userspace(None).unwrap();
        assert_eq!(
            parent.range_allocator().total_range(),
            VirtualRange::new(USER_SPACE_BASE, USER_SPACE_END - USER_SPACE_BASE)
        );
        let taken = parent
            .range_allocator()
            .allocate_specific(VirtualAddress(0x40_0000), 4 * PAGE_SIZE)
            .unwrap();

        let child = PageDirectory::create_for_userspace(Some(parent.range_allocator())).unwrap();
        assert_eq!(
            child.range_allocator().free_ranges(),
            parent.range_allocator().free_ranges()
        );
        assert!(child
            .range_allocator()
            .allocate_specific(taken.base(), PAGE_SIZE)
            .is_err());
    }

    #[test]
    fn lock_is_reentrant_for_the_holder() {
        let directory = PageDirectory::create_for_userspace(None).unwrap();
        let frame = FrameTracker::new_zeroed().unwrap();
        let _guard = directory.lock();
        assert!(directory.is_locked_by_current());
        directory
            .map(VirtualAddress(0x30_0000), frame.address(), Flags::READABLE)
            .unwrap();
        assert!(directory.translate(VirtualAddress(0x30_0000)).is_some());
    }
}
