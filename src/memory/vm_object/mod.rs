//! 区域背后的内存对象 [`VmObject`]
//!
//! 一个对象可以被多个地址空间里的多个区域共享（`Arc`），区域只在对象里登记
//! 弱引用 [`MappingRegistry`]，用于对象的页发生变化时撤销映射。

mod anonymous;
mod contiguous;

pub use anonymous::AnonymousVmObject;
pub use contiguous::ContiguousVmObject;

use crate::memory::address::{PhysicalPageNumber, VirtualAddress};
use crate::memory::config::PAGE_SIZE;
use crate::memory::mapping::PageDirectory;
use crate::memory::MemoryResult;
use crate::sync::Lock;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

pub trait VmObject: Send + Sync {
    fn page_count(&self) -> usize;

    fn size(&self) -> usize {
        self.page_count() * PAGE_SIZE
    }

    /// 第 `index` 页的物理页，不存在则分配（匿名内存清零）
    fn get_or_create_page(&self, index: usize) -> MemoryResult<PhysicalPageNumber>;

    /// 已经存在的物理页
    fn physical_page(&self, index: usize) -> Option<PhysicalPageNumber>;

    /// 写这一页之前是否需要先复制；共享区域从不复制
    fn should_cow(&self, _index: usize, _shared: bool) -> bool {
        false
    }

    /// 物理页是否同时属于别的对象
    fn is_page_shared(&self, _index: usize) -> bool {
        false
    }

    /// 让这一页成为本对象私有，返回之后应当映射的物理页
    fn break_cow(&self, index: usize) -> MemoryResult<PhysicalPageNumber> {
        self.get_or_create_page(index)
    }

    /// fork 时私有区域使用的副本
    fn try_clone(&self) -> MemoryResult<Arc<dyn VmObject>>;

    fn is_anonymous(&self) -> bool {
        false
    }

    fn mappings(&self) -> &MappingRegistry;

    fn class_name(&self) -> &'static str;
}

/// 对象被映射到的位置：`directory` 中从 `base` 开始，对应对象的
/// `[first_page, first_page + page_count)` 页
#[derive(Clone)]
pub struct MappingRecord {
    id: usize,
    pub directory: Weak<PageDirectory>,
    pub base: VirtualAddress,
    pub first_page: usize,
    pub page_count: usize,
}

impl MappingRecord {
    /// 对象第 `index` 页在这个映射里的虚拟地址
    pub fn address_of(&self, index: usize) -> Option<VirtualAddress> {
        if index < self.first_page || index >= self.first_page + self.page_count {
            return None;
        }
        Some(self.base + (index - self.first_page) * PAGE_SIZE)
    }
}

/// 映射登记表，只持有页目录的弱引用
#[derive(Default)]
pub struct MappingRegistry {
    records: Lock<Vec<MappingRecord>>,
}

static NEXT_MAPPING_ID: AtomicUsize = AtomicUsize::new(1);

impl MappingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一个映射，返回注销用的编号
    pub fn register(
        &self,
        directory: &Arc<PageDirectory>,
        base: VirtualAddress,
        first_page: usize,
        page_count: usize,
    ) -> usize {
        let id = NEXT_MAPPING_ID.fetch_add(1, Ordering::Relaxed);
        self.records.lock().push(MappingRecord {
            id,
            directory: Arc::downgrade(directory),
            base,
            first_page,
            page_count,
        });
        id
    }

    pub fn unregister(&self, id: usize) {
        self.records.lock().retain(|record| record.id != id);
    }

    /// 当前仍然存活的映射；顺带清理页目录已经销毁的记录
    pub fn snapshot(&self) -> Vec<MappingRecord> {
        let mut records = self.records.lock();
        records.retain(|record| record.directory.strong_count() > 0);
        records.clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 撤销对象第 `index` 页的所有映射
    ///
    /// 调用者不能持有对象自己的锁
    pub fn invalidate_page(&self, index: usize) {
        for record in self.snapshot() {
            if let (Some(directory), Some(address)) =
                (record.directory.upgrade(), record.address_of(index))
            {
                directory.unmap(address);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_drops_dead_directories() {
        let registry = MappingRegistry::new();
        let alive = PageDirectory::create_for_userspace(None).unwrap();
        let id = registry.register(&alive, VirtualAddress(0x10_0000), 2, 4);
        {
            let dead = PageDirectory::create_for_userspace(None).unwrap();
            registry.register(&dead, VirtualAddress(0x20_0000), 0, 1);
        }
        let records = registry.snapshot();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].address_of(3), Some(VirtualAddress(0x10_1000)));
        assert_eq!(records[0].address_of(1), None);
        assert_eq!(records[0].address_of(6), None);
        registry.unregister(id);
        assert!(registry.is_empty());
    }
}
