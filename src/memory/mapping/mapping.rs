//! 页表的构建 [`Mapping`]
//!
//! 多级页表的级数由 [`PagingMode`] 决定；中间页表按需分配，
//! 由 `page_tables` 持有，随 `Mapping` 一起释放。

use super::page_table::{PageTable, PageTableTracker};
use super::page_table_entry::{Flags, PageTableEntry};
use super::paging::PagingMode;
use crate::memory::address::*;
use crate::memory::frame::FRAME_ALLOCATOR;
use crate::memory::MemoryResult;
use alloc::{vec, vec::Vec};
use core::marker::PhantomData;
use core::ops::RangeInclusive;

/// 页表实现需要提供的能力，页目录只通过它来改动页表
pub trait PageTableImpl: Sized {
    fn new() -> MemoryResult<Self>;
    /// 写入一个叶子项，返回被覆盖的旧项
    fn map(
        &mut self,
        vpn: VirtualPageNumber,
        ppn: PhysicalPageNumber,
        flags: Flags,
    ) -> MemoryResult<Option<PageTableEntry>>;
    /// 清除一个叶子项，返回被清除的项
    fn unmap(&mut self, vpn: VirtualPageNumber) -> Option<PageTableEntry>;
    fn entry(&self, vpn: VirtualPageNumber) -> Option<PageTableEntry>;
    fn root_address(&self) -> PhysicalAddress;
}

pub struct Mapping<M: PagingMode> {
    page_tables: Vec<PageTableTracker>,
    root_ppn: PhysicalPageNumber,
    _mode: PhantomData<M>,
}

impl<M: PagingMode> Mapping<M> {
    /// 创建新映射, 分配根节点
    pub fn new() -> MemoryResult<Self> {
        let root_table = PageTableTracker::new(FRAME_ALLOCATOR.lock().alloc()?);
        let root_ppn = root_table.page_number();
        Ok(Mapping {
            page_tables: vec![root_table],
            root_ppn,
            _mode: PhantomData,
        })
    }

    fn root_table(&self) -> &'static mut PageTable {
        PhysicalAddress::from(self.root_ppn).deref_kernel()
    }

    /// 从根页表不断查找, 创建中间的页表, 最终找到对应的最低级页表项
    fn find_entry(&mut self, vpn: VirtualPageNumber) -> MemoryResult<&'static mut PageTableEntry> {
        let mut entry = &mut self.root_table().entries[M::index(vpn, 0)];
        for level in 1..M::LEVELS {
            if entry.is_empty() {
                // 如果页表不存在，则需要分配一个新的页表
                let new_table = PageTableTracker::new(FRAME_ALLOCATOR.lock().alloc()?);
                *entry = PageTableEntry::new(new_table.page_number(), Flags::VALID);
                self.page_tables.push(new_table);
            }
            assert!(
                entry.has_next_level(),
                "corrupted page table: {:?} at level {} while walking {:#x}",
                entry,
                level - 1,
                VirtualAddress::from(vpn)
            );
            entry = &mut entry.get_next_table().entries[M::index(vpn, level)];
        }
        Ok(entry)
    }

    /// 只读查找，不会分配
    fn walk(&self, vpn: VirtualPageNumber) -> Option<&'static mut PageTableEntry> {
        let mut entry = &mut self.root_table().entries[M::index(vpn, 0)];
        for level in 1..M::LEVELS {
            if entry.is_empty() {
                return None;
            }
            assert!(
                entry.has_next_level(),
                "corrupted page table: {:?} at level {} while walking {:#x}",
                entry,
                level - 1,
                VirtualAddress::from(vpn)
            );
            entry = &mut entry.get_next_table().entries[M::index(vpn, level)];
        }
        Some(entry)
    }

    pub fn map_one(
        &mut self,
        vpn: VirtualPageNumber,
        ppn: PhysicalPageNumber,
        flags: Flags,
    ) -> MemoryResult<Option<PageTableEntry>> {
        let entry = self.find_entry(vpn)?;
        let previous = core::mem::replace(entry, PageTableEntry::new(ppn, flags | Flags::VALID));
        Ok(Some(previous).filter(|entry| !entry.is_empty()))
    }

    pub fn unmap_one(&mut self, vpn: VirtualPageNumber) -> Option<PageTableEntry> {
        let entry = self.walk(vpn)?;
        if entry.is_empty() {
            return None;
        }
        let previous = *entry;
        entry.clear();
        Some(previous)
    }

    /// 非空的叶子项
    pub fn entry_of(&self, vpn: VirtualPageNumber) -> Option<PageTableEntry> {
        self.walk(vpn).map(|entry| *entry).filter(|entry| !entry.is_empty())
    }

    /// 查询虚拟地址对应的物理地址
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.entry_of(VirtualPageNumber::floor(va))
            .filter(|entry| entry.is_valid())
            .map(|entry| entry.address() + va.page_offset())
    }

    pub fn root_ppn(&self) -> PhysicalPageNumber {
        self.root_ppn
    }

    /// satp 寄存器的值：MODE | PPN
    pub fn satp(&self) -> usize {
        (M::SATP_MODE << 60) | self.root_ppn.0
    }

    /// 为根表的这些下标预先分配第二级页表，之后复制根表项的地址空间都能看到其中的映射
    pub fn populate_root_entries(&mut self, indices: RangeInclusive<usize>) -> MemoryResult<()> {
        let root_table = self.root_table();
        for index in indices {
            if root_table.entries[index].is_empty() {
                let new_table = PageTableTracker::new(FRAME_ALLOCATOR.lock().alloc()?);
                root_table.entries[index] = PageTableEntry::new(new_table.page_number(), Flags::VALID);
                self.page_tables.push(new_table);
            }
        }
        Ok(())
    }

    /// 复制另一个映射的根表项；下级页表共享，所有权仍在 `source`
    pub fn share_root_entries(&mut self, source: &Mapping<M>, indices: RangeInclusive<usize>) {
        let source_root = source.root_table();
        let root_table = self.root_table();
        for index in indices {
            root_table.entries[index] = source_root.entries[index];
        }
    }

    /// 根表下标落在 `indices` 中的叶子项数量
    pub fn leaf_count(&self, indices: impl Iterator<Item = usize>) -> usize {
        let root_table = self.root_table();
        indices
            .filter(|&index| root_table.entries[index].has_next_level())
            .map(|index| Self::count_leaves(root_table.entries[index].get_next_table(), 1))
            .sum()
    }

    fn count_leaves(table: &PageTable, level: usize) -> usize {
        if level + 1 == M::LEVELS {
            return table.present_entries().count();
        }
        table
            .present_entries()
            .filter(|(_, entry)| entry.has_next_level())
            .map(|(_, entry)| Self::count_leaves(entry.get_next_table(), level + 1))
            .sum()
    }

    /// 本映射自己拥有的页表页数（含根）
    pub fn table_count(&self) -> usize {
        self.page_tables.len()
    }
}

impl<M: PagingMode> PageTableImpl for Mapping<M> {
    fn new() -> MemoryResult<Self> {
        Mapping::new()
    }
    fn map(
        &mut self,
        vpn: VirtualPageNumber,
        ppn: PhysicalPageNumber,
        flags: Flags,
    ) -> MemoryResult<Option<PageTableEntry>> {
        self.map_one(vpn, ppn, flags)
    }
    fn unmap(&mut self, vpn: VirtualPageNumber) -> Option<PageTableEntry> {
        self.unmap_one(vpn)
    }
    fn entry(&self, vpn: VirtualPageNumber) -> Option<PageTableEntry> {
        self.entry_of(vpn)
    }
    fn root_address(&self) -> PhysicalAddress {
        PhysicalAddress::from(self.root_ppn)
    }
}

#[cfg(test)]
mod tests {
    use super::super::paging::{Sv39, Sv48};
    use super::*;
    use crate::memory::frame::FrameTracker;

    fn exercise<M: PagingMode>() {
        let mut mapping = Mapping::<M>::new().unwrap();
        let frame = FrameTracker::new_zeroed().unwrap();
        let va = VirtualAddress(0x4000_2000);
        let vpn = VirtualPageNumber::floor(va);

        let flags = Flags::READABLE | Flags::WRITABLE | Flags::USER;
        assert_eq!(mapping.map_one(vpn, frame.page_number(), flags).unwrap(), None);
        // 根之外每一级各分配一张
        assert_eq!(mapping.table_count(), M::LEVELS);
        assert_eq!(mapping.translate(va + 0x123), Some(frame.address() + 0x123));

        // 同一张末级页表里的相邻页不再分配
        mapping
            .map_one(vpn + 1, frame.page_number(), Flags::READABLE)
            .unwrap();
        assert_eq!(mapping.table_count(), M::LEVELS);
        assert_eq!(mapping.leaf_count(0..512), 2);

        let old = mapping.unmap_one(vpn).unwrap();
        assert_eq!(old.page_number(), frame.page_number());
        assert_eq!(old.flags(), flags | Flags::VALID);
        assert_eq!(mapping.translate(va), None);
        assert_eq!(mapping.unmap_one(vpn), None);
        assert_eq!(mapping.leaf_count(0..512), 1);
        assert_eq!(mapping.satp() >> 60, M::SATP_MODE);
    }

    #[test]
    fn three_level_mapping() {
        exercise::<Sv39>();
    }

    #[test]
    fn four_level_mapping() {
        exercise::<Sv48>();
    }

    #[test]
    fn remap_returns_previous_entry() {
        let mut mapping = Mapping::<Sv39>::new().unwrap();
        let vpn = VirtualPageNumber(0x1234);
        mapping.map_one(vpn, PhysicalPageNumber(7), Flags::READABLE).unwrap();
        let previous = mapping
            .map_one(vpn, PhysicalPageNumber(7), Flags::READABLE | Flags::WRITABLE)
            .unwrap()
            .unwrap();
        assert!(!previous.is_writable());
        assert!(mapping.entry_of(vpn).unwrap().is_writable());
    }

    #[test]
    fn shared_root_entries_see_later_mappings() {
        let mut source = Mapping::<Sv39>::new().unwrap();
        source.populate_root_entries(510..=511).unwrap();
        let mut target = Mapping::<Sv39>::new().unwrap();
        target.share_root_entries(&source, 510..=511);

        let va = VirtualAddress(0xffff_ffff_c000_3000);
        source
            .map_one(VirtualPageNumber::floor(va), PhysicalPageNumber(42), Flags::READABLE)
            .unwrap();
        assert_eq!(target.translate(va), Some(PhysicalAddress(42 * 4096)));
        // 共享的下级页表不归 target 所有
        assert_eq!(target.table_count(), 1);
    }

    #[test]
    #[should_panic(expected = "corrupted page table")]
    fn leaf_in_place_of_a_table_panics() {
        let mut mapping = Mapping::<Sv39>::new().unwrap();
        let vpn = VirtualPageNumber(0x1234);
        mapping.root_table().entries[Sv39::index(vpn, 0)] =
            PageTableEntry::new(PhysicalPageNumber(1), Flags::VALID | Flags::READABLE);
        let _ = mapping.map_one(vpn, PhysicalPageNumber(2), Flags::READABLE);
    }
}
