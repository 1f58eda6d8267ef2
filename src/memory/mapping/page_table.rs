//! 单一页表页面（4K） [`PageTable`]，以及相应封装 [`FrameTracker`] 的 [`PageTableTracker`]

use super::page_table_entry::PageTableEntry;
use crate::memory::address::PhysicalPageNumber;
use crate::memory::config::PAGE_SIZE;
use crate::memory::frame::FrameTracker;

/// 每一级页表的项数
pub const ENTRY_COUNT: usize = PAGE_SIZE / core::mem::size_of::<PageTableEntry>();

/// 物理页按 PageTable 解释
#[repr(C)]
pub struct PageTable {
    pub entries: [PageTableEntry; ENTRY_COUNT],
}

impl PageTable {
    pub fn zero_init(&mut self) {
        self.entries = [Default::default(); ENTRY_COUNT];
    }

    /// 非空的页表项及其下标
    pub fn present_entries(&self) -> impl Iterator<Item = (usize, &PageTableEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| !entry.is_empty())
    }
}

/// 拥有页表所在的物理页，析构时归还
pub struct PageTableTracker(FrameTracker);

impl PageTableTracker {
    pub fn new(frame: FrameTracker) -> Self {
        let mut page_table = Self(frame);
        page_table.zero_init();
        page_table
    }
    pub fn page_number(&self) -> PhysicalPageNumber {
        self.0.page_number()
    }
}

impl core::ops::Deref for PageTableTracker {
    type Target = PageTable;
    fn deref(&self) -> &Self::Target {
        self.0.address().deref_kernel()
    }
}

impl core::ops::DerefMut for PageTableTracker {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.0.address().deref_kernel()
    }
}

impl PageTableEntry {
    pub fn get_next_table(&self) -> &'static mut PageTable {
        self.address().deref_kernel()
    }
}
