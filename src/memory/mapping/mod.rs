//! 页表与页目录
//!
//! - [`PageTableEntry`] / [`PageTable`]：单个页表项和单张页表
//! - [`PagingMode`]：Sv39 或 Sv48，由 `sv48` feature 选定
//! - [`Mapping`]：一棵多级页表
//! - [`PageDirectory`]：一个地址空间的页表根加上它的虚拟区间分配器

mod mapping;
mod page_directory;
mod page_table;
mod page_table_entry;
mod paging;

pub use mapping::{Mapping, PageTableImpl};
pub use page_directory::{kernel_page_directory, ArchMapping, PageDirectory, PageDirectoryGuard};
pub use page_table::{PageTable, PageTableTracker, ENTRY_COUNT};
pub use page_table_entry::{Flags, PageTableEntry};
pub use paging::{ArchPaging, PagingMode, Sv39, Sv48};
