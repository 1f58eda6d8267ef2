//! 匿名内存 [`AnonymousVmObject`]：首次访问时分配清零的物理页
//!
//! 物理页以 `Arc<FrameTracker>` 存放，fork 后两个对象共享同一批页，
//! 引用计数就是"这一页是否被共享"。

use super::{MappingRegistry, VmObject};
use crate::memory::address::PhysicalPageNumber;
use crate::memory::config::PAGE_SIZE;
use crate::memory::frame::FrameTracker;
use crate::memory::{MemoryError, MemoryResult};
use crate::sync::Lock;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use bit_field::BitField;

pub struct AnonymousVmObject {
    inner: Lock<Inner>,
    mappings: MappingRegistry,
}

struct Inner {
    pages: Vec<Option<Arc<FrameTracker>>>,
    /// 写之前需要复制的页
    cow: Vec<u64>,
}

impl Inner {
    fn with_page_count(page_count: usize) -> Self {
        Self {
            pages: vec![None; page_count],
            cow: vec![0; (page_count + 63) / 64],
        }
    }

    fn is_cow(&self, index: usize) -> bool {
        self.cow[index / 64].get_bit(index % 64)
    }

    fn set_cow(&mut self, index: usize, value: bool) {
        self.cow[index / 64].set_bit(index % 64, value);
    }

    fn check_index(&self, index: usize) {
        assert!(
            index < self.pages.len(),
            "page {} outside anonymous object of {} pages",
            index,
            self.pages.len()
        );
    }

    fn get_or_create(&mut self, index: usize) -> MemoryResult<&Arc<FrameTracker>> {
        self.check_index(index);
        if self.pages[index].is_none() {
            self.pages[index] = Some(Arc::new(FrameTracker::new_zeroed()?));
        }
        self.pages[index].as_ref().ok_or(MemoryError::OutOfMemory)
    }
}

impl AnonymousVmObject {
    /// `size` 字节、按页取整的匿名对象；物理页在访问时才分配
    pub fn create_with_size(size: usize) -> MemoryResult<Arc<Self>> {
        if size == 0 {
            return Err(MemoryError::InvalidArgument);
        }
        let page_count = (size + PAGE_SIZE - 1) / PAGE_SIZE;
        Ok(Arc::new(Self {
            inner: Lock::new(Inner::with_page_count(page_count)),
            mappings: MappingRegistry::new(),
        }))
    }

    /// 写时复制尚未解除的页数
    pub fn cow_pages(&self) -> usize {
        let inner = self.inner.lock();
        (0..inner.pages.len()).filter(|&index| inner.is_cow(index)).count()
    }

    /// 已经分配了物理页的页数
    pub fn resident_pages(&self) -> usize {
        self.inner.lock().pages.iter().filter(|page| page.is_some()).count()
    }

    /// 丢弃一页的内容：撤销所有映射后释放物理页，下次访问重新得到零页
    pub fn discard_page(&self, index: usize) {
        let page = {
            let mut inner = self.inner.lock();
            inner.check_index(index);
            inner.set_cow(index, false);
            inner.pages[index].take()
        };
        if page.is_some() {
            self.mappings.invalidate_page(index);
            log::trace!("anonymous object: discarded page {}", index);
        }
        // 映射撤销之后 `page` 才在这里释放
    }
}

impl VmObject for AnonymousVmObject {
    fn page_count(&self) -> usize {
        self.inner.lock().pages.len()
    }

    fn get_or_create_page(&self, index: usize) -> MemoryResult<PhysicalPageNumber> {
        let mut inner = self.inner.lock();
        let frame = inner.get_or_create(index)?;
        Ok(frame.page_number())
    }

    fn physical_page(&self, index: usize) -> Option<PhysicalPageNumber> {
        let inner = self.inner.lock();
        inner.check_index(index);
        inner.pages[index].as_ref().map(|frame| frame.page_number())
    }

    fn should_cow(&self, index: usize, shared: bool) -> bool {
        if shared {
            return false;
        }
        let inner = self.inner.lock();
        inner.check_index(index);
        inner.is_cow(index)
    }

    fn is_page_shared(&self, index: usize) -> bool {
        let inner = self.inner.lock();
        inner.check_index(index);
        inner.pages[index]
            .as_ref()
            .map_or(false, |frame| Arc::strong_count(frame) > 1)
    }

    /// 页仍被别的对象引用时复制一份，否则只清除标记
    fn break_cow(&self, index: usize) -> MemoryResult<PhysicalPageNumber> {
        let mut inner = self.inner.lock();
        let frame = inner.get_or_create(index)?.clone();
        // 自己手里的 clone 也算一个
        if Arc::strong_count(&frame) > 2 {
            let mut copy = FrameTracker::new_zeroed()?;
            copy.copy_from_slice(&frame[..]);
            log::trace!(
                "anonymous object: copied page {} from {:#x} to {:#x}",
                index,
                frame.address(),
                copy.address()
            );
            inner.pages[index] = Some(Arc::new(copy));
        }
        inner.set_cow(index, false);
        inner.pages[index]
            .as_ref()
            .map(|frame| frame.page_number())
            .ok_or(MemoryError::OutOfMemory)
    }

    /// 两个对象共享所有已有的页，并且都把它们标记为写时复制
    fn try_clone(&self) -> MemoryResult<Arc<dyn VmObject>> {
        let mut inner = self.inner.lock();
        for index in 0..inner.pages.len() {
            if inner.pages[index].is_some() {
                inner.set_cow(index, true);
            }
        }
        let clone = Self {
            inner: Lock::new(Inner {
                pages: inner.pages.clone(),
                cow: inner.cow.clone(),
            }),
            mappings: MappingRegistry::new(),
        };
        Ok(Arc::new(clone))
    }

    fn is_anonymous(&self) -> bool {
        true
    }

    fn mappings(&self) -> &MappingRegistry {
        &self.mappings
    }

    fn class_name(&self) -> &'static str {
        "AnonymousVmObject"
    }
}
