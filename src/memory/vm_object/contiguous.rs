//! 一段固定的连续物理内存 [`ContiguousVmObject`]，例如设备寄存器或固件表
//!
//! 物理页不归这个对象所有，也不会被释放

use super::{MappingRegistry, VmObject};
use crate::memory::address::{PhysicalAddress, PhysicalPageNumber};
use crate::memory::config::PAGE_SIZE;
use crate::memory::{MemoryError, MemoryResult};
use alloc::sync::Arc;

pub struct ContiguousVmObject {
    base: PhysicalPageNumber,
    page_count: usize,
    mappings: MappingRegistry,
}

impl ContiguousVmObject {
    pub fn create_for_physical_range(base: PhysicalAddress, size: usize) -> MemoryResult<Arc<Self>> {
        if size == 0 || !base.is_page_aligned() || size % PAGE_SIZE != 0 {
            return Err(MemoryError::InvalidArgument);
        }
        Ok(Arc::new(Self {
            base: PhysicalPageNumber::from(base),
            page_count: size / PAGE_SIZE,
            mappings: MappingRegistry::new(),
        }))
    }

    pub fn base_address(&self) -> PhysicalAddress {
        PhysicalAddress::from(self.base)
    }

    fn page(&self, index: usize) -> PhysicalPageNumber {
        assert!(
            index < self.page_count,
            "page {} outside contiguous object of {} pages",
            index,
            self.page_count
        );
        self.base + index
    }
}

impl VmObject for ContiguousVmObject {
    fn page_count(&self) -> usize {
        self.page_count
    }

    fn get_or_create_page(&self, index: usize) -> MemoryResult<PhysicalPageNumber> {
        Ok(self.page(index))
    }

    fn physical_page(&self, index: usize) -> Option<PhysicalPageNumber> {
        Some(self.page(index))
    }

    /// 副本仍然指向同一段物理内存
    fn try_clone(&self) -> MemoryResult<Arc<dyn VmObject>> {
        Ok(Arc::new(Self {
            base: self.base,
            page_count: self.page_count,
            mappings: MappingRegistry::new(),
        }))
    }

    fn mappings(&self) -> &MappingRegistry {
        &self.mappings
    }

    fn class_name(&self) -> &'static str {
        "ContiguousVmObject"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_follow_the_physical_range() {
        let object =
            ContiguousVmObject::create_for_physical_range(PhysicalAddress(0x1000_0000), 2 * PAGE_SIZE)
                .unwrap();
        assert_eq!(object.page_count(), 2);
        assert_eq!(object.get_or_create_page(1).unwrap(), PhysicalPageNumber(0x10001));
        assert!(!object.should_cow(0, false));
        let clone = object.try_clone().unwrap();
        assert_eq!(clone.physical_page(0), object.physical_page(0));
        let unaligned = PhysicalAddress(0x1000_0800);
        assert!(ContiguousVmObject::create_for_physical_range(unaligned, PAGE_SIZE).is_err());
    }

    #[test]
    #[should_panic(expected = "outside contiguous object")]
    fn index_past_the_end_panics() {
        let object =
            ContiguousVmObject::create_for_physical_range(PhysicalAddress(0x2000_0000), PAGE_SIZE)
                .unwrap();
        let _ = object.physical_page(1);
    }
}
