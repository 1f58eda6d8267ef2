//! 页表项 [`PageTableEntry`] 和标志位 [`Flags`]

use crate::memory::address::{PhysicalAddress, PhysicalPageNumber};
use bit_field::BitField;
use bitflags::bitflags;

/// Sv39 / Sv48 共用的 8 字节页表项
#[derive(Copy, Clone, Default, Eq, PartialEq)]
pub struct PageTableEntry(usize);

/// 物理页号所在的位
const PAGE_NUMBER_BITS: core::ops::Range<usize> = 10..54;

impl PageTableEntry {
    pub fn new(page_number: PhysicalPageNumber, flags: Flags) -> Self {
        let mut bits = flags.bits();
        bits.set_bits(PAGE_NUMBER_BITS, page_number.0);
        Self(bits)
    }
    pub fn page_number(&self) -> PhysicalPageNumber {
        PhysicalPageNumber(self.0.get_bits(PAGE_NUMBER_BITS))
    }
    pub fn address(&self) -> PhysicalAddress {
        PhysicalAddress::from(self.page_number())
    }
    pub fn flags(&self) -> Flags {
        Flags::from_bits_truncate(self.0)
    }
    pub fn bits(&self) -> usize {
        self.0
    }
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
    pub fn is_valid(&self) -> bool {
        self.flags().contains(Flags::VALID)
    }
    /// 有效且 R/W/X 全为 0 时指向下一级页表
    pub fn has_next_level(&self) -> bool {
        self.is_valid()
            && !self
                .flags()
                .intersects(Flags::READABLE | Flags::WRITABLE | Flags::EXECUTABLE)
    }
    pub fn is_writable(&self) -> bool {
        self.flags().contains(Flags::WRITABLE)
    }
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("page_number", &self.page_number())
            .field("flags", &self.flags())
            .finish()
    }
}

bitflags! {
    #[derive(Default)]
    pub struct Flags: usize {
        const VALID =       1 << 0;
        const READABLE =    1 << 1;
        const WRITABLE =    1 << 2;
        const EXECUTABLE =  1 << 3;
        const USER =        1 << 4;
        const GLOBAL =      1 << 5;
        const ACCESSED =    1 << 6;
        const DIRTY =       1 << 7;
        /// Svpbmt 的 NC 类型
        const NON_CACHEABLE = 1 << 61;
    }
}

macro_rules! implement_flags {
    ($field: ident, $name: ident, $quote: literal) => {
        impl Flags {
            #[doc = concat!("返回 `Flags::", $quote, "` 或 `Flags::empty()`")]
            pub fn $name(value: bool) -> Flags {
                if value {
                    Flags::$field
                } else {
                    Flags::empty()
                }
            }
        }
    };
}

implement_flags! {USER, user, "USER"}
implement_flags! {READABLE, readable, "READABLE"}
implement_flags! {WRITABLE, writable, "WRITABLE"}
implement_flags! {EXECUTABLE, executable, "EXECUTABLE"}
implement_flags! {NON_CACHEABLE, non_cacheable, "NON_CACHEABLE"}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_keeps_page_number_and_flags_apart() {
        let flags = Flags::VALID | Flags::READABLE | Flags::NON_CACHEABLE;
        let entry = PageTableEntry::new(PhysicalPageNumber(0xabcde), flags);
        assert_eq!(entry.page_number(), PhysicalPageNumber(0xabcde));
        assert_eq!(entry.flags(), flags);
        assert!(!entry.has_next_level());
        let table = PageTableEntry::new(PhysicalPageNumber(0x1234), Flags::VALID);
        assert!(table.has_next_level());
        assert_eq!(Flags::writable(false) | Flags::user(true), Flags::USER);
    }
}
