//! 表示虚拟地址区间 [`VirtualRange`]

use super::address::{VirtualAddress, VirtualPageNumber};
use super::config::PAGE_SIZE;

/// 虚拟地址区间 `[base, base + size)`，`size > 0` 时 `base + size` 不会回绕
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct VirtualRange {
    base: VirtualAddress,
    size: usize,
}

impl VirtualRange {
    pub fn new(base: VirtualAddress, size: usize) -> Self {
        assert!(
            base.checked_offset(size).is_some(),
            "virtual range {:#x}+{:#x} wraps around",
            base,
            size
        );
        Self { base, size }
    }

    /// 会回绕时返回 `None`
    pub fn try_new(base: VirtualAddress, size: usize) -> Option<Self> {
        base.checked_offset(size).map(|_| Self { base, size })
    }

    pub fn base(&self) -> VirtualAddress {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// 结束地址（不包含）
    pub fn end(&self) -> VirtualAddress {
        self.base + self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn page_count(&self) -> usize {
        self.size / PAGE_SIZE
    }

    pub fn contains_address(&self, address: VirtualAddress) -> bool {
        self.base <= address && address < self.end()
    }

    /// `other` 是否整个落在区间内
    pub fn contains(&self, other: &VirtualRange) -> bool {
        self.base <= other.base && other.end() <= self.end()
    }

    /// 检测重合
    pub fn intersects(&self, other: &VirtualRange) -> bool {
        self.base < other.end() && other.base < self.end()
    }

    pub fn intersect(&self, other: &VirtualRange) -> Option<VirtualRange> {
        let base = core::cmp::max(self.base, other.base);
        let end = core::cmp::min(self.end(), other.end());
        if base < end {
            Some(VirtualRange::new(base, end - base))
        } else {
            None
        }
    }

    /// 首尾相接
    pub fn is_adjacent_to(&self, other: &VirtualRange) -> bool {
        self.end() == other.base || other.end() == self.base
    }

    /// 从区间里挖掉 `taken`，返回前后剩下的部分
    pub fn carve(&self, taken: &VirtualRange) -> (Option<VirtualRange>, Option<VirtualRange>) {
        assert!(self.contains(taken), "carving {:?} out of {:?}", taken, self);
        let before = if taken.base > self.base {
            Some(VirtualRange::new(self.base, taken.base - self.base))
        } else {
            None
        };
        let after = if taken.end() < self.end() {
            Some(VirtualRange::new(taken.end(), self.end() - taken.end()))
        } else {
            None
        };
        (before, after)
    }

    /// 迭代每个页
    pub fn pages(&self) -> impl Iterator<Item = VirtualPageNumber> {
        let first = VirtualPageNumber::floor(self.base).0;
        (first..first + self.page_count()).map(VirtualPageNumber)
    }
}

/// 兼容 core::ops::Range
impl From<core::ops::Range<VirtualAddress>> for VirtualRange {
    fn from(range: core::ops::Range<VirtualAddress>) -> Self {
        Self::new(range.start, range.end - range.start)
    }
}
