//! 一个地址空间内的虚拟区间分配 [`RangeAllocator`]
//!
//! 空闲区间按起始地址存放在有序表里，任意两个空闲区间互不相交也不相邻：
//! 回收时总是和前后紧挨着的空闲区间合并。

use super::address::{align_up, is_page_aligned, VirtualAddress};
use super::config::{MAX_RANDOMIZATION_ATTEMPTS, PAGE_SIZE};
use super::range::VirtualRange;
use super::{MemoryError, MemoryResult};
use crate::arch;
use crate::sync::Lock;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

pub struct RangeAllocator {
    inner: Lock<Inner>,
}

struct Inner {
    total: VirtualRange,
    /// 起始地址 -> 长度
    free: BTreeMap<VirtualAddress, usize>,
    rng: SmallRng,
}

fn check_request(size: usize, alignment: usize) -> MemoryResult<()> {
    if size == 0
        || !is_page_aligned(size)
        || alignment < PAGE_SIZE
        || !alignment.is_power_of_two()
    {
        return Err(MemoryError::InvalidArgument);
    }
    Ok(())
}

impl Default for RangeAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl RangeAllocator {
    /// 空的分配器，需要 [`initialize`](Self::initialize) 之后才能分配
    pub fn new() -> Self {
        Self {
            inner: Lock::new(Inner {
                total: VirtualRange::default(),
                free: BTreeMap::new(),
                rng: SmallRng::seed_from_u64(arch::entropy()),
            }),
        }
    }

    pub fn with_range(base: VirtualAddress, size: usize) -> Self {
        let allocator = Self::new();
        allocator.initialize(base, size);
        allocator
    }

    /// 设定管理范围，整个范围都是空闲的
    pub fn initialize(&self, base: VirtualAddress, size: usize) {
        let total = VirtualRange::new(base, size);
        let mut inner = self.inner.lock();
        inner.total = total;
        inner.free.clear();
        if !total.is_empty() {
            inner.free.insert(base, size);
        }
    }

    /// 复制另一个分配器的管理范围和空闲集合
    pub fn initialize_from_parent(&self, parent: &RangeAllocator) {
        let (total, free) = {
            let parent = parent.inner.lock();
            (parent.total, parent.free.clone())
        };
        let mut inner = self.inner.lock();
        inner.total = total;
        inner.free = free;
    }

    pub fn total_range(&self) -> VirtualRange {
        self.inner.lock().total
    }

    /// 区间是否在管理范围内
    pub fn contains(&self, range: &VirtualRange) -> bool {
        self.inner.lock().total.contains(range)
    }

    pub fn free_ranges(&self) -> Vec<VirtualRange> {
        self.inner
            .lock()
            .free
            .iter()
            .map(|(&base, &size)| VirtualRange::new(base, size))
            .collect()
    }

    pub fn dump(&self) {
        let inner = self.inner.lock();
        log::debug!(
            "RangeAllocator {:#x}-{:#x}:",
            inner.total.base(),
            inner.total.end()
        );
        for (base, size) in inner.free.iter() {
            log::debug!("    free {:#x}-{:#x}", base, *base + *size);
        }
    }

    /// 首次适配：第一个对齐之后还能放下的空闲区间
    pub fn allocate_anywhere(&self, size: usize, alignment: usize) -> MemoryResult<VirtualRange> {
        check_request(size, alignment)?;
        self.inner.lock().allocate_anywhere(size, alignment)
    }

    /// 指定位置，必须整个落在某一个空闲区间里
    pub fn allocate_specific(&self, base: VirtualAddress, size: usize) -> MemoryResult<VirtualRange> {
        check_request(size, PAGE_SIZE)?;
        if !base.is_page_aligned() {
            return Err(MemoryError::InvalidArgument);
        }
        self.inner.lock().allocate_specific(base, size)
    }

    /// 地址随机化：随机探测若干次，都失败就退回首次适配
    pub fn allocate_randomized(&self, size: usize, alignment: usize) -> MemoryResult<VirtualRange> {
        check_request(size, alignment)?;
        self.inner.lock().allocate_randomized(size, alignment)
    }

    /// 归还区间
    ///
    /// 重复释放或者释放管理范围之外的区间说明内核有 bug，直接 panic
    pub fn deallocate(&self, range: VirtualRange) {
        self.inner.lock().deallocate(range)
    }
}

impl Inner {
    fn allocate_anywhere(&mut self, size: usize, alignment: usize) -> MemoryResult<VirtualRange> {
        let found = self.free.iter().find_map(|(&base, &free_size)| {
            let free = VirtualRange::new(base, free_size);
            let aligned = align_up(base.0, alignment)?;
            let candidate = VirtualRange::try_new(VirtualAddress(aligned), size)?;
            if free.contains(&candidate) {
                Some((free, candidate))
            } else {
                None
            }
        });
        match found {
            Some((free, candidate)) => {
                self.carve(free, candidate);
                Ok(candidate)
            }
            None => {
                log::debug!(
                    "RangeAllocator: cannot find {:#x} bytes aligned to {:#x}",
                    size,
                    alignment
                );
                Err(MemoryError::OutOfVirtualMemory)
            }
        }
    }

    fn allocate_specific(&mut self, base: VirtualAddress, size: usize) -> MemoryResult<VirtualRange> {
        let wanted = VirtualRange::try_new(base, size).ok_or(MemoryError::RangeUnavailable)?;
        if !self.total.contains(&wanted) {
            return Err(MemoryError::RangeUnavailable);
        }
        let free = self
            .free
            .range(..=base)
            .next_back()
            .map(|(&free_base, &free_size)| VirtualRange::new(free_base, free_size))
            .filter(|free| free.contains(&wanted))
            .ok_or(MemoryError::RangeUnavailable)?;
        self.carve(free, wanted);
        Ok(wanted)
    }

    fn allocate_randomized(&mut self, size: usize, alignment: usize) -> MemoryResult<VirtualRange> {
        if self.total.is_empty() {
            return Err(MemoryError::OutOfVirtualMemory);
        }
        for _ in 0..MAX_RANDOMIZATION_ATTEMPTS {
            let random = self.rng.gen_range(self.total.base().0..self.total.end().0);
            let base = match align_up(random, alignment) {
                Some(base) => VirtualAddress(base),
                None => continue,
            };
            match VirtualRange::try_new(base, size) {
                Some(candidate) if self.total.contains(&candidate) => {}
                _ => continue,
            }
            if let Ok(range) = self.allocate_specific(base, size) {
                return Ok(range);
            }
        }
        self.allocate_anywhere(size, alignment)
    }

    fn deallocate(&mut self, range: VirtualRange) {
        assert!(
            !range.is_empty() && self.total.contains(&range),
            "RangeAllocator: deallocating {:#x}-{:#x} outside of {:#x}-{:#x}",
            range.base(),
            range.end(),
            self.total.base(),
            self.total.end()
        );
        let mut base = range.base();
        let mut end = range.end();

        if let Some((&prev_base, &prev_size)) = self.free.range(..=range.base()).next_back() {
            let prev_end = prev_base + prev_size;
            assert!(
                prev_end <= range.base(),
                "RangeAllocator: double free of {:#x}-{:#x}",
                range.base(),
                range.end()
            );
            if prev_end == range.base() {
                self.free.remove(&prev_base);
                base = prev_base;
            }
        }
        if let Some((&next_base, &next_size)) = self.free.range(range.base()..).next() {
            assert!(
                next_base >= range.end(),
                "RangeAllocator: double free of {:#x}-{:#x}",
                range.base(),
                range.end()
            );
            if next_base == range.end() {
                self.free.remove(&next_base);
                end = next_base + next_size;
            }
        }
        self.free.insert(base, end - base);
    }

    fn carve(&mut self, free: VirtualRange, taken: VirtualRange) {
        self.free.remove(&free.base());
        let (before, after) = free.carve(&taken);
        for remainder in before.into_iter().chain(after) {
            self.free.insert(remainder.base(), remainder.size());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn range(base: usize, size: usize) -> VirtualRange {
        VirtualRange::new(VirtualAddress(base), size)
    }

    /// 空闲集合有序、互不相交、互不相邻，并且和已分配的区间一起恰好铺满管理范围
    fn check_invariants(allocator: &RangeAllocator, live: &[VirtualRange]) {
        let total = allocator.total_range();
        let free = allocator.free_ranges();
        for pair in free.windows(2) {
            assert!(pair[0].end() < pair[1].base(), "{:?} and {:?} touch", pair[0], pair[1]);
        }
        for range in free.iter().chain(live) {
            assert!(total.contains(range));
        }
        for (i, a) in live.iter().enumerate() {
            for b in live.iter().skip(i + 1) {
                assert!(!a.intersects(b), "{:?} handed out twice ({:?})", a, b);
            }
            for f in free.iter() {
                assert!(!a.intersects(f), "{:?} is both free and live", a);
            }
        }
        let covered: usize = free.iter().chain(live).map(|r| r.size()).sum();
        assert_eq!(covered, total.size());
    }

    #[test]
    fn first_fit_scenario() {
        let allocator = RangeAllocator::with_range(VirtualAddress(0x1000), 0x9000);
        let first = allocator.allocate_anywhere(0x3000, PAGE_SIZE).unwrap();
        assert_eq!(first, range(0x1000, 0x3000));
        let second = allocator.allocate_anywhere(0x2000, PAGE_SIZE).unwrap();
        assert_eq!(second, range(0x4000, 0x2000));

        allocator.deallocate(first);
        assert_eq!(
            allocator.allocate_anywhere(0x5000, PAGE_SIZE),
            Err(MemoryError::OutOfVirtualMemory)
        );
        assert_eq!(
            allocator.free_ranges(),
            vec![range(0x1000, 0x3000), range(0x6000, 0x4000)]
        );

        allocator.deallocate(second);
        assert_eq!(allocator.free_ranges(), vec![range(0x1000, 0x9000)]);
        assert_eq!(
            allocator.allocate_anywhere(0x5000, PAGE_SIZE),
            Ok(range(0x1000, 0x5000))
        );
    }

    #[test]
    fn anywhere_respects_alignment() {
        let allocator = RangeAllocator::with_range(VirtualAddress(0x1000), 0x20000);
        let aligned = allocator.allocate_anywhere(0x1000, 0x4000).unwrap();
        assert_eq!(aligned, range(0x4000, 0x1000));
        assert_eq!(
            allocator.free_ranges(),
            vec![range(0x1000, 0x3000), range(0x5000, 0x1c000)]
        );
    }

    #[test]
    fn specific_requires_a_single_free_range() {
        let allocator = RangeAllocator::with_range(VirtualAddress(0x1000), 0x9000);
        assert_eq!(allocator.allocate_specific(VirtualAddress(0x3000), 0x2000), Ok(range(0x3000, 0x2000)));
        assert_eq!(
            allocator.allocate_specific(VirtualAddress(0x2000), 0x2000),
            Err(MemoryError::RangeUnavailable)
        );
        assert_eq!(
            allocator.allocate_specific(VirtualAddress(0x9000), 0x2000),
            Err(MemoryError::RangeUnavailable)
        );
        assert_eq!(
            allocator.allocate_specific(VirtualAddress(0x2800), 0x1000),
            Err(MemoryError::InvalidArgument)
        );
    }

    #[test]
    fn bad_requests_are_rejected() {
        let allocator = RangeAllocator::with_range(VirtualAddress(0x1000), 0x9000);
        assert_eq!(allocator.allocate_anywhere(0, PAGE_SIZE), Err(MemoryError::InvalidArgument));
        assert_eq!(allocator.allocate_anywhere(0x1800, PAGE_SIZE), Err(MemoryError::InvalidArgument));
        assert_eq!(allocator.allocate_anywhere(0x1000, 0x3000), Err(MemoryError::InvalidArgument));
    }

    #[test]
    fn randomized_allocations_stay_inside_and_disjoint() {
        let allocator = RangeAllocator::with_range(VirtualAddress(0x10_0000), 0x100_0000);
        let mut live = Vec::new();
        for _ in 0..64 {
            let range = allocator.allocate_randomized(0x3000, 0x1000).unwrap();
            live.push(range);
            check_invariants(&allocator, &live);
        }
    }

    #[test]
    fn randomized_falls_back_when_space_is_tight() {
        let allocator = RangeAllocator::with_range(VirtualAddress(0x1000), 0x4000);
        allocator.allocate_specific(VirtualAddress(0x1000), 0x3000).unwrap();
        assert_eq!(allocator.allocate_randomized(0x1000, PAGE_SIZE), Ok(range(0x4000, 0x1000)));
        assert_eq!(
            allocator.allocate_randomized(0x1000, PAGE_SIZE),
            Err(MemoryError::OutOfVirtualMemory)
        );
    }

    #[test]
    fn parent_free_set_is_copied() {
        let parent = RangeAllocator::with_range(VirtualAddress(0x1000), 0x9000);
        let reserved = parent.allocate_specific(VirtualAddress(0x2000), 0x1000).unwrap();
        let child = RangeAllocator::new();
        child.initialize_from_parent(&parent);
        assert_eq!(child.free_ranges(), parent.free_ranges());
        assert_eq!(
            child.allocate_specific(reserved.base(), reserved.size()),
            Err(MemoryError::RangeUnavailable)
        );
        // 之后两边互不影响
        child.deallocate(reserved);
        assert_eq!(child.free_ranges(), vec![range(0x1000, 0x9000)]);
        assert_eq!(parent.free_ranges().len(), 2);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let allocator = RangeAllocator::with_range(VirtualAddress(0x1000), 0x9000);
        let range = allocator.allocate_anywhere(0x2000, PAGE_SIZE).unwrap();
        allocator.deallocate(range);
        allocator.deallocate(range);
    }

    #[test]
    #[should_panic(expected = "outside of")]
    fn freeing_outside_bound_panics() {
        let allocator = RangeAllocator::with_range(VirtualAddress(0x1000), 0x9000);
        allocator.deallocate(range(0x20000, 0x1000));
    }

    #[test]
    fn concurrent_callers_keep_the_free_set_consistent() {
        use std::sync::{Arc, Mutex};
        use std::thread;

        const THREADS: usize = 8;
        let allocator = Arc::new(RangeAllocator::with_range(VirtualAddress(0x10000), 0x100000));
        let kept = Arc::new(Mutex::new(Vec::new()));
        let workers: Vec<_> = (0..THREADS)
            .map(|id| {
                let allocator = allocator.clone();
                let kept = kept.clone();
                thread::spawn(move || {
                    let mut mine = Vec::new();
                    for round in 0..500 {
                        let pages = 1 + (id + round) % 4;
                        if let Ok(range) = allocator.allocate_anywhere(pages * PAGE_SIZE, PAGE_SIZE) {
                            assert!(allocator.contains(&range));
                            mine.push(range);
                        }
                        if round % 3 != 0 {
                            if let Some(range) = mine.pop() {
                                allocator.deallocate(range);
                            }
                        }
                    }
                    kept.lock().unwrap().extend(mine);
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        let live = kept.lock().unwrap().clone();
        check_invariants(&allocator, &live);
        for range in live {
            allocator.deallocate(range);
        }
        assert_eq!(allocator.free_ranges(), vec![range(0x10000, 0x100000)]);
    }

    proptest! {
        #[test]
        fn free_set_invariants_hold(
            ops in prop::collection::vec((0u8..3, 1usize..8, 0usize..16), 1..96)
        ) {
            let base = 0x10000;
            let allocator = RangeAllocator::with_range(VirtualAddress(base), 0x40000);
            let mut live: Vec<VirtualRange> = Vec::new();
            for (op, pages, slot) in ops {
                match op {
                    0 => {
                        if let Ok(range) = allocator.allocate_anywhere(pages * PAGE_SIZE, PAGE_SIZE) {
                            live.push(range);
                        }
                    }
                    1 => {
                        let at = VirtualAddress(base + slot * 4 * PAGE_SIZE);
                        if let Ok(range) = allocator.allocate_specific(at, pages * PAGE_SIZE) {
                            prop_assert_eq!(range.base(), at);
                            live.push(range);
                        }
                    }
                    _ => {
                        if !live.is_empty() {
                            let range = live.swap_remove(slot % live.len());
                            allocator.deallocate(range);
                        }
                    }
                }
                check_invariants(&allocator, &live);
            }
        }

        #[test]
        fn specific_then_deallocate_restores_free_set(
            prior in prop::collection::vec(1usize..6, 0..8),
            slot in 0usize..60,
            pages in 1usize..4,
        ) {
            let allocator = RangeAllocator::with_range(VirtualAddress(0x10000), 0x40000);
            for size in prior {
                let _ = allocator.allocate_anywhere(size * PAGE_SIZE, PAGE_SIZE);
            }
            let before = allocator.free_ranges();
            let at = VirtualAddress(0x10000 + slot * PAGE_SIZE);
            if let Ok(range) = allocator.allocate_specific(at, pages * PAGE_SIZE) {
                allocator.deallocate(range);
            }
            prop_assert_eq!(allocator.free_ranges(), before);
        }
    }
}
