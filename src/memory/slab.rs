//! 固定大小对象的无锁分配器 [`SlabAllocator`]
//!
//! 每个大小类一块 arena，切成等长的块串在单链表上。分配和回收都只用原子
//! 比较交换，不会阻塞，可以在中断和缺页处理里调用。
//! 链表头带一个版本号，防止 ABA。

use super::address::align_up;
use super::config::{SLAB_ARENA_SIZES, SLAB_POOL_SIZE};
use super::heap;
use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use spin::Once;

/// 刚分配出去的块的填充字节
pub const SLAB_ALLOC_SCRUB_BYTE: u8 = 0xab;
/// 回收的块的填充字节，用于发现释放后使用
pub const SLAB_DEALLOC_SCRUB_BYTE: u8 = 0xbc;

#[repr(C, align(4096))]
struct Pool([u8; SLAB_POOL_SIZE]);

static mut POOL: Pool = Pool([0; SLAB_POOL_SIZE]);
static POOL_NEXT: AtomicUsize = AtomicUsize::new(0);

/// 从静态池里永久切出一块
fn allocate_eternal(size: usize, align: usize) -> Option<NonNull<u8>> {
    let base = core::ptr::addr_of_mut!(POOL) as usize;
    let mut current = POOL_NEXT.load(Ordering::Relaxed);
    loop {
        let start = align_up(base + current, align)? - base;
        let end = start.checked_add(size)?;
        if end > SLAB_POOL_SIZE {
            return None;
        }
        match POOL_NEXT.compare_exchange_weak(current, end, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return NonNull::new((base + start) as *mut u8),
            Err(actual) => current = actual,
        }
    }
}

/// 链表头：高 32 位是版本号，低 32 位是块下标加一（0 表示空）
const EMPTY: u32 = 0;

const fn pack(tag: u32, slot: u32) -> u64 {
    ((tag as u64) << 32) | slot as u64
}

fn unpack(head: u64) -> (u32, u32) {
    ((head >> 32) as u32, head as u32)
}

pub struct SlabAllocator<const SLAB_SIZE: usize> {
    head: AtomicU64,
    base: AtomicUsize,
    end: AtomicUsize,
    num_allocated: AtomicUsize,
    num_free: AtomicUsize,
}

impl<const SLAB_SIZE: usize> Default for SlabAllocator<SLAB_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const SLAB_SIZE: usize> SlabAllocator<SLAB_SIZE> {
    pub const fn new() -> Self {
        Self {
            head: AtomicU64::new(pack(0, EMPTY)),
            base: AtomicUsize::new(0),
            end: AtomicUsize::new(0),
            num_allocated: AtomicUsize::new(0),
            num_free: AtomicUsize::new(0),
        }
    }

    pub const fn slab_size(&self) -> usize {
        SLAB_SIZE
    }

    fn layout() -> Layout {
        // SLAB_SIZE 是 2 的幂
        unsafe { Layout::from_size_align_unchecked(SLAB_SIZE, SLAB_SIZE) }
    }

    /// 空闲块开头存放下一个空闲块的编号
    ///
    /// # Safety
    ///
    /// `index` 必须在 arena 之内
    unsafe fn next_of(base: usize, index: usize) -> &'static AtomicU32 {
        &*((base + index * SLAB_SIZE) as *const AtomicU32)
    }

    /// 从静态池切出 `total_bytes`，全部串到空闲链表上
    pub fn init(&self, total_bytes: usize) {
        assert!(SLAB_SIZE >= 8 && SLAB_SIZE.is_power_of_two());
        let count = total_bytes / SLAB_SIZE;
        assert!(count > 0 && count < u32::MAX as usize);
        let arena = allocate_eternal(count * SLAB_SIZE, SLAB_SIZE)
            .unwrap_or_else(|| panic!("slab pool exhausted carving {:#x} bytes", total_bytes));
        let base = arena.as_ptr() as usize;
        for index in 0..count {
            let next = if index + 1 < count {
                index as u32 + 2
            } else {
                EMPTY
            };
            unsafe { Self::next_of(base, index) }.store(next, Ordering::Relaxed);
        }
        assert!(
            self.base
                .compare_exchange(0, base, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            "slab allocator {} initialized twice",
            SLAB_SIZE
        );
        self.end.store(base + count * SLAB_SIZE, Ordering::Release);
        self.num_free.store(count, Ordering::Relaxed);
        self.head.store(pack(0, 1), Ordering::Release);
    }

    /// 块是否来自本大小类的 arena
    pub fn contains(&self, ptr: *const u8) -> bool {
        let address = ptr as usize;
        self.base.load(Ordering::Acquire) <= address && address < self.end.load(Ordering::Acquire)
    }

    pub fn num_allocated(&self) -> usize {
        self.num_allocated.load(Ordering::Relaxed)
    }

    pub fn num_free(&self) -> usize {
        self.num_free.load(Ordering::Relaxed)
    }

    /// 弹出链表头；链表空了就向通用堆要
    pub fn allocate(&self) -> Option<NonNull<u8>> {
        let base = self.base.load(Ordering::Acquire);
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let (tag, slot) = unpack(head);
            if slot == EMPTY {
                let ptr = heap::general_alloc(Self::layout())?;
                unsafe { ptr.as_ptr().write_bytes(SLAB_ALLOC_SCRUB_BYTE, SLAB_SIZE) };
                return Some(ptr);
            }
            let index = (slot - 1) as usize;
            let next = unsafe { Self::next_of(base, index) }.load(Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                pack(tag.wrapping_add(1), next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.num_allocated.fetch_add(1, Ordering::Relaxed);
                    self.num_free.fetch_sub(1, Ordering::Relaxed);
                    let ptr = (base + index * SLAB_SIZE) as *mut u8;
                    unsafe { ptr.write_bytes(SLAB_ALLOC_SCRUB_BYTE, SLAB_SIZE) };
                    return NonNull::new(ptr);
                }
                Err(actual) => head = actual,
            }
        }
    }

    /// 归还一个块；不在 arena 里的交给通用堆
    ///
    /// # Safety
    ///
    /// `ptr` 必须来自同一个分配器的 [`allocate`](Self::allocate)，且没有被释放过
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        let address = ptr.as_ptr() as usize;
        let base = self.base.load(Ordering::Acquire);
        if !self.contains(ptr.as_ptr()) {
            heap::general_dealloc(ptr, Self::layout());
            return;
        }
        assert!(
            (address - base) % SLAB_SIZE == 0,
            "slab {}: freeing misaligned pointer {:#x}",
            SLAB_SIZE,
            address
        );
        let index = (address - base) / SLAB_SIZE;
        ptr.as_ptr().write_bytes(SLAB_DEALLOC_SCRUB_BYTE, SLAB_SIZE);

        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let (tag, slot) = unpack(head);
            Self::next_of(base, index).store(slot, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                pack(tag.wrapping_add(1), index as u32 + 1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
        self.num_allocated.fetch_sub(1, Ordering::Relaxed);
        self.num_free.fetch_add(1, Ordering::Relaxed);
    }
}

pub static SLAB_16: SlabAllocator<16> = SlabAllocator::new();
pub static SLAB_32: SlabAllocator<32> = SlabAllocator::new();
pub static SLAB_64: SlabAllocator<64> = SlabAllocator::new();
pub static SLAB_128: SlabAllocator<128> = SlabAllocator::new();

static SLAB_INIT: Once<()> = Once::new();

fn arena_size(slab_size: usize) -> usize {
    SLAB_ARENA_SIZES
        .iter()
        .find(|(size, _)| *size == slab_size)
        .map_or(0, |(_, bytes)| *bytes)
}

pub fn init() {
    SLAB_INIT.call_once(|| {
        SLAB_16.init(arena_size(16));
        SLAB_32.init(arena_size(32));
        SLAB_64.init(arena_size(64));
        SLAB_128.init(arena_size(128));
    });
}

/// 按大小选择 slab，超过 128 字节返回 `None`
pub fn slab_alloc(size: usize) -> Option<NonNull<u8>> {
    match size {
        0..=16 => SLAB_16.allocate(),
        17..=32 => SLAB_32.allocate(),
        33..=64 => SLAB_64.allocate(),
        65..=128 => SLAB_128.allocate(),
        _ => None,
    }
}

/// 返回 `false` 表示这个大小不归 slab 管
///
/// # Safety
///
/// `ptr` 必须来自同样 `size` 的 [`slab_alloc`]
pub unsafe fn slab_dealloc(ptr: NonNull<u8>, size: usize) -> bool {
    match size {
        0..=16 => SLAB_16.deallocate(ptr),
        17..=32 => SLAB_32.deallocate(ptr),
        33..=64 => SLAB_64.deallocate(ptr),
        65..=128 => SLAB_128.deallocate(ptr),
        _ => return false,
    }
    true
}
