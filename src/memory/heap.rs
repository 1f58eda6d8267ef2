//! 内核堆
//!
//! [`HEAP`] 是通用的伙伴系统堆，slab 放不下或者用完时都回落到这里；
//! [`KernelHeap`] 把小对象分给各个 slab 大小类，其余交给 [`HEAP`]。

use super::config::KERNEL_HEAP_SIZE;
use super::slab;
use buddy_system_allocator::LockedHeap;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;
use spin::Once;

static mut HEAP_SPACE: [u8; KERNEL_HEAP_SIZE] = [0; KERNEL_HEAP_SIZE];

pub static HEAP: LockedHeap<32> = LockedHeap::<32>::empty();

static HEAP_INIT: Once<()> = Once::new();

/// 只在裸机目标上接管全局分配
#[cfg(target_os = "none")]
#[global_allocator]
static KERNEL_HEAP: KernelHeap = KernelHeap;

pub fn init() {
    HEAP_INIT.call_once(|| {
        let start = core::ptr::addr_of_mut!(HEAP_SPACE) as usize;
        log::info!(
            "heap initializing at {:#x} - {:#x}.",
            start,
            start + KERNEL_HEAP_SIZE
        );
        unsafe { HEAP.lock().init(start, KERNEL_HEAP_SIZE) }
    });
}

/// 通用堆分配；测试时直接用主机的分配器
#[cfg(not(test))]
pub fn general_alloc(layout: Layout) -> Option<NonNull<u8>> {
    HEAP.lock().alloc(layout).ok()
}

#[cfg(test)]
pub fn general_alloc(layout: Layout) -> Option<NonNull<u8>> {
    NonNull::new(unsafe { std::alloc::System.alloc(layout) })
}

/// # Safety
///
/// `ptr` 必须来自 [`general_alloc`]，且 `layout` 相同
#[cfg(not(test))]
pub unsafe fn general_dealloc(ptr: NonNull<u8>, layout: Layout) {
    HEAP.lock().dealloc(ptr, layout)
}

#[cfg(test)]
pub unsafe fn general_dealloc(ptr: NonNull<u8>, layout: Layout) {
    std::alloc::System.dealloc(ptr.as_ptr(), layout)
}

/// 全局分配器：不超过 128 字节的请求走 slab
pub struct KernelHeap;

fn slab_request_size(layout: &Layout) -> usize {
    layout.size().max(layout.align())
}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let block = match slab::slab_alloc(slab_request_size(&layout)) {
            Some(block) => Some(block),
            None => general_alloc(layout),
        };
        block.map_or(core::ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            if !slab::slab_dealloc(ptr, slab_request_size(&layout)) {
                general_dealloc(ptr, layout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_requests_are_served_by_slabs() {
        slab::init();
        let layout = Layout::from_size_align(24, 8).unwrap();
        unsafe {
            let ptr = KernelHeap.alloc(layout);
            assert!(!ptr.is_null());
            assert!(slab::SLAB_32.contains(ptr));
            KernelHeap.dealloc(ptr, layout);
        }
    }

    #[test]
    fn large_requests_go_to_the_general_heap() {
        slab::init();
        let layout = Layout::from_size_align(4096, 16).unwrap();
        unsafe {
            let ptr = KernelHeap.alloc(layout);
            assert!(!ptr.is_null());
            assert!(!slab::SLAB_128.contains(ptr));
            ptr.write_bytes(0x11, 4096);
            KernelHeap.dealloc(ptr, layout);
        }
    }
}
