//! 主机目标上的替身：没有中断，也没有真正的页表寄存器

use crate::memory::address::VirtualAddress;
use core::sync::atomic::{AtomicU64, Ordering};

#[cfg(test)]
pub fn cpu_id() -> usize {
    use core::sync::atomic::AtomicUsize;
    static NEXT_ID: AtomicUsize = AtomicUsize::new(0);
    std::thread_local! {
        static ID: usize = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    }
    ID.with(|id| *id)
}

#[cfg(not(test))]
pub fn cpu_id() -> usize {
    0
}

pub mod interrupt {
    pub fn disable_and_store() -> usize {
        0
    }

    pub fn restore(_state: usize) {}
}

pub fn activate_page_table(_satp: usize) {}

pub fn flush_tlb(_address: VirtualAddress) {}

pub fn entropy() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0x9e37_79b9_7f4a_7c15);
    COUNTER.fetch_add(0x6a09_e667_f3bc_c909, Ordering::Relaxed)
}
