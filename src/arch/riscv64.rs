use crate::memory::address::VirtualAddress;
use riscv::asm;
use riscv::register::{sstatus, time};

/// 当前硬件线程编号，启动时由 entry 代码放在 tp 中
pub fn cpu_id() -> usize {
    let id: usize;
    unsafe { core::arch::asm!("mv {0}, tp", out(reg) id) };
    id
}

pub mod interrupt {
    use super::sstatus;

    /// 关中断，返回之前的 sie 状态
    pub fn disable_and_store() -> usize {
        let enabled = sstatus::read().sie();
        unsafe { sstatus::clear_sie() };
        enabled as usize
    }

    /// 恢复 [`disable_and_store`] 保存的状态
    pub fn restore(state: usize) {
        if state != 0 {
            unsafe { sstatus::set_sie() };
        }
    }
}

/// 写入 satp 并刷新整个 TLB
pub fn activate_page_table(satp: usize) {
    unsafe {
        core::arch::asm!("csrw satp, {0}", "sfence.vma", in(reg) satp);
    }
}

pub fn flush_tlb(address: VirtualAddress) {
    unsafe { asm::sfence_vma(0, address.0) };
}

/// 以 time 计数器和核编号混合出的种子，只用于地址随机化
pub fn entropy() -> u64 {
    (time::read() as u64) ^ (cpu_id() as u64).rotate_left(32)
}
