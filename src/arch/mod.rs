//! 体系结构相关的最小接口
//!
//! 内存子系统只需要：当前核编号、开关中断、刷新 TLB、切换页表根以及一个随机种子。
//! 在 riscv64 上由 [`riscv`] crate 提供，其余目标（主机上的单元测试）使用空实现。

#[cfg(target_arch = "riscv64")]
mod riscv64;
#[cfg(target_arch = "riscv64")]
pub use riscv64::*;

#[cfg(not(target_arch = "riscv64"))]
mod host;
#[cfg(not(target_arch = "riscv64"))]
pub use host::*;
