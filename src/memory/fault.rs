//! 缺页记录和处理结果
//!
//! 每次缺页按 `Received → Classified → {Resolved, Rejected, Fatal}` 推进，
//! 一定走到三个终态之一才返回给陷入处理。

use super::address::VirtualAddress;
use super::mapping::PageDirectory;
use super::MemoryError;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FaultType {
    /// 页表里没有有效项（第一次访问）
    PageNotPresent,
    /// 有效项，但权限不允许这次访问
    ProtectionViolation,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FaultAccess {
    Read,
    Write,
    Execute,
}

impl FaultAccess {
    /// 由 scause 的异常号得到访问方向，不是缺页异常返回 `None`
    pub fn from_exception_code(code: usize) -> Option<Self> {
        match code {
            12 => Some(FaultAccess::Execute),
            13 => Some(FaultAccess::Read),
            15 => Some(FaultAccess::Write),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Privilege {
    User,
    Supervisor,
}

/// 体系结构层交给内存子系统的原始缺页记录
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PageFault {
    pub address: VirtualAddress,
    pub fault_type: FaultType,
    pub access: FaultAccess,
    pub privilege: Privilege,
}

impl PageFault {
    pub fn new(
        address: VirtualAddress,
        fault_type: FaultType,
        access: FaultAccess,
        privilege: Privilege,
    ) -> Self {
        Self {
            address,
            fault_type,
            access,
            privilege,
        }
    }

    /// RISC-V 的 scause 不区分两种缺页，查一下当前页表项
    pub fn from_trap(
        directory: &PageDirectory,
        address: VirtualAddress,
        access: FaultAccess,
        privilege: Privilege,
    ) -> Self {
        let fault_type = match directory.entry(address) {
            Some(entry) if entry.is_valid() => FaultType::ProtectionViolation,
            _ => FaultType::PageNotPresent,
        };
        Self::new(address, fault_type, access, privilege)
    }

    pub fn is_write(&self) -> bool {
        self.access == FaultAccess::Write
    }
}

/// 返回给陷入处理的结果
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PageFaultResponse {
    /// 已经修复，重新执行指令
    Continue,
    /// 给出错的线程发信号
    SignalError,
    /// 内存耗尽，终止这个地址空间
    OutOfMemory,
}

/// 分类之后要走的修复路径
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FaultClass {
    /// 第一次访问：向内存对象要页
    NotPresent,
    /// 写一个写时复制的页
    CopyOnWrite,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RejectReason {
    OutsideRegion,
    /// 区域还没有映射到任何页目录
    Unmapped,
    /// 用户态访问只属于内核的区域
    KernelOnly,
    AccessDenied(FaultAccess),
    ProtectionViolation,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FaultState {
    Received(PageFault),
    Classified {
        fault: PageFault,
        /// 区域内的页下标
        page_index: usize,
        class: FaultClass,
    },
    Resolved,
    Rejected(RejectReason),
    Fatal(MemoryError),
}

impl FaultState {
    /// 终态对应的结果，中间状态返回 `None`
    pub fn response(&self) -> Option<PageFaultResponse> {
        match self {
            FaultState::Resolved => Some(PageFaultResponse::Continue),
            FaultState::Rejected(_) => Some(PageFaultResponse::SignalError),
            FaultState::Fatal(_) => Some(PageFaultResponse::OutOfMemory),
            FaultState::Received(_) | FaultState::Classified { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::frame::FrameTracker;
    use crate::memory::mapping::Flags;

    #[test]
    fn trap_is_classified_by_the_current_entry() {
        let directory = PageDirectory::create_for_userspace(None).unwrap();
        let frame = FrameTracker::new_zeroed().unwrap();
        let va = VirtualAddress(0x60_0000);
        let fault = PageFault::from_trap(&directory, va, FaultAccess::Write, Privilege::User);
        assert_eq!(fault.fault_type, FaultType::PageNotPresent);

        directory.map(va, frame.address(), Flags::READABLE).unwrap();
        let fault = PageFault::from_trap(&directory, va + 4, FaultAccess::Write, Privilege::User);
        assert_eq!(fault.fault_type, FaultType::ProtectionViolation);
        assert!(fault.is_write());
        directory.unmap(va);
    }

    #[test]
    fn terminal_states_map_to_responses() {
        assert_eq!(FaultState::Resolved.response(), Some(PageFaultResponse::Continue));
        assert_eq!(
            FaultState::Rejected(RejectReason::OutsideRegion).response(),
            Some(PageFaultResponse::SignalError)
        );
        assert_eq!(
            FaultState::Fatal(MemoryError::OutOfMemory).response(),
            Some(PageFaultResponse::OutOfMemory)
        );
        assert_eq!(FaultAccess::from_exception_code(15), Some(FaultAccess::Write));
        assert_eq!(FaultAccess::from_exception_code(2), None);
    }
}
