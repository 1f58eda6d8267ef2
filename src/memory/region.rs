//! 区域 [`Region`]：把一段已经分配好的虚拟区间绑定到一个内存对象
//!
//! 区域只属于一个地址空间；跨地址空间的共享靠共享内存对象实现，
//! 区域本身从不共享。区域被析构时撤销页表项，并把区间还给页目录的分配器。

use super::address::{is_page_aligned, PhysicalAddress, PhysicalPageNumber, VirtualAddress};
use super::config::PAGE_SIZE;
use super::fault::{
    FaultAccess, FaultClass, FaultState, FaultType, PageFault, PageFaultResponse, Privilege,
    RejectReason,
};
use super::mapping::{Flags, PageDirectory};
use super::range::VirtualRange;
use super::vm_object::{AnonymousVmObject, VmObject};
use super::{MemoryError, MemoryResult};
use alloc::string::String;
use alloc::sync::Arc;
use bitflags::bitflags;

bitflags! {
    /// 访问权限；`HAS_BEEN_*` 记录曾经有过的权限，只会置位
    pub struct Access: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const HAS_BEEN_READABLE = 1 << 4;
        const HAS_BEEN_WRITABLE = 1 << 5;
        const HAS_BEEN_EXECUTABLE = 1 << 6;
        const READ_WRITE = Self::READ.bits | Self::WRITE.bits;
    }
}

impl Access {
    /// 当前权限对应的历史位
    fn history(self) -> Access {
        let current = self & (Access::READ | Access::WRITE | Access::EXECUTE);
        Access::from_bits_truncate(current.bits() << 4)
    }
}

/// fork 时区域的继承方式
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InheritMode {
    Default,
    /// 子进程得到同样大小的全新匿名内存
    ZeroedOnFork,
}

impl Default for InheritMode {
    fn default() -> Self {
        InheritMode::Default
    }
}

pub struct Region {
    range: VirtualRange,
    object: Arc<dyn VmObject>,
    offset_in_object: usize,
    name: String,
    access: Access,
    cacheable: bool,
    shared: bool,
    user_accessible: bool,
    stack: bool,
    mmap: bool,
    inherit_mode: InheritMode,
    page_directory: Option<Arc<PageDirectory>>,
    /// 在内存对象里登记的映射编号
    mapping_id: Option<usize>,
}

impl Region {
    #[allow(clippy::too_many_arguments)]
    fn new(
        range: VirtualRange,
        object: Arc<dyn VmObject>,
        offset_in_object: usize,
        name: &str,
        access: Access,
        cacheable: bool,
        shared: bool,
        user_accessible: bool,
    ) -> MemoryResult<Self> {
        if range.is_empty()
            || !range.base().is_page_aligned()
            || !is_page_aligned(range.size())
            || !is_page_aligned(offset_in_object)
        {
            return Err(MemoryError::InvalidArgument);
        }
        match offset_in_object.checked_add(range.size()) {
            Some(end) if end <= object.size() => {}
            _ => return Err(MemoryError::InvalidArgument),
        }
        Ok(Self {
            range,
            object,
            offset_in_object,
            name: String::from(name),
            access: access | access.history(),
            cacheable,
            shared,
            user_accessible,
            stack: false,
            mmap: false,
            inherit_mode: InheritMode::Default,
            page_directory: None,
            mapping_id: None,
        })
    }

    /// 用户可以访问的区域
    pub fn create_user_accessible(
        range: VirtualRange,
        object: Arc<dyn VmObject>,
        offset_in_object: usize,
        name: &str,
        access: Access,
        cacheable: bool,
        shared: bool,
    ) -> MemoryResult<Self> {
        Self::new(range, object, offset_in_object, name, access, cacheable, shared, true)
    }

    /// 只有内核可以访问的区域，从不共享
    pub fn create_kernel_only(
        range: VirtualRange,
        object: Arc<dyn VmObject>,
        offset_in_object: usize,
        name: &str,
        access: Access,
        cacheable: bool,
    ) -> MemoryResult<Self> {
        Self::new(range, object, offset_in_object, name, access, cacheable, false, false)
    }

    pub fn range(&self) -> VirtualRange {
        self.range
    }
    pub fn vaddr(&self) -> VirtualAddress {
        self.range.base()
    }
    pub fn size(&self) -> usize {
        self.range.size()
    }
    pub fn page_count(&self) -> usize {
        self.range.page_count()
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn access(&self) -> Access {
        self.access
    }
    pub fn is_readable(&self) -> bool {
        self.access.contains(Access::READ)
    }
    pub fn is_writable(&self) -> bool {
        self.access.contains(Access::WRITE)
    }
    pub fn is_executable(&self) -> bool {
        self.access.contains(Access::EXECUTE)
    }
    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }
    pub fn is_shared(&self) -> bool {
        self.shared
    }
    pub fn is_user_accessible(&self) -> bool {
        self.user_accessible
    }
    pub fn is_stack(&self) -> bool {
        self.stack
    }
    pub fn set_stack(&mut self, stack: bool) {
        self.stack = stack;
    }
    pub fn is_mmap(&self) -> bool {
        self.mmap
    }
    pub fn set_mmap(&mut self, mmap: bool) {
        self.mmap = mmap;
    }
    pub fn inherit_mode(&self) -> InheritMode {
        self.inherit_mode
    }
    pub fn set_inherit_mode(&mut self, mode: InheritMode) {
        self.inherit_mode = mode;
    }
    pub fn vmobject(&self) -> &Arc<dyn VmObject> {
        &self.object
    }
    pub fn offset_in_vmobject(&self) -> usize {
        self.offset_in_object
    }
    pub fn page_directory(&self) -> Option<&Arc<PageDirectory>> {
        self.page_directory.as_ref()
    }

    pub fn contains(&self, address: VirtualAddress) -> bool {
        self.range.contains_address(address)
    }

    /// 区域起点在内存对象中的页下标
    pub fn first_page_index(&self) -> usize {
        self.offset_in_object / PAGE_SIZE
    }
    pub fn page_index_from_address(&self, address: VirtualAddress) -> usize {
        (address - self.range.base()) / PAGE_SIZE
    }
    pub fn vaddr_from_page_index(&self, page_index: usize) -> VirtualAddress {
        self.range.base() + page_index * PAGE_SIZE
    }
    fn object_page_index(&self, page_index: usize) -> usize {
        self.first_page_index() + page_index
    }

    pub fn physical_page(&self, page_index: usize) -> Option<PhysicalPageNumber> {
        self.object.physical_page(self.object_page_index(page_index))
    }

    pub fn should_cow(&self, page_index: usize) -> bool {
        self.object
            .should_cow(self.object_page_index(page_index), self.shared)
    }

    /// 已经有物理页的字节数
    pub fn amount_resident(&self) -> usize {
        (0..self.page_count())
            .filter(|&index| self.physical_page(index).is_some())
            .count()
            * PAGE_SIZE
    }

    /// 物理页同时被别的对象引用的字节数
    pub fn amount_shared(&self) -> usize {
        (0..self.page_count())
            .filter(|&index| self.object.is_page_shared(self.object_page_index(index)))
            .count()
            * PAGE_SIZE
    }

    /// 一页应当使用的页表项标志；没有任何权限时不映射
    fn entry_flags(&self, page_index: usize) -> Option<Flags> {
        if !self.is_readable() && !self.is_writable() && !self.is_executable() {
            return None;
        }
        let writable = self.is_writable() && !self.should_cow(page_index);
        // RISC-V 不允许只写不读的页表项
        Some(
            Flags::readable(self.is_readable() || self.is_writable())
                | Flags::writable(writable)
                | Flags::executable(self.is_executable())
                | Flags::user(self.user_accessible)
                | Flags::non_cacheable(!self.cacheable),
        )
    }

    /// 按对象当前的状态重写一页的页表项
    fn map_individual_page(&self, page_index: usize) -> MemoryResult<()> {
        let directory = match &self.page_directory {
            Some(directory) => directory,
            None => return Ok(()),
        };
        let address = self.vaddr_from_page_index(page_index);
        // 先问完内存对象（释放对象的锁），再碰页目录
        let page = self.physical_page(page_index);
        match (page, self.entry_flags(page_index)) {
            (Some(page), Some(flags)) => directory.map(address, PhysicalAddress::from(page), flags),
            _ => {
                directory.unmap(address);
                Ok(())
            }
        }
    }

    /// 映射到页目录：已经有物理页的页立即写入页表项，其余等缺页
    pub fn map(&mut self, directory: &Arc<PageDirectory>) -> MemoryResult<()> {
        if let Some(current) = &self.page_directory {
            assert!(
                Arc::ptr_eq(current, directory),
                "region {} is already mapped elsewhere",
                self.name
            );
        }
        if self.mmap && directory.is_kernel() {
            panic!("mmap'ed region {} mapped into the kernel page directory", self.name);
        }
        if self.page_directory.is_none() {
            self.page_directory = Some(directory.clone());
            self.mapping_id = Some(self.object.mappings().register(
                directory,
                self.range.base(),
                self.first_page_index(),
                self.page_count(),
            ));
        }
        self.remap()
    }

    /// 重新写入所有已有物理页的页表项
    pub fn remap(&self) -> MemoryResult<()> {
        let directory = match &self.page_directory {
            Some(directory) => directory,
            None => return Ok(()),
        };
        let _guard = directory.lock();
        for page_index in 0..self.page_count() {
            if self.physical_page(page_index).is_some() {
                self.map_individual_page(page_index)?;
            }
        }
        Ok(())
    }

    /// 立即为每一页准备物理页并写入页表项
    pub fn commit(&self) -> MemoryResult<()> {
        for page_index in 0..self.page_count() {
            self.object
                .get_or_create_page(self.object_page_index(page_index))?;
            self.map_individual_page(page_index)?;
        }
        Ok(())
    }

    /// 撤销所有页表项；`deallocate_range` 时把区间还给页目录的分配器
    pub fn unmap(&mut self, deallocate_range: bool) {
        let directory = match self.page_directory.take() {
            Some(directory) => directory,
            None => return,
        };
        {
            let _guard = directory.lock();
            for page_index in 0..self.page_count() {
                directory.unmap(self.vaddr_from_page_index(page_index));
            }
        }
        if let Some(id) = self.mapping_id.take() {
            self.object.mappings().unregister(id);
        }
        // 页目录的锁已经释放，区间分配器的锁不和它嵌套；
        // 区间不属于这个页目录的分配器时由 deallocate 报错
        if deallocate_range {
            directory.range_allocator().deallocate(self.range);
        }
        log::trace!(
            "region {} {:#x}-{:#x} unmapped",
            self.name,
            self.range.base(),
            self.range.end()
        );
    }

    /// fork 用：得到一个还没有放置的新区域
    ///
    /// 共享区域共享内存对象；私有区域用对象的副本，并把自己可写的页重映射成只读，
    /// 之后任何一方写入都会触发写时复制
    pub fn clone(&self) -> MemoryResult<Region> {
        let object: Arc<dyn VmObject> = match (self.inherit_mode, self.shared) {
            (InheritMode::ZeroedOnFork, _) => {
                let fresh: Arc<dyn VmObject> = AnonymousVmObject::create_with_size(self.size())?;
                let mut region = Region::new(
                    self.range,
                    fresh,
                    0,
                    &self.name,
                    self.access,
                    self.cacheable,
                    self.shared,
                    self.user_accessible,
                )?;
                region.stack = self.stack;
                region.mmap = self.mmap;
                region.inherit_mode = self.inherit_mode;
                return Ok(region);
            }
            (InheritMode::Default, true) => self.object.clone(),
            (InheritMode::Default, false) => {
                let clone = self.object.try_clone()?;
                if self.object.is_anonymous() && self.is_writable() {
                    self.remap()?;
                }
                clone
            }
        };
        let mut region = Region::new(
            self.range,
            object,
            self.offset_in_object,
            &self.name,
            self.access,
            self.cacheable,
            self.shared,
            self.user_accessible,
        )?;
        region.stack = self.stack;
        region.mmap = self.mmap;
        region.inherit_mode = self.inherit_mode;
        Ok(region)
    }

    fn set_access_bit(&mut self, bit: Access, value: bool) -> MemoryResult<()> {
        self.access.set(bit, value);
        if value {
            self.access |= bit.history();
        }
        self.remap()
    }

    pub fn set_readable(&mut self, value: bool) -> MemoryResult<()> {
        self.set_access_bit(Access::READ, value)
    }

    pub fn set_writable(&mut self, value: bool) -> MemoryResult<()> {
        self.set_access_bit(Access::WRITE, value)
    }

    pub fn set_executable(&mut self, value: bool) -> MemoryResult<()> {
        self.set_access_bit(Access::EXECUTE, value)
    }

    fn permits(&self, access: FaultAccess) -> bool {
        match access {
            FaultAccess::Read => self.is_readable(),
            FaultAccess::Write => self.is_writable(),
            FaultAccess::Execute => self.is_executable(),
        }
    }

    /// 缺页入口
    pub fn handle_fault(&self, fault: &PageFault) -> PageFaultResponse {
        let mut state = FaultState::Received(*fault);
        loop {
            if let Some(response) = state.response() {
                match state {
                    FaultState::Rejected(reason) => log::debug!(
                        "region {}: rejected {:?} fault at {:#x}: {:?}",
                        self.name,
                        fault.access,
                        fault.address,
                        reason
                    ),
                    FaultState::Fatal(error) => log::warn!(
                        "region {}: cannot resolve fault at {:#x}: {}",
                        self.name,
                        fault.address,
                        error
                    ),
                    _ => {}
                }
                return response;
            }
            state = match state {
                FaultState::Received(fault) => self.classify(&fault),
                FaultState::Classified {
                    fault,
                    page_index,
                    class,
                } => self.resolve(&fault, page_index, class),
                terminal => terminal,
            };
        }
    }

    fn classify(&self, fault: &PageFault) -> FaultState {
        if !self.contains(fault.address) {
            return FaultState::Rejected(RejectReason::OutsideRegion);
        }
        if self.page_directory.is_none() {
            return FaultState::Rejected(RejectReason::Unmapped);
        }
        if fault.privilege == Privilege::User && !self.user_accessible {
            return FaultState::Rejected(RejectReason::KernelOnly);
        }
        let page_index = self.page_index_from_address(fault.address);
        let class = match fault.fault_type {
            FaultType::PageNotPresent => {
                if !self.permits(fault.access) {
                    return FaultState::Rejected(RejectReason::AccessDenied(fault.access));
                }
                FaultClass::NotPresent
            }
            FaultType::ProtectionViolation => {
                if fault.is_write() && self.is_writable() && self.should_cow(page_index) {
                    FaultClass::CopyOnWrite
                } else {
                    return FaultState::Rejected(RejectReason::ProtectionViolation);
                }
            }
        };
        FaultState::Classified {
            fault: *fault,
            page_index,
            class,
        }
    }

    /// 只改动一个页表项
    fn resolve(&self, fault: &PageFault, page_index: usize, class: FaultClass) -> FaultState {
        let object_index = self.object_page_index(page_index);
        let page = match class {
            FaultClass::NotPresent if fault.is_write() && self.should_cow(page_index) => {
                self.object.break_cow(object_index)
            }
            FaultClass::NotPresent => self.object.get_or_create_page(object_index),
            FaultClass::CopyOnWrite => self.object.break_cow(object_index),
        };
        match page.and_then(|_| self.map_individual_page(page_index)) {
            Ok(()) => {
                log::trace!(
                    "region {}: {:?} fault at {:#x} resolved",
                    self.name,
                    class,
                    fault.address
                );
                FaultState::Resolved
            }
            Err(error) => FaultState::Fatal(error),
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        self.unmap(true);
    }
}

impl core::fmt::Debug for Region {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Region({} {:#x}-{:#x} {:?} {})",
            self.name,
            self.range.base(),
            self.range.end(),
            self.access,
            self.object.class_name()
        )
    }
}
