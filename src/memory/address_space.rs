//! 地址空间 [`AddressSpace`]：一个进程的页目录和它的全部区域
//!
//! 锁的顺序：地址空间 → 页目录 → 内存对象 → 物理页分配器。
//! 区间分配器的锁从不和页目录的锁嵌套。

use super::address::{align_up, PhysicalAddress, VirtualAddress};
use super::config::PAGE_SIZE;
use super::fault::{FaultAccess, PageFault, PageFaultResponse, Privilege};
use super::mapping::{kernel_page_directory, PageDirectory};
use super::range::VirtualRange;
use super::region::{Access, Region};
use super::vm_object::{AnonymousVmObject, ContiguousVmObject, VmObject};
use super::{MemoryError, MemoryResult};
use crate::sync::Lock;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// 新区域的物理页什么时候分配
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AllocationStrategy {
    /// 等第一次访问
    Reserve,
    /// 立即分配并写入页表项
    AllocateNow,
}

pub struct AddressSpace {
    page_directory: Arc<PageDirectory>,
    /// 区域起始地址 -> 区域
    regions: Lock<BTreeMap<VirtualAddress, Region>>,
}

impl AddressSpace {
    /// 新的用户地址空间；给出 `parent` 时复制它的空闲区间集合
    pub fn try_create(parent: Option<&AddressSpace>) -> MemoryResult<Self> {
        let page_directory = PageDirectory::create_for_userspace(
            parent.map(|parent| parent.page_directory.range_allocator()),
        )?;
        Ok(Self {
            page_directory,
            regions: Lock::new(BTreeMap::new()),
        })
    }

    pub fn page_directory(&self) -> &Arc<PageDirectory> {
        &self.page_directory
    }

    /// 分配一段虚拟区间；`hint` 给出时必须正好放在那里
    pub fn allocate_range(
        &self,
        hint: Option<VirtualAddress>,
        size: usize,
        alignment: usize,
    ) -> MemoryResult<VirtualRange> {
        let size = align_up(size, PAGE_SIZE).ok_or(MemoryError::InvalidArgument)?;
        let allocator = self.page_directory.range_allocator();
        match hint {
            Some(base) => allocator.allocate_specific(base, size),
            None => allocator.allocate_anywhere(size, alignment),
        }
    }

    pub fn allocate_randomized_range(
        &self,
        size: usize,
        alignment: usize,
    ) -> MemoryResult<VirtualRange> {
        let size = align_up(size, PAGE_SIZE).ok_or(MemoryError::InvalidArgument)?;
        self.page_directory
            .range_allocator()
            .allocate_randomized(size, alignment)
    }

    /// 在已经分配的区间上建立匿名内存区域
    pub fn allocate_region(
        &self,
        range: VirtualRange,
        name: &str,
        access: Access,
        strategy: AllocationStrategy,
    ) -> MemoryResult<VirtualRange> {
        let object = match AnonymousVmObject::create_with_size(range.size()) {
            Ok(object) => object,
            Err(error) => {
                self.page_directory.range_allocator().deallocate(range);
                return Err(error);
            }
        };
        let region = Region::create_user_accessible(range, object, 0, name, access, true, false);
        self.place_region(region, range)?;
        if strategy == AllocationStrategy::AllocateNow {
            let committed = self.regions.lock()[&range.base()].commit();
            if let Err(error) = committed {
                self.deallocate_region(range.base())?;
                return Err(error);
            }
        }
        Ok(range)
    }

    /// 在已经分配的区间上映射给定的内存对象
    pub fn allocate_region_with_vmobject(
        &self,
        range: VirtualRange,
        object: Arc<dyn VmObject>,
        offset_in_object: usize,
        name: &str,
        access: Access,
        shared: bool,
    ) -> MemoryResult<VirtualRange> {
        let region =
            Region::create_user_accessible(range, object, offset_in_object, name, access, true, shared);
        self.place_region(region, range)
    }

    /// 映射并登记新区域；创建失败时归还区间
    fn place_region(
        &self,
        region: MemoryResult<Region>,
        range: VirtualRange,
    ) -> MemoryResult<VirtualRange> {
        let mut region = match region {
            Ok(region) => region,
            Err(error) => {
                self.page_directory.range_allocator().deallocate(range);
                return Err(error);
            }
        };
        // 映射失败时 region 析构会归还区间
        region.map(&self.page_directory)?;
        log::debug!("address space: new {:?}", region);
        self.regions.lock().insert(range.base(), region);
        Ok(range)
    }

    /// 拆除从 `base` 开始的区域，区间还给分配器
    pub fn deallocate_region(&self, base: VirtualAddress) -> MemoryResult<()> {
        let region = self
            .regions
            .lock()
            .remove(&base)
            .ok_or(MemoryError::InvalidArgument)?;
        drop(region);
        Ok(())
    }

    fn find_region<'a>(
        regions: &'a BTreeMap<VirtualAddress, Region>,
        address: VirtualAddress,
    ) -> Option<&'a Region> {
        regions
            .range(..=address)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.contains(address))
    }

    pub fn region_range_containing(&self, address: VirtualAddress) -> Option<VirtualRange> {
        let regions = self.regions.lock();
        Self::find_region(&regions, address).map(|region| region.range())
    }

    /// 对从 `base` 开始的区域调用 `f`
    pub fn with_region<T>(
        &self,
        base: VirtualAddress,
        f: impl FnOnce(&mut Region) -> T,
    ) -> Option<T> {
        self.regions.lock().get_mut(&base).map(f)
    }

    /// 修改区域的访问权限，已有的页表项随之改写
    pub fn protect(&self, base: VirtualAddress, access: Access) -> MemoryResult<()> {
        let mut regions = self.regions.lock();
        let region = regions.get_mut(&base).ok_or(MemoryError::InvalidArgument)?;
        region.set_readable(access.contains(Access::READ))?;
        region.set_writable(access.contains(Access::WRITE))?;
        region.set_executable(access.contains(Access::EXECUTE))
    }

    /// 交给包含缺页地址的区域处理；不属于任何区域的地址给线程发信号
    pub fn handle_fault(&self, fault: &PageFault) -> PageFaultResponse {
        let regions = self.regions.lock();
        match Self::find_region(&regions, fault.address) {
            Some(region) => region.handle_fault(fault),
            None => {
                log::debug!(
                    "address space: {:?} fault at {:#x} outside every region",
                    fault.access,
                    fault.address
                );
                PageFaultResponse::SignalError
            }
        }
    }

    /// 陷入处理的入口：根据当前页表项区分未映射和权限错误
    pub fn handle_trap(
        &self,
        address: VirtualAddress,
        access: FaultAccess,
        privilege: Privilege,
    ) -> PageFaultResponse {
        let fault = PageFault::from_trap(&self.page_directory, address, access, privilege);
        self.handle_fault(&fault)
    }

    /// fork：子地址空间拥有同样布局的区域，私有匿名内存写时复制
    pub fn try_clone(&self) -> MemoryResult<AddressSpace> {
        let regions = self.regions.lock();
        let page_directory =
            PageDirectory::create_for_userspace(Some(self.page_directory.range_allocator()))?;
        let mut cloned = BTreeMap::new();
        for (base, region) in regions.iter() {
            let mut clone = region.clone()?;
            clone.map(&page_directory)?;
            cloned.insert(*base, clone);
        }
        log::debug!("address space: cloned {} regions", cloned.len());
        Ok(AddressSpace {
            page_directory,
            regions: Lock::new(cloned),
        })
    }

    /// exec / exit 时拆除所有区域
    pub fn remove_all_regions(&self) {
        let regions = core::mem::take(&mut *self.regions.lock());
        drop(regions);
    }

    pub fn region_count(&self) -> usize {
        self.regions.lock().len()
    }

    pub fn region_ranges(&self) -> Vec<VirtualRange> {
        self.regions.lock().values().map(Region::range).collect()
    }

    pub fn amount_virtual(&self) -> usize {
        self.regions.lock().values().map(Region::size).sum()
    }

    pub fn amount_resident(&self) -> usize {
        self.regions.lock().values().map(Region::amount_resident).sum()
    }

    pub fn amount_shared(&self) -> usize {
        self.regions.lock().values().map(Region::amount_shared).sum()
    }
}

/// 在内核页目录里分配一块立即可用的只属于内核的内存
pub fn allocate_kernel_region(size: usize, name: &str, access: Access) -> MemoryResult<Region> {
    let size = align_up(size, PAGE_SIZE).ok_or(MemoryError::InvalidArgument)?;
    let object = AnonymousVmObject::create_with_size(size)?;
    allocate_kernel_region_with_vmobject(object, name, access, true)
}

/// 把一段物理内存（设备寄存器等）映射到内核，不经过缓存
pub fn allocate_kernel_region_for_physical_range(
    base: PhysicalAddress,
    size: usize,
    name: &str,
    access: Access,
) -> MemoryResult<Region> {
    let object = ContiguousVmObject::create_for_physical_range(base, size)?;
    allocate_kernel_region_with_vmobject(object, name, access, false)
}

fn allocate_kernel_region_with_vmobject(
    object: Arc<dyn VmObject>,
    name: &str,
    access: Access,
    cacheable: bool,
) -> MemoryResult<Region> {
    let directory = kernel_page_directory();
    let range = directory
        .range_allocator()
        .allocate_anywhere(object.size(), PAGE_SIZE)?;
    let mut region = match Region::create_kernel_only(range, object, 0, name, access, cacheable) {
        Ok(region) => region,
        Err(error) => {
            directory.range_allocator().deallocate(range);
            return Err(error);
        }
    };
    region.map(directory)?;
    region.commit()?;
    Ok(region)
}
