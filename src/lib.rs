//! 内核虚拟内存子系统
//!
//! - [`memory::range_allocator`]：每个地址空间的虚拟地址区间分配
//! - [`memory::region`]：把一段虚拟区间绑定到后备内存对象，并处理缺页
//! - [`memory::mapping`]：页表与页目录
//! - [`memory::vm_object`]：匿名内存和连续物理内存
//! - [`memory::address_space`]：进程的区域集合，fork 与缺页入口
//! - [`memory::slab`]：内核小对象的无锁 slab 分配器

#![cfg_attr(not(test), no_std)]
#![warn(clippy::all)]

extern crate alloc;

pub mod arch;
pub mod memory;
pub mod sync;
