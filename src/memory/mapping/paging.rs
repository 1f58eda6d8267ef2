//! 分页模式：页表级数在编译期由 feature 选定
//!
//! 两种模式的页表项格式相同，区别只在级数和 satp 里的 MODE 字段

use crate::memory::address::VirtualPageNumber;
use bit_field::BitField;

/// 每级页表下标的位数
const INDEX_BITS: usize = 9;

pub trait PagingMode: 'static {
    const LEVELS: usize;
    /// satp 的 MODE 字段
    const SATP_MODE: usize;

    /// 第 `level` 级（0 为根）页表中的下标
    fn index(vpn: VirtualPageNumber, level: usize) -> usize {
        let shift = INDEX_BITS * (Self::LEVELS - 1 - level);
        vpn.0.get_bits(shift..shift + INDEX_BITS)
    }
}

/// 三级页表，39 位虚拟地址
pub struct Sv39;

impl PagingMode for Sv39 {
    const LEVELS: usize = 3;
    const SATP_MODE: usize = 8;
}

/// 四级页表，48 位虚拟地址
pub struct Sv48;

impl PagingMode for Sv48 {
    const LEVELS: usize = 4;
    const SATP_MODE: usize = 9;
}

#[cfg(not(feature = "sv48"))]
pub type ArchPaging = Sv39;
#[cfg(feature = "sv48")]
pub type ArchPaging = Sv48;
