use crate::config::{PAGE_OFFSET_BITS, PAGE_SIZE};
use core::fmt::{self, Debug, Formatter};

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub struct PhysAddr(pub usize);

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub struct VirtAddr(pub usize);

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub struct PhysPageNum(pub usize);

#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub struct VirtPageNum(pub usize);

impl Debug for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:#x}(PA)", self.0))
    }
}
impl Debug for VirtAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:#x}(VA)", self.0))
    }
}
impl Debug for PhysPageNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:#x}(PPN)", self.0))
    }
}
impl Debug for VirtPageNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:#x}(VPN)", self.0))
    }
}

impl From<usize> for PhysAddr {
    fn from(v: usize) -> Self {
        Self(v)
    }
}
impl From<usize> for VirtAddr {
    fn from(v: usize) -> Self {
        Self(v)
    }
}
impl From<usize> for PhysPageNum {
    fn from(v: usize) -> Self {
        Self(v)
    }
}
impl From<usize> for VirtPageNum {
    fn from(v: usize) -> Self {
        Self(v)
    }
}

impl VirtAddr {
    pub fn bits(&self) -> usize {
        self.0
    }

    /// Returns the offset within the page for this virtual address.
    pub fn page_offset(&self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Returns the virtual page number containing this address (rounded down).
    pub fn floor(&self) -> VirtPageNum {
        VirtPageNum(self.0 / PAGE_SIZE)
    }

    /// Returns the virtual page number containing this address (rounded up).
    pub fn ceil(&self) -> VirtPageNum {
        VirtPageNum(self.0.div_ceil(PAGE_SIZE))
    }

    pub fn aligned(&self) -> bool {
        self.page_offset() == 0
    }
}

impl VirtPageNum {
    pub fn bits(&self) -> usize {
        self.0
    }

    pub fn add(&mut self, v: usize) {
        self.0 += v;
    }

    /// Returns the starting virtual address of this page.
    pub fn get_first_addr(&self) -> VirtAddr {
        VirtAddr(self.0 << PAGE_OFFSET_BITS)
    }
}

impl PhysAddr {
    pub fn bits(&self) -> usize {
        self.0
    }

    pub fn page_offset(&self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Returns the physical page number containing this address (rounded down).
    pub fn floor(&self) -> PhysPageNum {
        PhysPageNum(self.0 / PAGE_SIZE)
    }

    /// Returns the physical page number containing this address (rounded up).
    pub fn ceil(&self) -> PhysPageNum {
        PhysPageNum(self.0.div_ceil(PAGE_SIZE))
    }

    pub fn aligned(&self) -> bool {
        self.page_offset() == 0
    }
}

impl PhysPageNum {
    pub fn bits(&self) -> usize {
        self.0
    }

    /// Returns the starting physical address of this frame.
    pub fn get_first_addr(&self) -> PhysAddr {
        PhysAddr(self.0 << PAGE_OFFSET_BITS)
    }
}

/// A half-open range of virtual page numbers.
#[derive(Copy, Clone)]
pub struct VpnRange {
    start: VirtPageNum,
    end: VirtPageNum,
}

impl VpnRange {
    pub fn new(start: VirtPageNum, end: VirtPageNum) -> Self {
        Self { start, end }
    }
}

impl IntoIterator for VpnRange {
    type Item = VirtPageNum;

    type IntoIter = VpnRangeIterator;

    fn into_iter(self) -> Self::IntoIter {
        VpnRangeIterator {
            current: self.start,
            end: self.end,
        }
    }
}

pub struct VpnRangeIterator {
    current: VirtPageNum,
    end: VirtPageNum,
}

impl Iterator for VpnRangeIterator {
    type Item = VirtPageNum;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current >= self.end {
            None
        } else {
            let cur = self.current;
            self.current.add(1);
            Some(cur)
        }
    }
}
