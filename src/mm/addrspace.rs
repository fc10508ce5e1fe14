use super::address::{VirtAddr, VpnRange};
use crate::config::{PAGE_SIZE, STACK_PAGES, USER_TOP};
use crate::error::{Result, VmError};
use alloc::vec::Vec;
use bitflags::bitflags;
use core::sync::atomic::{AtomicUsize, Ordering};

bitflags! {
    /// Access permissions carried by a region and enforced on every fault.
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct Permissions: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// Identity of one address space; the hash key of the page table.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AsId(usize);

impl AsId {
    /// Marks a page-table slot with no owner. Never assigned to a live
    /// address space.
    pub const UNOWNED: AsId = AsId(0);

    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub fn bits(&self) -> usize {
        self.0
    }
}

static NEXT_AS_ID: AtomicUsize = AtomicUsize::new(1);

/// A permission-tagged contiguous range of user virtual pages.
///
/// Regions are page-aligned, owned by exactly one address space, and never
/// overlap within it.
#[derive(Copy, Clone, Debug)]
pub struct Region {
    base: VirtAddr,
    size: usize,
    perms: Permissions,
    /// WRITE was granted transiently by `prepare_load` and must be revoked
    /// by `complete_load`.
    read_only_change: bool,
}

impl Region {
    pub fn base(&self) -> VirtAddr {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn perms(&self) -> Permissions {
        self.perms
    }

    /// One past the last address of the region.
    pub fn end(&self) -> usize {
        self.base.0 + self.size
    }

    pub fn contains(&self, va: VirtAddr) -> bool {
        va.0 >= self.base.0 && va.0 < self.end()
    }

    /// The pages spanned by this region.
    pub fn pages(&self) -> VpnRange {
        VpnRange::new(self.base.floor(), VirtAddr(self.end()).ceil())
    }

    pub(crate) fn read_only_change(&self) -> bool {
        self.read_only_change
    }

    pub(crate) fn grant_transient_write(&mut self) {
        self.perms |= Permissions::WRITE;
        self.read_only_change = true;
    }

    pub(crate) fn revoke_transient_write(&mut self) {
        self.perms.remove(Permissions::WRITE);
        self.read_only_change = false;
    }
}

/// The full virtual-memory context of one process: an identity plus its
/// set of non-overlapping regions.
pub struct AddressSpace {
    id: AsId,
    regions: Vec<Region>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self {
            id: AsId(NEXT_AS_ID.fetch_add(1, Ordering::Relaxed)),
            regions: Vec::new(),
        }
    }

    pub fn id(&self) -> AsId {
        self.id
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub(crate) fn regions_mut(&mut self) -> &mut [Region] {
        &mut self.regions
    }

    /// First region containing `va`, if any. Regions never overlap, so at
    /// most one true match exists.
    pub fn find_region(&self, va: VirtAddr) -> Option<&Region> {
        self.regions.iter().find(|region| region.contains(va))
    }

    /// Define a new region covering `[vaddr, vaddr + size)`.
    ///
    /// The base is aligned down and the size up to page boundaries. Fails
    /// with `InvalidArgument` when the aligned range crosses the
    /// user/kernel split or overlaps an existing region; the region set is
    /// left unchanged on failure.
    pub fn define_region(
        &mut self,
        vaddr: VirtAddr,
        size: usize,
        readable: bool,
        writable: bool,
        executable: bool,
    ) -> Result<()> {
        let size = size + vaddr.page_offset();
        let base = vaddr.floor().get_first_addr();
        let size = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let end = base.0 + size;

        if end > USER_TOP {
            return Err(VmError::InvalidArgument);
        }
        if self
            .regions
            .iter()
            .any(|other| base.0 <= other.end() && end >= other.base.0)
        {
            return Err(VmError::InvalidArgument);
        }

        let mut perms = Permissions::empty();
        if readable {
            perms |= Permissions::READ;
        }
        if writable {
            perms |= Permissions::WRITE;
        }
        if executable {
            perms |= Permissions::EXECUTE;
        }

        self.regions.push(Region {
            base,
            size,
            perms,
            read_only_change: false,
        });
        Ok(())
    }

    /// Reserve the fixed-size stack region directly below the top of user
    /// space; returns the initial stack pointer.
    pub fn define_stack(&mut self) -> Result<VirtAddr> {
        let size = STACK_PAGES * PAGE_SIZE;
        self.define_region(VirtAddr(USER_TOP - size), size, true, true, false)?;
        Ok(VirtAddr(USER_TOP))
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct() {
        let a = AddressSpace::new();
        let b = AddressSpace::new();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), AsId::UNOWNED);
    }

    #[test]
    fn define_region_aligns_to_pages() {
        let mut space = AddressSpace::new();
        space
            .define_region(VirtAddr(0x1234), 0x1000, true, false, false)
            .unwrap();
        let region = &space.regions()[0];
        assert_eq!(region.base(), VirtAddr(0x1000));
        // 0x234 bytes of lead-in plus 0x1000 rounds up to two pages
        assert_eq!(region.size(), 0x2000);
        assert_eq!(region.perms(), Permissions::READ);
    }

    #[test]
    fn overlapping_region_is_rejected_and_set_unchanged() {
        let mut space = AddressSpace::new();
        space
            .define_region(VirtAddr(0x4000), 2 * PAGE_SIZE, true, true, false)
            .unwrap();
        assert_eq!(
            space.define_region(VirtAddr(0x5000), PAGE_SIZE, true, false, false),
            Err(VmError::InvalidArgument)
        );
        assert_eq!(space.regions().len(), 1);
        assert_eq!(space.regions()[0].perms(), Permissions::READ | Permissions::WRITE);
    }

    #[test]
    fn region_above_user_top_is_rejected() {
        let mut space = AddressSpace::new();
        assert_eq!(
            space.define_region(VirtAddr(USER_TOP - PAGE_SIZE), 2 * PAGE_SIZE, true, true, false),
            Err(VmError::InvalidArgument)
        );
        assert!(space.regions().is_empty());
    }

    #[test]
    fn stack_sits_below_user_top() {
        let mut space = AddressSpace::new();
        let sp = space.define_stack().unwrap();
        assert_eq!(sp, VirtAddr(USER_TOP));
        let region = &space.regions()[0];
        assert_eq!(region.end(), USER_TOP);
        assert_eq!(region.size(), STACK_PAGES * PAGE_SIZE);
        assert_eq!(region.perms(), Permissions::READ | Permissions::WRITE);
    }

    #[test]
    fn find_region_matches_containment() {
        let mut space = AddressSpace::new();
        space
            .define_region(VirtAddr(0x4000), 2 * PAGE_SIZE, true, false, true)
            .unwrap();
        assert!(space.find_region(VirtAddr(0x4000)).is_some());
        assert!(space.find_region(VirtAddr(0x5fff)).is_some());
        assert!(space.find_region(VirtAddr(0x6000)).is_none());
        assert!(space.find_region(VirtAddr(0x3fff)).is_none());
    }
}
