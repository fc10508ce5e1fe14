//! Hardware page-fault resolution.

use super::Vm;
use super::address::VirtAddr;
use super::addrspace::{AddressSpace, Permissions};
use super::frame::FrameAllocator;
use crate::error::{Result, VmError};
use crate::tlb::Tlb;
use log::debug;

/// Kind of fault delivered by the trap dispatcher.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FaultType {
    Read,
    Write,
    /// A write hit a translation whose DIRTY bit is clear.
    ReadOnly,
}

impl FaultType {
    /// Decode the machine-level fault code; any other code is a malformed
    /// call.
    pub fn from_code(code: usize) -> Result<Self> {
        match code {
            0 => Ok(FaultType::Read),
            1 => Ok(FaultType::Write),
            2 => Ok(FaultType::ReadOnly),
            _ => Err(VmError::InvalidArgument),
        }
    }
}

impl<F: FrameAllocator, T: Tlb> Vm<F, T> {
    /// Resolve one TLB miss or protection violation for `current`.
    ///
    /// The faulting page must fall inside a region of the current address
    /// space whose permissions allow the access. A page already resident
    /// in the page table only has its translation refreshed in the TLB
    /// (it was evicted, not lost); a first access allocates a zero-filled
    /// frame and installs the new translation immediately.
    pub fn handle_fault(
        &mut self,
        current: Option<&AddressSpace>,
        fault: FaultType,
        addr: VirtAddr,
    ) -> Result<()> {
        // A read-only violation is never auto-resolved by relaxing
        // permissions; only prepare_load's scoped grant may do that.
        if fault == FaultType::ReadOnly {
            return Err(VmError::AccessFault);
        }
        let space = current.ok_or(VmError::InvalidArgument)?;
        if space.regions().is_empty() {
            return Err(VmError::AccessFault);
        }

        let page = addr.floor().get_first_addr();
        let region = space.find_region(page).ok_or(VmError::AccessFault)?;
        let needed = match fault {
            FaultType::Read => Permissions::READ,
            FaultType::Write => Permissions::WRITE,
            FaultType::ReadOnly => unreachable!(),
        };
        if !region.perms().contains(needed) {
            return Err(VmError::AccessFault);
        }

        let vpn = page.floor();
        if let Some(index) = self.hpt.get(space.id(), vpn) {
            let lo = self.hpt.slot(index).entrylo();
            let spl = self.tlb.splhigh();
            self.tlb.write_random(vpn, lo);
            self.tlb.splx(spl);
            debug!("vm: refreshed {vpn:?} for as {:?}", space.id());
        } else {
            self.hpt
                .add(&mut self.frames, &mut self.tlb, space.id(), page, region.perms(), true)?;
            debug!("vm: faulted in {vpn:?} for as {:?}", space.id());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::mm::address::VirtPageNum;
    use crate::mm::frame::FramePool;
    use crate::tlb::SoftTlb;

    fn vm(frames: usize) -> Vm<FramePool, SoftTlb> {
        Vm::bootstrap(FramePool::new(frames), SoftTlb::new(16))
    }

    #[test]
    fn unknown_fault_code_is_invalid() {
        assert_eq!(FaultType::from_code(0), Ok(FaultType::Read));
        assert_eq!(FaultType::from_code(1), Ok(FaultType::Write));
        assert_eq!(FaultType::from_code(2), Ok(FaultType::ReadOnly));
        assert_eq!(FaultType::from_code(7), Err(VmError::InvalidArgument));
    }

    #[test]
    fn faulting_every_page_maps_it_with_region_permissions() {
        let mut vm = vm(8);
        let mut space = AddressSpace::new();
        space
            .define_region(VirtAddr(0x4000), 4 * PAGE_SIZE, true, true, false)
            .unwrap();

        for page in 4..8usize {
            vm.handle_fault(Some(&space), FaultType::Write, VirtAddr(page * PAGE_SIZE + 0x123))
                .unwrap();
        }
        assert_eq!(vm.hpt().resident_pages(), 4);
        for page in 4..8usize {
            let index = vm.hpt().get(space.id(), VirtPageNum(page)).unwrap();
            let lo = vm.hpt().slot(index).entrylo();
            assert!(lo.is_valid());
            // the region is writable, so the entry carries the dirty bit
            assert!(lo.is_dirty());
        }
    }

    #[test]
    fn read_only_region_maps_clean_entries() {
        let mut vm = vm(4);
        let mut space = AddressSpace::new();
        space
            .define_region(VirtAddr(0x4000), PAGE_SIZE, true, false, false)
            .unwrap();
        vm.handle_fault(Some(&space), FaultType::Read, VirtAddr(0x4000))
            .unwrap();
        let index = vm.hpt().get(space.id(), VirtPageNum(4)).unwrap();
        assert!(!vm.hpt().slot(index).entrylo().is_dirty());
    }

    #[test]
    fn repeated_fault_refreshes_instead_of_reallocating() {
        let mut vm = vm(4);
        let mut space = AddressSpace::new();
        space
            .define_region(VirtAddr(0x4000), PAGE_SIZE, true, true, false)
            .unwrap();
        vm.handle_fault(Some(&space), FaultType::Write, VirtAddr(0x4abc))
            .unwrap();
        assert_eq!(vm.frames().in_use(), 1);
        let first = vm.tlb().lookup(VirtPageNum(4)).unwrap();

        vm.handle_fault(Some(&space), FaultType::Read, VirtAddr(0x4000))
            .unwrap();
        assert_eq!(vm.frames().in_use(), 1);
        assert_eq!(vm.hpt().resident_pages(), 1);
        assert_eq!(vm.tlb().lookup(VirtPageNum(4)).unwrap(), first);
    }

    #[test]
    fn fault_installs_the_translation_in_the_tlb() {
        let mut vm = vm(4);
        let mut space = AddressSpace::new();
        space
            .define_region(VirtAddr(0x4000), PAGE_SIZE, true, false, false)
            .unwrap();
        vm.handle_fault(Some(&space), FaultType::Read, VirtAddr(0x4000))
            .unwrap();
        assert!(vm.tlb().lookup(VirtPageNum(4)).is_some());
        assert!(!vm.tlb().spl_raised());
    }

    #[test]
    fn read_only_violation_is_an_access_fault() {
        let mut vm = vm(4);
        let mut space = AddressSpace::new();
        space
            .define_region(VirtAddr(0x4000), PAGE_SIZE, true, false, false)
            .unwrap();
        assert_eq!(
            vm.handle_fault(Some(&space), FaultType::ReadOnly, VirtAddr(0x4000)),
            Err(VmError::AccessFault)
        );
    }

    #[test]
    fn missing_address_space_is_invalid() {
        let mut vm = vm(4);
        assert_eq!(
            vm.handle_fault(None, FaultType::Read, VirtAddr(0x4000)),
            Err(VmError::InvalidArgument)
        );
    }

    #[test]
    fn empty_region_set_is_an_access_fault() {
        let mut vm = vm(4);
        let space = AddressSpace::new();
        assert_eq!(
            vm.handle_fault(Some(&space), FaultType::Read, VirtAddr(0x4000)),
            Err(VmError::AccessFault)
        );
    }

    #[test]
    fn address_outside_every_region_is_an_access_fault() {
        let mut vm = vm(4);
        let mut space = AddressSpace::new();
        space
            .define_region(VirtAddr(0x4000), PAGE_SIZE, true, true, false)
            .unwrap();
        assert_eq!(
            vm.handle_fault(Some(&space), FaultType::Read, VirtAddr(0x8000)),
            Err(VmError::AccessFault)
        );
        assert_eq!(vm.frames().in_use(), 0);
    }

    #[test]
    fn write_to_read_only_region_is_an_access_fault() {
        let mut vm = vm(4);
        let mut space = AddressSpace::new();
        space
            .define_region(VirtAddr(0x4000), PAGE_SIZE, true, false, true)
            .unwrap();
        assert_eq!(
            vm.handle_fault(Some(&space), FaultType::Write, VirtAddr(0x4000)),
            Err(VmError::AccessFault)
        );
        // the failed fault mapped nothing
        assert_eq!(vm.hpt().resident_pages(), 0);
    }

    #[test]
    fn frame_exhaustion_surfaces_as_out_of_memory() {
        let mut vm = vm(1);
        let mut space = AddressSpace::new();
        space
            .define_region(VirtAddr(0x4000), 2 * PAGE_SIZE, true, true, false)
            .unwrap();
        vm.handle_fault(Some(&space), FaultType::Write, VirtAddr(0x4000))
            .unwrap();
        assert_eq!(
            vm.handle_fault(Some(&space), FaultType::Write, VirtAddr(0x5000)),
            Err(VmError::OutOfMemory)
        );
    }
}
