//! The virtual-memory core: per-process address spaces backed by a global
//! hashed page table, with translations pushed into a hardware TLB.

pub mod address;
pub mod addrspace;
pub mod fault;
pub mod frame;
pub mod hpt;

pub use address::{PhysAddr, PhysPageNum, VirtAddr, VirtPageNum, VpnRange};
pub use addrspace::{AddressSpace, AsId, Permissions, Region};
pub use fault::FaultType;
pub use frame::{FrameAllocator, FramePool};
pub use hpt::{HashPageTable, HptEntry};

use crate::error::Result;
use crate::tlb::Tlb;
use log::info;

/// The VM subsystem: the hashed page table plus its two hardware
/// collaborators, owned together so every operation threads through one
/// place instead of file-scope globals.
pub struct Vm<F: FrameAllocator, T: Tlb> {
    hpt: HashPageTable,
    frames: F,
    tlb: T,
}

impl<F: FrameAllocator, T: Tlb> Vm<F, T> {
    /// One-time initialization; must precede any fault handling. The page
    /// table is sized from the installed physical memory.
    pub fn bootstrap(frames: F, tlb: T) -> Self {
        let hpt = HashPageTable::new(frames.total_frames());
        info!(
            "vm: bootstrap with {} hpt slots for {} frames",
            hpt.slot_count(),
            frames.total_frames()
        );
        Self { hpt, frames, tlb }
    }

    pub fn hpt(&self) -> &HashPageTable {
        &self.hpt
    }

    pub fn frames(&self) -> &F {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut F {
        &mut self.frames
    }

    pub fn tlb(&self) -> &T {
        &self.tlb
    }

    /// Invalidate every TLB slot on context switch, so no thread ever
    /// observes another address space's translation. A kernel-only context
    /// (no address space) leaves the prior translations in place.
    pub fn activate(&mut self, current: Option<&AddressSpace>) {
        if current.is_none() {
            return;
        }
        self.flush_tlb();
    }

    pub fn deactivate(&mut self, current: Option<&AddressSpace>) {
        self.activate(current);
    }

    fn flush_tlb(&mut self) {
        let spl = self.tlb.splhigh();
        for slot in 0..self.tlb.slot_count() {
            self.tlb.invalidate_slot(slot);
        }
        self.tlb.splx(spl);
    }

    /// Duplicate `old` into a fresh address space: clone every region's
    /// geometry and permissions, then eagerly copy every resident page
    /// byte-for-byte into newly allocated frames. Any failure destroys the
    /// partially built space before the error propagates, so a half-built
    /// address space is never left reachable.
    pub fn copy_address_space(&mut self, old: &AddressSpace) -> Result<AddressSpace> {
        let mut new = AddressSpace::new();
        for region in old.regions() {
            let perms = region.perms();
            if let Err(err) = new.define_region(
                region.base(),
                region.size(),
                perms.contains(Permissions::READ),
                perms.contains(Permissions::WRITE),
                perms.contains(Permissions::EXECUTE),
            ) {
                self.destroy_address_space(new);
                return Err(err);
            }
        }
        for i in 0..new.regions().len() {
            let region = new.regions()[i];
            if let Err(err) =
                self.hpt
                    .copy_region(&mut self.frames, &mut self.tlb, &region, old.id(), new.id())
            {
                self.destroy_address_space(new);
                return Err(err);
            }
        }
        self.flush_tlb();
        Ok(new)
    }

    /// Tear down an address space: release every region's page table
    /// entries and backing frames, then invalidate the TLB.
    pub fn destroy_address_space(&mut self, space: AddressSpace) {
        for region in space.regions() {
            self.hpt
                .free(&mut self.frames, space.id(), region.base(), region.size());
        }
        self.flush_tlb();
    }

    /// Temporarily grant WRITE on the READ-only regions of `space` so the
    /// loader can write initial program images into otherwise read-only
    /// segments. The relaxed permission is pushed into already-resident
    /// page table and TLB entries.
    pub fn prepare_load(&mut self, space: &mut AddressSpace) -> Result<()> {
        let id = space.id();
        for region in space.regions_mut() {
            let perms = region.perms();
            if perms.contains(Permissions::READ) && !perms.contains(Permissions::WRITE) {
                region.grant_transient_write();
                self.hpt
                    .relax_region(&mut self.tlb, id, region.base(), region.size());
            }
        }
        Ok(())
    }

    /// Reverse exactly the grants made by [`Vm::prepare_load`], re-tighten
    /// the resident entries, and flush the TLB so no stale writable
    /// translation survives the load.
    pub fn complete_load(&mut self, space: &mut AddressSpace) -> Result<()> {
        let id = space.id();
        for region in space.regions_mut() {
            if region.read_only_change() {
                region.revoke_transient_write();
                self.hpt.restore_region(id, region.base(), region.size());
            }
        }
        self.flush_tlb();
        Ok(())
    }
}
