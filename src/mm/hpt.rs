//! The global hashed page table.
//!
//! One fixed array of slots maps `(address-space identity, virtual page)`
//! to a packed frame word. Collisions are resolved by a linear probe for a
//! free slot plus in-place chaining: the overflow slot is linked onto the
//! tail of the home slot's chain by slot index, so any slot serves as
//! either a home entry or a link target and no second allocator is needed
//! for overflow nodes.

use super::address::{VirtAddr, VirtPageNum, VpnRange};
use super::addrspace::{AsId, Permissions, Region};
use super::frame::FrameAllocator;
use crate::config::HPT_SLOTS_PER_FRAME;
use crate::error::{Result, VmError};
use crate::tlb::{EntryLo, EntryLoFlags, Tlb};
use alloc::vec;
use alloc::vec::Vec;
use log::trace;

/// One slot of the hashed page table.
///
/// A slot is free exactly when the VALID bit of its `entrylo` is clear;
/// `next` chains collision overflow by slot index.
#[derive(Copy, Clone, Debug)]
pub struct HptEntry {
    owner: AsId,
    entryhi: VirtPageNum,
    entrylo: EntryLo,
    next: Option<usize>,
}

impl HptEntry {
    const fn empty() -> Self {
        Self {
            owner: AsId::UNOWNED,
            entryhi: VirtPageNum(0),
            entrylo: EntryLo::invalid(),
            next: None,
        }
    }

    pub fn owner(&self) -> AsId {
        self.owner
    }

    pub fn entryhi(&self) -> VirtPageNum {
        self.entryhi
    }

    pub fn entrylo(&self) -> EntryLo {
        self.entrylo
    }

    pub fn next(&self) -> Option<usize> {
        self.next
    }

    pub fn is_valid(&self) -> bool {
        self.entrylo.is_valid()
    }
}

/// The hashed page table, constructed once at bootstrap and passed by
/// reference into every operation.
pub struct HashPageTable {
    slots: Vec<HptEntry>,
}

impl HashPageTable {
    /// Size the table from the installed frame count.
    pub fn new(total_frames: usize) -> Self {
        Self::with_slots(total_frames * HPT_SLOTS_PER_FRAME)
    }

    pub fn with_slots(slots: usize) -> Self {
        assert!(slots > 0, "page table must have at least one slot");
        Self {
            slots: vec![HptEntry::empty(); slots],
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> &HptEntry {
        &self.slots[index]
    }

    /// Number of valid entries; handy for debug dumps and self-tests.
    pub fn resident_pages(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_valid()).count()
    }

    /// Home slot for `(owner, vpn)`. A distribution function, not a
    /// security primitive.
    fn hash(&self, owner: AsId, vpn: VirtPageNum) -> usize {
        (owner.bits() ^ vpn.bits()) % self.slots.len()
    }

    /// Slot index of the valid entry for `(owner, vpn)`, if present.
    pub fn get(&self, owner: AsId, vpn: VirtPageNum) -> Option<usize> {
        self.get_with_prev(owner, vpn).0
    }

    /// Chain walk anchored at the home slot, also yielding the matched
    /// entry's immediate predecessor in the chain when there is one.
    pub fn get_with_prev(&self, owner: AsId, vpn: VirtPageNum) -> (Option<usize>, Option<usize>) {
        let mut prev = None;
        let mut cursor = Some(self.hash(owner, vpn));
        while let Some(index) = cursor {
            let slot = &self.slots[index];
            if slot.is_valid() && slot.owner == owner && slot.entryhi == vpn {
                return (Some(index), prev);
            }
            prev = Some(index);
            cursor = slot.next;
        }
        (None, prev)
    }

    /// Allocate a frame and map the page containing `vaddr` for `owner`.
    ///
    /// The frame is zero-filled before it becomes visible: no tenant's old
    /// data is ever exposed to a new owner. The probe wrapping the full
    /// table without a free slot is the designed capacity limit and fails
    /// `OutOfMemory` with the frame released. With `install` set, the new
    /// translation is also written into the TLB through its random
    /// replacement policy.
    pub fn add<F: FrameAllocator, T: Tlb>(
        &mut self,
        frames: &mut F,
        tlb: &mut T,
        owner: AsId,
        vaddr: VirtAddr,
        perms: Permissions,
        install: bool,
    ) -> Result<()> {
        let vpn = vaddr.floor();
        let frame = frames.alloc().ok_or(VmError::OutOfMemory)?;

        let home = self.hash(owner, vpn);
        let mut index = home;
        while self.slots[index].is_valid() {
            index = (index + 1) % self.slots.len();
            if index == home {
                frames.dealloc(frame);
                return Err(VmError::OutOfMemory);
            }
        }

        if index != home {
            // overflow slot: append it to the tail of the home chain
            let mut tail = home;
            while let Some(next) = self.slots[tail].next {
                tail = next;
            }
            self.slots[tail].next = Some(index);
        }

        frames.zero(frame);

        let mut flags = EntryLoFlags::VALID;
        if perms.contains(Permissions::WRITE) {
            flags |= EntryLoFlags::DIRTY;
        }
        self.slots[index] = HptEntry {
            owner,
            entryhi: vpn,
            entrylo: EntryLo::new(frame, flags),
            next: None,
        };
        trace!("hpt: map {vpn:?} -> {frame:?} for as {owner:?} in slot {index}");

        if install {
            let lo = self.slots[index].entrylo;
            let spl = tlb.splhigh();
            tlb.write_random(vpn, lo);
            tlb.splx(spl);
        }
        Ok(())
    }

    /// Release every mapping of `owner` within `[base, base + size)`.
    ///
    /// Pages that were defined but never faulted in are skipped. Removing
    /// a chained home entry promotes the tail-most successor's values into
    /// the home slot so every other page chained through it stays
    /// reachable; the vacated slot is cleared completely.
    pub fn free<F: FrameAllocator>(
        &mut self,
        frames: &mut F,
        owner: AsId,
        base: VirtAddr,
        size: usize,
    ) {
        for vpn in VpnRange::new(base.floor(), VirtAddr(base.0 + size).ceil()) {
            let (found, prev) = self.get_with_prev(owner, vpn);
            let Some(index) = found else {
                continue;
            };
            debug_assert_eq!(self.slots[index].entryhi, vpn);
            frames.dealloc(self.slots[index].entrylo.ppn());

            let mut vacated = index;
            if let Some(prev) = prev {
                self.slots[prev].next = self.slots[index].next;
            } else if self.slots[index].next.is_some() {
                // the home slot anchors a chain: promote the tail-most
                // successor into it and unlink the tail
                let mut before_tail = index;
                let mut tail = index;
                while let Some(next) = self.slots[tail].next {
                    before_tail = tail;
                    tail = next;
                }
                self.slots[index].owner = self.slots[tail].owner;
                self.slots[index].entryhi = self.slots[tail].entryhi;
                self.slots[index].entrylo = self.slots[tail].entrylo;
                self.slots[before_tail].next = None;
                vacated = tail;
            }
            self.slots[vacated] = HptEntry::empty();
            trace!("hpt: unmap {vpn:?} for as {owner:?}, slot {vacated} vacated");
        }
    }

    /// Duplicate `old`'s resident pages in `region` under `new`: a
    /// matching entry with the region's permissions (not installed into
    /// the TLB) and an eager byte-for-byte copy of the frame contents.
    pub fn copy_region<F: FrameAllocator, T: Tlb>(
        &mut self,
        frames: &mut F,
        tlb: &mut T,
        region: &Region,
        old: AsId,
        new: AsId,
    ) -> Result<()> {
        for vpn in region.pages() {
            let Some(src) = self.get(old, vpn) else {
                continue;
            };
            let src_frame = self.slots[src].entrylo.ppn();
            self.add(frames, tlb, new, vpn.get_first_addr(), region.perms(), false)?;
            // the entry written a moment ago must be reachable again
            let dst = self
                .get(new, vpn)
                .ok_or(VmError::InternalInconsistency)?;
            frames.copy_frame(src_frame, self.slots[dst].entrylo.ppn());
        }
        Ok(())
    }

    /// Push a transient WRITE grant into the resident entries of a region
    /// and refresh them in the TLB (the `prepare_load` half).
    pub fn relax_region<T: Tlb>(&mut self, tlb: &mut T, owner: AsId, base: VirtAddr, size: usize) {
        for vpn in VpnRange::new(base.floor(), VirtAddr(base.0 + size).ceil()) {
            if let Some(index) = self.get(owner, vpn) {
                self.slots[index].entrylo.set_dirty();
                let lo = self.slots[index].entrylo;
                let spl = tlb.splhigh();
                tlb.write_random(vpn, lo);
                tlb.splx(spl);
            }
        }
    }

    /// Revoke the transient grant on the resident entries of a region (the
    /// `complete_load` half). The caller flushes the TLB afterwards, so
    /// entries are only re-tightened here.
    pub fn restore_region(&mut self, owner: AsId, base: VirtAddr, size: usize) {
        for vpn in VpnRange::new(base.floor(), VirtAddr(base.0 + size).ceil()) {
            if let Some(index) = self.get(owner, vpn) {
                self.slots[index].entrylo.clear_dirty();
            }
        }
    }
}
