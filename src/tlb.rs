//! Adapter for the hardware translation cache.
//!
//! The TLB holds `(virtual page, packed frame word)` pairs and is managed
//! entirely in software: the VM core writes translations into it on fault
//! resolution and invalidates it wholesale on address-space switch. The
//! interrupt priority level is raised around every write so the update
//! appears atomic to an interrupting timer or device handler.

use crate::config::PAGE_OFFSET_BITS;
use crate::mm::address::{PhysPageNum, VirtPageNum};
use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt::{self, Debug, Formatter};

bitflags! {
    /// Flag bits in the low word of a translation.
    ///
    /// The layout follows the R3000 convention of keeping the status bits
    /// below the frame number: a translation is usable when VALID is set
    /// and writable when DIRTY is set.
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct EntryLoFlags: usize {
        const VALID = 1 << 9;
        const DIRTY = 1 << 10;
    }
}

/// Packed low word of a translation: physical frame number plus flags.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct EntryLo {
    bits: usize,
}

impl EntryLo {
    pub fn new(ppn: PhysPageNum, flags: EntryLoFlags) -> Self {
        Self {
            bits: ppn.0 << PAGE_OFFSET_BITS | flags.bits(),
        }
    }

    /// An all-zero word; the VALID bit is clear.
    pub const fn invalid() -> Self {
        Self { bits: 0 }
    }

    pub fn bits(&self) -> usize {
        self.bits
    }

    /// Returns the physical frame number stored in this word.
    pub fn ppn(&self) -> PhysPageNum {
        PhysPageNum(self.bits >> PAGE_OFFSET_BITS)
    }

    /// Returns the flag bits stored in this word.
    pub fn flags(&self) -> EntryLoFlags {
        EntryLoFlags::from_bits_truncate(self.bits)
    }

    pub fn is_valid(&self) -> bool {
        self.flags().contains(EntryLoFlags::VALID)
    }

    pub fn is_dirty(&self) -> bool {
        self.flags().contains(EntryLoFlags::DIRTY)
    }

    pub fn set_dirty(&mut self) {
        self.bits |= EntryLoFlags::DIRTY.bits();
    }

    pub fn clear_dirty(&mut self) {
        self.bits &= !EntryLoFlags::DIRTY.bits();
    }
}

impl Debug for EntryLo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:#x}(LO)", self.bits))
    }
}

/// Saved interrupt priority level returned by [`Tlb::splhigh`].
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct SplLevel(pub usize);

/// The hardware translation cache consumed by the VM core.
///
/// Interrupt priority control lives on this trait because the only
/// critical sections in the subsystem bracket TLB writes.
pub trait Tlb {
    /// Number of hardware slots.
    fn slot_count(&self) -> usize;
    /// Write a translation into a specific slot.
    fn write_slot(&mut self, slot: usize, hi: VirtPageNum, lo: EntryLo);
    /// Write a translation into a slot picked by the hardware's random
    /// replacement policy.
    fn write_random(&mut self, hi: VirtPageNum, lo: EntryLo);
    /// Invalidate one slot.
    fn invalidate_slot(&mut self, slot: usize);
    /// Raise the interrupt priority level; returns the previous level.
    fn splhigh(&mut self) -> SplLevel;
    /// Restore a previously saved interrupt priority level.
    fn splx(&mut self, level: SplLevel);
}

/// Software model of the translation cache.
///
/// Used by the self-tests and usable by a machine simulator. The random
/// replacement policy is a round-robin cursor so behavior stays
/// deterministic.
pub struct SoftTlb {
    slots: Vec<Option<(VirtPageNum, EntryLo)>>,
    cursor: usize,
    spl: usize,
}

impl SoftTlb {
    pub fn new(slot_count: usize) -> Self {
        Self {
            slots: vec![None; slot_count],
            cursor: 0,
            spl: 0,
        }
    }

    /// Translation currently cached for `vpn`, if any.
    pub fn lookup(&self, vpn: VirtPageNum) -> Option<EntryLo> {
        self.slots
            .iter()
            .flatten()
            .find(|(hi, _)| *hi == vpn)
            .map(|(_, lo)| *lo)
    }

    /// Number of slots holding a translation.
    pub fn valid_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// True while the interrupt priority level is raised.
    pub fn spl_raised(&self) -> bool {
        self.spl > 0
    }
}

impl Tlb for SoftTlb {
    fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn write_slot(&mut self, slot: usize, hi: VirtPageNum, lo: EntryLo) {
        self.slots[slot] = Some((hi, lo));
    }

    fn write_random(&mut self, hi: VirtPageNum, lo: EntryLo) {
        // A real TLB machine-checks on duplicate virtual pages, so an
        // existing slot for the same page is overwritten in place.
        if let Some(slot) = self
            .slots
            .iter()
            .position(|entry| matches!(entry, Some((cached, _)) if *cached == hi))
        {
            self.slots[slot] = Some((hi, lo));
        } else {
            let slot = self.cursor;
            self.cursor = (self.cursor + 1) % self.slots.len();
            self.slots[slot] = Some((hi, lo));
        }
    }

    fn invalidate_slot(&mut self, slot: usize) {
        self.slots[slot] = None;
    }

    fn splhigh(&mut self) -> SplLevel {
        let prev = self.spl;
        self.spl += 1;
        SplLevel(prev)
    }

    fn splx(&mut self, level: SplLevel) {
        self.spl = level.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lo(ppn: usize) -> EntryLo {
        EntryLo::new(PhysPageNum(ppn), EntryLoFlags::VALID)
    }

    #[test]
    fn entry_lo_packing() {
        let mut word = EntryLo::new(PhysPageNum(0x42), EntryLoFlags::VALID | EntryLoFlags::DIRTY);
        assert_eq!(word.ppn(), PhysPageNum(0x42));
        assert!(word.is_valid());
        assert!(word.is_dirty());
        word.clear_dirty();
        assert!(!word.is_dirty());
        assert!(word.is_valid());
        word.set_dirty();
        assert!(word.is_dirty());
        assert!(!EntryLo::invalid().is_valid());
    }

    #[test]
    fn random_writes_cycle_through_slots() {
        let mut tlb = SoftTlb::new(4);
        for page in 0..4 {
            tlb.write_random(VirtPageNum(page), lo(page));
        }
        assert_eq!(tlb.valid_count(), 4);
        // the fifth write evicts the oldest slot
        tlb.write_random(VirtPageNum(9), lo(9));
        assert_eq!(tlb.valid_count(), 4);
        assert!(tlb.lookup(VirtPageNum(0)).is_none());
        assert!(tlb.lookup(VirtPageNum(9)).is_some());
    }

    #[test]
    fn random_write_replaces_same_page_in_place() {
        let mut tlb = SoftTlb::new(4);
        tlb.write_random(VirtPageNum(3), lo(1));
        tlb.write_random(VirtPageNum(3), lo(2));
        assert_eq!(tlb.valid_count(), 1);
        assert_eq!(tlb.lookup(VirtPageNum(3)).unwrap().ppn(), PhysPageNum(2));
    }

    #[test]
    fn invalidate_clears_a_slot() {
        let mut tlb = SoftTlb::new(2);
        tlb.write_slot(1, VirtPageNum(5), lo(5));
        assert!(tlb.lookup(VirtPageNum(5)).is_some());
        tlb.invalidate_slot(1);
        assert!(tlb.lookup(VirtPageNum(5)).is_none());
    }

    #[test]
    fn spl_nesting_restores_in_order() {
        let mut tlb = SoftTlb::new(1);
        let outer = tlb.splhigh();
        let inner = tlb.splhigh();
        assert!(tlb.spl_raised());
        tlb.splx(inner);
        assert!(tlb.spl_raised());
        tlb.splx(outer);
        assert!(!tlb.spl_raised());
    }
}
