//! Virtual-memory core of a teaching operating-system kernel.
//!
//! Per-process address spaces are composed of permission-tagged regions;
//! virtual pages are backed by physical frames through a global hashed
//! page table with open addressing and in-place chaining; hardware page
//! faults are resolved by allocating frames on demand and installing
//! translations into the TLB.
//!
//! The physical frame allocator and the hardware TLB are external
//! collaborators, consumed through the [`FrameAllocator`] and [`Tlb`]
//! traits. [`FramePool`] and [`SoftTlb`] are ready-made implementations
//! for tests and simulators.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod mm;
pub mod tlb;

pub use error::{Result, VmError};
pub use mm::{
    AddressSpace, AsId, FaultType, FrameAllocator, FramePool, HashPageTable, Permissions, Region,
    VirtAddr, VirtPageNum, Vm,
};
pub use tlb::{EntryLo, EntryLoFlags, SoftTlb, SplLevel, Tlb};
