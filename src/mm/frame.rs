//! Interface to the physical frame allocator and frame contents.

use super::address::PhysPageNum;
use crate::config::PAGE_SIZE;
use alloc::boxed::Box;
use alloc::vec::Vec;
use log::warn;

/// The external frame allocator consumed by the VM core.
///
/// Besides allocation, the trait carries the two frame-content operations
/// the core needs (zero-fill on first mapping, byte copy on address-space
/// duplication). A kernel implements them over its physical direct map;
/// [`FramePool`] implements them over heap-backed frames.
pub trait FrameAllocator {
    /// Number of frames installed in total; used to size the hashed page
    /// table at bootstrap.
    fn total_frames(&self) -> usize;
    /// Allocate one frame, or `None` when exhausted.
    fn alloc(&mut self) -> Option<PhysPageNum>;
    /// Return a frame to the allocator.
    fn dealloc(&mut self, ppn: PhysPageNum);
    /// Fill a frame with zero bytes.
    fn zero(&mut self, ppn: PhysPageNum);
    /// Copy the full contents of `src` into `dst`.
    fn copy_frame(&mut self, src: PhysPageNum, dst: PhysPageNum);
}

/// Heap-backed frame pool with a fixed capacity.
///
/// Frames are handed out from a watermark and recycled through a stack of
/// freed page numbers. Freed frames keep their stale contents until the
/// page table zero-fills them on the next mapping.
pub struct FramePool {
    /// Frame storage; the index into this vector is the frame number.
    frames: Vec<Box<[u8; PAGE_SIZE]>>,
    /// Stack of recycled (freed) frame numbers.
    recycled: Vec<usize>,
    /// Upper bound on the number of frames ever handed out.
    capacity: usize,
}

impl FramePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Vec::new(),
            recycled: Vec::new(),
            capacity,
        }
    }

    /// Number of frames currently allocated.
    pub fn in_use(&self) -> usize {
        self.frames.len() - self.recycled.len()
    }

    pub fn frame(&self, ppn: PhysPageNum) -> &[u8; PAGE_SIZE] {
        &self.frames[ppn.0]
    }

    pub fn frame_mut(&mut self, ppn: PhysPageNum) -> &mut [u8; PAGE_SIZE] {
        &mut self.frames[ppn.0]
    }
}

impl FrameAllocator for FramePool {
    fn total_frames(&self) -> usize {
        self.capacity
    }

    fn alloc(&mut self) -> Option<PhysPageNum> {
        if let Some(ppn) = self.recycled.pop() {
            Some(ppn.into())
        } else if self.frames.len() == self.capacity {
            warn!(
                "frame pool out of memory! {} frames in use",
                self.frames.len()
            );
            None
        } else {
            self.frames.push(Box::new([0u8; PAGE_SIZE]));
            Some((self.frames.len() - 1).into())
        }
    }

    fn dealloc(&mut self, ppn: PhysPageNum) {
        let ppn = ppn.0;
        if ppn >= self.frames.len() || self.recycled.contains(&ppn) {
            panic!("Frame ppn={ppn:#x} has not been allocated!");
        }
        self.recycled.push(ppn);
    }

    fn zero(&mut self, ppn: PhysPageNum) {
        self.frames[ppn.0].fill(0);
    }

    fn copy_frame(&mut self, src: PhysPageNum, dst: PhysPageNum) {
        let page = *self.frames[src.0];
        *self.frames[dst.0] = page;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_hands_out_distinct_frames() {
        let mut pool = FramePool::new(3);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.in_use(), 2);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut pool = FramePool::new(2);
        assert!(pool.alloc().is_some());
        assert!(pool.alloc().is_some());
        assert!(pool.alloc().is_none());
    }

    #[test]
    fn freed_frames_are_recycled() {
        let mut pool = FramePool::new(1);
        let a = pool.alloc().unwrap();
        pool.dealloc(a);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.alloc().unwrap(), a);
        assert!(pool.alloc().is_none());
    }

    #[test]
    #[should_panic]
    fn double_free_panics() {
        let mut pool = FramePool::new(1);
        let a = pool.alloc().unwrap();
        pool.dealloc(a);
        pool.dealloc(a);
    }

    #[test]
    fn zero_and_copy() {
        let mut pool = FramePool::new(2);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        pool.frame_mut(a)[..4].copy_from_slice(b"abcd");
        pool.copy_frame(a, b);
        assert_eq!(&pool.frame(b)[..4], b"abcd");
        pool.zero(a);
        assert!(pool.frame(a).iter().all(|&byte| byte == 0));
        // the copy is physically distinct
        assert_eq!(&pool.frame(b)[..4], b"abcd");
    }
}
