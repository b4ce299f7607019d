// SPDX-License-Identifier: MIT OR Apache-2.0

//! The owned top-level kernel object. Every subsystem hangs off this
//! struct and is threaded through explicitly; there are no ambient
//! mutable statics.

extern crate alloc;

use crate::error::TurnstoneError;
use crate::locking::SpinLock;
use crate::mm::frame::{FrameAllocationFlags, FrameAllocator, FRAME_SIZE};
use crate::mm::heap::SimpleHeap;
use crate::mm::MemoryMapEntry;
use crate::platform::Platform;
use crate::task::TaskSystem;

use alloc::sync::Arc;

pub struct Kernel {
    platform: Arc<dyn Platform>,
    frames: SpinLock<FrameAllocator>,
    heap: SpinLock<SimpleHeap>,
    tasks: SpinLock<TaskSystem>,
}

impl core::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Kernel").finish()
    }
}

impl Kernel {
    /// Brings the runtime substrate up: the frame allocator is filled
    /// from the firmware memory map, then the heap takes its backing
    /// pages from the allocator exactly once.
    pub fn new(
        memory_map: &[MemoryMapEntry],
        platform: Arc<dyn Platform>,
        heap_frame_count: u64,
    ) -> Result<Self, TurnstoneError> {
        let mut frames = FrameAllocator::new(memory_map, platform.clone());

        let heap_extent = frames.allocate_by_count(heap_frame_count, FrameAllocationFlags::BLOCK)?;
        let heap_start = platform.phys_to_virt(heap_extent.start);
        let heap_end = heap_start + heap_extent.count * FRAME_SIZE;

        // SAFETY: the extent was just allocated exclusively for the
        // heap and stays reserved for the kernel lifetime.
        let heap = unsafe { SimpleHeap::create(heap_start, heap_end) };

        log::info!(
            "kernel substrate up: {:#x} frames total, heap {:#x} frames",
            frames.total_frame_count(),
            heap_frame_count
        );

        Ok(Self {
            platform,
            frames: SpinLock::new(frames),
            heap: SpinLock::new(heap),
            tasks: SpinLock::new(TaskSystem::new()),
        })
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    pub fn frames(&self) -> &SpinLock<FrameAllocator> {
        &self.frames
    }

    pub fn heap(&self) -> &SpinLock<SimpleHeap> {
        &self.heap
    }

    pub fn tasks(&self) -> &SpinLock<TaskSystem> {
        &self.tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::PhysAddr;
    use crate::mm::BootMemoryType;
    use crate::platform::test::TestPlatform;

    #[test]
    fn test_kernel_bringup_and_heap_use() {
        let entries = [MemoryMapEntry {
            physical_start: 0x100000,
            page_count: 0x100,
            entry_type: BootMemoryType::Conventional,
            attribute: 0,
        }];
        let platform = Arc::new(TestPlatform::new(PhysAddr::null(), 0x200000));
        let kernel = Kernel::new(&entries, platform, 16).unwrap();

        let ptr = kernel.heap().lock().malloc(256, 0).unwrap();
        kernel.heap().lock().free(ptr).unwrap();

        let extent = kernel
            .frames()
            .lock()
            .allocate_by_count(4, FrameAllocationFlags::BLOCK)
            .unwrap();
        kernel.frames().lock().release(extent).unwrap();

        assert_eq!(kernel.tasks().lock().current_task(), 1);
    }
}
