// SPDX-License-Identifier: MIT OR Apache-2.0

//! Physical frame allocator. Owns every frame of installed memory as a
//! set of non-overlapping extents spread over four indexes: free
//! extents by address and by size, allocated extents, and reserved
//! extents, plus the ACPI runtime-service extents kept aside for
//! mapping. Adjacent free extents with equal attributes coalesce when
//! the memory map is ingested; released frames are zeroed through the
//! platform scratch window before they become visible as free again.

extern crate alloc;

use super::{BootMemoryType, MemoryMapEntry};
use crate::address::PhysAddr;
use crate::collections::{DeleteAt, InsertAt, List};
use crate::error::TurnstoneError;
use crate::platform::Platform;
use crate::types::{LARGE_PAGE_FRAMES, PAGE_SIZE};

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::cmp::Ordering;

pub const FRAME_SIZE: u64 = PAGE_SIZE as u64;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct FrameAttributes: u64 {
        /// ACPI runtime-service frames (code or data).
        const ACPI = 1 << 60;
        /// Frame backs ACPI reclaimable memory.
        const ACPI_RECLAIM = 1 << 61;
        /// Reserved frame already entered into a page mapping; exempt
        /// from ACPI-reclaim freeing.
        const RESERVED_PAGE_MAPPED = 1 << 62;
        /// Carried over from the previous boot stage, freed by
        /// `cleanup` once handoff completes.
        const OLD_RESERVED = 1 << 63;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FrameAllocationFlags: u32 {
        /// One contiguous extent.
        const BLOCK = 1 << 0;
        /// Scattered extents are acceptable.
        const RELAX = 1 << 1;
        /// File the allocation under reserved rather than used.
        const RESERVED = 1 << 2;
        /// The extent must end below 4 GiB.
        const UNDER_4G = 1 << 3;
        /// Tag the allocation for release at boot-stage cleanup.
        const OLD_RESERVED = 1 << 4;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FrameType {
    #[default]
    Free,
    Used,
    Reserved,
    AcpiCode,
    AcpiData,
    AcpiReclaim,
}

/// Contiguous run of physical pages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameExtent {
    pub start: PhysAddr,
    pub count: u64,
    pub frame_type: FrameType,
    pub attributes: FrameAttributes,
}

impl FrameExtent {
    pub fn new(start: PhysAddr, count: u64) -> Self {
        Self {
            start,
            count,
            ..Self::default()
        }
    }

    pub fn end(&self) -> PhysAddr {
        self.start + self.count * FRAME_SIZE
    }

    pub fn contains(&self, addr: PhysAddr) -> bool {
        addr >= self.start && addr < self.end()
    }

    fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

fn cmp_by_count(a: &FrameExtent, b: &FrameExtent) -> Ordering {
    a.count.cmp(&b.count)
}

fn cmp_by_overlap(a: &FrameExtent, b: &FrameExtent) -> Ordering {
    if a.overlaps(b) {
        Ordering::Equal
    } else {
        a.start.cmp(&b.start)
    }
}

fn boot_type_to_frame_type(entry_type: BootMemoryType) -> FrameType {
    match entry_type {
        BootMemoryType::LoaderCode | BootMemoryType::LoaderData | BootMemoryType::Conventional => {
            FrameType::Free
        }
        BootMemoryType::BootServicesCode
        | BootMemoryType::RuntimeServicesCode
        | BootMemoryType::PalCode => FrameType::AcpiCode,
        BootMemoryType::BootServicesData | BootMemoryType::RuntimeServicesData => {
            FrameType::AcpiData
        }
        BootMemoryType::AcpiReclaim => FrameType::AcpiReclaim,
        _ => FrameType::Reserved,
    }
}

pub struct FrameAllocator {
    free_by_address: BTreeMap<u64, FrameExtent>,
    free_by_size: List<FrameExtent>,
    allocated_by_address: BTreeMap<u64, FrameExtent>,
    reserved_by_address: BTreeMap<u64, FrameExtent>,
    acpi_frames: List<FrameExtent>,
    total_frame_count: u64,
    free_frame_count: u64,
    allocated_frame_count: u64,
    platform: Arc<dyn Platform>,
}

impl core::fmt::Debug for FrameAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FrameAllocator")
            .field("total", &self.total_frame_count)
            .field("free", &self.free_frame_count)
            .field("allocated", &self.allocated_frame_count)
            .finish()
    }
}

impl FrameAllocator {
    pub fn new(memory_map: &[MemoryMapEntry], platform: Arc<dyn Platform>) -> Self {
        let mut size_list = List::sorted_by(cmp_by_count);
        size_list.set_equality_comparator(cmp_by_overlap);

        let mut fa = Self {
            free_by_address: BTreeMap::new(),
            free_by_size: size_list,
            allocated_by_address: BTreeMap::new(),
            reserved_by_address: BTreeMap::new(),
            acpi_frames: List::sorted_by(cmp_by_overlap),
            total_frame_count: 0,
            free_frame_count: 0,
            allocated_frame_count: 0,
            platform,
        };

        // Coalesce adjacent descriptors of the same kind before
        // inserting; firmware maps tend to be fragmented.
        let mut run: Option<FrameExtent> = None;
        for desc in memory_map {
            let frame_type = boot_type_to_frame_type(desc.entry_type);
            let attributes = FrameAttributes::from_bits_truncate(desc.attribute);

            if let Some(current) = run.as_mut() {
                if current.frame_type == frame_type
                    && current.attributes == attributes
                    && current.end() == PhysAddr::new(desc.physical_start)
                {
                    current.count += desc.page_count;
                    continue;
                }
                let finished = *current;
                fa.install_boot_extent(finished);
            }

            run = Some(FrameExtent {
                start: PhysAddr::new(desc.physical_start),
                count: desc.page_count,
                frame_type,
                attributes,
            });
        }
        if let Some(current) = run {
            fa.install_boot_extent(current);
        }

        fa
    }

    fn install_boot_extent(&mut self, mut extent: FrameExtent) {
        // Everything under 1 MiB stays out of the free pool.
        if extent.end() <= PhysAddr::new(1 << 20) && extent.frame_type == FrameType::Free {
            extent.frame_type = FrameType::Reserved;
        }

        self.total_frame_count += extent.count;

        match extent.frame_type {
            FrameType::Free => {
                self.free_frame_count += extent.count;
                self.insert_free(extent);
            }
            FrameType::Used => {
                self.allocated_frame_count += extent.count;
                self.allocated_by_address.insert(extent.start.bits(), extent);
            }
            FrameType::Reserved => {
                self.allocated_frame_count += extent.count;
                self.reserved_by_address.insert(extent.start.bits(), extent);
            }
            FrameType::AcpiReclaim => {
                extent.attributes |= FrameAttributes::ACPI_RECLAIM;
                self.allocated_frame_count += extent.count;
                self.reserved_by_address.insert(extent.start.bits(), extent);
            }
            FrameType::AcpiCode | FrameType::AcpiData => {
                extent.attributes |= FrameAttributes::ACPI;
                self.allocated_frame_count += extent.count;
                self.acpi_frames.insert_at(InsertAt::Sorted, extent);
            }
        }
    }

    pub fn total_frame_count(&self) -> u64 {
        self.total_frame_count
    }

    pub fn free_frame_count(&self) -> u64 {
        self.free_frame_count
    }

    pub fn allocated_frame_count(&self) -> u64 {
        self.allocated_frame_count
    }

    fn insert_free(&mut self, extent: FrameExtent) {
        self.free_by_address.insert(extent.start.bits(), extent);
        self.free_by_size.insert_at(InsertAt::Sorted, extent);
    }

    fn remove_free(&mut self, extent: &FrameExtent) {
        self.free_by_address.remove(&extent.start.bits());
        self.free_by_size.delete_at(DeleteAt::FindBy(extent));
    }

    fn find_containing(
        map: &BTreeMap<u64, FrameExtent>,
        addr: PhysAddr,
    ) -> Option<FrameExtent> {
        map.range(..=addr.bits())
            .next_back()
            .map(|(_, e)| *e)
            .filter(|e| e.contains(addr))
    }

    /// Allocates `count` contiguous frames. `Block` requests walk the
    /// size-ordered free list smallest-fit first; requests sized in
    /// whole 2 MiB units prefer extents already 2 MiB aligned and
    /// otherwise carve off the unaligned head as a fresh free extent.
    pub fn allocate_by_count(
        &mut self,
        count: u64,
        flags: FrameAllocationFlags,
    ) -> Result<FrameExtent, TurnstoneError> {
        if count == 0 {
            return Err(TurnstoneError::InvalidArgument);
        }

        if flags.contains(FrameAllocationFlags::RELAX) {
            // Scattered allocation is only reachable from DMA paths
            // that tolerate it; nothing in the kernel core needs it.
            log::error!("relaxed frame allocation is not supported");
            return Err(TurnstoneError::Unsupported);
        }

        if !flags.contains(FrameAllocationFlags::BLOCK) {
            log::error!("unknown allocation type for frames {:#x?}", flags);
            return Err(TurnstoneError::InvalidArgument);
        }

        let needs_alignment = count % LARGE_PAGE_FRAMES == 0;
        let mut chosen: Option<(FrameExtent, u64)> = None;

        for item in self.free_by_size.iter() {
            if item.count < count {
                continue;
            }

            if flags.contains(FrameAllocationFlags::UNDER_4G)
                && item.start.bits() + count * FRAME_SIZE >= 0x1_0000_0000
            {
                continue;
            }

            if needs_alignment {
                let begin_rem = item.start.bits() % (LARGE_PAGE_FRAMES * FRAME_SIZE);
                if begin_rem == 0 {
                    // fast hit
                    chosen = Some((*item, 0));
                    break;
                }
                let begin_rem_frames = (LARGE_PAGE_FRAMES * FRAME_SIZE - begin_rem) / FRAME_SIZE;
                if item.count >= count + begin_rem_frames {
                    chosen = Some((*item, begin_rem_frames));
                    break;
                }
            } else {
                chosen = Some((*item, 0));
                break;
            }
        }

        let (mut found, head_frames) = chosen.ok_or_else(|| {
            log::error!("cannot find free frames with count {:#x}", count);
            TurnstoneError::OutOfMemory
        })?;

        self.remove_free(&found);

        if head_frames != 0 {
            // Re-file the unaligned head so the allocation starts on a
            // 2 MiB boundary.
            let head = FrameExtent {
                start: found.start,
                count: head_frames,
                frame_type: FrameType::Free,
                attributes: found.attributes,
            };
            self.insert_free(head);

            found.start = found.start + head_frames * FRAME_SIZE;
            found.count -= head_frames;
        }

        let remainder = found.count - count;

        let mut allocated = FrameExtent {
            start: found.start,
            count,
            frame_type: FrameType::Used,
            attributes: found.attributes,
        };

        if flags.contains(FrameAllocationFlags::OLD_RESERVED) {
            allocated.attributes |= FrameAttributes::OLD_RESERVED;
        }

        self.allocated_frame_count += count;
        self.free_frame_count -= count;

        if flags.contains(FrameAllocationFlags::RESERVED) {
            allocated.frame_type = FrameType::Reserved;
            self.reserved_by_address
                .insert(allocated.start.bits(), allocated);
        } else {
            self.allocated_by_address
                .insert(allocated.start.bits(), allocated);
        }

        if remainder != 0 {
            let free_rem = FrameExtent {
                start: found.start + count * FRAME_SIZE,
                count: remainder,
                frame_type: FrameType::Free,
                attributes: found.attributes,
            };
            self.insert_free(free_rem);
        }

        Ok(allocated)
    }

    /// Reserves the specific extent `wanted`, carving it out of the
    /// free extent that contains it.
    pub fn allocate(&mut self, wanted: FrameExtent) -> Result<FrameExtent, TurnstoneError> {
        let containing = Self::find_containing(&self.free_by_address, wanted.start)
            .filter(|e| wanted.end() <= e.end())
            .ok_or_else(|| {
                log::error!(
                    "frame not found {:#x} {:#x}",
                    wanted.start.bits(),
                    wanted.count
                );
                TurnstoneError::NotFound
            })?;

        self.remove_free(&containing);

        let mut remaining = containing.count;

        if containing.start < wanted.start {
            let head = FrameExtent {
                start: containing.start,
                count: (wanted.start - containing.start) / FRAME_SIZE,
                frame_type: FrameType::Free,
                attributes: containing.attributes,
            };
            remaining -= head.count;
            self.insert_free(head);
        }

        remaining -= wanted.count;

        if remaining != 0 {
            let tail = FrameExtent {
                start: wanted.end(),
                count: remaining,
                frame_type: FrameType::Free,
                attributes: containing.attributes,
            };
            self.insert_free(tail);
        }

        let allocated = FrameExtent {
            start: wanted.start,
            count: wanted.count,
            frame_type: if wanted.frame_type != FrameType::Free {
                wanted.frame_type
            } else {
                FrameType::Used
            },
            attributes: if wanted.attributes.is_empty() {
                containing.attributes
            } else {
                wanted.attributes
            },
        };

        self.allocated_frame_count += allocated.count;
        self.free_frame_count -= allocated.count;

        if allocated.frame_type == FrameType::Used {
            self.allocated_by_address
                .insert(allocated.start.bits(), allocated);
        } else {
            self.reserved_by_address
                .insert(allocated.start.bits(), allocated);
        }

        Ok(allocated)
    }

    /// Returns `extent` to the free pool, zeroing every page through
    /// the platform scratch window so a later owner cannot observe old
    /// contents.
    pub fn release(&mut self, extent: FrameExtent) -> Result<(), TurnstoneError> {
        if let Some(owner) = Self::find_containing(&self.allocated_by_address, extent.start)
            .filter(|e| extent.end() <= e.end())
        {
            self.allocated_by_address.remove(&owner.start.bits());
            self.release_from(owner, extent, false);
            return Ok(());
        }

        if let Some(owner) = Self::find_containing(&self.reserved_by_address, extent.start)
            .filter(|e| extent.end() <= e.end())
        {
            self.reserved_by_address.remove(&owner.start.bits());
            self.release_from(owner, extent, true);
            return Ok(());
        }

        log::error!(
            "release of unowned extent {:#x} {:#x}",
            extent.start.bits(),
            extent.count
        );
        Err(TurnstoneError::NotFound)
    }

    fn release_from(&mut self, owner: FrameExtent, extent: FrameExtent, reserved: bool) {
        let mut remaining = owner.count - extent.count;

        if owner.start < extent.start {
            let head_count = (extent.start - owner.start) / FRAME_SIZE;
            let head = FrameExtent {
                start: owner.start,
                count: head_count,
                frame_type: owner.frame_type,
                attributes: owner.attributes,
            };
            if reserved {
                self.reserved_by_address.insert(head.start.bits(), head);
            } else {
                self.allocated_by_address.insert(head.start.bits(), head);
            }
            remaining -= head_count;
        }

        if remaining != 0 {
            let tail = FrameExtent {
                start: extent.end(),
                count: remaining,
                frame_type: owner.frame_type,
                attributes: owner.attributes,
            };
            if reserved {
                self.reserved_by_address.insert(tail.start.bits(), tail);
            } else {
                self.allocated_by_address.insert(tail.start.bits(), tail);
            }
        }

        self.zero_extent(&extent);

        let freed = FrameExtent {
            start: extent.start,
            count: extent.count,
            frame_type: FrameType::Free,
            attributes: owner.attributes,
        };

        self.allocated_frame_count -= freed.count;
        self.free_frame_count += freed.count;
        self.insert_free(freed);
    }

    fn zero_extent(&self, extent: &FrameExtent) {
        for i in 0..extent.count {
            self.platform.zero_frame(extent.start + i * FRAME_SIZE);
        }
    }

    /// Marks an extent as reserved. Overlap with already-reserved
    /// regions is tolerated; only the parts still free or unknown are
    /// carved out.
    pub fn reserve_system_frames(&mut self, extent: FrameExtent) -> Result<(), TurnstoneError> {
        let mut rem_start = extent.start;
        let mut rem_count = extent.count;

        while rem_count > 0 {
            let Some(found) = Self::find_containing(&self.reserved_by_address, rem_start) else {
                break;
            };

            if found.start <= rem_start && rem_count <= found.count {
                log::trace!("frame inside reserved area");
                return Ok(());
            }

            let covered = found.count - (rem_start - found.start) / FRAME_SIZE;
            rem_start = rem_start + covered * FRAME_SIZE;
            rem_count -= covered.min(rem_count);
        }

        while rem_count > 0 {
            log::trace!(
                "remaining frame start {:#x} count {:#x}",
                rem_start.bits(),
                rem_count
            );

            let Some(found) = Self::find_containing(&self.free_by_address, rem_start) else {
                // Not backed by RAM the allocator knows; file the rest
                // directly under reserved so later queries find it.
                let reserved = FrameExtent {
                    start: rem_start,
                    count: rem_count,
                    frame_type: FrameType::Reserved,
                    attributes: FrameAttributes::empty(),
                };
                self.reserved_by_address
                    .insert(reserved.start.bits(), reserved);
                break;
            };

            let available = found.count - (rem_start - found.start) / FRAME_SIZE;

            let mut piece = FrameExtent {
                start: rem_start,
                count: rem_count,
                frame_type: FrameType::Reserved,
                attributes: FrameAttributes::empty(),
            };

            if available < rem_count {
                piece.count = available;
                rem_count -= available;
                rem_start = rem_start + available * FRAME_SIZE;
            } else {
                rem_count = 0;
            }

            self.allocate(piece)?;
        }

        Ok(())
    }

    /// Point query over the reserved index.
    pub fn get_reserved_frames_of_address(&self, addr: PhysAddr) -> Option<FrameExtent> {
        Self::find_containing(&self.reserved_by_address, addr.page_align_down())
    }

    /// Frees every reserved extent tagged ACPI-reclaimable, unless it
    /// was entered into a page mapping.
    pub fn release_acpi_reclaim_memory(&mut self) {
        let targets: Vec<FrameExtent> = self
            .reserved_by_address
            .values()
            .filter(|e| {
                e.attributes.contains(FrameAttributes::ACPI_RECLAIM)
                    && !e.attributes.contains(FrameAttributes::RESERVED_PAGE_MAPPED)
            })
            .copied()
            .collect();

        for mut extent in targets {
            self.reserved_by_address.remove(&extent.start.bits());
            self.zero_extent(&extent);

            extent.attributes -= FrameAttributes::ACPI_RECLAIM;
            extent.frame_type = FrameType::Free;

            self.allocated_frame_count -= extent.count;
            self.free_frame_count += extent.count;
            self.insert_free(extent);
        }
    }

    /// Frees every extent still carrying the old-reserved tag once the
    /// previous boot stage is fully handed off.
    pub fn cleanup(&mut self) {
        for map in [true, false] {
            let source = if map {
                &self.reserved_by_address
            } else {
                &self.allocated_by_address
            };
            let targets: Vec<FrameExtent> = source
                .values()
                .filter(|e| e.attributes.contains(FrameAttributes::OLD_RESERVED))
                .copied()
                .collect();

            for mut extent in targets {
                if map {
                    self.reserved_by_address.remove(&extent.start.bits());
                } else {
                    self.allocated_by_address.remove(&extent.start.bits());
                }
                self.zero_extent(&extent);

                extent.attributes -= FrameAttributes::OLD_RESERVED;
                extent.frame_type = FrameType::Free;

                self.allocated_frame_count -= extent.count;
                self.free_frame_count += extent.count;
                self.insert_free(extent);
            }
        }
    }

    /// ACPI runtime-service extents collected from the memory map.
    pub fn acpi_runtime_extents(&self) -> impl Iterator<Item = &FrameExtent> {
        self.acpi_frames.iter()
    }

    #[cfg(test)]
    fn check_free_index_invariant(&self) {
        assert_eq!(self.free_by_address.len(), self.free_by_size.len());
        let mut by_addr: Vec<(u64, u64)> = self
            .free_by_address
            .values()
            .map(|e| (e.start.bits(), e.count))
            .collect();
        let mut by_size: Vec<(u64, u64)> = self
            .free_by_size
            .iter()
            .map(|e| (e.start.bits(), e.count))
            .collect();
        by_addr.sort_unstable();
        by_size.sort_unstable();
        assert_eq!(by_addr, by_size);
    }
}
