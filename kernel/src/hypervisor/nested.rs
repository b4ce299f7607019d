// SPDX-License-Identifier: MIT OR Apache-2.0

//! Nested page tables translating guest-physical to host-physical
//! addresses. Table frames come out of the frame allocator; the guest
//! RAM window is installed lazily by the page-fault path.

use crate::address::PhysAddr;
use crate::error::TurnstoneError;
use crate::mm::frame::{FrameAllocationFlags, FrameAllocator, FrameExtent, FRAME_SIZE};
use crate::mm::paging::{self, PteFlags};
use crate::platform::Platform;
use crate::types::PAGE_SIZE;

const NESTED_LEAF_FLAGS: PteFlags = PteFlags::PRESENT
    .union(PteFlags::WRITABLE)
    .union(PteFlags::USER);

#[derive(Debug)]
pub struct NestedPageTable {
    root: FrameExtent,
    /// Guest-physical base and length of the RAM window backed by
    /// `ram_host_base`.
    ram_guest_base: u64,
    ram_size: u64,
    ram_host_base: PhysAddr,
}

impl NestedPageTable {
    pub fn new(
        frames: &mut FrameAllocator,
        platform: &dyn Platform,
        ram_guest_base: u64,
        ram_host: FrameExtent,
    ) -> Result<Self, TurnstoneError> {
        let root = frames.allocate_by_count(1, FrameAllocationFlags::BLOCK)?;
        platform.zero_frame(root.start);
        Ok(Self {
            root,
            ram_guest_base,
            ram_size: ram_host.count * FRAME_SIZE,
            ram_host_base: ram_host.start,
        })
    }

    pub fn root_address(&self) -> PhysAddr {
        self.root.start
    }

    fn alloc_table(
        frames: &mut FrameAllocator,
        platform: &dyn Platform,
    ) -> Result<PhysAddr, TurnstoneError> {
        let extent = frames.allocate_by_count(1, FrameAllocationFlags::BLOCK)?;
        platform.zero_frame(extent.start);
        Ok(extent.start)
    }

    /// Installs a 4 KiB guest-physical to host-physical mapping,
    /// creating intermediate tables on demand.
    pub fn map_4k(
        &mut self,
        frames: &mut FrameAllocator,
        platform: &dyn Platform,
        gpa: u64,
        hpa: PhysAddr,
        flags: PteFlags,
    ) -> Result<(), TurnstoneError> {
        let mut table = self.root.start;

        for level in (1..paging::PT_LEVELS).rev() {
            let entry_pa = table + paging::table_index(gpa, level) * 8;
            // SAFETY: table frames are allocator-owned and direct
            // mapped.
            let entry = unsafe { platform.phys_read_u64(entry_pa) };

            table = if paging::entry_present(entry) {
                PhysAddr::new(paging::entry_address(entry))
            } else {
                let fresh = Self::alloc_table(frames, platform)?;
                let entry = paging::make_entry(fresh.bits(), NESTED_LEAF_FLAGS);
                // SAFETY: same as above.
                unsafe {
                    platform.phys_write_u64(entry_pa, entry);
                }
                fresh
            };
        }

        let leaf_pa = table + paging::table_index(gpa, 0) * 8;
        // SAFETY: same as above.
        unsafe {
            platform.phys_write_u64(leaf_pa, paging::make_entry(hpa.bits(), flags));
        }

        Ok(())
    }

    /// Walks the nested tables for `gpa`. Returns the host-physical
    /// address, honoring 2 MiB leaves.
    pub fn translate_gpa(&self, platform: &dyn Platform, gpa: u64) -> Option<PhysAddr> {
        let mut table = self.root.start;

        for level in (1..paging::PT_LEVELS).rev() {
            let entry_pa = table + paging::table_index(gpa, level) * 8;
            // SAFETY: table frames are allocator-owned and direct
            // mapped.
            let entry = unsafe { platform.phys_read_u64(entry_pa) };
            if !paging::entry_present(entry) {
                return None;
            }
            if level == 1 && entry & PteFlags::HUGE.bits() != 0 {
                let base = paging::entry_address(entry);
                return Some(PhysAddr::new(base + (gpa & 0x1F_FFFF)));
            }
            table = PhysAddr::new(paging::entry_address(entry));
        }

        let entry_pa = table + paging::table_index(gpa, 0) * 8;
        // SAFETY: same as above.
        let entry = unsafe { platform.phys_read_u64(entry_pa) };
        if !paging::entry_present(entry) {
            return None;
        }
        Some(PhysAddr::new(
            paging::entry_address(entry) + (gpa & (PAGE_SIZE as u64 - 1)),
        ))
    }

    /// Translates a guest-virtual address by walking the guest's own
    /// page tables through the nested tables, then translating the
    /// resulting guest-physical address.
    pub fn translate_gva(
        &self,
        platform: &dyn Platform,
        guest_cr3: u64,
        gva: u64,
    ) -> Option<PhysAddr> {
        let mut table_gpa = guest_cr3 & !(PAGE_SIZE as u64 - 1);

        for level in (1..paging::PT_LEVELS).rev() {
            let entry_gpa = table_gpa + paging::table_index(gva, level) * 8;
            let entry_hpa = self.translate_gpa(platform, entry_gpa)?;
            // SAFETY: translated guest table frames are backed by
            // allocator-owned memory.
            let entry = unsafe { platform.phys_read_u64(entry_hpa) };
            if !paging::entry_present(entry) {
                return None;
            }
            if level == 1 && entry & PteFlags::HUGE.bits() != 0 {
                let gpa = paging::entry_address(entry) + (gva & 0x1F_FFFF);
                return self.translate_gpa(platform, gpa);
            }
            table_gpa = paging::entry_address(entry);
        }

        let entry_gpa = table_gpa + paging::table_index(gva, 0) * 8;
        let entry_hpa = self.translate_gpa(platform, entry_gpa)?;
        // SAFETY: same as above.
        let entry = unsafe { platform.phys_read_u64(entry_hpa) };
        if !paging::entry_present(entry) {
            return None;
        }
        let gpa = paging::entry_address(entry) + (gva & (PAGE_SIZE as u64 - 1));
        self.translate_gpa(platform, gpa)
    }

    /// Nested page-fault helper: install the mapping when the faulting
    /// guest-physical address falls inside the guest RAM window,
    /// otherwise fail the guest.
    pub fn handle_page_fault(
        &mut self,
        frames: &mut FrameAllocator,
        platform: &dyn Platform,
        fault_gpa: u64,
    ) -> Result<(), TurnstoneError> {
        if fault_gpa < self.ram_guest_base || fault_gpa >= self.ram_guest_base + self.ram_size {
            log::error!("nested fault outside guest memory: {:#x}", fault_gpa);
            return Err(TurnstoneError::ProtocolViolation);
        }

        let page_gpa = fault_gpa & !(PAGE_SIZE as u64 - 1);
        let hpa = self.ram_host_base + (page_gpa - self.ram_guest_base);
        self.map_4k(frames, platform, page_gpa, hpa, NESTED_LEAF_FLAGS)
    }

    /// Writes the guest's own page tables (identity, 4 KiB pages) for
    /// `[0, size)` starting at guest-physical `tables_gpa`. Used when
    /// a fresh guest image is assembled. Returns the number of table
    /// pages consumed.
    pub fn build_identity_guest_tables(
        &mut self,
        platform: &dyn Platform,
        tables_gpa: u64,
        size: u64,
    ) -> Option<u64> {
        // Single PML4 -> PDPT -> PD -> n PTs covering `size`.
        let pt_count = size.div_ceil(1 << 21);
        let pml4_gpa = tables_gpa;
        let pdpt_gpa = tables_gpa + FRAME_SIZE;
        let pd_gpa = tables_gpa + 2 * FRAME_SIZE;
        let pt_base_gpa = tables_gpa + 3 * FRAME_SIZE;

        let flags = PteFlags::PRESENT | PteFlags::WRITABLE;

        self.write_guest_u64(platform, pml4_gpa, paging::make_entry(pdpt_gpa, flags))?;
        self.write_guest_u64(platform, pdpt_gpa, paging::make_entry(pd_gpa, flags))?;

        for pt in 0..pt_count {
            let pt_gpa = pt_base_gpa + pt * FRAME_SIZE;
            self.write_guest_u64(platform, pd_gpa + pt * 8, paging::make_entry(pt_gpa, flags))?;

            for entry in 0..512u64 {
                let page = (pt * 512 + entry) * FRAME_SIZE;
                if page >= size {
                    break;
                }
                self.write_guest_u64(
                    platform,
                    pt_gpa + entry * 8,
                    paging::make_entry(page, flags),
                )?;
            }
        }

        Some(3 + pt_count)
    }

    fn write_guest_u64(&self, platform: &dyn Platform, gpa: u64, value: u64) -> Option<()> {
        let hpa = self.translate_gpa(platform, gpa)?;
        // SAFETY: translated addresses point into allocator-owned
        // guest RAM.
        unsafe {
            platform.phys_write_u64(hpa, value);
        }
        Some(())
    }
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use super::*;
    use crate::mm::{BootMemoryType, MemoryMapEntry};
    use crate::platform::test::TestPlatform;
    use alloc::sync::Arc;

    fn setup() -> (FrameAllocator, Arc<TestPlatform>) {
        let entries = [MemoryMapEntry {
            physical_start: 0x100000,
            page_count: 0x400,
            entry_type: BootMemoryType::Conventional,
            attribute: 0,
        }];
        let platform = Arc::new(TestPlatform::new(PhysAddr::null(), 0x500000));
        let fa = FrameAllocator::new(&entries, platform.clone());
        (fa, platform)
    }

    #[test]
    fn test_map_and_translate_gpa() {
        let (mut frames, platform) = setup();
        let ram = frames
            .allocate_by_count(16, FrameAllocationFlags::BLOCK)
            .unwrap();
        let mut nested =
            NestedPageTable::new(&mut frames, platform.as_ref(), 0, ram).unwrap();

        nested
            .map_4k(
                &mut frames,
                platform.as_ref(),
                0x4000,
                PhysAddr::new(0xAB000),
                PteFlags::PRESENT | PteFlags::WRITABLE,
            )
            .unwrap();

        assert_eq!(
            nested.translate_gpa(platform.as_ref(), 0x4000),
            Some(PhysAddr::new(0xAB000))
        );
        assert_eq!(
            nested.translate_gpa(platform.as_ref(), 0x4123),
            Some(PhysAddr::new(0xAB123))
        );
        assert_eq!(nested.translate_gpa(platform.as_ref(), 0x9000), None);
    }

    #[test]
    fn test_page_fault_installs_ram_mapping() {
        let (mut frames, platform) = setup();
        let ram = frames
            .allocate_by_count(16, FrameAllocationFlags::BLOCK)
            .unwrap();
        let ram_host = ram.start;
        let mut nested =
            NestedPageTable::new(&mut frames, platform.as_ref(), 0x10000, ram).unwrap();

        assert_eq!(nested.translate_gpa(platform.as_ref(), 0x12000), None);
        nested
            .handle_page_fault(&mut frames, platform.as_ref(), 0x12345)
            .unwrap();
        assert_eq!(
            nested.translate_gpa(platform.as_ref(), 0x12000),
            Some(ram_host + 0x2000)
        );

        // Outside the RAM window the guest fails.
        assert_eq!(
            nested.handle_page_fault(&mut frames, platform.as_ref(), 0xFFFF_0000),
            Err(TurnstoneError::ProtocolViolation)
        );
    }

    #[test]
    fn test_translate_gva_through_guest_tables() {
        let (mut frames, platform) = setup();
        let ram = frames
            .allocate_by_count(64, FrameAllocationFlags::BLOCK)
            .unwrap();
        let mut nested =
            NestedPageTable::new(&mut frames, platform.as_ref(), 0, ram).unwrap();

        // Back the whole guest RAM window.
        for page in 0..64u64 {
            nested
                .handle_page_fault(&mut frames, platform.as_ref(), page * FRAME_SIZE)
                .unwrap();
        }

        // Guest identity tables at guest-physical 0x20000 covering
        // 2 MiB; guest CR3 points at them.
        let tables_gpa = 0x20000;
        nested
            .build_identity_guest_tables(platform.as_ref(), tables_gpa, 1 << 21)
            .unwrap();

        let hpa = nested
            .translate_gva(platform.as_ref(), tables_gpa, 0x4000)
            .unwrap();
        // Identity guest mapping: gva 0x4000 -> gpa 0x4000 -> host RAM
        // base + 0x4000.
        assert_eq!(hpa, nested.ram_host_base + 0x4000);
    }
}
