// SPDX-License-Identifier: MIT OR Apache-2.0

use super::Platform;
use crate::address::{PhysAddr, VirtAddr};
use crate::io::{DefaultIOPort, IOPort};
use crate::mm::paging::{self, PteFlags};
use crate::types::PAGE_SIZE;

use cpuarch::x86::CpuidResult;

/// Virtual address reserved for the map-zero-unmap scratch mapping
/// used when frames are released. No other code may hold this page.
pub const SCRATCH_WINDOW: VirtAddr = VirtAddr::new(0x1000);

/// Platform running directly on x86-64 hardware. Kernel-owned frames
/// are reached through a direct map placed at a fixed offset by early
/// boot.
#[derive(Debug)]
pub struct NativePlatform {
    direct_map_offset: u64,
    /// Root of the active host page tables, used for the scratch
    /// window mapping.
    pml4: PhysAddr,
    serial_port: u16,
    io: DefaultIOPort,
}

impl NativePlatform {
    pub fn new(direct_map_offset: u64, pml4: PhysAddr, serial_port: u16) -> Self {
        Self {
            direct_map_offset,
            pml4,
            serial_port,
            io: DefaultIOPort::default(),
        }
    }

    /// Walks the host tables down to the PTE covering the scratch
    /// window and returns its direct-mapped location. The covering
    /// table hierarchy is created by early boot and identity-covers
    /// low memory, so every level is present.
    fn scratch_pte(&self) -> *mut u64 {
        let mut table = self.pml4;
        for level in (1..paging::PT_LEVELS).rev() {
            let index = paging::table_index(SCRATCH_WINDOW.bits(), level);
            let entry_va = self.phys_to_virt(table + index * 8);
            // SAFETY: page table frames are kernel-owned and direct
            // mapped.
            let entry = unsafe { core::ptr::read_volatile(entry_va.as_ptr::<u64>()) };
            table = PhysAddr::new(paging::entry_address(entry));
        }
        let index = paging::table_index(SCRATCH_WINDOW.bits(), 0);
        self.phys_to_virt(table + index * 8).as_mut_ptr::<u64>()
    }

    fn invalidate_scratch(&self) {
        #[cfg(target_arch = "x86_64")]
        // SAFETY: invlpg on a kernel-reserved address has no memory
        // safety impact.
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) SCRATCH_WINDOW.bits(), options(nostack));
        }
    }
}

impl Platform for NativePlatform {
    fn phys_to_virt(&self, paddr: PhysAddr) -> VirtAddr {
        VirtAddr::new(self.direct_map_offset + paddr.bits())
    }

    fn zero_frame(&self, paddr: PhysAddr) {
        let pte = self.scratch_pte();
        // SAFETY: the scratch PTE is exclusively ours while the frame
        // allocator lock is held; the window address maps the frame
        // only between the two writes below.
        unsafe {
            core::ptr::write_volatile(
                pte,
                paging::make_entry(paddr.bits(), PteFlags::PRESENT | PteFlags::WRITABLE),
            );
            self.invalidate_scratch();
            core::ptr::write_bytes(SCRATCH_WINDOW.as_mut_ptr::<u8>(), 0, PAGE_SIZE);
            core::ptr::write_volatile(pte, 0);
            self.invalidate_scratch();
        }
    }

    fn io_port(&self) -> &dyn IOPort {
        &self.io
    }

    fn serial_out(&self, bytes: &[u8]) {
        for byte in bytes {
            self.io.outb(self.serial_port, *byte);
        }
    }

    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        #[cfg(target_arch = "x86_64")]
        {
            // SAFETY: cpuid is available on every supported processor.
            let res = unsafe { core::arch::x86_64::__cpuid_count(leaf, subleaf) };
            CpuidResult {
                eax: res.eax,
                ebx: res.ebx,
                ecx: res.ecx,
                edx: res.edx,
            }
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = (leaf, subleaf);
            CpuidResult::default()
        }
    }

    fn eoi(&self) {
        // x2APIC EOI write; a zero value acknowledges the in-service
        // interrupt.
        #[cfg(target_arch = "x86_64")]
        // SAFETY: MSR_X2APIC_EOI accepts any write in x2APIC mode.
        unsafe {
            core::arch::asm!(
                "wrmsr",
                in("ecx") cpuarch::x86::MSR_X2APIC_EOI,
                in("eax") 0u32,
                in("edx") 0u32,
                options(nomem, nostack),
            );
        }
    }
}
