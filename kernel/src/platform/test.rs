// SPDX-License-Identifier: MIT OR Apache-2.0

//! Arena-backed platform for unit tests. "Physical" memory is a boxed
//! buffer, so frame zeroing, GOT cloning, and nested-table walks run
//! for real.

extern crate alloc;

use super::Platform;
use crate::address::{PhysAddr, VirtAddr};
use crate::io::IOPort;
use crate::locking::SpinLock;
use crate::types::PAGE_SIZE;

use alloc::vec;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, Ordering};

use cpuarch::x86::CpuidResult;

pub struct TestPlatform {
    memory: Vec<UnsafeCell<u8>>,
    base: PhysAddr,
    serial: SpinLock<Vec<u8>>,
    eoi_count: AtomicU64,
    io: NullIOPort,
}

// SAFETY: single-threaded test use; interior mutability is routed
// through raw pointers the same way the direct map would be.
unsafe impl Sync for TestPlatform {}
// SAFETY: same as above.
unsafe impl Send for TestPlatform {}

#[derive(Debug, Default)]
pub struct NullIOPort {
    last_out: SpinLock<Option<(u16, u32)>>,
}

impl IOPort for NullIOPort {
    fn outb(&self, port: u16, value: u8) {
        *self.last_out.lock() = Some((port, value as u32));
    }
    fn inb(&self, _port: u16) -> u8 {
        0x5A
    }
    fn outw(&self, port: u16, value: u16) {
        *self.last_out.lock() = Some((port, value as u32));
    }
    fn inw(&self, _port: u16) -> u16 {
        0x5A5A
    }
    fn outl(&self, port: u16, value: u32) {
        *self.last_out.lock() = Some((port, value));
    }
    fn inl(&self, _port: u16) -> u32 {
        0x5A5A_5A5A
    }
}

impl TestPlatform {
    /// Creates a platform whose physical memory spans `[base, base +
    /// size)`.
    pub fn new(base: PhysAddr, size: usize) -> Self {
        assert_eq!(size % PAGE_SIZE, 0);
        let mut memory = Vec::with_capacity(size);
        memory.resize_with(size, || UnsafeCell::new(0));
        Self {
            memory,
            base,
            serial: SpinLock::new(Vec::new()),
            eoi_count: AtomicU64::new(0),
            io: NullIOPort::default(),
        }
    }

    fn offset_of(&self, paddr: PhysAddr) -> usize {
        let offset = (paddr - self.base) as usize;
        assert!(offset < self.memory.len(), "address outside test memory");
        offset
    }

    pub fn read_mem(&self, paddr: PhysAddr, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        // SAFETY: test memory stays alive for the platform lifetime.
        unsafe {
            self.phys_read(paddr, &mut buf);
        }
        buf
    }

    pub fn write_mem(&self, paddr: PhysAddr, bytes: &[u8]) {
        // SAFETY: test memory stays alive for the platform lifetime.
        unsafe {
            self.phys_write(paddr, bytes);
        }
    }

    pub fn serial_captured(&self) -> Vec<u8> {
        self.serial.lock().clone()
    }

    pub fn eoi_count(&self) -> u64 {
        self.eoi_count.load(Ordering::Relaxed)
    }

    pub fn last_port_write(&self) -> Option<(u16, u32)> {
        *self.io.last_out.lock()
    }
}

impl Platform for TestPlatform {
    fn phys_to_virt(&self, paddr: PhysAddr) -> VirtAddr {
        let offset = self.offset_of(paddr);
        VirtAddr::new(self.memory[offset].get() as u64)
    }

    fn zero_frame(&self, paddr: PhysAddr) {
        self.write_mem(paddr, &[0u8; PAGE_SIZE]);
    }

    fn io_port(&self) -> &dyn IOPort {
        &self.io
    }

    fn serial_out(&self, bytes: &[u8]) {
        self.serial.lock().extend_from_slice(bytes);
    }

    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        CpuidResult {
            eax: leaf.wrapping_add(1),
            ebx: leaf.wrapping_mul(3),
            ecx: subleaf,
            edx: 0xC0DE,
        }
    }

    fn eoi(&self) {
        self.eoi_count.fetch_add(1, Ordering::Relaxed);
    }
}
