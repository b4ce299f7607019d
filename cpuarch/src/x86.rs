// SPDX-License-Identifier: MIT OR Apache-2.0

use bitflags::bitflags;

pub const MSR_EFER: u32 = 0xC000_0080;

// x2APIC register MSRs. Only the registers the virtual LAPIC intercepts
// are named here; everything else goes through the per-VM MSR map.
pub const MSR_X2APIC_EOI: u32 = 0x80B;
pub const MSR_X2APIC_LVT_TIMER: u32 = 0x832;
pub const MSR_X2APIC_TIMER_INITIAL: u32 = 0x838;
pub const MSR_X2APIC_TIMER_CURRENT: u32 = 0x839;
pub const MSR_X2APIC_TIMER_DIVIDER: u32 = 0x83E;

pub const RFLAGS_IF: u64 = 1 << 9;
pub const RFLAGS_DF: u64 = 1 << 10;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EFERFlags: u64 {
        const SCE   = 1 << 0;  // System Call Extensions
        const LME   = 1 << 8;  // Long Mode Enable
        const LMA   = 1 << 10; // Long Mode Active
        const NXE   = 1 << 11; // No-Execute Enable
        const SVME  = 1 << 12; // Secure Virtual Machine Enable
        const FFXSR = 1 << 14; // Fast FXSAVE/FXRSTOR
        const TCE   = 1 << 15; // Translation Cache Extension
    }
}

impl From<u64> for EFERFlags {
    fn from(bits: u64) -> Self {
        EFERFlags::from_bits_truncate(bits)
    }
}

/// General purpose registers as saved around a guest entry/exit. RAX
/// lives in the VMCB save area on SVM and is mirrored here by the
/// backend after each exit.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct GuestRegisters {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// Full register snapshot of an arriving host interrupt, in the layout
/// the interrupt dispatcher consumes and the hypervisor copies into the
/// guest's interrupt frame extension page.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct InterruptFrame {
    pub registers: GuestRegisters,
    pub interrupt_number: u64,
    pub error_code: u64,
    pub return_rip: u64,
    pub return_cs: u64,
    pub return_rflags: u64,
    pub return_rsp: u64,
    pub return_ss: u64,
}
