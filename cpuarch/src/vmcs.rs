// SPDX-License-Identifier: MIT OR Apache-2.0

use bitfield_struct::bitfield;

/// Basic exit reasons, Appendix C of the Intel SDM Vol. 3. Only the
/// reasons the exit engine dispatches on are named.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmxExitReason {
    ExceptionOrNmi = 0,
    ExternalInterrupt = 1,
    TripleFault = 2,
    InterruptWindow = 7,
    Cpuid = 10,
    Hlt = 12,
    Vmcall = 18,
    CrAccess = 28,
    IoInstruction = 30,
    Rdmsr = 31,
    Wrmsr = 32,
    Pause = 40,
    EptViolation = 48,
    EptMisconfig = 49,
}

pub const VMX_EXIT_REASON_COUNT: usize = 70;

impl VmxExitReason {
    pub fn from_raw(reason: u64) -> Option<Self> {
        let basic = (reason & 0xFFFF) as u32;
        Some(match basic {
            0 => Self::ExceptionOrNmi,
            1 => Self::ExternalInterrupt,
            2 => Self::TripleFault,
            7 => Self::InterruptWindow,
            10 => Self::Cpuid,
            12 => Self::Hlt,
            18 => Self::Vmcall,
            28 => Self::CrAccess,
            30 => Self::IoInstruction,
            31 => Self::Rdmsr,
            32 => Self::Wrmsr,
            40 => Self::Pause,
            48 => Self::EptViolation,
            49 => Self::EptMisconfig,
            _ => return None,
        })
    }
}

// VMCS field encodings, Appendix B of the Intel SDM Vol. 3.
pub const VMX_GUEST_CR0: u32 = 0x6800;
pub const VMX_GUEST_CR3: u32 = 0x6802;
pub const VMX_GUEST_CR4: u32 = 0x6804;
pub const VMX_GUEST_RSP: u32 = 0x681C;
pub const VMX_GUEST_RIP: u32 = 0x681E;
pub const VMX_GUEST_RFLAGS: u32 = 0x6820;
pub const VMX_GUEST_IA32_EFER: u32 = 0x2806;
pub const VMX_GUEST_INTERRUPTIBILITY_STATE: u32 = 0x4824;
pub const VMX_GUEST_PHYSICAL_ADDR: u32 = 0x2400;
pub const VMX_GUEST_LINEAR_ADDR: u32 = 0x640A;

pub const VMX_VMEXIT_REASON: u32 = 0x4402;
pub const VMX_VM_INSTRUCTION_ERROR: u32 = 0x4400;
pub const VMX_EXIT_QUALIFICATION: u32 = 0x6400;
pub const VMX_VMEXIT_INSTRUCTION_LENGTH: u32 = 0x440C;
pub const VMX_VMEXIT_INSTRUCTION_INFO: u32 = 0x440E;
pub const VMX_VMEXIT_INTERRUPT_INFO: u32 = 0x4404;
pub const VMX_VMEXIT_INTERRUPT_ERROR_CODE: u32 = 0x4406;

pub const VMX_CTLS_PIN_BASED_VM_EXECUTION: u32 = 0x4000;
pub const VMX_CTLS_PRI_PROC_BASED_VM_EXECUTION: u32 = 0x4002;
pub const VMX_CTLS_VM_ENTRY_INTERRUPT_INFORMATION_FIELD: u32 = 0x4016;
pub const VMX_CTLS_VM_ENTRY_EXCEPTION_ERROR_CODE: u32 = 0x4018;
pub const VMX_CTLS_VM_ENTRY_INSTRUCTION_LENGTH: u32 = 0x401A;
pub const VMX_CTLS_EPTP: u32 = 0x201A;

pub const VMX_HOST_CS_SELECTOR: u32 = 0xC02;
pub const VMX_HOST_SS_SELECTOR: u32 = 0xC04;
pub const VMX_HOST_RSP: u32 = 0x6C14;
pub const VMX_HOST_RIP: u32 = 0x6C16;

// Bit 2 of the primary processor-based controls arms the
// interrupt-window exit.
pub const VMX_PRI_PROC_CTL_INTERRUPT_WINDOW: u64 = 1 << 2;

/// Exit qualification of an I/O instruction exit.
/// Table 27-5, Intel SDM Vol. 3.
#[bitfield(u64)]
pub struct IoExitQualification {
    #[bits(3)]
    pub size_code: u8,
    pub direction_in: bool,
    pub string: bool,
    pub rep: bool,
    pub operand_imm: bool,
    _rsvd_15_7: bool,
    #[bits(8)]
    _rsvd2: u8,
    pub port: u16,
    _rsvd_63_32: u32,
}

/// Exit qualification of a control-register access exit.
/// Table 27-3, Intel SDM Vol. 3.
#[bitfield(u64)]
pub struct CrAccessQualification {
    #[bits(4)]
    pub cr: u8,
    #[bits(2)]
    pub access_type: u8,
    pub lmsw_memory: bool,
    _rsvd_7: bool,
    #[bits(4)]
    pub register: u8,
    #[bits(4)]
    _rsvd_15_12: u8,
    pub lmsw_source: u16,
    _rsvd_63_32: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_exit_qualification_decode() {
        // outsb to port 0x3F8 with rep prefix
        let qual = IoExitQualification::from(0x03F8_0030u64);
        assert_eq!(qual.size_code(), 0);
        assert!(!qual.direction_in());
        assert!(qual.string());
        assert!(qual.rep());
        assert_eq!(qual.port(), 0x3F8);
    }

    #[test]
    fn test_cr_access_qualification_decode() {
        // mov to cr3 from r15
        let qual = CrAccessQualification::from(0x0F03u64);
        assert_eq!(qual.cr(), 3);
        assert_eq!(qual.access_type(), 0);
        assert_eq!(qual.register(), 15);
    }

    #[test]
    fn test_exit_reason_from_raw() {
        assert_eq!(VmxExitReason::from_raw(12), Some(VmxExitReason::Hlt));
        assert_eq!(VmxExitReason::from_raw(48), Some(VmxExitReason::EptViolation));
        assert_eq!(VmxExitReason::from_raw(63), None);
    }
}
