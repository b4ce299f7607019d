// SPDX-License-Identifier: MIT OR Apache-2.0

//! Intel-VMX backend: VMCS field access, exit-reason decode, and the
//! VMCS-backed guest CPU state.

use super::{GuestCpuState, IoAccess, VmExit};

use cpuarch::vmcs::{
    CrAccessQualification, IoExitQualification, VmxExitReason, VMX_CTLS_PRI_PROC_BASED_VM_EXECUTION,
    VMX_CTLS_VM_ENTRY_EXCEPTION_ERROR_CODE, VMX_CTLS_VM_ENTRY_INSTRUCTION_LENGTH,
    VMX_CTLS_VM_ENTRY_INTERRUPT_INFORMATION_FIELD, VMX_GUEST_CR3, VMX_GUEST_IA32_EFER,
    VMX_GUEST_RFLAGS, VMX_GUEST_RIP, VMX_GUEST_RSP, VMX_PRI_PROC_CTL_INTERRUPT_WINDOW,
};
use cpuarch::x86::GuestRegisters;

/// Reads a VMCS field of the current VMCS.
#[cfg(target_arch = "x86_64")]
pub fn vmread(field: u32) -> u64 {
    let value: u64;
    // SAFETY: vmread faults only outside VMX operation; the backend
    // only runs with a loaded VMCS.
    unsafe {
        core::arch::asm!(
            "vmread {value}, {field}",
            field = in(reg) field as u64,
            value = out(reg) value,
            options(nostack),
        );
    }
    value
}

/// Writes a VMCS field of the current VMCS.
#[cfg(target_arch = "x86_64")]
pub fn vmwrite(field: u32, value: u64) {
    // SAFETY: same requirement as vmread.
    unsafe {
        core::arch::asm!(
            "vmwrite {field}, {value}",
            field = in(reg) field as u64,
            value = in(reg) value,
            options(nostack),
        );
    }
}

#[cfg(not(target_arch = "x86_64"))]
pub fn vmread(_field: u32) -> u64 {
    0
}

#[cfg(not(target_arch = "x86_64"))]
pub fn vmwrite(_field: u32, _value: u64) {}

/// Raw exit information pulled out of the VMCS on every exit.
#[derive(Clone, Copy, Debug, Default)]
pub struct VmxExitInfo {
    pub reason: u64,
    pub qualification: u64,
    pub interrupt_info: u64,
    pub interrupt_error_code: u64,
    pub guest_physical: u64,
    pub guest_linear: u64,
    pub instruction_length: u64,
}

impl VmxExitInfo {
    #[cfg(target_arch = "x86_64")]
    pub fn read() -> Self {
        use cpuarch::vmcs::{
            VMX_EXIT_QUALIFICATION, VMX_GUEST_LINEAR_ADDR, VMX_GUEST_PHYSICAL_ADDR,
            VMX_VMEXIT_INSTRUCTION_LENGTH, VMX_VMEXIT_INTERRUPT_ERROR_CODE,
            VMX_VMEXIT_INTERRUPT_INFO, VMX_VMEXIT_REASON,
        };

        Self {
            reason: vmread(VMX_VMEXIT_REASON),
            qualification: vmread(VMX_EXIT_QUALIFICATION),
            interrupt_info: vmread(VMX_VMEXIT_INTERRUPT_INFO),
            interrupt_error_code: vmread(VMX_VMEXIT_INTERRUPT_ERROR_CODE),
            guest_physical: vmread(VMX_GUEST_PHYSICAL_ADDR),
            guest_linear: vmread(VMX_GUEST_LINEAR_ADDR),
            instruction_length: vmread(VMX_VMEXIT_INSTRUCTION_LENGTH),
        }
    }
}

fn io_size(code: u8) -> Option<u8> {
    match code {
        0 => Some(1),
        1 => Some(2),
        3 => Some(4),
        _ => None,
    }
}

/// Decodes the raw exit information into the common representation.
pub fn decode_exit(info: &VmxExitInfo) -> VmExit {
    let Some(reason) = VmxExitReason::from_raw(info.reason) else {
        return VmExit::Unknown(info.reason);
    };

    match reason {
        VmxExitReason::ExternalInterrupt => VmExit::ExternalInterrupt {
            vector: (info.interrupt_info & 0xFF) as u8,
            error_code: info.interrupt_error_code,
        },
        VmxExitReason::ExceptionOrNmi => VmExit::ExceptionOrNmi {
            vector: (info.interrupt_info & 0xFF) as u8,
            error_code: info.interrupt_error_code,
            // For a page fault the qualification holds the faulting
            // linear address.
            fault_address: info.qualification,
        },
        VmxExitReason::InterruptWindow => VmExit::InterruptWindow,
        VmxExitReason::Cpuid => VmExit::Cpuid,
        VmxExitReason::Hlt => VmExit::Hlt,
        VmxExitReason::Pause => VmExit::Pause,
        VmxExitReason::Vmcall => VmExit::Vmcall,
        VmxExitReason::Rdmsr => VmExit::Rdmsr,
        VmxExitReason::Wrmsr => VmExit::Wrmsr,
        VmxExitReason::CrAccess => {
            let qual = CrAccessQualification::from(info.qualification);
            match (qual.cr(), qual.access_type()) {
                (3, 0) => VmExit::Cr3Access {
                    write: true,
                    register: qual.register(),
                },
                (3, 1) => VmExit::Cr3Access {
                    write: false,
                    register: qual.register(),
                },
                _ => VmExit::Unknown(info.reason),
            }
        }
        VmxExitReason::IoInstruction => {
            let qual = IoExitQualification::from(info.qualification);
            match io_size(qual.size_code()) {
                Some(size) => VmExit::Io(IoAccess {
                    port: qual.port(),
                    size,
                    direction_in: qual.direction_in(),
                    string: qual.string(),
                    rep: qual.rep(),
                }),
                None => VmExit::Unknown(info.reason),
            }
        }
        VmxExitReason::EptViolation => VmExit::NestedPageFault {
            fault_gpa: info.guest_physical,
            error_code: info.qualification,
        },
        VmxExitReason::EptMisconfig => {
            log::error!(
                "ept misconfig: gpa {:#x} gla {:#x}",
                info.guest_physical,
                info.guest_linear
            );
            VmExit::Unknown(info.reason)
        }
        VmxExitReason::TripleFault => VmExit::Unknown(info.reason),
    }
}

/// Guest CPU state backed by the current VMCS plus the register block
/// saved by the exit stub.
#[derive(Debug)]
pub struct VmxCpuState<'a> {
    pub registers: &'a mut GuestRegisters,
    pub instruction_length: u64,
}

impl GuestCpuState for VmxCpuState<'_> {
    fn registers(&self) -> &GuestRegisters {
        self.registers
    }

    fn registers_mut(&mut self) -> &mut GuestRegisters {
        self.registers
    }

    fn rip(&self) -> u64 {
        vmread(VMX_GUEST_RIP)
    }

    fn set_rip(&mut self, rip: u64) {
        vmwrite(VMX_GUEST_RIP, rip);
    }

    fn rsp(&self) -> u64 {
        vmread(VMX_GUEST_RSP)
    }

    fn rflags(&self) -> u64 {
        vmread(VMX_GUEST_RFLAGS)
    }

    fn cr3(&self) -> u64 {
        vmread(VMX_GUEST_CR3)
    }

    fn set_cr3(&mut self, value: u64) {
        vmwrite(VMX_GUEST_CR3, value);
    }

    fn efer(&self) -> u64 {
        vmread(VMX_GUEST_IA32_EFER)
    }

    fn set_efer(&mut self, value: u64) {
        vmwrite(VMX_GUEST_IA32_EFER, value);
    }

    fn instruction_length(&self) -> u64 {
        self.instruction_length
    }

    fn advance_rip(&mut self) {
        let rip = self.rip() + self.instruction_length;
        self.set_rip(rip);
    }

    fn inject_interrupt(&mut self, vector: u8) {
        let mut interrupt_info = vector as u64;
        interrupt_info |= 1 << 31; // valid

        if vector >= 0x20 {
            vmwrite(VMX_CTLS_VM_ENTRY_EXCEPTION_ERROR_CODE, 0);
            vmwrite(VMX_CTLS_VM_ENTRY_INSTRUCTION_LENGTH, self.instruction_length);
        }

        vmwrite(VMX_CTLS_VM_ENTRY_INTERRUPT_INFORMATION_FIELD, interrupt_info);
    }

    fn set_interrupt_window(&mut self, enabled: bool) {
        let controls = vmread(VMX_CTLS_PRI_PROC_BASED_VM_EXECUTION);
        let updated = if enabled {
            controls | VMX_PRI_PROC_CTL_INTERRUPT_WINDOW
        } else {
            controls & !VMX_PRI_PROC_CTL_INTERRUPT_WINDOW
        };
        vmwrite(VMX_CTLS_PRI_PROC_BASED_VM_EXECUTION, updated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_io_exit() {
        let info = VmxExitInfo {
            reason: 30,
            qualification: 0x03F8_0030,
            ..VmxExitInfo::default()
        };
        assert_eq!(
            decode_exit(&info),
            VmExit::Io(IoAccess {
                port: 0x3F8,
                size: 1,
                direction_in: false,
                string: true,
                rep: true,
            })
        );
    }

    #[test]
    fn test_decode_cr3_write_from_r15() {
        let info = VmxExitInfo {
            reason: 28,
            qualification: 0x0F03,
            ..VmxExitInfo::default()
        };
        assert_eq!(
            decode_exit(&info),
            VmExit::Cr3Access {
                write: true,
                register: 15,
            }
        );
    }

    #[test]
    fn test_decode_cr_other_than_cr3_is_unknown() {
        let info = VmxExitInfo {
            reason: 28,
            qualification: 0x0F00,
            ..VmxExitInfo::default()
        };
        assert_eq!(decode_exit(&info), VmExit::Unknown(28));
    }

    #[test]
    fn test_decode_ept_violation() {
        let info = VmxExitInfo {
            reason: 48,
            qualification: 0x2,
            guest_physical: 0xAB000,
            ..VmxExitInfo::default()
        };
        assert_eq!(
            decode_exit(&info),
            VmExit::NestedPageFault {
                fault_gpa: 0xAB000,
                error_code: 0x2,
            }
        );
    }

    #[test]
    fn test_decode_page_fault_exception() {
        let info = VmxExitInfo {
            reason: 0,
            interrupt_info: 0x80000B0E,
            interrupt_error_code: 0x2,
            qualification: 0xDEAD_0000,
            ..VmxExitInfo::default()
        };
        assert_eq!(
            decode_exit(&info),
            VmExit::ExceptionOrNmi {
                vector: 14,
                error_code: 0x2,
                fault_address: 0xDEAD_0000,
            }
        );
    }

    #[test]
    fn test_decode_unknown_reason() {
        let info = VmxExitInfo {
            reason: 63,
            ..VmxExitInfo::default()
        };
        assert_eq!(decode_exit(&info), VmExit::Unknown(63));
    }
}
