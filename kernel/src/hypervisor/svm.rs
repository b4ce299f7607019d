// SPDX-License-Identifier: MIT OR Apache-2.0

//! AMD-SVM backend: VMCB-backed guest CPU state, exit-code
//! normalization, and the run loop around the VMRUN stub.

use super::{GuestCpuState, IoAccess, Vm, VmExit, VmExitAction, VmExitEnv};
use crate::error::TurnstoneError;
use crate::mm::frame::FrameExtent;

use cpuarch::vmcb::{
    EventInject, EventType, IoioInfo, SvmExitCode, Vmcb, SVM_EXIT_AVIC_INCOMPLETE_IPI_REMAPPED,
    SVM_EXIT_AVIC_NOACCEL_REMAPPED, SVM_EXIT_BUSY_REMAPPED, SVM_EXIT_IDLE_REQUIRED_REMAPPED,
    SVM_EXIT_INVALID_PMC_REMAPPED, SVM_EXIT_INVALID_REMAPPED, SVM_EXIT_NPF_REMAPPED,
    SVM_EXIT_UNUSED_REMAPPED, SVM_EXIT_VMGEXIT_REMAPPED,
};
use cpuarch::x86::GuestRegisters;

/// Exit codes above the dense range collapse into the compact remap
/// window so dispatch can stay a flat array lookup.
pub fn remap_exit_code(exit_code: u64) -> u64 {
    if exit_code <= SvmExitCode::IDLE_HLT as u64 {
        return exit_code;
    }

    let narrowed = exit_code & 0xFFFF_FFFF;

    if narrowed == SvmExitCode::NPF as u64 {
        SVM_EXIT_NPF_REMAPPED
    } else if narrowed == SvmExitCode::AVIC_INCOMPLETE_IPI as u64 {
        SVM_EXIT_AVIC_INCOMPLETE_IPI_REMAPPED
    } else if narrowed == SvmExitCode::AVIC_NOACCEL as u64 {
        SVM_EXIT_AVIC_NOACCEL_REMAPPED
    } else if narrowed == SvmExitCode::VMGEXIT as u64 {
        SVM_EXIT_VMGEXIT_REMAPPED
    } else if narrowed == (SvmExitCode::INVALID as u64 & 0xFFFF_FFFF) {
        SVM_EXIT_INVALID_REMAPPED
    } else if narrowed == (SvmExitCode::BUSY as u64 & 0xFFFF_FFFF) {
        SVM_EXIT_BUSY_REMAPPED
    } else if narrowed == (SvmExitCode::IDLE_REQUIRED as u64 & 0xFFFF_FFFF) {
        SVM_EXIT_IDLE_REQUIRED_REMAPPED
    } else if narrowed == (SvmExitCode::INVALID_PMC as u64 & 0xFFFF_FFFF) {
        SVM_EXIT_INVALID_PMC_REMAPPED
    } else if narrowed == (SvmExitCode::UNUSED as u64 & 0xFFFF_FFFF) {
        SVM_EXIT_UNUSED_REMAPPED
    } else {
        SVM_EXIT_INVALID_REMAPPED
    }
}

fn decode_ioio(info: IoioInfo) -> Option<IoAccess> {
    let size = if info.sz8() {
        1
    } else if info.sz16() {
        2
    } else if info.sz32() {
        4
    } else {
        return None;
    };

    Some(IoAccess {
        port: info.port(),
        size,
        direction_in: info.type_in(),
        string: info.string(),
        rep: info.rep(),
    })
}

/// Decodes a VMCB exit into the common exit representation.
/// `host_vector` carries the vector already read from the host APIC
/// for external-interrupt exits.
pub fn decode_exit(vmcb: &Vmcb, host_vector: u8) -> VmExit {
    let exit_code = vmcb.control_area.exit_code;
    let exit_info_1 = vmcb.control_area.exit_info_1;
    let exit_info_2 = vmcb.control_area.exit_info_2;

    let remapped = remap_exit_code(exit_code);

    if remapped == SvmExitCode::INTR as u64 {
        VmExit::ExternalInterrupt {
            vector: host_vector,
            error_code: 0,
        }
    } else if remapped == SvmExitCode::EXCP14 as u64 {
        VmExit::ExceptionOrNmi {
            vector: 14,
            error_code: exit_info_1,
            fault_address: exit_info_2,
        }
    } else if remapped == SvmExitCode::HLT as u64 || remapped == SvmExitCode::IDLE_HLT as u64 {
        VmExit::Hlt
    } else if remapped == SvmExitCode::PAUSE as u64 {
        VmExit::Pause
    } else if remapped == SvmExitCode::CPUID as u64 {
        VmExit::Cpuid
    } else if remapped == SvmExitCode::VINTR as u64 {
        VmExit::InterruptWindow
    } else if remapped == SvmExitCode::MSR as u64 {
        // EXITINFO1 distinguishes RDMSR (0) from WRMSR (1).
        if exit_info_1 & 1 != 0 {
            VmExit::Wrmsr
        } else {
            VmExit::Rdmsr
        }
    } else if remapped == SvmExitCode::VMMCALL as u64 {
        VmExit::Vmcall
    } else if remapped == SvmExitCode::IOIO as u64 {
        match decode_ioio(IoioInfo::from(exit_info_1)) {
            Some(io) => VmExit::Io(io),
            None => VmExit::Unknown(exit_code),
        }
    } else if remapped == SvmExitCode::CR3_READ as u64 {
        VmExit::Cr3Access {
            write: false,
            register: (exit_info_1 & 0xF) as u8,
        }
    } else if remapped == SvmExitCode::CR3_WRITE as u64
        || remapped == SvmExitCode::CR3_WRITE_TRAP as u64
    {
        VmExit::Cr3Access {
            write: true,
            register: (exit_info_1 & 0xF) as u8,
        }
    } else if remapped == SVM_EXIT_NPF_REMAPPED {
        VmExit::NestedPageFault {
            fault_gpa: exit_info_2,
            error_code: exit_info_1,
        }
    } else {
        VmExit::Unknown(exit_code)
    }
}

/// Guest CPU state backed by a VMCB plus the register block the VMRUN
/// stub exchanges. RAX is mirrored between the two by the run loop.
#[derive(Debug)]
pub struct SvmCpuState<'a> {
    pub vmcb: &'a mut Vmcb,
    pub registers: &'a mut GuestRegisters,
}

impl GuestCpuState for SvmCpuState<'_> {
    fn registers(&self) -> &GuestRegisters {
        self.registers
    }

    fn registers_mut(&mut self) -> &mut GuestRegisters {
        self.registers
    }

    fn rip(&self) -> u64 {
        self.vmcb.save_state_area.rip
    }

    fn set_rip(&mut self, rip: u64) {
        self.vmcb.save_state_area.rip = rip;
    }

    fn rsp(&self) -> u64 {
        self.vmcb.save_state_area.rsp
    }

    fn rflags(&self) -> u64 {
        self.vmcb.save_state_area.rflags
    }

    fn cr3(&self) -> u64 {
        self.vmcb.save_state_area.cr3
    }

    fn set_cr3(&mut self, value: u64) {
        self.vmcb.save_state_area.cr3 = value;
    }

    fn efer(&self) -> u64 {
        self.vmcb.save_state_area.efer
    }

    fn set_efer(&mut self, value: u64) {
        self.vmcb.save_state_area.efer = value;
    }

    fn instruction_length(&self) -> u64 {
        let n_rip = self.vmcb.control_area.n_rip;
        n_rip - self.vmcb.save_state_area.rip
    }

    fn advance_rip(&mut self) {
        self.vmcb.save_state_area.rip = self.vmcb.control_area.n_rip;
    }

    fn inject_interrupt(&mut self, vector: u8) {
        self.vmcb.control_area.event_inj = EventInject::new()
            .with_vector(vector)
            .with_event_type(EventType::Interrupt)
            .with_valid(true);
    }

    fn set_interrupt_window(&mut self, enabled: bool) {
        let mut vint = self.vmcb.control_area.vint_control;
        vint.set_v_irq(enabled);
        vint.set_v_ign_tpr(enabled);
        self.vmcb.control_area.vint_control = vint;
    }
}

/// Per-guest SVM control state owned by the guest's task.
#[derive(Debug)]
pub struct SvmVcpu {
    /// Two frames: the VMCB page followed by the host-save page.
    pub vmcb_frame: FrameExtent,
    pub guest_registers: GuestRegisters,
    pub host_registers: GuestRegisters,
}

/// Runs the guest until it exits or an unrecoverable error leaves it
/// halted. Interrupts are gated with CLGI/STGI around the register
/// exchange.
#[cfg(target_arch = "x86_64")]
pub fn svm_vm_run(
    vcpu: &mut SvmVcpu,
    vm: &mut Vm,
    env: &mut VmExitEnv<'_>,
    host_isr_vector: impl Fn() -> u8,
) -> Result<i64, TurnstoneError> {
    use super::vmenter;

    let vmcb_pa = vcpu.vmcb_frame.start;
    let vmcb_va = env.platform.phys_to_virt(vmcb_pa);

    loop {
        // SAFETY: gating GI around the world switch keeps host
        // interrupt state consistent with the register exchange.
        unsafe {
            core::arch::asm!("clgi", options(nomem, nostack));
            vmenter::turnstone_svm_run_single(
                &mut vcpu.host_registers,
                &mut vcpu.guest_registers,
                vmcb_pa.bits(),
            );
            core::arch::asm!("stgi", options(nomem, nostack));
        }

        // SAFETY: the VMCB frame is owned by this vcpu and direct
        // mapped.
        let vmcb = unsafe { &mut *vmcb_va.as_mut_ptr::<Vmcb>() };

        vcpu.guest_registers.rax = vmcb.save_state_area.rax;

        let exit = decode_exit(vmcb, host_isr_vector());

        if matches!(exit, VmExit::ExternalInterrupt { .. }) {
            // The host interrupt is still in service; acknowledge it
            // here where the exit is taken.
            env.platform.eoi();
        }

        let mut state = SvmCpuState {
            vmcb,
            registers: &mut vcpu.guest_registers,
        };

        match super::vmexit::handle_vmexit(vm, &mut state, exit, env) {
            Ok(VmExitAction::Continue) => {}
            Ok(VmExitAction::GuestExit(code)) => return Ok(code),
            Err(err) => {
                log::error!("vmexit handler failed: {:?}", err);
                dump_guest_state(vmcb, &vcpu.guest_registers);
                vm.lapic.timer_masked = true;
                vm.is_halted = true;
                return Err(err);
            }
        }

        vmcb.save_state_area.rax = vcpu.guest_registers.rax;
    }
}

pub fn dump_guest_state(vmcb: &Vmcb, registers: &GuestRegisters) {
    let rip = vmcb.save_state_area.rip;
    let rflags = vmcb.save_state_area.rflags;
    let efer = vmcb.save_state_area.efer;
    let rsp = vmcb.save_state_area.rsp;
    let rax = vmcb.save_state_area.rax;
    let cr0 = vmcb.save_state_area.cr0;
    let cr2 = vmcb.save_state_area.cr2;
    let cr3 = vmcb.save_state_area.cr3;
    let cr4 = vmcb.save_state_area.cr4;

    log::error!("    RIP: {:#018x} RFLAGS: {:#010x} EFER: {:#010x}", rip, rflags, efer);
    log::error!(
        "    RAX: {:#018x} RBX: {:#018x} RCX: {:#018x} RDX: {:#018x}",
        rax,
        registers.rbx,
        registers.rcx,
        registers.rdx
    );
    log::error!(
        "    RSI: {:#018x} RDI: {:#018x} RBP: {:#018x} RSP: {:#018x}",
        registers.rsi,
        registers.rdi,
        registers.rbp,
        rsp
    );
    log::error!(
        "    R8:  {:#018x} R9:  {:#018x} R10: {:#018x} R11: {:#018x}",
        registers.r8,
        registers.r9,
        registers.r10,
        registers.r11
    );
    log::error!(
        "    R12: {:#018x} R13: {:#018x} R14: {:#018x} R15: {:#018x}",
        registers.r12,
        registers.r13,
        registers.r14,
        registers.r15
    );
    log::error!(
        "    CR0: {:#010x} CR2: {:#018x} CR3: {:#018x} CR4: {:#010x}",
        cr0,
        cr2,
        cr3,
        cr4
    );
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use super::*;
    use alloc::boxed::Box;

    fn zeroed_vmcb() -> Box<Vmcb> {
        // SAFETY: Vmcb is repr(C, packed) plain data; the all-zero
        // pattern is valid.
        unsafe { Box::new(core::mem::zeroed()) }
    }

    #[test]
    fn test_remap_folds_high_codes() {
        assert_eq!(remap_exit_code(SvmExitCode::HLT as u64), 0x78);
        assert_eq!(remap_exit_code(SvmExitCode::NPF as u64), SVM_EXIT_NPF_REMAPPED);
        assert_eq!(
            remap_exit_code(SvmExitCode::VMGEXIT as u64),
            SVM_EXIT_VMGEXIT_REMAPPED
        );
        assert_eq!(remap_exit_code(u64::MAX), SVM_EXIT_INVALID_REMAPPED);
        // Unrecognized high codes fold into the invalid slot.
        assert_eq!(remap_exit_code(0x700), SVM_EXIT_INVALID_REMAPPED);
        assert!(remap_exit_code(SvmExitCode::NPF as u64) < cpuarch::vmcb::SVM_EXIT_ARRAY_SIZE as u64);
    }

    #[test]
    fn test_decode_msr_direction() {
        let mut vmcb = zeroed_vmcb();
        vmcb.control_area.exit_code = SvmExitCode::MSR as u64;
        vmcb.control_area.exit_info_1 = 0;
        assert_eq!(decode_exit(&vmcb, 0), VmExit::Rdmsr);
        vmcb.control_area.exit_info_1 = 1;
        assert_eq!(decode_exit(&vmcb, 0), VmExit::Wrmsr);
    }

    #[test]
    fn test_decode_ioio_exit() {
        let mut vmcb = zeroed_vmcb();
        vmcb.control_area.exit_code = SvmExitCode::IOIO as u64;
        // rep outsb to port 0x3F8.
        vmcb.control_area.exit_info_1 = 0x03F8_0000 | (1 << 2) | (1 << 3) | (1 << 4);

        let exit = decode_exit(&vmcb, 0);
        assert_eq!(
            exit,
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
    fn test_decode_npf_carries_fault_address() {
        let mut vmcb = zeroed_vmcb();
        vmcb.control_area.exit_code = SvmExitCode::NPF as u64;
        vmcb.control_area.exit_info_1 = 0x4;
        vmcb.control_area.exit_info_2 = 0x1234_5000;
        assert_eq!(
            decode_exit(&vmcb, 0),
            VmExit::NestedPageFault {
                fault_gpa: 0x1234_5000,
                error_code: 0x4,
            }
        );
    }

    #[test]
    fn test_cpu_state_advance_rip_uses_next_rip() {
        let mut vmcb = zeroed_vmcb();
        vmcb.save_state_area.rip = 0x1000;
        vmcb.control_area.n_rip = 0x1003;
        let mut registers = GuestRegisters::default();

        let mut state = SvmCpuState {
            vmcb: &mut vmcb,
            registers: &mut registers,
        };
        assert_eq!(state.instruction_length(), 3);
        state.advance_rip();
        assert_eq!(state.rip(), 0x1003);
    }

    #[test]
    fn test_cpu_state_injection_sets_event() {
        let mut vmcb = zeroed_vmcb();
        let mut registers = GuestRegisters::default();
        let mut state = SvmCpuState {
            vmcb: &mut vmcb,
            registers: &mut registers,
        };

        state.inject_interrupt(0x21);
        let event = vmcb.control_area.event_inj;
        assert!(event.valid());
        assert_eq!(event.vector(), 0x21);

        let mut state = SvmCpuState {
            vmcb: &mut vmcb,
            registers: &mut registers,
        };
        state.set_interrupt_window(true);
        let vint = vmcb.control_area.vint_control;
        assert!(vint.v_irq());
    }
}
