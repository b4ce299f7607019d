// SPDX-License-Identifier: MIT OR Apache-2.0

use bitfield_struct::bitfield;

// AE Exitcodes
// Table 15-35, AMD64 Architecture Programmer's Manual, Vol. 2
#[repr(u64)]
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
#[allow(dead_code, non_camel_case_types)]
pub enum SvmExitCode {
    CR3_READ = 0x03,
    CR3_WRITE = 0x13,
    EXCP14 = 0x4E,
    INTR = 0x60,
    NMI = 0x61,
    SMI = 0x62,
    INIT = 0x63,
    VINTR = 0x64,
    CPUID = 0x72,
    PAUSE = 0x77,
    HLT = 0x78,
    IOIO = 0x7B,
    MSR = 0x7C,
    SHUTDOWN = 0x7F,
    VMMCALL = 0x81,
    EFER_WRITE_TRAP = 0x8F,
    CR3_WRITE_TRAP = 0x93,
    IDLE_HLT = 0xA5,
    NPF = 0x400,
    AVIC_INCOMPLETE_IPI = 0x401,
    AVIC_NOACCEL = 0x402,
    VMGEXIT = 0x403,
    #[default]
    INVALID = 0xffffffffffffffff,
    BUSY = 0xfffffffffffffffe,
    IDLE_REQUIRED = 0xfffffffffffffffd,
    INVALID_PMC = 0xfffffffffffffffc,
    UNUSED = 0xfffffffffffffff7,
}

// The dense exit codes end at IDLE_HLT; everything above gets remapped
// into the compact range right behind it so a flat dispatch array can
// cover all reachable codes.
pub const SVM_EXIT_REMAP_BASE: u64 = SvmExitCode::IDLE_HLT as u64 + 1;
pub const SVM_EXIT_NPF_REMAPPED: u64 = SVM_EXIT_REMAP_BASE;
pub const SVM_EXIT_AVIC_INCOMPLETE_IPI_REMAPPED: u64 = SVM_EXIT_REMAP_BASE + 1;
pub const SVM_EXIT_AVIC_NOACCEL_REMAPPED: u64 = SVM_EXIT_REMAP_BASE + 2;
pub const SVM_EXIT_VMGEXIT_REMAPPED: u64 = SVM_EXIT_REMAP_BASE + 3;
pub const SVM_EXIT_INVALID_REMAPPED: u64 = SVM_EXIT_REMAP_BASE + 4;
pub const SVM_EXIT_BUSY_REMAPPED: u64 = SVM_EXIT_REMAP_BASE + 5;
pub const SVM_EXIT_IDLE_REQUIRED_REMAPPED: u64 = SVM_EXIT_REMAP_BASE + 6;
pub const SVM_EXIT_INVALID_PMC_REMAPPED: u64 = SVM_EXIT_REMAP_BASE + 7;
pub const SVM_EXIT_UNUSED_REMAPPED: u64 = SVM_EXIT_REMAP_BASE + 8;
pub const SVM_EXIT_ARRAY_SIZE: usize = (SVM_EXIT_REMAP_BASE + 9) as usize;

#[bitfield(u64)]
pub struct VIntrCtrl {
    pub v_tpr: u8,
    pub v_irq: bool,
    pub vgif: bool,
    pub int_shadow: bool,
    pub v_nmi: bool,
    pub v_nmi_mask: bool,
    #[bits(3)]
    _rsvd_15_13: u8,
    #[bits(4)]
    pub v_intr_prio: u8,
    pub v_ign_tpr: bool,
    #[bits(5)]
    _rsvd_25_21: u8,
    v_nmi_enable: bool,
    #[bits(5)]
    _rsvd_31_27: u8,
    pub v_intr_vector: u8,
    #[bits(23)]
    _rsvd_62_40: u32,
    busy: bool,
}

#[derive(Debug, Eq, PartialEq)]
pub enum EventType {
    Interrupt = 0,
    Nmi = 2,
    Exception = 3,
    SoftwareInterrupt = 4,
}

impl EventType {
    const fn into_bits(self) -> u64 {
        self as _
    }
    const fn from_bits(value: u64) -> Self {
        match value {
            2 => Self::Nmi,
            3 => Self::Exception,
            4 => Self::SoftwareInterrupt,
            _ => Self::Interrupt,
        }
    }
}

#[bitfield(u64)]
pub struct EventInject {
    pub vector: u8,
    #[bits(3)]
    pub event_type: EventType,
    pub error_code_valid: bool,
    #[bits(19)]
    _rsvd_30_12: u32,
    pub valid: bool,
    pub error_code: u32,
}

/// EXITINFO1 of an IOIO intercept.
/// Table 15-17, AMD64 Architecture Programmer's Manual, Vol. 2
#[bitfield(u64)]
pub struct IoioInfo {
    pub type_in: bool,
    _rsvd_1: bool,
    pub string: bool,
    pub rep: bool,
    pub sz8: bool,
    pub sz16: bool,
    pub sz32: bool,
    pub addr16: bool,
    pub addr32: bool,
    pub addr64: bool,
    #[bits(3)]
    pub seg: u8,
    #[bits(3)]
    _rsvd_15_13: u8,
    pub port: u16,
    _rsvd_63_32: u32,
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct VmcbSegment {
    pub selector: u16,
    pub flags: u16,
    pub limit: u32,
    pub base: u64,
}

/// VMCB control area, offsets per Appendix B of the AMD manual. Fields
/// the exit engine does not touch are folded into reserved blocks.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct VmcbControlArea {
    reserved_0: [u8; 0x60],
    pub vint_control: VIntrCtrl,
    pub interrupt_shadow: u64,
    pub exit_code: u64,
    pub exit_info_1: u64,
    pub exit_info_2: u64,
    pub exit_int_info: u64,
    pub np_enable: u64,
    pub avic_apic_bar: u64,
    pub ghcb_gpa: u64,
    pub event_inj: EventInject,
    pub n_cr3: u64,
    pub lbr_virt_enable: u64,
    pub clean_bits: u64,
    pub n_rip: u64,
    pub guest_ins_bytes: [u8; 16],
    reserved_1: [u8; 0x400 - 0xE0],
}

/// VMCB save state area, starting at offset 0x400 of the VMCB page.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct VmcbSaveArea {
    pub es: VmcbSegment,
    pub cs: VmcbSegment,
    pub ss: VmcbSegment,
    pub ds: VmcbSegment,
    pub fs: VmcbSegment,
    pub gs: VmcbSegment,
    pub gdtr: VmcbSegment,
    pub ldtr: VmcbSegment,
    pub idtr: VmcbSegment,
    pub tr: VmcbSegment,
    reserved_0: [u8; 0xCB - 0xA0],
    pub cpl: u8,
    reserved_1: [u8; 4],
    pub efer: u64,
    reserved_2: [u8; 0x148 - 0xD8],
    pub cr4: u64,
    pub cr3: u64,
    pub cr0: u64,
    pub dr7: u64,
    pub dr6: u64,
    pub rflags: u64,
    pub rip: u64,
    reserved_3: [u8; 0x1D8 - 0x180],
    pub rsp: u64,
    pub s_cet: u64,
    pub ssp: u64,
    pub isst_addr: u64,
    pub rax: u64,
    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    pub sfmask: u64,
    pub kernel_gs_base: u64,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub cr2: u64,
    reserved_4: [u8; 0x400 - 0x248],
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct Vmcb {
    pub control_area: VmcbControlArea,
    pub save_state_area: VmcbSaveArea,
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;

    #[test]
    fn test_vmcb_control_area_offsets() {
        assert_eq!(offset_of!(VmcbControlArea, vint_control), 0x60);
        assert_eq!(offset_of!(VmcbControlArea, exit_code), 0x70);
        assert_eq!(offset_of!(VmcbControlArea, event_inj), 0xA8);
        assert_eq!(offset_of!(VmcbControlArea, clean_bits), 0xC0);
        assert_eq!(offset_of!(VmcbControlArea, n_rip), 0xC8);
        assert_eq!(core::mem::size_of::<VmcbControlArea>(), 0x400);
    }

    #[test]
    fn test_vmcb_save_area_offsets() {
        assert_eq!(offset_of!(Vmcb, save_state_area), 0x400);
        assert_eq!(offset_of!(VmcbSaveArea, efer), 0xD0);
        assert_eq!(offset_of!(VmcbSaveArea, rflags), 0x170);
        assert_eq!(offset_of!(VmcbSaveArea, rip), 0x178);
        assert_eq!(offset_of!(VmcbSaveArea, rsp), 0x1D8);
        assert_eq!(offset_of!(VmcbSaveArea, rax), 0x1F8);
        assert_eq!(offset_of!(VmcbSaveArea, cr2), 0x240);
    }

    #[test]
    fn test_ioio_info_decode() {
        // out dx,al with rep: type=out, sz8, rep, port in high word
        let info = IoioInfo::from(0x03F8_0000u64 | (1 << 3) | (1 << 4));
        assert!(!info.type_in());
        assert!(info.rep());
        assert!(info.sz8());
        assert_eq!(info.port(), 0x3F8);
    }
}
