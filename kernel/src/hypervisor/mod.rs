// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hypervisor core. The per-guest state lives in [`Vm`]; the exit
//! engine in [`vmexit`] is generic over [`GuestCpuState`], which the
//! AMD-SVM and Intel-VMX backends implement over their VMCB and VMCS
//! control structures.

extern crate alloc;

pub mod apic;
pub mod nested;
pub mod svm;
pub mod vmexit;
pub mod vmx;

#[cfg(target_arch = "x86_64")]
pub mod vmenter;

use crate::address::PhysAddr;
use crate::collections::List;
use crate::error::TurnstoneError;
use crate::mm::frame::{FrameAllocator, FrameExtent};
use crate::platform::Platform;
use crate::types::PAGE_SIZE;

use alloc::collections::BTreeMap;

use apic::VirtualLapic;
use cpuarch::x86::{GuestRegisters, InterruptFrame, RFLAGS_IF};
use nested::NestedPageTable;

// Hypercall numbers carried in RAX of a VMMCALL/VMCALL; arguments in
// RDI/RSI/RDX/R11, result in RAX.
pub const VMCALL_EXIT: u64 = 0;
pub const VMCALL_GVA_TO_HPA: u64 = 1;
pub const VMCALL_ATTACH_PCI_DEV: u64 = 2;
pub const VMCALL_ATTACH_INTERRUPT: u64 = 3;
pub const VMCALL_LOAD_MODULE: u64 = 4;

/// Guest-physical page into which the host copies the full register
/// snapshot of an arriving interrupt before injecting its vector.
pub const GUEST_IFEXT_BASE: u64 = 0x9000;

/// Classes of frames a VM owns; released together on teardown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmFrameType {
    VcpuControl = 0,
    Vapic = 1,
    InterruptFrameExt = 2,
    GuestRam = 3,
    Got = 4,
    Program = 5,
}

pub const VM_FRAME_TYPE_COUNT: usize = 6;

/// Per-guest virtual CPU and machine state.
pub struct Vm {
    pub lapic: VirtualLapic,
    pub msr_map: BTreeMap<u32, u64>,
    pub mapped_io_ports: List<u16>,
    pub interrupt_queue: List<InterruptFrame>,
    pub nested: NestedPageTable,
    pub owned_frames: [Option<FrameExtent>; VM_FRAME_TYPE_COUNT],
    pub is_halted: bool,
    pub is_halt_need_next_instruction: bool,
    pub need_to_notify: bool,
    /// Virtual interrupt delivery available; EOI is not intercepted.
    pub vid_enabled: bool,
    pub vapic_register_access_enabled: bool,
    pub lapic_timer_enabled: bool,
    pub lapic_timer_pending: bool,
}

impl core::fmt::Debug for Vm {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vm")
            .field("is_halted", &self.is_halted)
            .field("need_to_notify", &self.need_to_notify)
            .finish()
    }
}

impl Vm {
    pub fn new(nested: NestedPageTable) -> Self {
        Self {
            lapic: VirtualLapic::default(),
            msr_map: BTreeMap::new(),
            mapped_io_ports: List::sorted(),
            interrupt_queue: List::with_comparator(|_, _| core::cmp::Ordering::Equal),
            nested,
            owned_frames: [None; VM_FRAME_TYPE_COUNT],
            is_halted: false,
            is_halt_need_next_instruction: false,
            need_to_notify: false,
            vid_enabled: false,
            vapic_register_access_enabled: false,
            lapic_timer_enabled: false,
            lapic_timer_pending: false,
        }
    }

    pub fn set_owned_frame(&mut self, kind: VmFrameType, extent: FrameExtent) {
        self.owned_frames[kind as usize] = Some(extent);
    }

    pub fn owned_frame(&self, kind: VmFrameType) -> Option<FrameExtent> {
        self.owned_frames[kind as usize]
    }

    /// Releases every frame the VM owns back to the allocator.
    pub fn release_owned_frames(&mut self, frames: &mut FrameAllocator) {
        for slot in self.owned_frames.iter_mut() {
            if let Some(extent) = slot.take() {
                if let Err(err) = frames.release(extent) {
                    log::warn!("vm frame release failed: {:?}", err);
                }
            }
        }
    }

    /// Queues an interrupt towards the guest: bit set in the request
    /// vectors, full frame parked for the interrupt-frame extension
    /// page, delivery flagged.
    pub fn post_interrupt(&mut self, frame: InterruptFrame) {
        let vector = frame.interrupt_number as u8;
        self.lapic.request_vector(vector);
        if vector != 0x20 {
            self.interrupt_queue.queue_push(frame);
        }
        self.need_to_notify = true;
    }

    fn with_vapic_page(&self, platform: &dyn Platform, edit: impl FnOnce(&mut [u8])) {
        let Some(vapic) = self.owned_frames[VmFrameType::Vapic as usize] else {
            return;
        };
        let mut page = [0u8; PAGE_SIZE];
        // SAFETY: the vAPIC frame is owned by this VM.
        unsafe {
            platform.phys_read(vapic.start, &mut page);
        }
        edit(&mut page);
        // SAFETY: same as above.
        unsafe {
            platform.phys_write(vapic.start, &page);
        }
    }

    /// Scan/service policy of the virtual LAPIC, shared by the
    /// interrupt-window exit and the intercepted EOI write.
    ///
    /// With `iterate` the lowest pending vector is taken into service.
    /// With `for_eoi` the just-serviced vector is retired first: its
    /// IRR/ISR page bits are cleared and the in-service state reset.
    /// `need_to_notify` is raised when the guest can take a further
    /// interrupt (RFLAGS.IF set and something pending).
    pub fn find_next_x2apic_interrupt(
        &mut self,
        platform: &dyn Platform,
        guest_rflags: u64,
        iterate: bool,
        for_eoi: bool,
    ) {
        if for_eoi {
            let serviced = self.lapic.in_service_vector as u8;
            if serviced != 0 {
                self.with_vapic_page(platform, |page| {
                    apic::vapic_set_irr(page, serviced, true);
                    apic::vapic_set_isr(page, serviced, true);
                });
            }
            if serviced == self.lapic.timer_vector && self.lapic_timer_pending {
                self.lapic_timer_pending = false;
            }
            self.lapic.in_service_vector = 0;
            self.lapic.apic_eoi_pending = false;
        }

        let found = self.lapic.first_pending();
        let waiting = self.lapic.pending_count();

        match found {
            Some(vector) => {
                if iterate {
                    self.lapic.clear_vector(vector);
                    self.with_vapic_page(platform, |page| {
                        apic::vapic_set_irr(page, vector, false);
                    });

                    self.lapic.in_service_vector = vector as u32;
                    self.lapic.apic_eoi_pending = true;

                    if vector != 0x20 {
                        if let Some(frame) = self.interrupt_queue.queue_pop() {
                            self.deliver_interrupt_frame(platform, &frame);
                        }
                    }
                }

                if guest_rflags & RFLAGS_IF != 0 && waiting > 0 {
                    self.need_to_notify = true;
                }
            }
            None => {
                self.lapic.in_service_vector = 0;
                self.need_to_notify = false;
                self.lapic.apic_eoi_pending = false;
            }
        }
    }

    /// Copies the parked register snapshot into the guest's interrupt
    /// frame extension page.
    fn deliver_interrupt_frame(&self, platform: &dyn Platform, frame: &InterruptFrame) {
        let Some(hpa) = self.nested.translate_gpa(platform, GUEST_IFEXT_BASE) else {
            log::error!("interrupt frame extension page is not mapped");
            return;
        };

        let bytes = interrupt_frame_bytes(frame);
        // SAFETY: the extension page is guest RAM owned by this VM.
        unsafe {
            platform.phys_write(hpa, bytes);
        }
    }

    /// One virtual timer step. Posts the timer vector when the counter
    /// runs out; periodic timers reload from the initial value.
    pub fn lapic_timer_tick(&mut self) {
        if !self.lapic_timer_enabled || self.lapic.timer_masked {
            return;
        }

        let step = self.lapic.timer_divider_realvalue.max(1);
        if self.lapic.timer_current_value > step {
            self.lapic.timer_current_value -= step;
            return;
        }

        if self.lapic.timer_periodic {
            self.lapic.timer_current_value = self.lapic.timer_initial_value;
        } else {
            self.lapic.timer_current_value = 0;
            self.lapic_timer_enabled = false;
        }

        if !self.lapic_timer_pending {
            self.lapic_timer_pending = true;
            self.lapic.request_vector(self.lapic.timer_vector);
            self.need_to_notify = true;
        }
    }
}

pub fn interrupt_frame_bytes(frame: &InterruptFrame) -> &[u8] {
    // SAFETY: InterruptFrame is repr(C) with no padding; viewing it as
    // bytes is well-defined.
    unsafe {
        core::slice::from_raw_parts(
            (frame as *const InterruptFrame).cast::<u8>(),
            core::mem::size_of::<InterruptFrame>(),
        )
    }
}

/// Decoded reason of a guest exit, common to both backends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmExit {
    ExternalInterrupt { vector: u8, error_code: u64 },
    ExceptionOrNmi { vector: u8, error_code: u64, fault_address: u64 },
    NestedPageFault { fault_gpa: u64, error_code: u64 },
    Hlt,
    Pause,
    Io(IoAccess),
    InterruptWindow,
    Rdmsr,
    Wrmsr,
    Cr3Access { write: bool, register: u8 },
    Cpuid,
    Vmcall,
    Unknown(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoAccess {
    pub port: u16,
    pub size: u8,
    pub direction_in: bool,
    pub string: bool,
    pub rep: bool,
}

/// What the run loop should do after a handled exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmExitAction {
    Continue,
    /// The guest asked to exit with the given code.
    GuestExit(i64),
}

/// Access to the guest's architectural CPU state, implemented over the
/// VMCB on SVM and the VMCS on VMX.
pub trait GuestCpuState {
    fn registers(&self) -> &GuestRegisters;
    fn registers_mut(&mut self) -> &mut GuestRegisters;
    fn rip(&self) -> u64;
    fn set_rip(&mut self, rip: u64);
    fn rsp(&self) -> u64;
    fn rflags(&self) -> u64;
    fn cr3(&self) -> u64;
    fn set_cr3(&mut self, value: u64);
    fn efer(&self) -> u64;
    fn set_efer(&mut self, value: u64);
    fn instruction_length(&self) -> u64;
    /// Moves RIP past the exiting instruction.
    fn advance_rip(&mut self);
    fn inject_interrupt(&mut self, vector: u8);
    fn set_interrupt_window(&mut self, enabled: bool);
}

/// Host interrupt dispatcher; receives the frame synthesized from a
/// guest external-interrupt exit.
pub trait InterruptDispatcher {
    fn dispatch(&mut self, frame: &InterruptFrame);
}

/// Cooperative scheduling hooks the exit engine suspends through.
pub trait TaskServices {
    fn task_yield(&mut self);
    fn set_message_waiting(&mut self);
}

/// Hypercalls that reach outside the VM itself.
pub trait VmcallServices {
    fn attach_pci_device(
        &mut self,
        vm: &mut Vm,
        frames: &mut FrameAllocator,
        address: u64,
    ) -> Result<u64, TurnstoneError>;

    fn attach_interrupt(
        &mut self,
        vm: &mut Vm,
        pci_dev_address: u64,
        interrupt_kind: u64,
        interrupt_number: u8,
    ) -> Result<u64, TurnstoneError>;

    /// Loads a further module through the TOSDB manager; the argument
    /// is the guest's GOT entry address naming the wanted symbol.
    fn load_module(
        &mut self,
        vm: &mut Vm,
        frames: &mut FrameAllocator,
        got_entry_address: u64,
    ) -> Result<u64, TurnstoneError>;
}

/// Everything outside the VM the exit handlers touch.
pub struct VmExitEnv<'a> {
    pub platform: &'a dyn Platform,
    pub frames: &'a mut FrameAllocator,
    pub tasks: &'a mut dyn TaskServices,
    pub interrupts: &'a mut dyn InterruptDispatcher,
    pub vmcalls: &'a mut dyn VmcallServices,
}

pub fn guest_physical_of(vm: &Vm, platform: &dyn Platform, gpa: u64) -> Option<PhysAddr> {
    vm.nested.translate_gpa(platform, gpa)
}
