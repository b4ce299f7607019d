// SPDX-License-Identifier: MIT OR Apache-2.0

//! VM-exit engine: one state machine over the decoded exit reason,
//! shared by the SVM and VMX backends through [`GuestCpuState`].

use super::apic::{self, decode_timer_divider};
use super::{
    GuestCpuState, IoAccess, Vm, VmExit, VmExitAction, VmExitEnv, VMCALL_ATTACH_INTERRUPT,
    VMCALL_ATTACH_PCI_DEV, VMCALL_EXIT, VMCALL_GVA_TO_HPA, VMCALL_LOAD_MODULE,
};
use crate::error::TurnstoneError;

extern crate alloc;

use alloc::vec::Vec;
use cpuarch::x86::{
    InterruptFrame, MSR_EFER, MSR_X2APIC_EOI, MSR_X2APIC_LVT_TIMER, MSR_X2APIC_TIMER_CURRENT,
    MSR_X2APIC_TIMER_DIVIDER, MSR_X2APIC_TIMER_INITIAL, RFLAGS_DF,
};

const SERIAL_DEBUG_PORT: u16 = 0x3F8;

/// Dispatches one decoded exit. Errors leave the guest halted with a
/// register dump; the host itself never dies from a guest fault.
pub fn handle_vmexit<S: GuestCpuState>(
    vm: &mut Vm,
    state: &mut S,
    exit: VmExit,
    env: &mut VmExitEnv<'_>,
) -> Result<VmExitAction, TurnstoneError> {
    match exit {
        VmExit::ExternalInterrupt { vector, error_code } => {
            handle_external_interrupt(state, vector, error_code, env);
            Ok(VmExitAction::Continue)
        }
        VmExit::ExceptionOrNmi {
            vector,
            error_code,
            fault_address,
        } => {
            // Exception 14 routes to the nested paging helper;
            // anything else is unexpected while the guest runs.
            if vector == 14 {
                vm.nested
                    .handle_page_fault(env.frames, env.platform, fault_address)?;
                Ok(VmExitAction::Continue)
            } else {
                log::error!(
                    "unhandled guest exception {:#x} error {:#x}",
                    vector,
                    error_code
                );
                Err(TurnstoneError::ProtocolViolation)
            }
        }
        VmExit::NestedPageFault { fault_gpa, .. } => {
            vm.nested
                .handle_page_fault(env.frames, env.platform, fault_gpa)?;
            Ok(VmExitAction::Continue)
        }
        VmExit::Hlt => {
            vm.is_halted = true;
            log::trace!("vm is halted");

            env.tasks.set_message_waiting();
            env.tasks.task_yield();

            if vm.is_halt_need_next_instruction {
                vm.is_halted = false;
                vm.is_halt_need_next_instruction = false;
                state.advance_rip();
            }
            Ok(VmExitAction::Continue)
        }
        VmExit::Pause => {
            vm.is_halted = true;
            env.tasks.task_yield();
            vm.is_halted = false;
            state.advance_rip();
            Ok(VmExitAction::Continue)
        }
        VmExit::Io(io) => {
            handle_io(vm, state, io, env)?;
            state.advance_rip();
            Ok(VmExitAction::Continue)
        }
        VmExit::InterruptWindow => {
            handle_interrupt_window(vm, state, env);
            Ok(VmExitAction::Continue)
        }
        VmExit::Rdmsr => {
            handle_rdmsr(vm, state);
            state.advance_rip();
            Ok(VmExitAction::Continue)
        }
        VmExit::Wrmsr => {
            handle_wrmsr(vm, state, env)?;
            state.advance_rip();
            Ok(VmExitAction::Continue)
        }
        VmExit::Cr3Access { write, register } => {
            // Only R15 is honored as the source or destination.
            if register != 15 {
                log::error!("unhandled control register access via r{}", register);
                return Err(TurnstoneError::ProtocolViolation);
            }
            if write {
                let value = state.registers().r15;
                state.set_cr3(value);
            } else {
                state.registers_mut().r15 = state.cr3();
            }
            state.advance_rip();
            Ok(VmExitAction::Continue)
        }
        VmExit::Cpuid => {
            let leaf = state.registers().rax as u32;
            let subleaf = state.registers().rcx as u32;
            let result = env.platform.cpuid(leaf, subleaf);
            let registers = state.registers_mut();
            registers.rax = result.eax as u64;
            registers.rbx = result.ebx as u64;
            registers.rcx = result.ecx as u64;
            registers.rdx = result.edx as u64;
            state.advance_rip();
            Ok(VmExitAction::Continue)
        }
        VmExit::Vmcall => handle_vmcall(vm, state, env),
        VmExit::Unknown(code) => {
            log::error!("unhandled vm exit {:#x}", code);
            Err(TurnstoneError::ProtocolViolation)
        }
    }
}

fn handle_external_interrupt<S: GuestCpuState>(
    state: &mut S,
    vector: u8,
    error_code: u64,
    env: &mut VmExitEnv<'_>,
) {
    log::trace!("external interrupt vector {:#x}", vector);

    let frame = InterruptFrame {
        registers: *state.registers(),
        interrupt_number: vector as u64,
        error_code,
        return_rip: state.rip(),
        return_cs: 0,
        return_rflags: state.rflags(),
        return_rsp: state.rsp(),
        return_ss: 0,
    };

    env.interrupts.dispatch(&frame);
}

fn handle_interrupt_window<S: GuestCpuState>(vm: &mut Vm, state: &mut S, env: &mut VmExitEnv<'_>) {
    log::trace!("interrupt window, rip {:#x}", state.rip());

    if vm.need_to_notify {
        vm.find_next_x2apic_interrupt(env.platform, state.rflags(), true, false);

        if vm.need_to_notify {
            let vector = vm.lapic.in_service_vector as u8;

            vm.with_vapic_page(env.platform, |page| {
                apic::vapic_set_isr(page, vector, false);
            });

            state.inject_interrupt(vector);
            log::trace!("interrupt window: injected {:#x}", vector);

            vm.need_to_notify = false;
        }
    }

    if !vm.need_to_notify {
        state.set_interrupt_window(false);
    }
}

fn handle_rdmsr<S: GuestCpuState>(vm: &mut Vm, state: &mut S) {
    let msr = state.registers().rcx as u32;

    let value = match msr {
        MSR_EFER => state.efer(),
        MSR_X2APIC_TIMER_INITIAL => vm.lapic.timer_initial_value,
        MSR_X2APIC_TIMER_CURRENT => vm.lapic.timer_current_value,
        MSR_X2APIC_TIMER_DIVIDER => vm.lapic.timer_divider,
        MSR_X2APIC_LVT_TIMER => vm.lapic.lvt_timer(),
        _ => vm.msr_map.get(&msr).copied().unwrap_or(0),
    };

    let registers = state.registers_mut();
    registers.rax = value & 0xFFFF_FFFF;
    registers.rdx = (value >> 32) & 0xFFFF_FFFF;
}

fn handle_wrmsr<S: GuestCpuState>(
    vm: &mut Vm,
    state: &mut S,
    env: &mut VmExitEnv<'_>,
) -> Result<(), TurnstoneError> {
    let registers = *state.registers();
    let msr = registers.rcx as u32;
    let value = (registers.rax & 0xFFFF_FFFF) | (registers.rdx << 32);

    match msr {
        MSR_EFER => state.set_efer(value),
        MSR_X2APIC_TIMER_INITIAL => {
            vm.lapic.timer_initial_value = value;
            vm.lapic.timer_current_value = value;
            vm.lapic_timer_enabled = true;
        }
        MSR_X2APIC_TIMER_CURRENT => {
            vm.lapic.timer_current_value = value;
        }
        MSR_X2APIC_TIMER_DIVIDER => {
            let real = decode_timer_divider(value).ok_or_else(|| {
                log::error!("invalid timer divider {:#x}", value);
                TurnstoneError::ProtocolViolation
            })?;
            vm.lapic.timer_divider = value;
            vm.lapic.timer_divider_realvalue = real;
        }
        MSR_X2APIC_LVT_TIMER => vm.lapic.set_lvt_timer(value),
        MSR_X2APIC_EOI => {
            if vm.vid_enabled {
                // With virtual interrupt delivery the EOI never traps.
                log::error!("eoi intercept with virtual interrupt delivery enabled");
                return Err(TurnstoneError::ProtocolViolation);
            }
            vm.find_next_x2apic_interrupt(env.platform, state.rflags(), false, true);
            if vm.need_to_notify {
                state.set_interrupt_window(true);
            }
        }
        _ => {
            vm.msr_map.insert(msr, value);
        }
    }

    Ok(())
}

fn io_mask(size: u8) -> u64 {
    u64::MAX >> (64 - (size as u32) * 8)
}

fn handle_io<S: GuestCpuState>(
    vm: &mut Vm,
    state: &mut S,
    io: IoAccess,
    env: &mut VmExitEnv<'_>,
) -> Result<(), TurnstoneError> {
    log::trace!(
        "io port {:#x} size {} dir-in {} string {} rep {}",
        io.port,
        io.size,
        io.direction_in,
        io.string,
        io.rep
    );

    if vm.mapped_io_ports.contains(&io.port) {
        passthrough_io(vm, state, io, env)
    } else if io.port == SERIAL_DEBUG_PORT && !io.direction_in {
        emulate_serial_out(vm, state, io, env)
    } else {
        log::error!(
            "unhandled io instruction port {:#x} size {} dir-in {}",
            io.port,
            io.size,
            io.direction_in
        );
        Err(TurnstoneError::ProtocolViolation)
    }
}

fn guest_string_ptr<S: GuestCpuState>(state: &S, io: &IoAccess) -> u64 {
    if io.direction_in {
        state.registers().rdi
    } else {
        state.registers().rsi
    }
}

fn passthrough_io<S: GuestCpuState>(
    vm: &mut Vm,
    state: &mut S,
    io: IoAccess,
    env: &mut VmExitEnv<'_>,
) -> Result<(), TurnstoneError> {
    let mask = io_mask(io.size);
    let ports = env.platform.io_port();
    let count = if io.rep { state.registers().rcx } else { 1 };
    let decrement = state.rflags() & RFLAGS_DF != 0;

    if io.string {
        let base = guest_string_ptr(state, &io);
        let cr3 = state.cr3();
        let step = io.size as u64;

        for i in 0..count {
            let gva = if decrement {
                base.wrapping_sub(i * step)
            } else {
                base.wrapping_add(i * step)
            };

            let hpa = vm
                .nested
                .translate_gva(env.platform, cr3, gva)
                .ok_or(TurnstoneError::ProtocolViolation)?;

            if io.direction_in {
                let value: u32 = match io.size {
                    1 => ports.inb(io.port) as u32,
                    2 => ports.inw(io.port) as u32,
                    _ => ports.inl(io.port),
                };
                // SAFETY: translated guest addresses point into
                // VM-owned RAM.
                unsafe {
                    env.platform
                        .phys_write(hpa, &value.to_le_bytes()[..io.size as usize]);
                }
            } else {
                let mut buf = [0u8; 4];
                // SAFETY: same as above.
                unsafe {
                    env.platform.phys_read(hpa, &mut buf[..io.size as usize]);
                }
                let value = u32::from_le_bytes(buf);
                match io.size {
                    1 => ports.outb(io.port, value as u8),
                    2 => ports.outw(io.port, value as u16),
                    _ => ports.outl(io.port, value),
                }
            }
        }

        let moved = count * step;
        let registers = state.registers_mut();
        let cursor = if io.direction_in {
            &mut registers.rdi
        } else {
            &mut registers.rsi
        };
        if decrement {
            *cursor = cursor.wrapping_sub(moved);
        } else {
            *cursor = cursor.wrapping_add(moved);
        }
        if io.rep {
            registers.rcx = 0;
        }
    } else if io.direction_in {
        let value: u64 = match io.size {
            1 => ports.inb(io.port) as u64,
            2 => ports.inw(io.port) as u64,
            _ => ports.inl(io.port) as u64,
        };
        let registers = state.registers_mut();
        registers.rax = (registers.rax & !mask) | (value & mask);
    } else {
        let value = state.registers().rax & mask;
        match io.size {
            1 => ports.outb(io.port, value as u8),
            2 => ports.outw(io.port, value as u16),
            _ => ports.outl(io.port, value as u32),
        }
    }

    Ok(())
}

/// Emulated guest debug serial port: bytes end up on the host serial
/// line. The rep-string form copies straight out of guest memory
/// through the nested translation.
fn emulate_serial_out<S: GuestCpuState>(
    vm: &mut Vm,
    state: &mut S,
    io: IoAccess,
    env: &mut VmExitEnv<'_>,
) -> Result<(), TurnstoneError> {
    if io.string && io.rep {
        let count = state.registers().rcx;
        let base = state.registers().rsi;
        let cr3 = state.cr3();
        let decrement = state.rflags() & RFLAGS_DF != 0;
        let step = io.size as u64;

        let mut bytes: Vec<u8> = Vec::with_capacity((count * step) as usize);
        for i in 0..count {
            let gva = if decrement {
                base.wrapping_sub(i * step)
            } else {
                base.wrapping_add(i * step)
            };
            let hpa = vm
                .nested
                .translate_gva(env.platform, cr3, gva)
                .ok_or(TurnstoneError::ProtocolViolation)?;
            let mut buf = [0u8; 4];
            // SAFETY: translated guest addresses point into VM-owned
            // RAM.
            unsafe {
                env.platform.phys_read(hpa, &mut buf[..io.size as usize]);
            }
            bytes.extend_from_slice(&buf[..io.size as usize]);
        }

        env.platform.serial_out(&bytes);

        let moved = count * step;
        let registers = state.registers_mut();
        if decrement {
            registers.rsi = registers.rsi.wrapping_sub(moved);
        } else {
            registers.rsi = registers.rsi.wrapping_add(moved);
        }
        registers.rcx = 0;
    } else {
        let data = state.registers().rax & io_mask(io.size);
        let bytes = data.to_le_bytes();
        env.platform.serial_out(&bytes[..io.size as usize]);
    }

    Ok(())
}

fn handle_vmcall<S: GuestCpuState>(
    vm: &mut Vm,
    state: &mut S,
    env: &mut VmExitEnv<'_>,
) -> Result<VmExitAction, TurnstoneError> {
    let registers = *state.registers();
    let number = registers.rax;

    log::debug!("vmcall {:#x}", number);

    let result = match number {
        VMCALL_EXIT => {
            log::info!("vmcall exit {:#x}", registers.rdi);
            return Ok(VmExitAction::GuestExit(registers.rdi as i64));
        }
        VMCALL_GVA_TO_HPA => vm
            .nested
            .translate_gva(env.platform, state.cr3(), registers.rdi)
            .map(|pa| pa.bits())
            .unwrap_or(u64::MAX),
        VMCALL_ATTACH_PCI_DEV => env
            .vmcalls
            .attach_pci_device(vm, env.frames, registers.rdi)
            .unwrap_or(u64::MAX),
        VMCALL_ATTACH_INTERRUPT => env
            .vmcalls
            .attach_interrupt(vm, registers.rdi, registers.rsi, registers.rdx as u8)
            .unwrap_or(u64::MAX),
        VMCALL_LOAD_MODULE => env
            .vmcalls
            .load_module(vm, env.frames, registers.r11)
            .unwrap_or(u64::MAX),
        _ => {
            log::error!("unknown vmcall {:#x}", number);
            u64::MAX
        }
    };

    state.registers_mut().rax = result;
    state.advance_rip();

    Ok(VmExitAction::Continue)
}

#[cfg(test)]
pub(crate) mod tests {
    extern crate alloc;

    use super::*;
    use crate::address::PhysAddr;
    use crate::collections::InsertAt;
    use crate::hypervisor::nested::NestedPageTable;
    use crate::hypervisor::{InterruptDispatcher, TaskServices, VmcallServices};
    use crate::mm::frame::{FrameAllocationFlags, FrameAllocator, FRAME_SIZE};
    use crate::mm::{BootMemoryType, MemoryMapEntry};
    use crate::platform::test::TestPlatform;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use cpuarch::x86::{GuestRegisters, RFLAGS_IF};

    pub(crate) struct MockCpuState {
        pub registers: GuestRegisters,
        pub rip: u64,
        pub rsp: u64,
        pub rflags: u64,
        pub cr3: u64,
        pub efer: u64,
        pub instruction_length: u64,
        pub injected: Vec<u8>,
        pub interrupt_window: bool,
    }

    impl Default for MockCpuState {
        fn default() -> Self {
            Self {
                registers: GuestRegisters::default(),
                rip: 0x1000,
                rsp: 0x8000,
                rflags: RFLAGS_IF,
                cr3: 0,
                efer: 0xD00,
                instruction_length: 3,
                injected: Vec::new(),
                interrupt_window: false,
            }
        }
    }

    impl GuestCpuState for MockCpuState {
        fn registers(&self) -> &GuestRegisters {
            &self.registers
        }
        fn registers_mut(&mut self) -> &mut GuestRegisters {
            &mut self.registers
        }
        fn rip(&self) -> u64 {
            self.rip
        }
        fn set_rip(&mut self, rip: u64) {
            self.rip = rip;
        }
        fn rsp(&self) -> u64 {
            self.rsp
        }
        fn rflags(&self) -> u64 {
            self.rflags
        }
        fn cr3(&self) -> u64 {
            self.cr3
        }
        fn set_cr3(&mut self, value: u64) {
            self.cr3 = value;
        }
        fn efer(&self) -> u64 {
            self.efer
        }
        fn set_efer(&mut self, value: u64) {
            self.efer = value;
        }
        fn instruction_length(&self) -> u64 {
            self.instruction_length
        }
        fn advance_rip(&mut self) {
            self.rip += self.instruction_length;
        }
        fn inject_interrupt(&mut self, vector: u8) {
            self.injected.push(vector);
        }
        fn set_interrupt_window(&mut self, enabled: bool) {
            self.interrupt_window = enabled;
        }
    }

    #[derive(Default)]
    pub(crate) struct MockTasks {
        pub yields: u64,
        pub message_waits: u64,
    }

    impl TaskServices for MockTasks {
        fn task_yield(&mut self) {
            self.yields += 1;
        }
        fn set_message_waiting(&mut self) {
            self.message_waits += 1;
        }
    }

    #[derive(Default)]
    pub(crate) struct MockInterrupts {
        pub dispatched: Vec<u64>,
    }

    impl InterruptDispatcher for MockInterrupts {
        fn dispatch(&mut self, frame: &InterruptFrame) {
            self.dispatched.push(frame.interrupt_number);
        }
    }

    #[derive(Default)]
    pub(crate) struct MockVmcalls {
        pub loaded_modules: Vec<u64>,
    }

    impl VmcallServices for MockVmcalls {
        fn attach_pci_device(
            &mut self,
            _vm: &mut Vm,
            _frames: &mut FrameAllocator,
            address: u64,
        ) -> Result<u64, TurnstoneError> {
            Ok(address + 1)
        }

        fn attach_interrupt(
            &mut self,
            vm: &mut Vm,
            _pci_dev_address: u64,
            _interrupt_kind: u64,
            interrupt_number: u8,
        ) -> Result<u64, TurnstoneError> {
            vm.lapic.request_vector(interrupt_number);
            Ok(0)
        }

        fn load_module(
            &mut self,
            _vm: &mut Vm,
            _frames: &mut FrameAllocator,
            got_entry_address: u64,
        ) -> Result<u64, TurnstoneError> {
            self.loaded_modules.push(got_entry_address);
            Ok(0xCAFE_0000)
        }
    }

    pub(crate) struct TestRig {
        pub platform: Arc<TestPlatform>,
        pub frames: FrameAllocator,
        pub vm: Vm,
        pub state: MockCpuState,
        pub tasks: MockTasks,
        pub interrupts: MockInterrupts,
        pub vmcalls: MockVmcalls,
    }

    impl TestRig {
        pub fn new() -> Self {
            let entries = [MemoryMapEntry {
                physical_start: 0x100000,
                page_count: 0x400,
                entry_type: BootMemoryType::Conventional,
                attribute: 0,
            }];
            let platform = Arc::new(TestPlatform::new(PhysAddr::null(), 0x500000));
            let mut frames = FrameAllocator::new(&entries, platform.clone());

            let ram = frames
                .allocate_by_count(64, FrameAllocationFlags::BLOCK)
                .unwrap();
            let mut nested =
                NestedPageTable::new(&mut frames, platform.as_ref(), 0, ram).unwrap();
            for page in 0..64u64 {
                nested
                    .handle_page_fault(&mut frames, platform.as_ref(), page * FRAME_SIZE)
                    .unwrap();
            }

            let mut vm = Vm::new(nested);

            // Guest identity page tables at guest-physical 0x20000.
            vm.nested
                .build_identity_guest_tables(platform.as_ref(), 0x20000, 1 << 21)
                .unwrap();

            let state = MockCpuState {
                cr3: 0x20000,
                ..MockCpuState::default()
            };

            Self {
                platform,
                frames,
                vm,
                state,
                tasks: MockTasks::default(),
                interrupts: MockInterrupts::default(),
                vmcalls: MockVmcalls::default(),
            }
        }

        pub fn handle(&mut self, exit: VmExit) -> Result<VmExitAction, TurnstoneError> {
            let mut env = VmExitEnv {
                platform: self.platform.as_ref(),
                frames: &mut self.frames,
                tasks: &mut self.tasks,
                interrupts: &mut self.interrupts,
                vmcalls: &mut self.vmcalls,
            };
            handle_vmexit(&mut self.vm, &mut self.state, exit, &mut env)
        }
    }

    #[test]
    fn test_hlt_halts_and_advances_on_request() {
        let mut rig = TestRig::new();
        let rip = rig.state.rip;

        rig.handle(VmExit::Hlt).unwrap();
        assert!(rig.vm.is_halted);
        assert_eq!(rig.tasks.yields, 1);
        assert_eq!(rig.state.rip, rip);

        rig.vm.is_halt_need_next_instruction = true;
        rig.handle(VmExit::Hlt).unwrap();
        assert!(!rig.vm.is_halted);
        assert_eq!(rig.state.rip, rip + rig.state.instruction_length);
    }

    #[test]
    fn test_pause_yields_and_advances() {
        let mut rig = TestRig::new();
        let rip = rig.state.rip;
        rig.handle(VmExit::Pause).unwrap();
        assert_eq!(rig.tasks.yields, 1);
        assert!(!rig.vm.is_halted);
        assert_eq!(rig.state.rip, rip + rig.state.instruction_length);
    }

    #[test]
    fn test_cr3_access_uses_r15_only() {
        let mut rig = TestRig::new();

        rig.state.registers.r15 = 0x7000;
        rig.handle(VmExit::Cr3Access {
            write: true,
            register: 15,
        })
        .unwrap();
        assert_eq!(rig.state.cr3, 0x7000);

        rig.state.registers.r15 = 0;
        rig.handle(VmExit::Cr3Access {
            write: false,
            register: 15,
        })
        .unwrap();
        assert_eq!(rig.state.registers.r15, 0x7000);

        assert_eq!(
            rig.handle(VmExit::Cr3Access {
                write: true,
                register: 3
            }),
            Err(TurnstoneError::ProtocolViolation)
        );
    }

    #[test]
    fn test_cpuid_passes_host_result() {
        let mut rig = TestRig::new();
        rig.state.registers.rax = 7;
        rig.state.registers.rcx = 2;
        rig.handle(VmExit::Cpuid).unwrap();
        assert_eq!(rig.state.registers.rax, 8);
        assert_eq!(rig.state.registers.rcx, 2);
        assert_eq!(rig.state.registers.rdx, 0xC0DE);
    }

    #[test]
    fn test_msr_map_fallthrough_roundtrip() {
        let mut rig = TestRig::new();

        rig.state.registers.rcx = 0xC000_1234;
        rig.state.registers.rax = 0xDEAD_BEEF;
        rig.state.registers.rdx = 0x1;
        rig.handle(VmExit::Wrmsr).unwrap();

        rig.state.registers.rax = 0;
        rig.state.registers.rdx = 0;
        rig.handle(VmExit::Rdmsr).unwrap();
        assert_eq!(rig.state.registers.rax, 0xDEAD_BEEF);
        assert_eq!(rig.state.registers.rdx, 0x1);
    }

    #[test]
    fn test_timer_initial_write_reloads_current() {
        let mut rig = TestRig::new();

        rig.state.registers.rcx = MSR_X2APIC_TIMER_INITIAL as u64;
        rig.state.registers.rax = 0x4000;
        rig.state.registers.rdx = 0;
        rig.handle(VmExit::Wrmsr).unwrap();

        assert_eq!(rig.vm.lapic.timer_initial_value, 0x4000);
        assert_eq!(rig.vm.lapic.timer_current_value, 0x4000);
        assert!(rig.vm.lapic_timer_enabled);
    }

    #[test]
    fn test_invalid_timer_divider_is_protocol_violation() {
        let mut rig = TestRig::new();

        rig.state.registers.rcx = MSR_X2APIC_TIMER_DIVIDER as u64;
        rig.state.registers.rax = 0x5;
        rig.state.registers.rdx = 0;
        assert_eq!(
            rig.handle(VmExit::Wrmsr),
            Err(TurnstoneError::ProtocolViolation)
        );

        rig.state.registers.rax = 0xB;
        rig.handle(VmExit::Wrmsr).unwrap();
        assert_eq!(rig.vm.lapic.timer_divider_realvalue, 1);
    }

    #[test]
    fn test_vapic_eoi_services_vectors_in_order() {
        let mut rig = TestRig::new();

        for vector in [0x20u8, 0x30, 0x40] {
            rig.vm.lapic.request_vector(vector);
        }
        rig.vm.need_to_notify = true;

        let mut serviced = Vec::new();
        for _ in 0..3 {
            rig.vm.find_next_x2apic_interrupt(
                rig.platform.as_ref(),
                rig.state.rflags,
                true,
                false,
            );
            serviced.push(rig.vm.lapic.in_service_vector);
            assert!(rig.vm.lapic.apic_eoi_pending);
            // Retire it the way the intercepted EOI write does.
            rig.vm.find_next_x2apic_interrupt(
                rig.platform.as_ref(),
                rig.state.rflags,
                false,
                true,
            );
        }

        assert_eq!(serviced, [0x20, 0x30, 0x40]);
        assert_eq!(rig.vm.lapic.in_service_vector, 0);
        assert!(!rig.vm.need_to_notify);
        assert!(!rig.vm.lapic.apic_eoi_pending);
    }

    #[test]
    fn test_interrupt_window_injects_lowest_vector() {
        let mut rig = TestRig::new();

        rig.vm.lapic.request_vector(0x30);
        rig.vm.lapic.request_vector(0x21);
        rig.vm.need_to_notify = true;

        rig.handle(VmExit::InterruptWindow).unwrap();
        assert_eq!(rig.state.injected, [0x21]);
        assert_eq!(rig.vm.lapic.in_service_vector, 0x21);
        assert!(rig.vm.lapic.apic_eoi_pending);
        assert!(!rig.vm.need_to_notify);
    }

    #[test]
    fn test_interrupt_window_without_pending_disarms() {
        let mut rig = TestRig::new();
        rig.state.interrupt_window = true;
        rig.handle(VmExit::InterruptWindow).unwrap();
        assert!(!rig.state.interrupt_window);
        assert!(rig.state.injected.is_empty());
    }

    #[test]
    fn test_serial_port_emulation_single_byte() {
        let mut rig = TestRig::new();

        rig.state.registers.rax = 0x41;
        rig.handle(VmExit::Io(IoAccess {
            port: 0x3F8,
            size: 1,
            direction_in: false,
            string: false,
            rep: false,
        }))
        .unwrap();

        assert_eq!(rig.platform.serial_captured(), b"A");
    }

    #[test]
    fn test_serial_port_emulation_fast_string() {
        let mut rig = TestRig::new();

        // Place "hello" into guest RAM at guest-virtual 0x5000
        // (identity-mapped onto the RAM window).
        let host = rig
            .vm
            .nested
            .translate_gpa(rig.platform.as_ref(), 0x5000)
            .unwrap();
        rig.platform.write_mem(host, b"hello");

        rig.state.registers.rsi = 0x5000;
        rig.state.registers.rcx = 5;
        rig.handle(VmExit::Io(IoAccess {
            port: 0x3F8,
            size: 1,
            direction_in: false,
            string: true,
            rep: true,
        }))
        .unwrap();

        assert_eq!(rig.platform.serial_captured(), b"hello");
        assert_eq!(rig.state.registers.rsi, 0x5005);
        assert_eq!(rig.state.registers.rcx, 0);
    }

    #[test]
    fn test_io_to_unmapped_port_fails_guest() {
        let mut rig = TestRig::new();
        assert_eq!(
            rig.handle(VmExit::Io(IoAccess {
                port: 0x70,
                size: 1,
                direction_in: false,
                string: false,
                rep: false,
            })),
            Err(TurnstoneError::ProtocolViolation)
        );
    }

    #[test]
    fn test_mapped_port_passthrough() {
        let mut rig = TestRig::new();
        rig.vm.mapped_io_ports.insert_at(InsertAt::Sorted, 0x60);

        rig.state.registers.rax = 0xFE;
        rig.handle(VmExit::Io(IoAccess {
            port: 0x60,
            size: 1,
            direction_in: false,
            string: false,
            rep: false,
        }))
        .unwrap();
        assert_eq!(rig.platform.last_port_write(), Some((0x60, 0xFE)));

        rig.handle(VmExit::Io(IoAccess {
            port: 0x60,
            size: 1,
            direction_in: true,
            string: false,
            rep: false,
        }))
        .unwrap();
        assert_eq!(rig.state.registers.rax & 0xFF, 0x5A);
    }

    #[test]
    fn test_vmcall_gva_to_hpa() {
        let mut rig = TestRig::new();

        // Guest-virtual 0x4000 is identity-mapped to guest-physical
        // 0x4000; the nested tables place that inside the RAM window.
        let expected = rig
            .vm
            .nested
            .translate_gpa(rig.platform.as_ref(), 0x4000)
            .unwrap();

        rig.state.registers.rax = VMCALL_GVA_TO_HPA;
        rig.state.registers.rdi = 0x4000;
        let rip = rig.state.rip;

        rig.handle(VmExit::Vmcall).unwrap();
        assert_eq!(rig.state.registers.rax, expected.bits());
        assert_eq!(rig.state.rip, rip + rig.state.instruction_length);
    }

    #[test]
    fn test_vmcall_gva_to_hpa_follows_remapped_page() {
        use crate::mm::paging::PteFlags;

        let mut rig = TestRig::new();

        // Rewire guest-physical 0x4000 to host-physical 0xAB000; the
        // guest-virtual address still resolves through the guest's own
        // identity tables first.
        {
            let TestRig {
                platform,
                frames,
                vm,
                ..
            } = &mut rig;
            vm.nested
                .map_4k(
                    frames,
                    platform.as_ref(),
                    0x4000,
                    PhysAddr::new(0xAB000),
                    PteFlags::PRESENT | PteFlags::WRITABLE,
                )
                .unwrap();
        }

        rig.state.registers.rax = VMCALL_GVA_TO_HPA;
        rig.state.registers.rdi = 0x4000;
        let rip = rig.state.rip;

        rig.handle(VmExit::Vmcall).unwrap();
        assert_eq!(rig.state.registers.rax, 0xAB000);
        assert_eq!(rig.state.rip, rip + rig.state.instruction_length);
    }

    #[test]
    fn test_vmcall_exit_ends_guest() {
        let mut rig = TestRig::new();
        rig.state.registers.rax = VMCALL_EXIT;
        rig.state.registers.rdi = 3;
        assert_eq!(rig.handle(VmExit::Vmcall), Ok(VmExitAction::GuestExit(3)));
    }

    #[test]
    fn test_vmcall_load_module() {
        let mut rig = TestRig::new();
        rig.state.registers.rax = VMCALL_LOAD_MODULE;
        rig.state.registers.r11 = 0x1234;
        rig.handle(VmExit::Vmcall).unwrap();
        assert_eq!(rig.state.registers.rax, 0xCAFE_0000);
        assert_eq!(rig.vmcalls.loaded_modules, [0x1234]);
    }

    #[test]
    fn test_unknown_vmcall_returns_error_to_guest() {
        let mut rig = TestRig::new();
        rig.state.registers.rax = 99;
        rig.handle(VmExit::Vmcall).unwrap();
        assert_eq!(rig.state.registers.rax, u64::MAX);
    }

    #[test]
    fn test_external_interrupt_dispatches_frame() {
        let mut rig = TestRig::new();
        rig.handle(VmExit::ExternalInterrupt {
            vector: 0x21,
            error_code: 0,
        })
        .unwrap();
        assert_eq!(rig.interrupts.dispatched, [0x21]);
    }

    #[test]
    fn test_nested_page_fault_installs_mapping() {
        let mut rig = TestRig::new();
        // Fault on an unmapped page inside guest RAM.
        rig.handle(VmExit::NestedPageFault {
            fault_gpa: 0x3C000,
            error_code: 0,
        })
        .unwrap();
        assert!(rig
            .vm
            .nested
            .translate_gpa(rig.platform.as_ref(), 0x3C000)
            .is_some());
    }

    #[test]
    fn test_unknown_exit_is_protocol_violation() {
        let mut rig = TestRig::new();
        assert_eq!(
            rig.handle(VmExit::Unknown(0x999)),
            Err(TurnstoneError::ProtocolViolation)
        );
    }
}
