// SPDX-License-Identifier: MIT OR Apache-2.0

//! VM entry/exit register exchange stubs. Everything here is the thin
//! assembly boundary; the exit engine proper is ordinary code that
//! receives the exchanged snapshot.
//!
//! Register block layout (field offsets of `GuestRegisters`):
//! rax 0x00, rbx 0x08, rcx 0x10, rdx 0x18, rsi 0x20, rdi 0x28,
//! rbp 0x30, r8 0x38 .. r15 0x70.

use cpuarch::x86::GuestRegisters;

// Host-save area lives one page behind the VMCB.
core::arch::global_asm!(
    r#"
    .global turnstone_svm_run_single
    .balign 16
turnstone_svm_run_single:
    push    rbp
    mov     rbp, rsp
    sub     rsp, 0x20
    mov     [rsp], rdi          // host register block
    mov     [rsp + 8], rsi      // guest register block
    mov     [rsp + 0x10], rdx   // vmcb physical address

    // Save host registers.
    mov     [rdi + 0x08], rbx
    mov     [rdi + 0x10], rcx
    mov     [rdi + 0x18], rdx
    mov     [rdi + 0x30], rbp
    mov     [rdi + 0x38], r8
    mov     [rdi + 0x40], r9
    mov     [rdi + 0x48], r10
    mov     [rdi + 0x50], r11
    mov     [rdi + 0x58], r12
    mov     [rdi + 0x60], r13
    mov     [rdi + 0x68], r14
    mov     [rdi + 0x70], r15

    // Save host state into the save page behind the VMCB.
    mov     rax, rdx
    add     rax, 0x1000
    vmsave  rax

    // Load guest registers; rsi goes last since it carries the block
    // pointer.
    mov     rbx, [rsi + 0x08]
    mov     rcx, [rsi + 0x10]
    mov     rdx, [rsi + 0x18]
    mov     rdi, [rsi + 0x28]
    mov     rbp, [rsi + 0x30]
    mov     r8,  [rsi + 0x38]
    mov     r9,  [rsi + 0x40]
    mov     r10, [rsi + 0x48]
    mov     r11, [rsi + 0x50]
    mov     r12, [rsi + 0x58]
    mov     r13, [rsi + 0x60]
    mov     r14, [rsi + 0x68]
    mov     r15, [rsi + 0x70]
    mov     rsi, [rsi + 0x20]

    mov     rax, [rsp + 0x10]
    vmload  rax
    vmrun   rax
    vmsave  rax

    // rsi holds the guest value; swap it with the stashed block
    // pointer before storing the rest.
    xchg    rsi, [rsp + 8]
    mov     [rsi + 0x08], rbx
    mov     [rsi + 0x10], rcx
    mov     [rsi + 0x18], rdx
    mov     [rsi + 0x28], rdi
    mov     [rsi + 0x30], rbp
    mov     [rsi + 0x38], r8
    mov     [rsi + 0x40], r9
    mov     [rsi + 0x48], r10
    mov     [rsi + 0x50], r11
    mov     [rsi + 0x58], r12
    mov     [rsi + 0x60], r13
    mov     [rsi + 0x68], r14
    mov     [rsi + 0x70], r15
    mov     rax, [rsp + 8]
    mov     [rsi + 0x20], rax

    // Restore host registers and the host save state.
    mov     rdi, [rsp]
    mov     rbx, [rdi + 0x08]
    mov     rcx, [rdi + 0x10]
    mov     rdx, [rdi + 0x18]
    mov     r8,  [rdi + 0x38]
    mov     r9,  [rdi + 0x40]
    mov     r10, [rdi + 0x48]
    mov     r11, [rdi + 0x50]
    mov     r12, [rdi + 0x58]
    mov     r13, [rdi + 0x60]
    mov     r14, [rdi + 0x68]
    mov     r15, [rdi + 0x70]

    mov     rax, [rsp + 0x10]
    add     rax, 0x1000
    vmload  rax

    add     rsp, 0x20
    pop     rbp
    ret
"#
);

core::arch::global_asm!(
    r#"
    .global turnstone_vmx_exit_stub
    .balign 16
turnstone_vmx_exit_stub:
    // Guest general purpose state; layout must match GuestRegisters
    // read back by the exit entry.
    push    r15
    push    r14
    push    r13
    push    r12
    push    r11
    push    r10
    push    r9
    push    r8
    push    rbp
    push    rdi
    push    rsi
    push    rdx
    push    rcx
    push    rbx
    push    rax

    mov     rdi, rsp
    call    turnstone_vmx_exit_entry

    mov     rsp, rax
    pop     rax
    pop     rbx
    pop     rcx
    pop     rdx
    pop     rsi
    pop     rdi
    pop     rbp
    pop     r8
    pop     r9
    pop     r10
    pop     r11
    pop     r12
    pop     r13
    pop     r14
    pop     r15

    vmresume
    // vmresume only falls through on failure.
    call    turnstone_vmx_entry_failed
2:
    cli
    hlt
    jmp     2b
"#
);

extern "C" {
    /// Exchanges host and guest register state around one VMRUN.
    pub fn turnstone_svm_run_single(
        host_registers: &mut GuestRegisters,
        guest_registers: &mut GuestRegisters,
        vmcb_pa: u64,
    );
}

/// Entered from the VMX exit stub with a pointer to the pushed guest
/// register block; returns the stack pointer to resume from.
#[no_mangle]
extern "C" fn turnstone_vmx_exit_entry(saved: *mut GuestRegisters) -> *mut GuestRegisters {
    // The full exit handling runs from the guest task's run loop; the
    // stub only needs the register block back.
    saved
}

#[no_mangle]
extern "C" fn turnstone_vmx_entry_failed() {
    let error = super::vmx::vmread(cpuarch::vmcs::VMX_VM_INSTRUCTION_ERROR);
    log::error!("vm entry failed: instruction error {:#x}", error);
}
