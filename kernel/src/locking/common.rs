// SPDX-License-Identifier: MIT OR Apache-2.0

use core::marker::PhantomData;

/// Abstracts interrupt state handling when taking and releasing locks.
/// There are two implementations:
///
///   * [`IrqGuardLocking`] actually disables and enables IRQs in the
///     methods, ensuring that no interrupt can be taken while the lock
///     is held.
///   * [`UnguardedLocking`] performs no correctness checks when
///     locking. There is nothing to prevent interrupts that may
///     attempt to recursively acquire the lock.
pub trait IrqLocking {
    /// Associated helper function to modify interrupt state when a
    /// lock is acquired. This is used by lock implementations and will
    /// return an instance of the object.
    fn acquire_lock() -> Self;
}

/// Implements the state handling methods for locks that perform no checking.
#[derive(Debug, Default)]
pub struct UnguardedLocking {}

impl IrqLocking for UnguardedLocking {
    fn acquire_lock() -> Self {
        Self {}
    }
}

/// RAII guard for interrupt state. Interrupts are disabled on
/// construction; the saved state is restored on drop.
#[derive(Debug, Default)]
pub struct IrqGuard {
    was_enabled: bool,
}

impl IrqGuard {
    pub fn new() -> Self {
        let was_enabled = irqs_enabled();
        irqs_disable();
        Self { was_enabled }
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.was_enabled {
            irqs_enable();
        }
    }
}

/// Implements the state handling methods for locks that disable interrupts.
#[derive(Debug, Default)]
pub struct IrqGuardLocking {
    /// IrqGuard to keep track of IRQ state. IrqGuard implements Drop,
    /// which will re-enable IRQs when the struct goes out of scope.
    _guard: IrqGuard,
    /// Make type explicitly !Send + !Sync
    phantom: PhantomData<*const ()>,
}

impl IrqLocking for IrqGuardLocking {
    fn acquire_lock() -> Self {
        Self {
            _guard: IrqGuard::new(),
            phantom: PhantomData,
        }
    }
}

#[cfg(all(target_arch = "x86_64", not(test)))]
fn irqs_enabled() -> bool {
    let flags: u64;
    // SAFETY: reading RFLAGS has no side effects.
    unsafe {
        core::arch::asm!("pushfq", "pop {}", out(reg) flags, options(nomem, preserves_flags));
    }
    flags & cpuarch::x86::RFLAGS_IF != 0
}

#[cfg(all(target_arch = "x86_64", not(test)))]
fn irqs_disable() {
    // SAFETY: disabling interrupts is always safe in kernel context.
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack));
    }
}

#[cfg(all(target_arch = "x86_64", not(test)))]
fn irqs_enable() {
    // SAFETY: the caller restores a state that previously had
    // interrupts enabled.
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack));
    }
}

#[cfg(any(not(target_arch = "x86_64"), test))]
fn irqs_enabled() -> bool {
    false
}

#[cfg(any(not(target_arch = "x86_64"), test))]
fn irqs_disable() {}

#[cfg(any(not(target_arch = "x86_64"), test))]
fn irqs_enable() {}
