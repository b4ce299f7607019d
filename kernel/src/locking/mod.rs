// SPDX-License-Identifier: MIT OR Apache-2.0

pub mod common;
pub mod spinlock;

pub use common::{IrqGuardLocking, IrqLocking, UnguardedLocking};
pub use spinlock::{RawLockGuard, SpinLock, SpinLockGuard, SpinLockGuardIrqSafe, SpinLockIrqSafe};
