// SPDX-License-Identifier: MIT OR Apache-2.0

//! Raw x86-64 hardware definitions shared by the kernel and the
//! hypervisor backends: MSR numbers, control flags, the SVM VMCB
//! layout and exit codes, and the VMX exit reasons and field
//! encodings. No kernel types leak into this crate.

#![no_std]

pub mod vmcb;
pub mod vmcs;
pub mod x86;
