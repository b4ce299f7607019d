// SPDX-License-Identifier: MIT OR Apache-2.0

//! Turnstone OS kernel runtime substrate: physical frame allocator,
//! simple heap, the ordered linked list, the TOSDB record/table
//! surface, the dynamic module linker, and the hypervisor VM-exit
//! engine.

#![no_std]

pub mod address;
pub mod collections;
pub mod error;
pub mod hypervisor;
pub mod io;
pub mod kernel;
pub mod linker;
pub mod locking;
pub mod mm;
pub mod platform;
pub mod task;
pub mod tosdb;
pub mod types;
pub mod utils;
