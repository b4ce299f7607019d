// SPDX-License-Identifier: MIT OR Apache-2.0

//! TOSDB manager: the single service task that owns the module store,
//! the kernel GOT, and the deployed-module memo map. Build requests
//! arrive through a queue and complete through the requester's
//! interrupt flag, so callers block on the IPC completion rather than
//! on the build itself.

extern crate alloc;

use super::{got_buffer_bytes, GotEntry, LinkerContext, ModuleStore};
use crate::collections::List;
use crate::error::TurnstoneError;
use crate::mm::frame::{FrameAllocationFlags, FrameAllocator, FrameExtent, FRAME_SIZE};
use crate::platform::Platform;
use crate::task::{TaskId, TaskSystem};

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

/// Result of one program/module build handed back to the requester.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgramBuild {
    pub program_handle: u64,
    pub program_dump_frame: FrameExtent,
    pub program_size: u64,
    pub program_physical_address: u64,
    pub program_virtual_address: u64,
    pub entry_point_virtual_address: u64,
    pub got_physical_address: u64,
    pub got_size: u64,
    pub metadata_physical_address: u64,
    pub metadata_size: u64,
}

#[derive(Clone, Copy, Debug)]
struct DeployedModule {
    program_dump_frame: FrameExtent,
    program_size: u64,
    program_physical_address: u64,
    program_virtual_address: u64,
    entry_point_virtual_address: u64,
    metadata_physical_address: u64,
    metadata_size: u64,
}

/// A build request as queued towards the manager task.
#[derive(Clone, Debug)]
pub enum ManagerRequest {
    ProgramLoad {
        entry_point_name: String,
        for_vm: bool,
        sender: TaskId,
    },
    ModuleLoad {
        module_id: u64,
        for_vm: bool,
        sender: TaskId,
    },
    Close,
}

#[derive(Clone, Copy, Debug)]
pub struct ManagerResponse {
    pub sender: TaskId,
    pub result: Result<ProgramBuild, TurnstoneError>,
}

pub struct TosdbManager<S: ModuleStore> {
    store: S,
    deployed: BTreeMap<u64, DeployedModule>,
    got_buffer: Vec<GotEntry>,
    got_symbol_index: BTreeMap<u64, u64>,
    requests: List<ManagerRequest>,
    closed: bool,
}

impl<S: ModuleStore> core::fmt::Debug for TosdbManager<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TosdbManager")
            .field("deployed", &self.deployed.len())
            .field("got_entries", &self.got_buffer.len())
            .finish()
    }
}

impl<S: ModuleStore> TosdbManager<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            deployed: BTreeMap::new(),
            got_buffer: Vec::new(),
            got_symbol_index: BTreeMap::new(),
            requests: List::with_comparator(|_, _| core::cmp::Ordering::Equal),
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Queues a request; the manager task drains the queue from its
    /// service loop.
    pub fn enqueue(&mut self, request: ManagerRequest) {
        self.requests.queue_push(request);
    }

    /// Drains every queued request, completing each sender through its
    /// interrupt flag.
    pub fn process_requests(
        &mut self,
        frames: &mut FrameAllocator,
        platform: &dyn Platform,
        tasks: &mut TaskSystem,
    ) -> Vec<ManagerResponse> {
        let mut responses = Vec::new();

        while let Some(request) = self.requests.queue_pop() {
            match request {
                ManagerRequest::Close => {
                    log::debug!("manager received close message");
                    self.closed = true;
                }
                ManagerRequest::ProgramLoad {
                    entry_point_name,
                    for_vm,
                    sender,
                } => {
                    let result = self.build_program(&entry_point_name, for_vm, frames, platform);
                    tasks.set_interrupt_received(sender);
                    responses.push(ManagerResponse { sender, result });
                }
                ManagerRequest::ModuleLoad {
                    module_id,
                    for_vm,
                    sender,
                } => {
                    let result = self.build_module(module_id, 0, for_vm, frames, platform);
                    tasks.set_interrupt_received(sender);
                    responses.push(ManagerResponse { sender, result });
                }
            }
        }

        responses
    }

    /// Clones the kernel GOT into a fresh run of physical frames and
    /// returns its address and frame-rounded size.
    fn clone_global_offset_table(
        &self,
        frames: &mut FrameAllocator,
        platform: &dyn Platform,
    ) -> Result<(u64, u64, FrameExtent), TurnstoneError> {
        let bytes = got_buffer_bytes(&self.got_buffer);
        let size = (bytes.len() as u64).div_ceil(FRAME_SIZE) * FRAME_SIZE;

        let extent = frames.allocate_by_count(size / FRAME_SIZE, FrameAllocationFlags::BLOCK)?;

        for page in 0..extent.count {
            platform.zero_frame(extent.start + page * FRAME_SIZE);
        }

        // SAFETY: the extent was just allocated for this clone.
        unsafe {
            platform.phys_write(extent.start, &bytes);
        }

        Ok((extent.start.bits(), size, extent))
    }

    /// Resolves the entry point name through the symbol and section
    /// tables, then builds its module.
    pub fn build_program(
        &mut self,
        entry_point_name: &str,
        for_vm: bool,
        frames: &mut FrameAllocator,
        platform: &dyn Platform,
    ) -> Result<ProgramBuild, TurnstoneError> {
        let symbol = self.store.symbol_by_name(entry_point_name)?;
        let section = self.store.section_by_id(symbol.section_id)?;

        log::debug!(
            "entrypoint symbol {} id {:#x} section id {:#x} module id {:#x}",
            entry_point_name,
            symbol.id,
            section.id,
            section.module_id
        );

        self.build_module(section.module_id, symbol.id, for_vm, frames, platform)
    }

    /// Builds (or returns the memoized) module image and hands out a
    /// fresh GOT clone either way.
    pub fn build_module(
        &mut self,
        module_id: u64,
        entrypoint_symbol_id: u64,
        for_vm: bool,
        frames: &mut FrameAllocator,
        platform: &dyn Platform,
    ) -> Result<ProgramBuild, TurnstoneError> {
        log::debug!("module id {:#x}", module_id);

        if let Some(deployed) = self.deployed.get(&module_id) {
            let (got_pa, got_size, _) = self.clone_global_offset_table(frames, platform)?;

            return Ok(ProgramBuild {
                program_handle: module_id,
                program_dump_frame: deployed.program_dump_frame,
                program_size: deployed.program_size,
                program_physical_address: deployed.program_physical_address,
                program_virtual_address: deployed.program_virtual_address,
                entry_point_virtual_address: deployed.entry_point_virtual_address,
                got_physical_address: got_pa,
                got_size,
                metadata_physical_address: deployed.metadata_physical_address,
                metadata_size: deployed.metadata_size,
            });
        }

        let mut ctx = LinkerContext::new(
            &mut self.store,
            &mut self.got_buffer,
            &mut self.got_symbol_index,
            entrypoint_symbol_id,
            for_vm,
        );

        ctx.build_module(module_id)?;
        log::debug!("modules built");

        ctx.calculate_program_size()?;

        let total_size = ctx.program_size + ctx.metadata_size;
        let frame_count = total_size.div_ceil(FRAME_SIZE);

        let dump_frame = frames.allocate_by_count(frame_count, FrameAllocationFlags::BLOCK)?;

        // Everything after this point must hand the dump frame back on
        // failure.
        let build_result = (|| {
            for page in 0..dump_frame.count {
                platform.zero_frame(dump_frame.start + page * FRAME_SIZE);
            }

            ctx.program_start_physical = dump_frame.start.bits();
            ctx.program_start_virtual = dump_frame.start.bits();

            ctx.bind_linear_addresses()?;
            ctx.bind_got_entry_values()?;

            let mut dump = alloc::vec![0u8; total_size as usize];
            ctx.link_program(&mut dump)?;

            // SAFETY: the dump frame was just allocated for this
            // build.
            unsafe {
                platform.phys_write(dump_frame.start, &dump);
            }

            Ok((
                ctx.program_size,
                ctx.program_start_physical,
                ctx.program_start_virtual,
                ctx.entrypoint_address_virtual,
                ctx.metadata_size,
            ))
        })();

        let (program_size, program_pa, program_va, entry_va, metadata_size) = match build_result {
            Ok(values) => values,
            Err(err) => {
                log::error!("cannot build module: {:?}", err);
                if let Err(release_err) = frames.release(dump_frame) {
                    log::warn!("dump frame release failed: {:?}", release_err);
                }
                return Err(err);
            }
        };

        let (got_pa, got_size, _) = self.clone_global_offset_table(frames, platform)?;

        let deployed = DeployedModule {
            program_dump_frame: dump_frame,
            program_size,
            program_physical_address: program_pa,
            program_virtual_address: program_va,
            entry_point_virtual_address: entry_va,
            metadata_physical_address: program_pa,
            metadata_size,
        };
        self.deployed.insert(module_id, deployed);

        log::debug!("program dump frame address: {:#x}", program_pa);
        log::debug!("program size: {:#x}", program_size);
        log::debug!("entry point virtual address: {:#x}", entry_va);
        log::debug!("got physical address: {:#x}", got_pa);

        Ok(ProgramBuild {
            program_handle: module_id,
            program_dump_frame: dump_frame,
            program_size,
            program_physical_address: program_pa,
            program_virtual_address: program_va,
            entry_point_virtual_address: entry_va,
            got_physical_address: got_pa,
            got_size,
            metadata_physical_address: program_pa,
            metadata_size,
        })
    }
}
