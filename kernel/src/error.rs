// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::hypervisor::apic::ApicError;
use crate::linker::LinkerError;
use crate::tosdb::TosdbError;

/// Central error type of the kernel substrate. The first eight
/// variants are the generic failure kinds shared by every component;
/// the remaining ones wrap component-specific errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnstoneError {
    OutOfMemory,
    InvalidArgument,
    NotFound,
    CapacityExceeded,
    HardwareTimeout,
    /// Bad magic or padding in an on-memory or on-disk structure.
    CorruptData,
    /// Unexpected VM-exit code, unknown hypercall, malformed request.
    ProtocolViolation,
    /// Feature masked off by capability registers.
    Unsupported,
    Apic(ApicError),
    Linker(LinkerError),
    Tosdb(TosdbError),
}

impl From<ApicError> for TurnstoneError {
    fn from(err: ApicError) -> Self {
        TurnstoneError::Apic(err)
    }
}

impl From<LinkerError> for TurnstoneError {
    fn from(err: LinkerError) -> Self {
        TurnstoneError::Linker(err)
    }
}

impl From<TosdbError> for TurnstoneError {
    fn from(err: TosdbError) -> Self {
        TurnstoneError::Tosdb(err)
    }
}
