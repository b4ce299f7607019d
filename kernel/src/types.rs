// SPDX-License-Identifier: MIT OR Apache-2.0

pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
pub const PAGE_SIZE_2M: usize = 1 << 21;

/// Frames per 2 MiB large page. A block request that is a multiple of
/// this prefers 2 MiB-aligned extents.
pub const LARGE_PAGE_FRAMES: u64 = (PAGE_SIZE_2M / PAGE_SIZE) as u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageSize {
    Regular,
    Huge,
}
