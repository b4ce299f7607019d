// SPDX-License-Identifier: MIT OR Apache-2.0

pub mod list;

pub use list::{Cursor, DeleteAt, Indexer, InsertAt, List};
