// SPDX-License-Identifier: GPL-3.0-or-later

//! Confidential, integrity-protected block-device stack and filesystem for a trusted-execution-
//! environment runtime.
//!
//! The crate is layered bottom-up, mirroring how a caller actually assembles a mounted
//! filesystem: a [`host`] transport carries raw blocks across the enclave boundary, [`device`]
//! stacks a cache and an authenticated/Merkle layer on top of it, [`fs`] implements OEFS over the
//! resulting [`device::DeviceHandle`], [`mount`] resolves paths across multiple mounted
//! filesystem instances, and [`facade`] exposes the whole thing as a descriptor-based POSIX-like
//! API. [`heap`] is independent of the rest: a page-granular virtual-address allocator used by
//! the same runtime for process address spaces.

pub mod bytes;
pub mod crypto;
pub mod device;
pub mod error;
pub mod facade;
pub mod fs;
pub mod heap;
pub mod host;
pub mod key;
pub mod mount;

pub use error::{Error, Result};
