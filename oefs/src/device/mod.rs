// SPDX-License-Identifier: GPL-3.0-or-later

//! The block-device stack: every layer between the host transport and the filesystem core
//! satisfies the same narrow interface (`spec.md` §4.B), so the filesystem never needs to know
//! whether it is talking to a cache, a Merkle-authenticated layer, or the raw device directly.

pub mod cache;
pub mod merkle;
pub mod raw;

use crate::error::Result;
use std::sync::Arc;

/// Fixed block size in bytes used by every layer of the device stack and by OEFS itself.
pub const BLOCK_SIZE: usize = 1024;

/// A shared handle to a layer of the device stack.
///
/// Refcounting is `Arc`'s: cloning a `DeviceHandle` is `add_ref`, dropping the last clone is
/// `release`, and releasing the device below happens automatically because each layer holds its
/// own `DeviceHandle` to the next one (`spec.md` §9, "Layered devices with shared inner layer").
pub type DeviceHandle = Arc<dyn BlockDevice>;

/// Uniform interface satisfied by every layer of the block-device stack.
///
/// Contract (`spec.md` §4.B): `get` must return the content of the last committed `put` for that
/// `blkno`; a `put` is durable only after the matching `end` reaches the bottom device.
/// `begin`/`end` pairs may nest; only the outermost `end` is required to flush.
pub trait BlockDevice: Send + Sync {
	/// Reads the block `blkno` into `out`, which must be exactly [`BLOCK_SIZE`] bytes.
	fn get(&self, blkno: u32, out: &mut [u8]) -> Result<()>;
	/// Writes `data` (exactly [`BLOCK_SIZE`] bytes) to block `blkno`.
	fn put(&self, blkno: u32, data: &[u8]) -> Result<()>;
	/// Opens a batched transaction window. Windows may nest.
	fn begin(&self) -> Result<()>;
	/// Closes a transaction window opened by `begin`. Flushes once the outermost window closes.
	fn end(&self) -> Result<()>;
	/// Total number of addressable blocks on this device.
	fn block_count(&self) -> u32;
}

/// Tracks nested `begin`/`end` windows for a single device layer.
///
/// Layers that need to defer work until the outermost `end` (the cache and Merkle layers) embed
/// one of these behind a lock rather than duplicating the nesting arithmetic.
#[derive(Default)]
pub(crate) struct TxDepth(pub(crate) u32);

impl TxDepth {
	/// Returns `true` the first time a window is opened (depth goes `0 -> 1`).
	pub fn enter(&mut self) -> bool {
		self.0 += 1;
		self.0 == 1
	}

	/// Returns `true` when the outermost window just closed (depth goes `1 -> 0`).
	///
	/// Ignores extra `end()` calls with no matching `begin()` rather than underflowing, since a
	/// stray `end()` should surface as a flush, not a panic.
	pub fn leave(&mut self) -> bool {
		if self.0 == 0 {
			return true;
		}
		self.0 -= 1;
		self.0 == 0
	}
}
