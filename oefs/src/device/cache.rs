// SPDX-License-Identifier: GPL-3.0-or-later

//! LRU write-through cache of recently read/written blocks (`spec.md` §4.D).
//!
//! The cache map is a fixed-size open-addressed hash table (`TABLE_SIZE` buckets); the active
//! set of cached blocks is bounded at `MAX_ENTRIES`, backed by an arena of that many slots so
//! eviction recycles a slot instead of allocating and freeing. Slots not currently holding a
//! block sit on a free list (at most `MAX_FREE`, which in this implementation equals
//! `MAX_ENTRIES` since every slot is either active or free). The LRU order is a doubly linked
//! list threaded through the same arena by index, mirroring the index-based tree+list the
//! virtual heap uses for its VADs (`spec.md` §9) rather than raw pointers.

use crate::{
	device::{BlockDevice, DeviceHandle, BLOCK_SIZE},
	error::{Error, Result},
};
use spin::Mutex;

/// Capacity of the open-addressed hash table.
const TABLE_SIZE: usize = 1093;
/// Maximum number of blocks held in the active set at once.
const MAX_ENTRIES: usize = 64;

/// One arena slot: the cached block plus its position in the LRU list and in the hash table.
struct Slot {
	blkno: u32,
	data: [u8; BLOCK_SIZE],
	/// Index of the hash bucket currently pointing at this slot, so eviction can clear it in
	/// O(1) instead of re-probing.
	bucket: usize,
	prev: Option<u32>,
	next: Option<u32>,
	in_use: bool,
}

impl Default for Slot {
	fn default() -> Self {
		Self {
			blkno: 0,
			data: [0; BLOCK_SIZE],
			bucket: 0,
			prev: None,
			next: None,
			in_use: false,
		}
	}
}

struct CacheState {
	/// Maps a probed bucket to the arena slot it refers to.
	table: Vec<Option<u32>>,
	slots: Vec<Slot>,
	free: Vec<u32>,
	/// Most-recently-used end of the list.
	head: Option<u32>,
	/// Least-recently-used end of the list; the next eviction candidate.
	tail: Option<u32>,
}

impl CacheState {
	fn new() -> Self {
		let mut slots = Vec::with_capacity(MAX_ENTRIES);
		slots.resize_with(MAX_ENTRIES, Slot::default);
		Self {
			table: vec![None; TABLE_SIZE],
			slots,
			free: (0..MAX_ENTRIES as u32).rev().collect(),
			head: None,
			tail: None,
		}
	}

	/// Linear-probes for `blkno`, returning the arena slot index on a hit.
	fn find(&self, blkno: u32) -> Option<u32> {
		let start = (blkno as usize) % TABLE_SIZE;
		for i in 0..TABLE_SIZE {
			let bucket = (start + i) % TABLE_SIZE;
			match self.table[bucket] {
				None => return None,
				Some(idx) if self.slots[idx as usize].blkno == blkno => return Some(idx),
				Some(_) => continue,
			}
		}
		None
	}

	/// Finds the first empty bucket starting from `blkno`'s home slot, wrapping around.
	fn probe_empty(&self, blkno: u32) -> usize {
		let start = (blkno as usize) % TABLE_SIZE;
		for i in 0..TABLE_SIZE {
			let bucket = (start + i) % TABLE_SIZE;
			if self.table[bucket].is_none() {
				return bucket;
			}
		}
		unreachable!("hash table capacity exceeds the active set bound, so it can never fill")
	}

	fn unlink(&mut self, idx: u32) {
		let (prev, next) = (self.slots[idx as usize].prev, self.slots[idx as usize].next);
		match prev {
			Some(p) => self.slots[p as usize].next = next,
			None => self.head = next,
		}
		match next {
			Some(n) => self.slots[n as usize].prev = prev,
			None => self.tail = prev,
		}
		self.slots[idx as usize].prev = None;
		self.slots[idx as usize].next = None;
	}

	fn push_front(&mut self, idx: u32) {
		self.slots[idx as usize].prev = None;
		self.slots[idx as usize].next = self.head;
		if let Some(h) = self.head {
			self.slots[h as usize].prev = Some(idx);
		}
		self.head = Some(idx);
		if self.tail.is_none() {
			self.tail = Some(idx);
		}
	}

	fn touch(&mut self, idx: u32) {
		if self.head == Some(idx) {
			return;
		}
		self.unlink(idx);
		self.push_front(idx);
	}

	/// Allocates a slot for a new entry, evicting the LRU tail if the active set is full.
	fn take_slot(&mut self) -> u32 {
		if let Some(idx) = self.free.pop() {
			return idx;
		}
		let victim = self.tail.expect("active set full implies a tail exists");
		self.unlink(victim);
		let bucket = self.slots[victim as usize].bucket;
		self.table[bucket] = None;
		self.slots[victim as usize].in_use = false;
		victim
	}

	fn insert(&mut self, blkno: u32, data: &[u8]) -> u32 {
		let idx = self.take_slot();
		let bucket = self.probe_empty(blkno);
		self.table[bucket] = Some(idx);
		let slot = &mut self.slots[idx as usize];
		slot.blkno = blkno;
		slot.data.copy_from_slice(data);
		slot.bucket = bucket;
		slot.in_use = true;
		self.push_front(idx);
		idx
	}
}

/// Write-through LRU cache layered over the next device in the stack.
pub struct CacheBlockDevice {
	inner: DeviceHandle,
	state: Mutex<CacheState>,
}

impl CacheBlockDevice {
	pub fn new(inner: DeviceHandle) -> Self {
		Self {
			inner,
			state: Mutex::new(CacheState::new()),
		}
	}
}

impl BlockDevice for CacheBlockDevice {
	fn get(&self, blkno: u32, out: &mut [u8]) -> Result<()> {
		if out.len() != BLOCK_SIZE {
			return Err(Error::InvalidArgument);
		}
		let mut state = self.state.lock();
		if let Some(idx) = state.find(blkno) {
			out.copy_from_slice(&state.slots[idx as usize].data);
			state.touch(idx);
			return Ok(());
		}
		drop(state);
		self.inner.get(blkno, out)?;
		let mut state = self.state.lock();
		// Another caller may have raced us into the cache; re-check before inserting.
		if let Some(idx) = state.find(blkno) {
			state.touch(idx);
		} else {
			state.insert(blkno, out);
		}
		Ok(())
	}

	fn put(&self, blkno: u32, data: &[u8]) -> Result<()> {
		if data.len() != BLOCK_SIZE {
			return Err(Error::InvalidArgument);
		}
		self.inner.put(blkno, data)?;
		let mut state = self.state.lock();
		if let Some(idx) = state.find(blkno) {
			state.slots[idx as usize].data.copy_from_slice(data);
			state.touch(idx);
		} else {
			state.insert(blkno, data);
		}
		Ok(())
	}

	fn begin(&self) -> Result<()> {
		self.inner.begin()
	}

	fn end(&self) -> Result<()> {
		self.inner.end()
	}

	fn block_count(&self) -> u32 {
		self.inner.block_count()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{device::raw::RawBlockDevice, host::SimHostTransport};
	use std::sync::Arc;

	fn device(blocks: u32) -> Arc<dyn BlockDevice> {
		Arc::new(RawBlockDevice::new(Box::new(SimHostTransport::new(
			blocks, BLOCK_SIZE,
		))))
	}

	#[test]
	fn hit_matches_underlying() {
		let raw = device(8);
		let cache = CacheBlockDevice::new(raw.clone());
		let data = [5u8; BLOCK_SIZE];
		cache.put(3, &data).unwrap();
		let mut from_raw = [0u8; BLOCK_SIZE];
		raw.get(3, &mut from_raw).unwrap();
		assert_eq!(from_raw, data);
		let mut out = [0u8; BLOCK_SIZE];
		cache.get(3, &mut out).unwrap();
		assert_eq!(out, data);
	}

	#[test]
	fn eviction_keeps_consistency_with_next_layer() {
		let raw = device(200);
		let cache = CacheBlockDevice::new(raw.clone());
		// Fill well past MAX_ENTRIES to force eviction.
		for b in 0..150u32 {
			let data = [(b % 251) as u8; BLOCK_SIZE];
			cache.put(b, &data).unwrap();
		}
		for b in 0..150u32 {
			let mut out = [0u8; BLOCK_SIZE];
			cache.get(b, &mut out).unwrap();
			assert_eq!(out, [(b % 251) as u8; BLOCK_SIZE]);
		}
	}
}
