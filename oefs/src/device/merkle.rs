// SPDX-License-Identifier: GPL-3.0-or-later

//! Authenticated, integrity-protected block device (`spec.md` §4.E).
//!
//! Every data block is encrypted with AES-256-GCM using a per-block IV derived from its block
//! number, so the IV never needs to be stored. The GCM tags of every block form the leaves of a
//! Merkle tree; the root hash lives in a dedicated header block and is checked on every `open`.
//! A crash between writing ciphertext and advancing the root is detected as a **tamper** on the
//! next open rather than silently accepted (`spec.md` §5, "bounded atomicity").
//!
//! [`MerkleMode::ShaOnly`] reproduces the legacy, pre-authentication variant named in `spec.md`
//! §9 ("Non-reproduced behaviour"): blocks are stored in cleartext and the Merkle leaves are the
//! SHA-256 digest of each block's content, with no AES-GCM tag to check. `get` still reports
//! tamper on a bit-flip (the stored content no longer hashes to the committed leaf), but there is
//! no confidentiality and no per-block authentication tag in this mode, only the Merkle hash
//! chain's integrity guarantee.

use crate::{
	crypto,
	device::{BlockDevice, DeviceHandle, TxDepth, BLOCK_SIZE},
	error::{Error, Result},
};
use macros::AnyRepr;
use spin::Mutex;

/// GCM tags (or, in [`MerkleMode::ShaOnly`], SHA-256 digests) per 1 KiB tag block.
pub const TAGS_PER_BLOCK: usize = BLOCK_SIZE / 16;

const HEADER_MAGIC: u64 = 0x4F45_4653_4D4B_4C45;

/// Which value the Merkle tree's leaves commit to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MerkleMode {
	/// Leaves are the block's 16-byte GCM authentication tag (upper 16 bytes zero). The default,
	/// and the mode exercised by every mandatory invariant in `spec.md` §8.
	Authenticated,
	/// Leaves are the full 32-byte SHA-256 digest of the block's ciphertext. Legacy mode.
	ShaOnly,
}

impl MerkleMode {
	fn leaf_bytes(self) -> usize {
		match self {
			MerkleMode::Authenticated => 16,
			MerkleMode::ShaOnly => 32,
		}
	}

	fn entries_per_block(self) -> usize {
		BLOCK_SIZE / self.leaf_bytes()
	}
}

/// On-disk header: magic, block count, and the Merkle root, sized to exactly one block.
#[repr(C)]
#[derive(Clone, Copy, AnyRepr)]
struct HeaderBlock {
	magic: u64,
	nblks: u64,
	root_hash: [u8; 32],
	mode: u8,
	_reserved: [u8; BLOCK_SIZE - 8 - 8 - 32 - 1],
}

impl HeaderBlock {
	fn to_bytes(self) -> [u8; BLOCK_SIZE] {
		let mut out = [0u8; BLOCK_SIZE];
		crate::bytes::write(&mut out, &self);
		out
	}

	fn from_bytes(bytes: &[u8]) -> Self {
		crate::bytes::read(bytes)
	}
}

struct MerkleState {
	root_hash: [u8; 32],
	/// Upper (internal) nodes of the tree, heap-indexed: `merkle[0]` is the root.
	merkle: Vec<[u8; 32]>,
	/// Conceptual leaf values, one per data block, indexed by `blkno`.
	leaves: Vec<[u8; 32]>,
	/// In-memory mirror of each persisted tag block, rewritten wholesale on flush.
	tag_blocks: Vec<[u8; BLOCK_SIZE]>,
	dirty_tag_blocks: Vec<bool>,
	header_dirty: bool,
	tx: TxDepth,
}

impl MerkleState {
	fn leaf_index(nblks: u64, blkno: u32) -> usize {
		(nblks as usize - 1) + blkno as usize
	}

	/// Returns the value of the conceptual tree node at heap index `i` (internal or leaf).
	fn value_at(&self, nblks: u64, i: usize) -> [u8; 32] {
		if i < nblks as usize - 1 {
			self.merkle[i]
		} else {
			self.leaves[i - (nblks as usize - 1)]
		}
	}

	fn recompute_from_leaves(&mut self, nblks: u64) {
		for i in (0..nblks as usize - 1).rev() {
			let left = self.value_at(nblks, 2 * i + 1);
			let right = self.value_at(nblks, 2 * i + 2);
			self.merkle[i] = crypto::hash_pair(&left, &right);
		}
		self.root_hash = self.merkle[0];
	}

	fn update_path(&mut self, nblks: u64, blkno: u32) {
		let mut i = Self::leaf_index(nblks, blkno);
		while i > 0 {
			i = (i - 1) / 2;
			let left = self.value_at(nblks, 2 * i + 1);
			let right = self.value_at(nblks, 2 * i + 2);
			self.merkle[i] = crypto::hash_pair(&left, &right);
		}
		self.root_hash = self.merkle[0];
	}
}

/// Encrypted, Merkle-authenticated block device layered over the cache (or raw) device below.
pub struct MerkleBlockDevice {
	inner: DeviceHandle,
	key: [u8; 32],
	nblks: u64,
	mode: MerkleMode,
	header_blkno: u32,
	tag_base_blkno: u32,
	num_tag_blocks: usize,
	state: Mutex<MerkleState>,
}

/// Number of blocks occupied by the header plus tag blocks, for a device with `nblks` data
/// blocks under the given mode (`spec.md` §6: `extra_blocks(nblks)`).
pub fn extra_blocks(nblks: u64, mode: MerkleMode) -> u64 {
	1 + (nblks as usize).div_ceil(mode.entries_per_block()) as u64
}

impl MerkleBlockDevice {
	fn layout(nblks: u64, mode: MerkleMode) -> (u32, u32, usize) {
		let header_blkno = nblks as u32;
		let tag_base_blkno = header_blkno + 1;
		let num_tag_blocks = (nblks as usize).div_ceil(mode.entries_per_block());
		(header_blkno, tag_base_blkno, num_tag_blocks)
	}

	fn leaf_from_tag_blocks(tag_blocks: &[[u8; BLOCK_SIZE]], mode: MerkleMode, blkno: u32) -> [u8; 32] {
		let epb = mode.entries_per_block();
		let lb = mode.leaf_bytes();
		let block_idx = blkno as usize / epb;
		let off = (blkno as usize % epb) * lb;
		let mut leaf = [0u8; 32];
		leaf[32 - lb..].copy_from_slice(&tag_blocks[block_idx][off..off + lb]);
		leaf
	}

	fn write_leaf_into(tag_blocks: &mut [[u8; BLOCK_SIZE]], mode: MerkleMode, blkno: u32, leaf: &[u8; 32]) {
		let epb = mode.entries_per_block();
		let lb = mode.leaf_bytes();
		let block_idx = blkno as usize / epb;
		let off = (blkno as usize % epb) * lb;
		tag_blocks[block_idx][off..off + lb].copy_from_slice(&leaf[32 - lb..]);
	}

	/// Formats a fresh device with `nblks` data blocks (must be a power of two, `>= 2`):
	/// encrypts the all-zero block once per `blkno`, builds the tree, and flushes header + tags.
	pub fn initialize(inner: DeviceHandle, key: [u8; 32], nblks: u64, mode: MerkleMode) -> Result<Self> {
		if nblks < 2 || !nblks.is_power_of_two() {
			return Err(Error::InvalidArgument);
		}
		let (header_blkno, tag_base_blkno, num_tag_blocks) = Self::layout(nblks, mode);
		if inner.block_count() < nblks as u32 + 1 + num_tag_blocks as u32 {
			return Err(Error::NoSpace);
		}
		let zero = [0u8; BLOCK_SIZE];
		let mut tag_blocks = vec![[0u8; BLOCK_SIZE]; num_tag_blocks];
		let mut leaves = vec![[0u8; 32]; nblks as usize];
		for blkno in 0..nblks as u32 {
			let leaf = match mode {
				MerkleMode::Authenticated => {
					let (ciphertext, tag) = crypto::encrypt_block(&key, blkno, &zero);
					inner.put(blkno, &ciphertext)?;
					let mut l = [0u8; 32];
					l[16..].copy_from_slice(&tag);
					l
				}
				MerkleMode::ShaOnly => {
					inner.put(blkno, &zero)?;
					crypto::sha256(&zero)
				}
			};
			leaves[blkno as usize] = leaf;
			Self::write_leaf_into(&mut tag_blocks, mode, blkno, &leaf);
		}
		let mut state = MerkleState {
			root_hash: [0u8; 32],
			merkle: vec![[0u8; 32]; nblks as usize - 1],
			leaves,
			tag_blocks,
			dirty_tag_blocks: vec![true; num_tag_blocks],
			header_dirty: true,
			tx: TxDepth::default(),
		};
		state.recompute_from_leaves(nblks);
		let dev = Self {
			inner,
			key,
			nblks,
			mode,
			header_blkno,
			tag_base_blkno,
			num_tag_blocks,
			state: Mutex::new(state),
		};
		dev.flush_locked(&mut dev.state.lock())?;
		Ok(dev)
	}

	/// Opens an existing device whose data block count is `nblks` (known out-of-band, e.g. from
	/// mount configuration), verifying the recomputed Merkle root against the stored one.
	pub fn open(inner: DeviceHandle, key: [u8; 32], nblks: u64, mode: MerkleMode) -> Result<Self> {
		if nblks < 2 || !nblks.is_power_of_two() {
			return Err(Error::InvalidArgument);
		}
		let (header_blkno, tag_base_blkno, num_tag_blocks) = Self::layout(nblks, mode);
		let mut header_bytes = [0u8; BLOCK_SIZE];
		inner.get(header_blkno, &mut header_bytes)?;
		let header = HeaderBlock::from_bytes(&header_bytes);
		if header.magic != HEADER_MAGIC || header.nblks != nblks {
			return Err(Error::Tamper);
		}
		let mut tag_blocks = vec![[0u8; BLOCK_SIZE]; num_tag_blocks];
		for (i, block) in tag_blocks.iter_mut().enumerate() {
			inner.get(tag_base_blkno + i as u32, block)?;
		}
		let mut leaves = vec![[0u8; 32]; nblks as usize];
		for (blkno, leaf) in leaves.iter_mut().enumerate() {
			*leaf = Self::leaf_from_tag_blocks(&tag_blocks, mode, blkno as u32);
		}
		let mut state = MerkleState {
			root_hash: [0u8; 32],
			merkle: vec![[0u8; 32]; nblks as usize - 1],
			leaves,
			tag_blocks,
			dirty_tag_blocks: vec![false; num_tag_blocks],
			header_dirty: false,
			tx: TxDepth::default(),
		};
		state.recompute_from_leaves(nblks);
		if state.root_hash != header.root_hash {
			return Err(Error::Tamper);
		}
		Ok(Self {
			inner,
			key,
			nblks,
			mode,
			header_blkno,
			tag_base_blkno,
			num_tag_blocks,
			state: Mutex::new(state),
		})
	}

	fn flush_locked(&self, state: &mut MerkleState) -> Result<()> {
		for (i, block) in state.tag_blocks.iter().enumerate() {
			if state.dirty_tag_blocks[i] {
				self.inner.put(self.tag_base_blkno + i as u32, block)?;
				state.dirty_tag_blocks[i] = false;
			}
		}
		if state.header_dirty {
			let header = HeaderBlock {
				magic: HEADER_MAGIC,
				nblks: self.nblks,
				root_hash: state.root_hash,
				mode: self.mode as u8,
				_reserved: [0; BLOCK_SIZE - 8 - 8 - 32 - 1],
			};
			self.inner.put(self.header_blkno, &header.to_bytes())?;
			state.header_dirty = false;
		}
		Ok(())
	}
}

impl BlockDevice for MerkleBlockDevice {
	fn get(&self, blkno: u32, out: &mut [u8]) -> Result<()> {
		if out.len() != BLOCK_SIZE || blkno as u64 >= self.nblks {
			return Err(Error::InvalidArgument);
		}
		let mut stored = vec![0u8; BLOCK_SIZE];
		self.inner.get(blkno, &mut stored)?;
		let state = self.state.lock();
		let leaf = state.leaves[blkno as usize];
		match self.mode {
			MerkleMode::Authenticated => {
				let mut tag = [0u8; 16];
				tag.copy_from_slice(&leaf[16..]);
				let plain = crypto::decrypt_block(&self.key, blkno, &stored, &tag)?;
				out.copy_from_slice(&plain);
			}
			MerkleMode::ShaOnly => {
				// No GCM tag is persisted in this mode; the block is stored in cleartext and the
				// Merkle leaf is a direct content hash, so the only check is against that hash.
				if crypto::sha256(&stored) != leaf {
					return Err(Error::Tamper);
				}
				out.copy_from_slice(&stored);
			}
		}
		Ok(())
	}

	fn put(&self, blkno: u32, data: &[u8]) -> Result<()> {
		if data.len() != BLOCK_SIZE || blkno as u64 >= self.nblks {
			return Err(Error::InvalidArgument);
		}
		let leaf = match self.mode {
			MerkleMode::Authenticated => {
				let (ciphertext, tag) = crypto::encrypt_block(&self.key, blkno, data);
				self.inner.put(blkno, &ciphertext)?;
				let mut l = [0u8; 32];
				l[16..].copy_from_slice(&tag);
				l
			}
			MerkleMode::ShaOnly => {
				self.inner.put(blkno, data)?;
				crypto::sha256(data)
			}
		};
		let mut state = self.state.lock();
		state.leaves[blkno as usize] = leaf;
		let mode = self.mode;
		Self::write_leaf_into(&mut state.tag_blocks, mode, blkno, &leaf);
		let epb = mode.entries_per_block();
		state.dirty_tag_blocks[blkno as usize / epb] = true;
		state.update_path(self.nblks, blkno);
		state.header_dirty = true;
		if state.tx.0 == 0 {
			self.flush_locked(&mut state)?;
		}
		Ok(())
	}

	fn begin(&self) -> Result<()> {
		let mut state = self.state.lock();
		if state.tx.enter() {
			self.inner.begin()?;
		}
		Ok(())
	}

	fn end(&self) -> Result<()> {
		let mut state = self.state.lock();
		if state.tx.leave() {
			self.flush_locked(&mut state)?;
			self.inner.end()?;
		}
		Ok(())
	}

	fn block_count(&self) -> u32 {
		self.nblks as u32
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{device::raw::RawBlockDevice, host::SimHostTransport};
	use std::sync::Arc;

	fn raw_inner(nblks: u64, mode: MerkleMode) -> Arc<dyn BlockDevice> {
		let total = nblks + extra_blocks(nblks, mode);
		Arc::new(RawBlockDevice::new(Box::new(SimHostTransport::new(
			total as u32,
			BLOCK_SIZE,
		))))
	}

	#[test]
	fn write_then_read_round_trip() {
		let key = [1u8; 32];
		let inner = raw_inner(8, MerkleMode::Authenticated);
		let dev = MerkleBlockDevice::initialize(inner.clone(), key, 8, MerkleMode::Authenticated).unwrap();
		for b in 0..8u32 {
			let data = vec![(b + 1) as u8; BLOCK_SIZE];
			dev.put(b, &data).unwrap();
		}
		for b in 0..8u32 {
			let mut out = vec![0u8; BLOCK_SIZE];
			dev.get(b, &mut out).unwrap();
			assert_eq!(out, vec![(b + 1) as u8; BLOCK_SIZE]);
		}
	}

	#[test]
	fn initialize_decrypts_to_zero() {
		let key = [2u8; 32];
		let inner = raw_inner(4, MerkleMode::Authenticated);
		let dev = MerkleBlockDevice::initialize(inner, key, 4, MerkleMode::Authenticated).unwrap();
		for b in 0..4u32 {
			let mut out = vec![0u8; BLOCK_SIZE];
			dev.get(b, &mut out).unwrap();
			assert_eq!(out, vec![0u8; BLOCK_SIZE]);
		}
	}

	#[test]
	fn reopen_with_matching_key_succeeds() {
		let key = [3u8; 32];
		let inner = raw_inner(8, MerkleMode::Authenticated);
		{
			let dev =
				MerkleBlockDevice::initialize(inner.clone(), key, 8, MerkleMode::Authenticated).unwrap();
			for b in 0..8u32 {
				dev.put(b, &vec![9u8; BLOCK_SIZE]).unwrap();
			}
		}
		let dev = MerkleBlockDevice::open(inner, key, 8, MerkleMode::Authenticated).unwrap();
		let mut out = vec![0u8; BLOCK_SIZE];
		dev.get(0, &mut out).unwrap();
		assert_eq!(out, vec![9u8; BLOCK_SIZE]);
	}

	#[test]
	fn reopen_with_wrong_key_fails_on_first_get() {
		let inner = raw_inner(8, MerkleMode::Authenticated);
		{
			let dev = MerkleBlockDevice::initialize(inner.clone(), [4u8; 32], 8, MerkleMode::Authenticated)
				.unwrap();
			dev.put(0, &vec![1u8; BLOCK_SIZE]).unwrap();
		}
		// A different key still recomputes the same leaves (tags are on disk already), so open
		// succeeds, but decrypting with the wrong key fails the GCM tag check.
		let dev =
			MerkleBlockDevice::open(inner, [5u8; 32], 8, MerkleMode::Authenticated).unwrap();
		let mut out = vec![0u8; BLOCK_SIZE];
		assert_eq!(dev.get(0, &mut out), Err(Error::Tamper));
	}

	#[test]
	fn tampering_with_a_tag_block_is_detected_on_reopen() {
		let key = [6u8; 32];
		let inner = raw_inner(8, MerkleMode::Authenticated);
		{
			let dev = MerkleBlockDevice::initialize(inner.clone(), key, 8, MerkleMode::Authenticated)
				.unwrap();
			for b in 0..8u32 {
				dev.put(b, &vec![b as u8; BLOCK_SIZE]).unwrap();
			}
		}
		// Flip a bit directly on the backing store's tag block.
		let mut tag_block = vec![0u8; BLOCK_SIZE];
		inner.get(9, &mut tag_block).unwrap();
		tag_block[0] ^= 0x01;
		inner.put(9, &tag_block).unwrap();
		let res = MerkleBlockDevice::open(inner, key, 8, MerkleMode::Authenticated);
		assert_eq!(res.err(), Some(Error::Tamper));
	}

	#[test]
	fn sha_only_round_trip() {
		let key = [7u8; 32];
		let inner = raw_inner(8, MerkleMode::ShaOnly);
		let dev = MerkleBlockDevice::initialize(inner, key, 8, MerkleMode::ShaOnly).unwrap();
		for b in 0..8u32 {
			let data = vec![(b + 1) as u8; BLOCK_SIZE];
			dev.put(b, &data).unwrap();
		}
		for b in 0..8u32 {
			let mut out = vec![0u8; BLOCK_SIZE];
			dev.get(b, &mut out).unwrap();
			assert_eq!(out, vec![(b + 1) as u8; BLOCK_SIZE]);
		}
	}

	#[test]
	fn sha_only_detects_tampered_block_on_get() {
		let key = [8u8; 32];
		let inner = raw_inner(8, MerkleMode::ShaOnly);
		let dev = MerkleBlockDevice::initialize(inner.clone(), key, 8, MerkleMode::ShaOnly).unwrap();
		dev.put(0, &vec![5u8; BLOCK_SIZE]).unwrap();
		let mut stored = vec![0u8; BLOCK_SIZE];
		inner.get(0, &mut stored).unwrap();
		stored[0] ^= 0x01;
		inner.put(0, &stored).unwrap();
		let mut out = vec![0u8; BLOCK_SIZE];
		assert_eq!(dev.get(0, &mut out), Err(Error::Tamper));
	}
}
