// SPDX-License-Identifier: GPL-3.0-or-later

//! The enclave-to-host call boundary.
//!
//! The real runtime crosses into the untrusted host through a single synchronous
//! `invoke_host(op_tag, blob)` call; the cryptographic primitives, the CPIO archive reader, the
//! audit log, and the POSIX shim all live on the other side of interfaces like this one and are
//! out of scope here (`spec.md` §1). [`HostTransport`] is the Rust-level shape of that boundary
//! for the one piece this crate owns end-to-end: block I/O.

use crate::error::{Error, Result};
use macros::AnyRepr;
use std::sync::Mutex;

/// Direction of a block I/O opcode, kept explicit in the wire record rather than inferred from
/// which function was called, since the host-side transport is a single multiplexed entry point.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
	Read = 0,
	Write = 1,
}

impl Direction {
	fn to_wire(self) -> u8 {
		self as u8
	}

	fn from_wire(byte: u8) -> Result<Self> {
		match byte {
			0 => Ok(Direction::Read),
			1 => Ok(Direction::Write),
			_ => Err(Error::InvalidArgument),
		}
	}
}

/// Packed, fixed-offset argument record for a block I/O opcode.
///
/// All multi-byte fields are little-endian on the wire; [`BlockIoArgs::new`]/[`BlockIoArgs::blkno`]
/// convert explicitly with `to_le`/`from_le` rather than relying on host endianness, since the
/// transport may cross an architecture boundary even when both sides happen to run the same
/// process today. `direction` is stored as a raw `u8` (not the `Direction` enum itself) so the
/// whole record stays a valid [`AnyRepr`] type — an enum discriminant has niches a plain byte
/// doesn't.
#[repr(C)]
#[derive(Clone, Copy, AnyRepr)]
struct BlockIoArgs {
	blkno: u32,
	direction: u8,
}

impl BlockIoArgs {
	fn new(blkno: u32, direction: Direction) -> Self {
		Self { blkno: blkno.to_le(), direction: direction.to_wire() }
	}

	fn blkno(self) -> u32 {
		u32::from_le(self.blkno)
	}

	fn direction(self) -> Result<Direction> {
		Direction::from_wire(self.direction)
	}
}

/// The host-side block I/O bridge.
///
/// Implementations marshal `get_block`/`put_block` into the packed record above and hand it to
/// `invoke_host`. The only implementation shipped in this crate is [`SimHostTransport`], an
/// in-enclave byte array standing in for the real host bridge during tests — see `spec.md` §4.C,
/// "Simulation mode".
pub trait HostTransport: Send + Sync {
	/// Total number of fixed-size blocks backing this transport.
	fn block_count(&self) -> u32;
	/// Reads the block `blkno` into `out`. `out` must be exactly `BLOCK_SIZE` bytes.
	fn get_block(&self, blkno: u32, out: &mut [u8]) -> Result<()>;
	/// Writes `data` (exactly `BLOCK_SIZE` bytes) to block `blkno`.
	fn put_block(&self, blkno: u32, data: &[u8]) -> Result<()>;
}

/// In-enclave simulated backing store: a plain byte array, copied in and out on every call.
///
/// Stands in for the real host transport, which would marshal the same calls across the
/// enclave boundary. Any transport failure on the real bridge surfaces as [`Error::Io`]; this
/// simulation never fails except on an out-of-range `blkno`, which is itself an
/// [`Error::InvalidArgument`] rather than a transport fault.
pub struct SimHostTransport {
	block_size: usize,
	store: Mutex<Vec<u8>>,
	block_count: u32,
}

impl SimHostTransport {
	/// Creates a simulated transport backing `block_count` blocks of `block_size` bytes each,
	/// all zero-initialized.
	pub fn new(block_count: u32, block_size: usize) -> Self {
		Self {
			block_size,
			store: Mutex::new(vec![0u8; block_count as usize * block_size]),
			block_count,
		}
	}
}

impl HostTransport for SimHostTransport {
	fn block_count(&self) -> u32 {
		self.block_count
	}

	fn get_block(&self, blkno: u32, out: &mut [u8]) -> Result<()> {
		// Marshal into the packed wire record and back, the way a real host transport would
		// cross the boundary, even though this simulation never leaves the process.
		let wire = crate::bytes::as_bytes(&BlockIoArgs::new(blkno, Direction::Read)).to_vec();
		let args: BlockIoArgs = crate::bytes::read(&wire);
		if args.direction()? != Direction::Read {
			return Err(Error::InvalidArgument);
		}
		let blkno = args.blkno();
		if blkno >= self.block_count || out.len() != self.block_size {
			return Err(Error::InvalidArgument);
		}
		let store = self.store.lock().unwrap();
		let off = blkno as usize * self.block_size;
		out.copy_from_slice(&store[off..off + self.block_size]);
		Ok(())
	}

	fn put_block(&self, blkno: u32, data: &[u8]) -> Result<()> {
		let wire = crate::bytes::as_bytes(&BlockIoArgs::new(blkno, Direction::Write)).to_vec();
		let args: BlockIoArgs = crate::bytes::read(&wire);
		if args.direction()? != Direction::Write {
			return Err(Error::InvalidArgument);
		}
		let blkno = args.blkno();
		if blkno >= self.block_count || data.len() != self.block_size {
			return Err(Error::InvalidArgument);
		}
		let mut store = self.store.lock().unwrap();
		let off = blkno as usize * self.block_size;
		store[off..off + self.block_size].copy_from_slice(data);
		Ok(())
	}
}

impl<T: HostTransport + ?Sized> HostTransport for std::sync::Arc<T> {
	fn block_count(&self) -> u32 {
		(**self).block_count()
	}

	fn get_block(&self, blkno: u32, out: &mut [u8]) -> Result<()> {
		(**self).get_block(blkno, out)
	}

	fn put_block(&self, blkno: u32, data: &[u8]) -> Result<()> {
		(**self).put_block(blkno, data)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn write_then_read() {
		let t = SimHostTransport::new(4, 16);
		let data = [7u8; 16];
		t.put_block(2, &data).unwrap();
		let mut out = [0u8; 16];
		t.get_block(2, &mut out).unwrap();
		assert_eq!(out, data);
	}

	#[test]
	fn out_of_range() {
		let t = SimHostTransport::new(4, 16);
		let mut out = [0u8; 16];
		assert_eq!(t.get_block(4, &mut out), Err(Error::InvalidArgument));
	}
}
