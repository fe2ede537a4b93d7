// SPDX-License-Identifier: GPL-3.0-or-later

//! Helpers to reinterpret plain-old-data structures as raw bytes, used for every on-disk and
//! on-wire structure (superblock, inode, bnode, dirent, host transport argument records, ...).

use core::{mem, slice};

/// Marker for a `#[repr(C)]` type that can be safely reinterpreted from or to an arbitrary byte
/// pattern of its size. Derive with `#[derive(macros::AnyRepr)]`.
///
/// # Safety
///
/// The implementor must have no padding-sensitive invariants, no interior pointers, and no
/// niches (no `bool`, no non-exhaustive enum discriminants) — every bit pattern of the struct's
/// size must be a legal value.
pub unsafe trait AnyRepr: Sized {}

/// Reinterprets `value` as a byte slice.
pub fn as_bytes<T: AnyRepr>(value: &T) -> &[u8] {
	unsafe { slice::from_raw_parts(value as *const T as *const u8, mem::size_of::<T>()) }
}

/// Reinterprets `value` as a mutable byte slice.
pub fn as_bytes_mut<T: AnyRepr>(value: &mut T) -> &mut [u8] {
	unsafe { slice::from_raw_parts_mut(value as *mut T as *mut u8, mem::size_of::<T>()) }
}

/// Reinterprets a byte slice as `T`, copying it in.
///
/// Panics if `bytes` is shorter than `size_of::<T>()`.
pub fn read<T: AnyRepr + Copy>(bytes: &[u8]) -> T {
	assert!(bytes.len() >= mem::size_of::<T>());
	unsafe { (bytes.as_ptr() as *const T).read_unaligned() }
}

/// Writes `value` into the beginning of `bytes`.
///
/// Panics if `bytes` is shorter than `size_of::<T>()`.
pub fn write<T: AnyRepr>(bytes: &mut [u8], value: &T) {
	let src = as_bytes(value);
	bytes[..src.len()].copy_from_slice(src);
}

unsafe impl AnyRepr for u8 {}
unsafe impl AnyRepr for u16 {}
unsafe impl AnyRepr for u32 {}
unsafe impl AnyRepr for u64 {}
unsafe impl AnyRepr for i64 {}

#[cfg(test)]
mod tests {
	use super::*;

	#[repr(C)]
	#[derive(Clone, Copy, macros::AnyRepr)]
	struct Pair {
		a: u32,
		b: u32,
	}

	#[test]
	fn round_trip() {
		let p = Pair { a: 1, b: 2 };
		let bytes = as_bytes(&p).to_vec();
		let q: Pair = read(&bytes);
		assert_eq!(q.a, 1);
		assert_eq!(q.b, 2);
	}
}
