// SPDX-License-Identifier: GPL-3.0-or-later

//! The error taxonomy shared by every layer of the device stack and filesystem.
//!
//! Every fallible operation in this crate returns [`Result`]. Errors are never folded into a
//! generic numeric code inside the core; translation to POSIX-style names only happens at the
//! [`crate::facade`] boundary, which is the one place a caller actually wants errno semantics.

use thiserror::Error;

/// A single error kind, covering every failure category named by the specification this crate
/// implements.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
	/// Null, out-of-range, or unaligned argument.
	#[error("invalid argument")]
	InvalidArgument,
	/// A path or mount binding does not exist.
	#[error("not found")]
	NotFound,
	/// A create/link/mkdir target already exists.
	#[error("already exists")]
	AlreadyExists,
	/// A path component that should be a directory isn't.
	#[error("not a directory")]
	NotADirectory,
	/// A path component that shouldn't be a directory is one.
	#[error("is a directory")]
	IsADirectory,
	/// A directory is not empty where emptiness was required.
	#[error("directory not empty")]
	NotEmpty,
	/// Bitmap, VAD arena, or mount-table exhaustion.
	#[error("no space left")]
	NoSpace,
	/// Transport or underlying block-device failure.
	#[error("I/O error")]
	Io,
	/// Merkle root mismatch or GCM tag mismatch. Never recovered from silently.
	#[error("integrity violation detected (tamper)")]
	Tamper,
	/// File descriptor out of range or already closed.
	#[error("bad descriptor")]
	BadDescriptor,
	/// A path component exceeds the maximum name length.
	#[error("name too long")]
	NameTooLong,
	/// Rename or link attempted across two distinct filesystem instances.
	#[error("cross-device link")]
	CrossDevice,
	/// Numeric overflow while computing an offset or size.
	#[error("overflow")]
	Overflow,
}

/// The result type used throughout this crate.
pub type Result<T> = core::result::Result<T, Error>;
