// SPDX-License-Identifier: GPL-3.0-or-later

//! Translates the core [`crate::error::Error`] taxonomy to POSIX-style errno *names*.
//!
//! This is the one boundary that should ever think in errno terms (`spec.md` §7: "never fold
//! into generic numeric codes at the core boundary... the POSIX-compatible shim does the final
//! translation"). [`Error::Tamper`] has no POSIX equivalent; it collapses to `EIO`, which is the
//! closest existing errno and loses the tamper/ordinary-I/O-failure distinction on purpose — a
//! caller that cares about that distinction should match on [`crate::error::Error`] directly
//! instead of going through this table.

use crate::error::Error;

/// Returns the POSIX errno name most closely matching `err`.
pub fn errno_name(err: Error) -> &'static str {
	match err {
		Error::InvalidArgument => "EINVAL",
		Error::NotFound => "ENOENT",
		Error::AlreadyExists => "EEXIST",
		Error::NotADirectory => "ENOTDIR",
		Error::IsADirectory => "EISDIR",
		Error::NotEmpty => "ENOTEMPTY",
		Error::NoSpace => "ENOSPC",
		Error::Io => "EIO",
		Error::Tamper => "EIO",
		Error::BadDescriptor => "EBADF",
		Error::NameTooLong => "ENAMETOOLONG",
		Error::CrossDevice => "EXDEV",
		Error::Overflow => "EOVERFLOW",
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn maps_not_found_to_enoent() {
		assert_eq!(errno_name(Error::NotFound), "ENOENT");
	}

	#[test]
	fn tamper_collapses_to_eio() {
		assert_eq!(errno_name(Error::Tamper), "EIO");
	}
}
