// SPDX-License-Identifier: GPL-3.0-or-later

//! Path resolution and mount table (`spec.md` §4.G): a bounded longest-prefix binding table that
//! dispatches a normalised path to the filesystem instance mounted at the deepest matching
//! prefix.
//!
//! The buggy source-side `oe_open`/`oe_mount` sketches named in `spec.md` §9 are not reproduced
//! here; `bind`/`unbind`/`lookup` below are derived directly from this module's own contract.

use crate::{
	device::{cache::CacheBlockDevice, merkle::{MerkleBlockDevice, MerkleMode}, raw::RawBlockDevice, DeviceHandle},
	error::{Error, Result},
	fs::Filesystem,
	host::HostTransport,
	key::KeySource,
};
use spin::Mutex;
use std::sync::Arc;

pub const MAX_MOUNTS: usize = 64;

/// Composes the block-device stack bottom-up for a mount (`spec.md` §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MountFlags(u32);

impl MountFlags {
	pub const NONE: u32 = 0;
	pub const MKFS: u32 = 1 << 0;
	pub const CRYPTO: u32 = 1 << 1;
	pub const AUTH_CRYPTO: u32 = 1 << 2;
	pub const INTEGRITY: u32 = 1 << 3;
	pub const CACHING: u32 = 1 << 4;

	pub fn new(bits: u32) -> Self {
		Self(bits)
	}

	pub fn contains(self, bit: u32) -> bool {
		self.0 & bit != 0
	}
}

/// Composes the block-device stack bottom-up per `flags` and formats or opens the resulting OEFS
/// instance (`spec.md` §3: "Filesystem handles are created by `mount_oefs`, released by
/// `unmount`").
///
/// `nblks` is the data-block count the Merkle layer is initialised or opened with; it is ignored
/// when neither `CRYPTO`, `AUTH_CRYPTO`, nor `INTEGRITY` is set. Bare `CRYPTO` without
/// `AUTH_CRYPTO` has no distinct device type in this crate (every encrypted layer is also
/// Merkle-protected); it is treated the same as `INTEGRITY` alone, selecting the legacy
/// [`MerkleMode::ShaOnly`] tree. `AUTH_CRYPTO` selects [`MerkleMode::Authenticated`].
pub fn mount_oefs(
	transport: Box<dyn HostTransport>,
	nblks: u64,
	flags: MountFlags,
	key_source: &dyn KeySource,
	label: &str,
) -> Result<Arc<Filesystem>> {
	let mut device: DeviceHandle = Arc::new(RawBlockDevice::new(transport));
	if flags.contains(MountFlags::CACHING) {
		device = Arc::new(CacheBlockDevice::new(device));
	}
	let wants_crypto =
		flags.contains(MountFlags::CRYPTO) || flags.contains(MountFlags::AUTH_CRYPTO) || flags.contains(MountFlags::INTEGRITY);
	if wants_crypto {
		let key = key_source.derive_key(label);
		let mode = if flags.contains(MountFlags::AUTH_CRYPTO) {
			MerkleMode::Authenticated
		} else {
			MerkleMode::ShaOnly
		};
		device = if flags.contains(MountFlags::MKFS) {
			Arc::new(MerkleBlockDevice::initialize(device, key, nblks, mode)?)
		} else {
			Arc::new(MerkleBlockDevice::open(device, key, nblks, mode)?)
		};
	}
	let fs = if flags.contains(MountFlags::MKFS) {
		Filesystem::format(device)?
	} else {
		Filesystem::open(device)?
	};
	log::info!("mounted OEFS at label {label:?} (flags {:#x})", flags.0);
	Ok(Arc::new(fs))
}

/// Releases a mounted filesystem handle. Ordinary `Drop` on the last `Arc` clone already tears
/// down the device stack beneath it; this exists to name the lifecycle operation `spec.md` calls
/// `unmount` explicitly.
pub fn unmount(fs: Arc<Filesystem>) {
	drop(fs);
}

/// Normalises `path`, prefixing it with `cwd` if it's relative.
///
/// Rules (`spec.md` §4.G): absolute paths only once normalised; `.` components are dropped, `..`
/// pops the previous component, consecutive slashes collapse. A path that would resolve above
/// root fails with [`Error::InvalidArgument`].
pub fn normalize(path: &str, cwd: &str) -> Result<String> {
	let absolute = if path.starts_with('/') {
		path.to_string()
	} else {
		format!("{cwd}/{path}")
	};
	let mut stack: Vec<&str> = Vec::new();
	for component in absolute.split('/').filter(|c| !c.is_empty()) {
		match component {
			"." => {}
			".." => {
				if stack.pop().is_none() {
					return Err(Error::InvalidArgument);
				}
			}
			_ => stack.push(component),
		}
	}
	if stack.is_empty() {
		Ok("/".to_string())
	} else {
		Ok(format!("/{}", stack.join("/")))
	}
}

struct Binding {
	prefix: String,
	fs: Arc<Filesystem>,
}

struct Table {
	bindings: Vec<Binding>,
	cwd: String,
}

/// The process-wide mount table.
pub struct MountTable {
	inner: Mutex<Table>,
}

impl Default for MountTable {
	fn default() -> Self {
		Self::new()
	}
}

impl MountTable {
	pub fn new() -> Self {
		Self {
			inner: Mutex::new(Table {
				bindings: Vec::new(),
				cwd: "/".to_string(),
			}),
		}
	}

	/// Binds `fs` at `path`. Rejects a path already bound and a table at capacity.
	pub fn bind(&self, fs: Arc<Filesystem>, path: &str) -> Result<()> {
		let mut table = self.inner.lock();
		let cwd = table.cwd.clone();
		let prefix = normalize(path, &cwd)?;
		if table.bindings.iter().any(|b| b.prefix == prefix) {
			return Err(Error::AlreadyExists);
		}
		if table.bindings.len() >= MAX_MOUNTS {
			return Err(Error::NoSpace);
		}
		table.bindings.push(Binding { prefix, fs });
		Ok(())
	}

	/// Removes the binding at exactly `path`.
	pub fn unbind(&self, path: &str) -> Result<()> {
		let mut table = self.inner.lock();
		let cwd = table.cwd.clone();
		let prefix = normalize(path, &cwd)?;
		let before = table.bindings.len();
		table.bindings.retain(|b| b.prefix != prefix);
		if table.bindings.len() == before {
			return Err(Error::NotFound);
		}
		Ok(())
	}

	/// Longest-prefix match: returns the bound filesystem and the path suffix below its prefix.
	pub fn lookup(&self, path: &str) -> Result<(Arc<Filesystem>, String)> {
		let table = self.inner.lock();
		let normalized = normalize(path, &table.cwd)?;
		let mut best: Option<&Binding> = None;
		for binding in &table.bindings {
			let matches = normalized == binding.prefix
				|| (binding.prefix == "/")
				|| normalized.starts_with(&format!("{}/", binding.prefix));
			if !matches {
				continue;
			}
			if best.map(|b| b.prefix.len() < binding.prefix.len()).unwrap_or(true) {
				best = Some(binding);
			}
		}
		let binding = best.ok_or(Error::NotFound)?;
		let suffix = if binding.prefix == "/" {
			normalized
		} else {
			normalized[binding.prefix.len()..].to_string()
		};
		let suffix = if suffix.is_empty() { "/".to_string() } else { suffix };
		Ok((binding.fs.clone(), suffix))
	}

	pub fn getcwd(&self) -> String {
		self.inner.lock().cwd.clone()
	}

	pub fn chdir(&self, path: &str) -> Result<()> {
		let mut table = self.inner.lock();
		let cwd = table.cwd.clone();
		let normalized = normalize(path, &cwd)?;
		table.cwd = normalized;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{device::raw::RawBlockDevice, device::DeviceHandle, host::SimHostTransport, key::FixedKeySource};

	fn fs() -> Arc<Filesystem> {
		let device: DeviceHandle = Arc::new(RawBlockDevice::new(Box::new(SimHostTransport::new(
			1024,
			crate::device::BLOCK_SIZE,
		))));
		Arc::new(Filesystem::format(device).unwrap())
	}

	#[test]
	fn normalize_collapses_dots_and_slashes() {
		assert_eq!(normalize("/a/./b//c/../d", "/").unwrap(), "/a/b/d");
	}

	#[test]
	fn normalize_idempotent() {
		let once = normalize("/a/./b//c/../d", "/").unwrap();
		let twice = normalize(&once, "/").unwrap();
		assert_eq!(once, twice);
	}

	#[test]
	fn normalize_above_root_fails() {
		assert_eq!(normalize("/..", "/"), Err(Error::InvalidArgument));
	}

	#[test]
	fn relative_path_uses_cwd() {
		assert_eq!(normalize("b", "/a").unwrap(), "/a/b");
	}

	#[test]
	fn bind_rejects_duplicate_prefix() {
		let table = MountTable::new();
		table.bind(fs(), "/mnt").unwrap();
		assert_eq!(table.bind(fs(), "/mnt"), Err(Error::AlreadyExists));
	}

	#[test]
	fn longest_prefix_match() {
		// Scenario 4 of spec.md §8.
		let table = MountTable::new();
		table.bind(fs(), "/a").unwrap();
		table.bind(fs(), "/a/b").unwrap();
		let (_, suffix) = table.lookup("/a/b/c").unwrap();
		assert_eq!(suffix, "/c");
	}

	#[test]
	fn unbind_then_lookup_fails() {
		let table = MountTable::new();
		table.bind(fs(), "/mnt").unwrap();
		table.unbind("/mnt").unwrap();
		assert_eq!(table.lookup("/mnt").err(), Some(Error::NotFound));
	}

	#[test]
	fn root_binding_matches_everything_not_otherwise_claimed() {
		let table = MountTable::new();
		table.bind(fs(), "/").unwrap();
		let (_, suffix) = table.lookup("/etc/passwd").unwrap();
		assert_eq!(suffix, "/etc/passwd");
	}

	#[test]
	fn mount_oefs_formats_then_reopens_with_same_key() {
		let key_source = FixedKeySource::new([7u8; 32]);
		let nblks = 1024u64;
		let flags = MountFlags::new(MountFlags::MKFS | MountFlags::CACHING | MountFlags::AUTH_CRYPTO);
		let total = nblks + crate::device::merkle::extra_blocks(nblks, MerkleMode::Authenticated);
		let backing = std::sync::Arc::new(crate::host::SimHostTransport::new(total as u32, crate::device::BLOCK_SIZE));
		let fs = mount_oefs(Box::new(backing.clone()), nblks, flags, &key_source, "root").unwrap();
		let ino = fs
			.open_or_create(crate::fs::layout::ROOT_INO, "f", crate::fs::layout::INODE_MODE_REG, crate::fs::O_CREAT)
			.unwrap();
		fs.write(ino, 0, b"hello").unwrap();
		unmount(fs);

		let reopen_flags = MountFlags::new(MountFlags::CACHING | MountFlags::AUTH_CRYPTO);
		let fs = mount_oefs(Box::new(backing), nblks, reopen_flags, &key_source, "root").unwrap();
		let mut out = [0u8; 5];
		fs.read(ino, 0, &mut out).unwrap();
		assert_eq!(&out, b"hello");
	}

	#[test]
	fn mount_oefs_with_wrong_key_fails() {
		let nblks = 1024u64;
		let flags = MountFlags::new(MountFlags::MKFS | MountFlags::AUTH_CRYPTO);
		let total = nblks + crate::device::merkle::extra_blocks(nblks, MerkleMode::Authenticated);
		let backing = std::sync::Arc::new(crate::host::SimHostTransport::new(total as u32, crate::device::BLOCK_SIZE));
		let fs = mount_oefs(
			Box::new(backing.clone()),
			nblks,
			flags,
			&FixedKeySource::new([1u8; 32]),
			"root",
		)
		.unwrap();
		unmount(fs);

		let reopen_flags = MountFlags::new(MountFlags::AUTH_CRYPTO);
		let reopened = mount_oefs(Box::new(backing), nblks, reopen_flags, &FixedKeySource::new([2u8; 32]), "root");
		assert_eq!(reopened.err(), Some(Error::Tamper));
	}
}
