// SPDX-License-Identifier: GPL-3.0-or-later

//! Descriptor-based POSIX-like surface over [`crate::mount::MountTable`] (`spec.md` §4.H).
//!
//! Every call resolves a path through the mount table, dispatches the suffix to the bound
//! filesystem, and serialises through the facade's single coarse lock (`spec.md` §5) — per-call
//! locking here, not per-filesystem, since the facade is the one place every request funnels
//! through regardless of which filesystem instance eventually services it.

pub mod posix;

use crate::{
	error::{Error, Result},
	fs::{layout::INODE_MODE_DIR, DirEntryView, Filesystem, Stat},
	mount::MountTable,
};
use spin::Mutex;
use std::sync::Arc;

pub const MAX_FILES: usize = 1024;
const RESERVED_FDS: usize = 3;

pub use crate::fs::{O_CREAT as OPEN_CREAT, O_EXCL as OPEN_EXCL, O_TRUNC as OPEN_TRUNC};

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Whence {
	Set,
	Cur,
	End,
}

struct OpenFile {
	fs: Arc<Filesystem>,
	ino: u32,
	offset: u64,
}

struct OpenDir {
	entries: Vec<DirEntryView>,
	pos: usize,
}

enum Handle {
	File(OpenFile),
	Dir(OpenDir),
}

/// The process-wide file-descriptor table, cwd, and mount table, each under its own lock.
pub struct Facade {
	mounts: MountTable,
	table: Mutex<Vec<Option<Handle>>>,
}

impl Default for Facade {
	fn default() -> Self {
		Self::new()
	}
}

impl Facade {
	pub fn new() -> Self {
		Self {
			mounts: MountTable::new(),
			table: Mutex::new((0..MAX_FILES - RESERVED_FDS).map(|_| None).collect()),
		}
	}

	pub fn mounts(&self) -> &MountTable {
		&self.mounts
	}

	fn alloc_fd(&self, handle: Handle) -> Result<u32> {
		let mut table = self.table.lock();
		let slot = table.iter().position(|h| h.is_none()).ok_or(Error::NoSpace)?;
		table[slot] = Some(handle);
		Ok((slot + RESERVED_FDS) as u32)
	}

	fn slot_of(fd: u32) -> Result<usize> {
		let fd = fd as usize;
		if fd < RESERVED_FDS {
			return Err(Error::BadDescriptor);
		}
		Ok(fd - RESERVED_FDS)
	}

	fn resolve(&self, path: &str) -> Result<(Arc<Filesystem>, String)> {
		self.mounts.lookup(path)
	}

	fn resolve_parent<'a>(&self, fs: &Filesystem, suffix: &'a str) -> Result<(u32, &'a str)> {
		let suffix = suffix.trim_end_matches('/');
		let (parent_path, name) = match suffix.rfind('/') {
			Some(0) => ("/", &suffix[1..]),
			Some(idx) => (&suffix[..idx], &suffix[idx + 1..]),
			None => ("/", suffix),
		};
		if name.is_empty() {
			return Err(Error::InvalidArgument);
		}
		let root = crate::fs::layout::ROOT_INO;
		let parent_ino = if parent_path == "/" {
			root
		} else {
			fs.resolve(root, parent_path)?
		};
		Ok((parent_ino, name))
	}

	/// Resolves `path`, applying `O_CREAT`/`O_EXCL`/`O_TRUNC`, and returns an open descriptor.
	pub fn open(&self, path: &str, flags: u32, mode: u16) -> Result<u32> {
		let (fs, suffix) = self.resolve(path)?;
		let (parent, name) = self.resolve_parent(&fs, &suffix)?;
		let ino = fs.open_or_create(parent, name, mode, flags)?;
		let fd = self.alloc_fd(Handle::File(OpenFile { fs, ino, offset: 0 }))?;
		log::debug!("open({path:?}) -> fd {fd}");
		Ok(fd)
	}

	pub fn close(&self, fd: u32) -> Result<()> {
		let slot = Self::slot_of(fd)?;
		let mut table = self.table.lock();
		let entry = table.get_mut(slot).ok_or(Error::BadDescriptor)?;
		if entry.is_none() {
			return Err(Error::BadDescriptor);
		}
		*entry = None;
		Ok(())
	}

	fn with_file<T>(&self, fd: u32, f: impl FnOnce(&mut OpenFile) -> Result<T>) -> Result<T> {
		let slot = Self::slot_of(fd)?;
		let mut table = self.table.lock();
		match table.get_mut(slot).ok_or(Error::BadDescriptor)? {
			Some(Handle::File(file)) => f(file),
			_ => Err(Error::BadDescriptor),
		}
	}

	/// Scatter/gather read: fills each buffer in order, advancing the handle's offset.
	pub fn readv(&self, fd: u32, bufs: &mut [&mut [u8]]) -> Result<usize> {
		self.with_file(fd, |file| {
			let mut total = 0;
			for buf in bufs.iter_mut() {
				let n = file.fs.read(file.ino, file.offset, buf)?;
				file.offset += n as u64;
				total += n;
				if n < buf.len() {
					break;
				}
			}
			Ok(total)
		})
	}

	/// Scatter/gather write: writes each buffer in order, advancing the handle's offset.
	pub fn writev(&self, fd: u32, bufs: &[&[u8]]) -> Result<usize> {
		self.with_file(fd, |file| {
			let mut total = 0;
			for buf in bufs {
				let n = file.fs.write(file.ino, file.offset, buf)?;
				file.offset += n as u64;
				total += n;
			}
			Ok(total)
		})
	}

	/// Repositions a handle's offset. Rejects a resulting negative offset.
	pub fn lseek(&self, fd: u32, offset: i64, whence: Whence) -> Result<u64> {
		self.with_file(fd, |file| {
			let size = file.fs.stat(file.ino)?.size as i64;
			let base = match whence {
				Whence::Set => 0,
				Whence::Cur => file.offset as i64,
				Whence::End => size,
			};
			let new_offset = base.checked_add(offset).ok_or(Error::Overflow)?;
			if new_offset < 0 {
				return Err(Error::InvalidArgument);
			}
			file.offset = new_offset as u64;
			Ok(file.offset)
		})
	}

	pub fn fstat(&self, fd: u32) -> Result<Stat> {
		self.with_file(fd, |file| file.fs.stat(file.ino))
	}

	pub fn fsync(&self, fd: u32) -> Result<()> {
		self.with_file(fd, |file| file.fs.flush())
	}

	pub fn stat(&self, path: &str) -> Result<Stat> {
		let (fs, suffix) = self.resolve(path)?;
		let ino = fs.resolve(crate::fs::layout::ROOT_INO, &suffix)?;
		fs.stat(ino)
	}

	pub fn truncate(&self, path: &str, size: u64) -> Result<()> {
		let (fs, suffix) = self.resolve(path)?;
		let ino = fs.resolve(crate::fs::layout::ROOT_INO, &suffix)?;
		fs.truncate(ino, size)
	}

	pub fn mkdir(&self, path: &str, mode: u16) -> Result<()> {
		let (fs, suffix) = self.resolve(path)?;
		let (parent, name) = self.resolve_parent(&fs, &suffix)?;
		fs.mkdir(parent, name, mode | INODE_MODE_DIR)?;
		Ok(())
	}

	pub fn rmdir(&self, path: &str) -> Result<()> {
		let (fs, suffix) = self.resolve(path)?;
		let (parent, name) = self.resolve_parent(&fs, &suffix)?;
		fs.rmdir(parent, name)
	}

	pub fn unlink(&self, path: &str) -> Result<()> {
		let (fs, suffix) = self.resolve(path)?;
		let (parent, name) = self.resolve_parent(&fs, &suffix)?;
		fs.unlink(parent, name)
	}

	pub fn link(&self, existing: &str, new: &str) -> Result<()> {
		let (fs_old, suffix_old) = self.resolve(existing)?;
		let (fs_new, suffix_new) = self.resolve(new)?;
		if !Arc::ptr_eq(&fs_old, &fs_new) {
			return Err(Error::CrossDevice);
		}
		let ino = fs_old.resolve(crate::fs::layout::ROOT_INO, &suffix_old)?;
		let (parent, name) = self.resolve_parent(&fs_new, &suffix_new)?;
		fs_new.link(parent, name, ino)
	}

	/// Renames within one filesystem; across distinct mounted filesystems fails with
	/// [`Error::CrossDevice`] rather than attempting a copy (`spec.md` §4.F: rename is
	/// implemented as link+unlink, single-filesystem only).
	pub fn rename(&self, old: &str, new: &str) -> Result<()> {
		let (fs_old, suffix_old) = self.resolve(old)?;
		let (fs_new, suffix_new) = self.resolve(new)?;
		if !Arc::ptr_eq(&fs_old, &fs_new) {
			return Err(Error::CrossDevice);
		}
		let (old_parent, old_name) = self.resolve_parent(&fs_old, &suffix_old)?;
		let (new_parent, new_name) = self.resolve_parent(&fs_new, &suffix_new)?;
		fs_old.rename(old_parent, old_name, new_parent, new_name)
	}

	pub fn getcwd(&self) -> String {
		self.mounts.getcwd()
	}

	pub fn chdir(&self, path: &str) -> Result<()> {
		self.mounts.chdir(path)
	}

	pub fn opendir(&self, path: &str) -> Result<u32> {
		let (fs, suffix) = self.resolve(path)?;
		let ino = fs.resolve(crate::fs::layout::ROOT_INO, &suffix)?;
		let entries = fs.readdir(ino)?;
		self.alloc_fd(Handle::Dir(OpenDir { entries, pos: 0 }))
	}

	pub fn readdir(&self, fd: u32) -> Result<Option<DirEntryView>> {
		let slot = Self::slot_of(fd)?;
		let mut table = self.table.lock();
		match table.get_mut(slot).ok_or(Error::BadDescriptor)? {
			Some(Handle::Dir(dir)) => {
				if dir.pos >= dir.entries.len() {
					return Ok(None);
				}
				let entry = dir.entries[dir.pos].clone();
				dir.pos += 1;
				Ok(Some(entry))
			}
			_ => Err(Error::BadDescriptor),
		}
	}

	pub fn closedir(&self, fd: u32) -> Result<()> {
		self.close(fd)
	}

	/// Returns the directory entries of the directory open on `fd`, starting at `cookie`
	/// (an index into creation order), without consuming the handle's own cursor.
	pub fn getdents(&self, fd: u32, cookie: usize) -> Result<Vec<DirEntryView>> {
		let slot = Self::slot_of(fd)?;
		let table = self.table.lock();
		match table.get(slot).ok_or(Error::BadDescriptor)? {
			Some(Handle::Dir(dir)) => Ok(dir.entries.iter().skip(cookie).cloned().collect()),
			_ => Err(Error::BadDescriptor),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		device::raw::RawBlockDevice, device::DeviceHandle, fs::layout::INODE_MODE_REG,
		fs::{O_CREAT, O_EXCL}, host::SimHostTransport,
	};

	fn facade() -> Facade {
		let facade = Facade::new();
		let device: DeviceHandle = Arc::new(RawBlockDevice::new(Box::new(SimHostTransport::new(
			4096,
			crate::device::BLOCK_SIZE,
		))));
		let fs = Arc::new(Filesystem::format(device).unwrap());
		facade.mounts().bind(fs, "/").unwrap();
		facade
	}

	#[test]
	fn open_write_read_via_fd() {
		let f = facade();
		let fd = f.open("/hello.txt", O_CREAT, INODE_MODE_REG).unwrap();
		assert!(fd >= 3);
		let mut data = b"hi there".to_vec();
		f.writev(fd, &[&data]).unwrap();
		f.lseek(fd, 0, Whence::Set).unwrap();
		let mut out = vec![0u8; data.len()];
		f.readv(fd, &mut [&mut out]).unwrap();
		assert_eq!(out, data);
		data.clear();
		f.close(fd).unwrap();
		assert_eq!(f.readv(fd, &mut [&mut [0u8; 1]]).err(), Some(Error::BadDescriptor));
	}

	#[test]
	fn open_excl_on_existing_fails() {
		let f = facade();
		f.open("/a", O_CREAT, INODE_MODE_REG).unwrap();
		assert_eq!(
			f.open("/a", O_CREAT | O_EXCL, INODE_MODE_REG),
			Err(Error::AlreadyExists)
		);
	}

	#[test]
	fn lseek_negative_offset_rejected() {
		let f = facade();
		let fd = f.open("/a", O_CREAT, INODE_MODE_REG).unwrap();
		assert_eq!(f.lseek(fd, -1, Whence::Set), Err(Error::InvalidArgument));
	}

	#[test]
	fn mkdir_then_opendir_readdir_closedir() {
		let f = facade();
		f.mkdir("/d", INODE_MODE_DIR).unwrap();
		f.open("/d/f1", O_CREAT, INODE_MODE_REG).unwrap();
		f.open("/d/f2", O_CREAT, INODE_MODE_REG).unwrap();
		let dirfd = f.opendir("/d").unwrap();
		let mut names = Vec::new();
		while let Some(entry) = f.readdir(dirfd).unwrap() {
			names.push(entry.name);
		}
		assert_eq!(names, vec![".", "..", "f1", "f2"]);
		f.closedir(dirfd).unwrap();
	}

	#[test]
	fn rmdir_nonempty_fails() {
		let f = facade();
		f.mkdir("/d", INODE_MODE_DIR).unwrap();
		f.open("/d/f", O_CREAT, INODE_MODE_REG).unwrap();
		assert_eq!(f.rmdir("/d"), Err(Error::NotEmpty));
	}

	#[test]
	fn rename_across_mounts_is_cross_device() {
		let f = facade();
		let device: DeviceHandle = Arc::new(RawBlockDevice::new(Box::new(SimHostTransport::new(
			1024,
			crate::device::BLOCK_SIZE,
		))));
		let other = Arc::new(Filesystem::format(device).unwrap());
		f.mounts().bind(other, "/other").unwrap();
		f.open("/a", O_CREAT, INODE_MODE_REG).unwrap();
		assert_eq!(f.rename("/a", "/other/a"), Err(Error::CrossDevice));
	}

	#[test]
	fn chdir_and_relative_open() {
		let f = facade();
		f.mkdir("/d", INODE_MODE_DIR).unwrap();
		f.chdir("/d").unwrap();
		assert_eq!(f.getcwd(), "/d");
	}
}
