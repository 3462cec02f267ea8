//! Directories.
//!
//! A directory is an inode whose payload is a flat array of fixed-width
//! entries binding names to inode sectors. Entries are never compacted:
//! removal clears the in-use flag and a later insert reuses the first free
//! slot, appending (and growing the directory) only when every slot is
//! taken. Each directory carries `.` and `..` as its first two entries,
//! inserted right after creation; the resolver walks them like any other
//! name.
//!
//! Every scan-then-update sequence runs under the directory inode's
//! metadata lock, so two inserts of the same name cannot both succeed.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::mem;

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use super::inode::{self, Inode, InodeGuard};
use super::path::Name;
use super::FileSystem;
use crate::error::Error;
use crate::param::DIRSIZ;
use crate::Result;

/// Width of one directory entry on disk.
pub(crate) const DIRENT_SIZE: usize = mem::size_of::<Dirent>();
const_assert_eq!(DIRENT_SIZE, 24);

#[repr(C)]
#[derive(Default, AsBytes, FromBytes)]
struct Dirent {
    in_use: u8,
    _pad0: [u8; 3],
    sector: u32,
    /// NUL-padded; a full-length name takes all `DIRSIZ` bytes plus the
    /// terminator slot.
    name: [u8; DIRSIZ + 1],
    _pad1: u8,
}

impl Dirent {
    fn new(name: &Name, sector: u32) -> Self {
        let mut de = Dirent {
            in_use: 1,
            sector,
            ..Default::default()
        };
        de.name[..name.as_bytes().len()].copy_from_slice(name.as_bytes());
        de
    }

    fn name(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(DIRSIZ);
        &self.name[..len]
    }
}

/// An open directory plus a `readdir` cursor.
pub struct Dir {
    inode: Arc<Inode>,
    pos: usize,
}

/// Sizes a fresh directory inode at `sector` for `entries` slots.
pub(crate) fn dir_create(fs: &FileSystem, sector: u32, entries: usize) -> Result<()> {
    inode::create(fs, sector, entries * DIRENT_SIZE, true)
}

/// Reads the whole payload with the lock held; one metadata fetch, then a
/// straight scan in memory.
fn load(guard: &InodeGuard<'_>, fs: &FileSystem) -> Vec<u8> {
    let len = guard.len(fs);
    let mut payload = vec![0u8; len - len % DIRENT_SIZE];
    guard.read_at(fs, &mut payload, 0);
    payload
}

fn entries(payload: &[u8]) -> impl Iterator<Item = (usize, Dirent)> + '_ {
    payload.chunks_exact(DIRENT_SIZE).enumerate().map(|(i, c)| {
        let mut de = Dirent::default();
        de.as_bytes_mut().copy_from_slice(c);
        (i * DIRENT_SIZE, de)
    })
}

impl Dir {
    /// Wraps an already-open directory inode.
    pub(crate) fn new(inode: Arc<Inode>) -> Result<Self> {
        if !inode.is_dir() {
            return Err(Error::NotADirectory);
        }
        Ok(Self { inode, pos: 0 })
    }

    pub(crate) fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    pub(crate) fn into_inode(self) -> Arc<Inode> {
        self.inode
    }

    /// Looks `name` up and opens the referent. The caller owns the returned
    /// reference.
    pub(crate) fn lookup(&self, fs: &FileSystem, name: &Name) -> Result<Arc<Inode>> {
        let guard = self.inode.lock();
        let payload = load(&guard, fs);
        for (_, de) in entries(&payload) {
            if de.in_use != 0 && de.name() == name.as_bytes() {
                return fs.itable().open(fs, de.sector);
            }
        }
        Err(Error::NotFound)
    }

    /// Binds `name` to `sector`, reusing the first free slot or appending.
    pub(crate) fn insert(&self, fs: &FileSystem, name: &Name, sector: u32) -> Result<()> {
        let mut guard = self.inode.lock();
        let payload = load(&guard, fs);
        let mut slot = payload.len();
        for (off, de) in entries(&payload) {
            if de.in_use != 0 {
                if de.name() == name.as_bytes() {
                    return Err(Error::AlreadyExists);
                }
            } else if off < slot {
                slot = off;
            }
        }
        let de = Dirent::new(name, sector);
        guard.write_at(fs, de.as_bytes(), slot)?;
        Ok(())
    }

    /// Unbinds `name`. The slot stays behind for reuse.
    pub(crate) fn remove_entry(&self, fs: &FileSystem, name: &Name) -> Result<()> {
        let mut guard = self.inode.lock();
        let payload = load(&guard, fs);
        for (off, mut de) in entries(&payload) {
            if de.in_use != 0 && de.name() == name.as_bytes() {
                de.in_use = 0;
                guard.write_at(fs, de.as_bytes(), off)?;
                return Ok(());
            }
        }
        Err(Error::NotFound)
    }

    /// True when nothing but `.` and `..` is left.
    pub(crate) fn is_empty(&self, fs: &FileSystem) -> bool {
        let guard = self.inode.lock();
        let payload = load(&guard, fs);
        let result = entries(&payload)
            .all(|(_, de)| de.in_use == 0 || de.name() == b"." || de.name() == b"..");
        result
    }

    /// Advances the cursor to the next entry and returns its name, skipping
    /// `.` and `..`. `None` when the directory is exhausted.
    pub fn read_next(&mut self, fs: &FileSystem) -> Option<String> {
        let guard = self.inode.lock();
        let payload = load(&guard, fs);
        drop(guard);
        while self.pos + DIRENT_SIZE <= payload.len() {
            let mut de = Dirent::default();
            de.as_bytes_mut()
                .copy_from_slice(&payload[self.pos..self.pos + DIRENT_SIZE]);
            self.pos += DIRENT_SIZE;
            if de.in_use != 0 && de.name() != b"." && de.name() != b".." {
                return Some(String::from_utf8_lossy(de.name()).into_owned());
            }
        }
        None
    }

    /// Rewinds the `readdir` cursor.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }
}
