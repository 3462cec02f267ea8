//! File handles.
//!
//! A [`File`] pairs an open inode with a byte position, giving the usual
//! sequential read/write surface on top of the offset-based inode
//! operations. Handles are plain values; hand them back with
//! [`FileSystem::close`] so the opener count and any write denial are
//! undone.
//!
//! [`FileSystem::close`]: super::FileSystem::close

use alloc::sync::Arc;

use super::inode::Inode;
use super::FileSystem;

/// An open file, or a directory opened as a file.
pub struct File {
    inode: Arc<Inode>,
    pos: usize,
    denied_write: bool,
}

impl File {
    pub(crate) fn new(inode: Arc<Inode>) -> Self {
        Self {
            inode,
            pos: 0,
            denied_write: false,
        }
    }

    pub(crate) fn take(self) -> (Arc<Inode>, bool) {
        (self.inode, self.denied_write)
    }

    /// Reads from the current position and advances it. Like
    /// [`read_at`](File::read_at), a request crossing the end of the file
    /// returns 0.
    pub fn read(&mut self, fs: &FileSystem, dst: &mut [u8]) -> usize {
        let n = self.inode.read_at(fs, dst, self.pos);
        self.pos += n;
        n
    }

    /// Writes at the current position and advances it.
    pub fn write(&mut self, fs: &FileSystem, src: &[u8]) -> usize {
        let n = self.inode.write_at(fs, src, self.pos);
        self.pos += n;
        n
    }

    /// Positioned read; the handle's position is untouched.
    pub fn read_at(&self, fs: &FileSystem, dst: &mut [u8], offset: usize) -> usize {
        self.inode.read_at(fs, dst, offset)
    }

    /// Positioned write; the handle's position is untouched.
    pub fn write_at(&self, fs: &FileSystem, src: &[u8], offset: usize) -> usize {
        self.inode.write_at(fs, src, offset)
    }

    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn tell(&self) -> usize {
        self.pos
    }

    pub fn size(&self, fs: &FileSystem) -> usize {
        self.inode.len(fs)
    }

    pub fn is_dir(&self) -> bool {
        self.inode.is_dir()
    }

    /// The inode sector: a stable identifier for the underlying file.
    pub fn inumber(&self) -> u32 {
        self.inode.sector()
    }

    /// Pins the underlying inode against writes until the handle is closed
    /// or [`allow_write`](File::allow_write) is called. Idempotent per
    /// handle.
    pub fn deny_write(&mut self) {
        if !self.denied_write {
            self.denied_write = true;
            self.inode.deny_write();
        }
    }

    pub fn allow_write(&mut self) {
        if self.denied_write {
            self.denied_write = false;
            self.inode.allow_write();
        }
    }
}
