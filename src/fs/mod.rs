//! File-system facade.
//!
//! [`FileSystem`] owns the whole stack for one device: the sector cache,
//! the free map, and the open-inode table. Operations here combine the
//! resolver, the directory layer, and the inode layer: `create`/`mkdir`
//! allocate an inode sector and link it under its parent, `open` hands out
//! positioned [`File`] handles, `remove` unlinks and lets the last close
//! reclaim the sectors, `chdir` moves a caller's [`CurrentDir`].
//!
//! Handles must be returned with [`FileSystem::close`] (or
//! [`close_dir`](FileSystem::close_dir)); reclamation of removed files
//! happens on the last close, so a leaked handle pins the file's sectors.

use alloc::sync::Arc;

use log::{debug, info};
use scopeguard::ScopeGuard;

use crate::bio::{Bcache, CacheStats};
use crate::device::BlockDevice;
use crate::error::Error;
use crate::freemap::FreeMap;
use crate::param::{MAXDEV, NDIRENT_INIT, ROOT_SECTOR};
use crate::Result;

mod dir;
mod file;
mod inode;
mod path;

pub use dir::Dir;
pub use file::File;

use dir::DIRENT_SIZE;
use inode::{Inode, Itable};
use path::Name;

/// A caller's current directory: the starting point for relative paths.
/// A fresh value resolves from the root.
pub struct CurrentDir(Option<Arc<Inode>>);

impl CurrentDir {
    pub const fn new() -> Self {
        Self(None)
    }

    fn inode(&self) -> Option<&Arc<Inode>> {
        self.0.as_ref()
    }
}

impl Default for CurrentDir {
    fn default() -> Self {
        Self::new()
    }
}

/// One mounted file system over one block device.
pub struct FileSystem {
    device: Arc<dyn BlockDevice>,
    cache: Bcache,
    freemap: FreeMap,
    itable: Itable,
}

impl FileSystem {
    pub(crate) fn cache(&self) -> &Bcache {
        &self.cache
    }

    pub(crate) fn freemap(&self) -> &FreeMap {
        &self.freemap
    }

    pub(crate) fn itable(&self) -> &Itable {
        &self.itable
    }

    pub(crate) fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// Writes a fresh file system: an empty free map and a root directory
    /// carrying `.` and `..` pointing at itself.
    pub fn format(device: Arc<dyn BlockDevice>) -> Result<Self> {
        let nsectors = device.nsectors();
        if nsectors as usize > MAXDEV {
            return Err(Error::DeviceTooLarge);
        }
        let cache = Bcache::new(Arc::clone(&device));
        let freemap = FreeMap::create(nsectors);
        let fs = FileSystem {
            device,
            cache,
            freemap,
            itable: Itable::new(),
        };
        assert!(
            fs.freemap.claim(&fs.cache, ROOT_SECTOR),
            "root sector already taken"
        );
        dir::dir_create(&fs, ROOT_SECTOR, NDIRENT_INIT)?;
        let root = Dir::new(fs.itable.open(&fs, ROOT_SECTOR)?)?;
        root.insert(&fs, &Name::new(b".")?, ROOT_SECTOR)?;
        root.insert(&fs, &Name::new(b"..")?, ROOT_SECTOR)?;
        fs.itable.close(&fs, root.into_inode());
        fs.cache.flush_all();
        info!("ffs: formatted, {} sectors", nsectors);
        Ok(fs)
    }

    /// Opens the file system already on the device.
    pub fn mount(device: Arc<dyn BlockDevice>) -> Result<Self> {
        let nsectors = device.nsectors();
        if nsectors as usize > MAXDEV {
            return Err(Error::DeviceTooLarge);
        }
        let cache = Bcache::new(Arc::clone(&device));
        let fs = FileSystem {
            freemap: FreeMap::open(&cache, nsectors),
            device,
            cache,
            itable: Itable::new(),
        };
        let root = fs.itable.open(&fs, ROOT_SECTOR).map_err(|_| Error::Corrupted)?;
        let is_dir = root.is_dir();
        fs.itable.close(&fs, root);
        if !is_dir {
            return Err(Error::Corrupted);
        }
        info!("ffs: mounted, {} sectors", nsectors);
        Ok(fs)
    }

    /// Creates a regular file of `size` bytes, all zero.
    pub fn create(&self, cwd: &CurrentDir, path: &str, size: usize) -> Result<()> {
        self.create_node(cwd, path, size, false)
    }

    /// Creates an empty directory.
    pub fn mkdir(&self, cwd: &CurrentDir, path: &str) -> Result<()> {
        self.create_node(cwd, path, NDIRENT_INIT * DIRENT_SIZE, true)
    }

    fn create_node(&self, cwd: &CurrentDir, path: &str, size: usize, is_dir: bool) -> Result<()> {
        let (parent, name) = path::resolve(self, cwd.inode(), path)?;
        let parent = scopeguard::guard(parent, |d| self.itable.close(self, d.into_inode()));
        let name = name.ok_or(Error::AlreadyExists)?;

        // Refuse duplicates before spending sectors; `insert` below re-checks
        // under the directory lock.
        if let Ok(existing) = parent.lookup(self, &name) {
            self.itable.close(self, existing);
            return Err(Error::AlreadyExists);
        }

        let sector = self.freemap.allocate(&self.cache).ok_or(Error::NoSpace)?;
        {
            let sector = scopeguard::guard(sector, |s| self.freemap.release(&self.cache, s));
            inode::create(self, *sector, size, is_dir)?;
            ScopeGuard::into_inner(sector);
        }

        // The inode now owns its sectors; from here, undo means removal.
        let ip = self.itable.open(self, sector)?;
        let linked = self.link_node(&parent, &name, &ip, is_dir);
        if linked.is_err() {
            debug!("ffs: create at sector {} rolled back", sector);
            ip.mark_removed();
        }
        self.itable.close(self, ip);
        linked
    }

    fn link_node(&self, parent: &Dir, name: &Name, ip: &Arc<Inode>, is_dir: bool) -> Result<()> {
        if is_dir {
            // `.` and `..` first, so a linked directory always has them.
            let dir = Dir::new(Arc::clone(ip))?;
            dir.insert(self, &Name::new(b".")?, ip.sector())?;
            dir.insert(self, &Name::new(b"..")?, parent.inode().sector())?;
        }
        parent.insert(self, name, ip.sector())
    }

    /// Opens `path` as a positioned file handle. `/` opens the root
    /// directory itself.
    pub fn open(&self, cwd: &CurrentDir, path: &str) -> Result<File> {
        let (parent, name) = path::resolve(self, cwd.inode(), path)?;
        let name = match name {
            Some(name) => name,
            None => return Ok(File::new(parent.into_inode())),
        };
        let parent = scopeguard::guard(parent, |d| self.itable.close(self, d.into_inode()));
        let ip = parent.lookup(self, &name)?;
        if ip.is_removed() {
            self.itable.close(self, ip);
            return Err(Error::NotFound);
        }
        Ok(File::new(ip))
    }

    /// Opens `path` as a directory handle for [`Dir::read_next`].
    pub fn open_dir(&self, cwd: &CurrentDir, path: &str) -> Result<Dir> {
        path::resolve_dir(self, cwd.inode(), path)
    }

    /// Returns a file handle; the last close of a removed file frees it.
    pub fn close(&self, file: File) {
        let (ip, denied_write) = file.take();
        if denied_write {
            ip.allow_write();
        }
        self.itable.close(self, ip);
    }

    pub fn close_dir(&self, dir: Dir) {
        self.itable.close(self, dir.into_inode());
    }

    /// Unlinks `path`. Directories must be empty and have no opener besides
    /// the handle this check itself holds; the root and the caller's current
    /// directory are never removable. Sectors come back to the free map when
    /// the last opener closes.
    pub fn remove(&self, cwd: &CurrentDir, path: &str) -> Result<()> {
        let (parent, name) = path::resolve(self, cwd.inode(), path)?;
        let parent = scopeguard::guard(parent, |d| self.itable.close(self, d.into_inode()));
        let name = name.ok_or(Error::Busy)?;
        if name.as_bytes() == b"." || name.as_bytes() == b".." {
            return Err(Error::Busy);
        }
        let ip = parent.lookup(self, &name)?;
        let ip = scopeguard::guard(ip, |ip| self.itable.close(self, ip));
        if ip.sector() == ROOT_SECTOR {
            return Err(Error::Busy);
        }
        if let Some(current) = cwd.inode() {
            if current.sector() == ip.sector() {
                return Err(Error::Busy);
            }
        }
        if ip.is_dir() {
            let dir = Dir::new(Arc::clone(&ip))?;
            if !dir.is_empty(self) {
                return Err(Error::NotEmpty);
            }
            if self.itable.openers(ip.sector()) > 1 {
                return Err(Error::Busy);
            }
        }
        parent.remove_entry(self, &name)?;
        ip.mark_removed();
        debug!("ffs: removed inode at sector {}", ip.sector());
        Ok(())
    }

    /// Moves `cwd` to `path`, which must name a directory.
    pub fn chdir(&self, cwd: &mut CurrentDir, path: &str) -> Result<()> {
        let dir = path::resolve_dir(self, cwd.inode(), path)?;
        if let Some(old) = cwd.0.replace(dir.into_inode()) {
            self.itable.close(self, old);
        }
        Ok(())
    }

    /// Sends `cwd` back to the root and releases its reference.
    pub fn release_dir(&self, cwd: &mut CurrentDir) {
        if let Some(old) = cwd.0.take() {
            self.itable.close(self, old);
        }
    }

    /// Writes every dirty cached sector to the device.
    pub fn flush(&self) {
        self.cache.flush_all();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Flushes, drops every cached sector, and zeroes the counters.
    /// Exclusive access guarantees no operation is in flight.
    pub fn cache_reset(&mut self) {
        self.cache.reset();
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        self.cache.flush_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RamDisk;
    use crate::param::SECTOR_SIZE;

    fn fresh_fs(nsectors: u32) -> FileSystem {
        FileSystem::format(RamDisk::new(nsectors)).unwrap()
    }

    fn pattern(len: usize, seed: u32) -> Vec<u8> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 24) as u8
            })
            .collect()
    }

    #[test]
    fn filesize_roundtrip() {
        let fs = fresh_fs(256);
        let cwd = CurrentDir::new();
        const N: usize = 1234;
        fs.create(&cwd, "a", N).unwrap();
        let mut f = fs.open(&cwd, "a").unwrap();
        let data = pattern(N, 1);
        assert_eq!(f.write(&fs, &data), N);
        assert_eq!(f.size(&fs), N);
        fs.close(f);
    }

    #[test]
    fn write_full_needs_no_device_reads() {
        let fs = fresh_fs(512);
        let cwd = CurrentDir::new();
        // 130 sectors: past the direct region, into the indirect one.
        const N: usize = 66_560;
        fs.create(&cwd, "big", N).unwrap();
        let mut f = fs.open(&cwd, "big").unwrap();
        let data = pattern(N, 2);

        let r0 = fs.cache_stats().device_reads;
        assert_eq!(f.write(&fs, &data), N);
        let r1 = fs.cache_stats().device_reads;
        assert_eq!(r1, r0, "a full overwrite went to the device for data");
        fs.close(f);

        // And the bytes actually landed.
        let f = fs.open(&cwd, "big").unwrap();
        let mut out = vec![0u8; N];
        assert_eq!(f.read_at(&fs, &mut out, 0), N);
        assert_eq!(out, data);
        fs.close(f);
    }

    #[test]
    fn repeat_reads_improve_the_hit_ratio() {
        let mut fs = fresh_fs(256);
        let cwd = CurrentDir::new();
        fs.create(&cwd, "r", 1024).unwrap();
        let mut f = fs.open(&cwd, "r").unwrap();
        let data = pattern(1024, 3);
        assert_eq!(f.write(&fs, &data), 1024);
        fs.close(f);

        fs.cache_reset();

        let mut buf = [0u8; 1024];
        let mut f = fs.open(&cwd, "r").unwrap();
        assert_eq!(f.read(&fs, &mut buf), 1024);
        let hits0 = fs.cache_stats().hits;
        fs.close(f);

        let mut f = fs.open(&cwd, "r").unwrap();
        assert_eq!(f.read(&fs, &mut buf), 1024);
        let hits1 = fs.cache_stats().hits;
        fs.close(f);

        assert!(
            hits1 - hits0 > hits0,
            "second pass hit {} vs first pass {}",
            hits1 - hits0,
            hits0
        );
    }

    #[test]
    fn dot_and_dotdot_navigate() {
        let fs = fresh_fs(256);
        let mut cwd = CurrentDir::new();
        fs.mkdir(&cwd, "/a").unwrap();
        fs.mkdir(&cwd, "/a/b").unwrap();

        let a = fs.open(&cwd, "/a").unwrap();
        let b = fs.open(&cwd, "/a/b").unwrap();
        let (a_ino, b_ino) = (a.inumber(), b.inumber());
        fs.close(a);
        fs.close(b);

        fs.chdir(&mut cwd, "/a/b").unwrap();
        let up = fs.open(&cwd, "..").unwrap();
        assert_eq!(up.inumber(), a_ino);
        let here = fs.open(&cwd, ".").unwrap();
        assert_eq!(here.inumber(), b_ino);
        fs.close(up);
        fs.close(here);
        fs.release_dir(&mut cwd);
    }

    #[test]
    fn removing_a_nonempty_directory_fails() {
        let fs = fresh_fs(256);
        let cwd = CurrentDir::new();
        fs.mkdir(&cwd, "/a").unwrap();
        fs.create(&cwd, "/a/x", 0).unwrap();
        assert_eq!(fs.remove(&cwd, "/a").err(), Some(Error::NotEmpty));
        // Still reachable.
        let f = fs.open(&cwd, "/a/x").unwrap();
        fs.close(f);
        fs.remove(&cwd, "/a/x").unwrap();
        fs.remove(&cwd, "/a").unwrap();
        assert_eq!(fs.open(&cwd, "/a").err(), Some(Error::NotFound));
    }

    #[test]
    fn remove_returns_every_sector() {
        let fs = fresh_fs(512);
        let cwd = CurrentDir::new();
        let free_before = fs.freemap().free_count();
        fs.create(&cwd, "fat", 200 * SECTOR_SIZE).unwrap();
        assert!(fs.freemap().free_count() < free_before);
        fs.remove(&cwd, "fat").unwrap();
        assert_eq!(fs.freemap().free_count(), free_before);
    }

    #[test]
    fn removed_file_lives_until_last_close() {
        let fs = fresh_fs(256);
        let cwd = CurrentDir::new();
        fs.create(&cwd, "ghost", 0).unwrap();
        let mut f = fs.open(&cwd, "ghost").unwrap();
        assert_eq!(f.write(&fs, b"boo"), 3);
        fs.remove(&cwd, "ghost").unwrap();
        // Gone from the namespace, still readable through the handle.
        assert_eq!(fs.open(&cwd, "ghost").err(), Some(Error::NotFound));
        let mut buf = [0u8; 3];
        assert_eq!(f.read_at(&fs, &mut buf, 0), 3);
        assert_eq!(&buf, b"boo");
        fs.close(f);
    }

    #[test]
    fn duplicate_create_changes_nothing() {
        let fs = fresh_fs(256);
        let cwd = CurrentDir::new();
        fs.create(&cwd, "x", 3 * SECTOR_SIZE).unwrap();
        let free = fs.freemap().free_count();
        assert_eq!(
            fs.create(&cwd, "x", 5 * SECTOR_SIZE).err(),
            Some(Error::AlreadyExists)
        );
        assert_eq!(fs.mkdir(&cwd, "x").err(), Some(Error::AlreadyExists));
        assert_eq!(fs.freemap().free_count(), free);
    }

    #[test]
    fn root_and_current_directory_are_not_removable() {
        let fs = fresh_fs(256);
        let mut cwd = CurrentDir::new();
        assert_eq!(fs.remove(&cwd, "/").err(), Some(Error::Busy));
        fs.mkdir(&cwd, "/a").unwrap();
        fs.chdir(&mut cwd, "/a").unwrap();
        assert_eq!(fs.remove(&cwd, "/a").err(), Some(Error::Busy));
        fs.release_dir(&mut cwd);
        fs.remove(&cwd, "/a").unwrap();
    }

    #[test]
    fn open_directory_blocks_removal() {
        let fs = fresh_fs(256);
        let cwd = CurrentDir::new();
        fs.mkdir(&cwd, "/d").unwrap();
        let held = fs.open_dir(&cwd, "/d").unwrap();
        assert_eq!(fs.remove(&cwd, "/d").err(), Some(Error::Busy));
        fs.close_dir(held);
        fs.remove(&cwd, "/d").unwrap();
    }

    #[test]
    fn readdir_lists_what_was_created() {
        let fs = fresh_fs(256);
        let cwd = CurrentDir::new();
        fs.mkdir(&cwd, "/d").unwrap();
        fs.create(&cwd, "/d/one", 0).unwrap();
        fs.create(&cwd, "/d/two", 0).unwrap();
        fs.mkdir(&cwd, "/d/sub").unwrap();

        let mut dir = fs.open_dir(&cwd, "/d").unwrap();
        let mut names = Vec::new();
        while let Some(n) = dir.read_next(&fs) {
            names.push(n);
        }
        names.sort();
        assert_eq!(names, vec!["one", "sub", "two"]);
        fs.close_dir(dir);
    }

    #[test]
    fn root_opens_as_a_file_handle() {
        let fs = fresh_fs(256);
        let cwd = CurrentDir::new();
        let f = fs.open(&cwd, "/").unwrap();
        assert!(f.is_dir());
        assert_eq!(f.inumber(), ROOT_SECTOR);
        fs.close(f);
    }

    #[test]
    fn deny_write_through_a_handle() {
        let fs = fresh_fs(256);
        let cwd = CurrentDir::new();
        fs.create(&cwd, "exe", 0).unwrap();
        let mut pinned = fs.open(&cwd, "exe").unwrap();
        pinned.deny_write();
        let mut writer = fs.open(&cwd, "exe").unwrap();
        assert_eq!(writer.write(&fs, b"nope"), 0);
        fs.close(pinned); // releases the denial
        assert_eq!(writer.write(&fs, b"yes!"), 4);
        fs.close(writer);
    }

    #[test]
    fn data_survives_a_remount() {
        let device = RamDisk::new(256);
        let data = pattern(3 * SECTOR_SIZE + 17, 4);
        {
            let fs = FileSystem::format(Arc::clone(&device) as Arc<dyn BlockDevice>).unwrap();
            let cwd = CurrentDir::new();
            fs.mkdir(&cwd, "/keep").unwrap();
            fs.create(&cwd, "/keep/data", 0).unwrap();
            let mut f = fs.open(&cwd, "/keep/data").unwrap();
            assert_eq!(f.write(&fs, &data), data.len());
            fs.close(f);
            // Dropping the file system flushes the cache.
        }
        let fs = FileSystem::mount(device).unwrap();
        let cwd = CurrentDir::new();
        let f = fs.open(&cwd, "/keep/data").unwrap();
        assert_eq!(f.size(&fs), data.len());
        let mut out = vec![0u8; data.len()];
        assert_eq!(f.read_at(&fs, &mut out, 0), data.len());
        assert_eq!(out, data);
        fs.close(f);
    }

    #[test]
    fn mounting_a_blank_device_fails() {
        assert_eq!(
            FileSystem::mount(RamDisk::new(64)).err(),
            Some(Error::Corrupted)
        );
    }

    #[test]
    fn oversized_devices_are_rejected() {
        let too_big = (MAXDEV + 1) as u32;
        assert_eq!(
            FileSystem::format(RamDisk::new(too_big)).err(),
            Some(Error::DeviceTooLarge)
        );
    }

    #[test]
    fn concurrent_files_do_not_interfere() {
        use std::sync::Arc as StdArc;

        let fs = StdArc::new(fresh_fs(2048));
        let cwd = CurrentDir::new();
        for t in 0..4 {
            fs.create(&cwd, &format!("t{}", t), 0).unwrap();
        }
        let mut handles = Vec::new();
        for t in 0..4u32 {
            let fs = StdArc::clone(&fs);
            handles.push(std::thread::spawn(move || {
                let cwd = CurrentDir::new();
                let name = format!("t{}", t);
                let data = pattern(40 * SECTOR_SIZE + 7, t + 10);
                let mut f = fs.open(&cwd, &name).unwrap();
                assert_eq!(f.write(&fs, &data), data.len());
                let mut out = vec![0u8; data.len()];
                assert_eq!(f.read_at(&fs, &mut out, 0), data.len());
                assert_eq!(out, data);
                fs.close(f);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        fs.flush();
    }
}
