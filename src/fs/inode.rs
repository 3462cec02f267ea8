//! Inodes.
//!
//! An inode describes a single unnamed file or directory. The on-disk inode
//! occupies exactly one sector and holds the file length plus the block map:
//! 123 direct sector numbers, one indirect sector of 128 more, and one
//! doubly-indirect sector whose entries each name another indirect sector.
//! A zero sector number means "not allocated".
//!
//! The in-memory [`Inode`] carries only identity and bookkeeping: the inode
//! sector (which doubles as the inode number), the opener count, the removed
//! flag, and the deny-write count. It deliberately caches none of the
//! on-disk fields; every length query and block-map lookup goes back through
//! the sector cache, so all openers observe one consistent copy.
//!
//! The [`Itable`] keeps at most one `Inode` per sector. `open` finds or
//! creates the shared instance; `close` drops one reference, and the last
//! close of a removed inode returns every sector reachable from its block
//! map to the free map, the inode sector included.
//!
//! The per-inode mutex guards metadata access (the block map, the length,
//! extension), never the data copies themselves; two reads of the same file
//! can move bytes concurrently. Public entry points acquire the mutex, the
//! `InodeGuard` methods assume it is held, and the directory layer uses the
//! guard form to make its scan-then-update sequences atomic.
//!
//! File growth is all-or-nothing. `extend` first counts every sector the
//! grown map needs (data plus any new indirection sectors), allocates the
//! whole batch from the free map, and only then wires the batch into the
//! map, zero-filling each new data sector through the cache. If the batch
//! cannot be completed, everything already allocated is released and the
//! inode is left untouched.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp;
use core::convert::TryInto;
use core::mem;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use hashbrown::HashMap;
use log::debug;
use scopeguard::ScopeGuard;
use spin::{Mutex, MutexGuard};
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use super::FileSystem;
use crate::error::Error;
use crate::param::{MAXFILE, MAXSECTORS, NDIRECT, NINDIRECT, SECTOR_SIZE};
use crate::Result;

/// Identifies a sector as an inode.
const INODE_MAGIC: u32 = 0x494e_4f44;

/// On-disk inode. Exactly one sector.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
pub(crate) struct DiskInode {
    /// File length in bytes.
    length: i32,

    /// Must be `INODE_MAGIC`.
    magic: u32,

    /// Direct data sectors.
    direct: [u32; NDIRECT],

    /// Indirect sector; its entries are data sectors.
    indirect: u32,

    /// Doubly-indirect sector; its entries are indirect sectors.
    doubly_indirect: u32,

    is_dir: u8,
    _pad: [u8; 3],
}

const_assert_eq!(mem::size_of::<DiskInode>(), SECTOR_SIZE);

/// An indirect sector: nothing but sector numbers.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
struct IndirectBlock {
    entries: [u32; NINDIRECT],
}

const_assert_eq!(mem::size_of::<IndirectBlock>(), SECTOR_SIZE);

impl DiskInode {
    fn new(is_dir: bool) -> Self {
        Self {
            length: 0,
            magic: INODE_MAGIC,
            direct: [0; NDIRECT],
            indirect: 0,
            doubly_indirect: 0,
            is_dir: is_dir as u8,
            _pad: [0; 3],
        }
    }

    fn len(&self) -> usize {
        cmp::max(self.length, 0) as usize
    }
}

impl IndirectBlock {
    fn empty() -> Self {
        Self {
            entries: [0; NINDIRECT],
        }
    }
}

fn read_disk_inode(fs: &FileSystem, sector: u32) -> DiskInode {
    let mut dnode = DiskInode::new(false);
    fs.cache().read(sector, dnode.as_bytes_mut(), 0);
    dnode
}

fn read_indirect(fs: &FileSystem, sector: u32) -> IndirectBlock {
    let mut blk = IndirectBlock::empty();
    fs.cache().read(sector, blk.as_bytes_mut(), 0);
    blk
}

fn nonzero(sector: u32) -> Option<u32> {
    if sector == 0 {
        None
    } else {
        Some(sector)
    }
}

/// Data sector holding block `bn` of the file, if allocated.
fn map_sector(fs: &FileSystem, dnode: &DiskInode, bn: usize) -> Option<u32> {
    if bn < NDIRECT {
        nonzero(dnode.direct[bn])
    } else if bn < NDIRECT + NINDIRECT {
        let blk = read_indirect(fs, nonzero(dnode.indirect)?);
        nonzero(blk.entries[bn - NDIRECT])
    } else if bn < MAXSECTORS {
        let d = bn - NDIRECT - NINDIRECT;
        let dbl = read_indirect(fs, nonzero(dnode.doubly_indirect)?);
        let leaf = read_indirect(fs, nonzero(dbl.entries[d / NINDIRECT])?);
        nonzero(leaf.entries[d % NINDIRECT])
    } else {
        None
    }
}

fn sectors_for(bytes: usize) -> usize {
    (bytes + SECTOR_SIZE - 1) / SECTOR_SIZE
}

/// Indirect sectors hanging off the doubly-indirect sector when the file
/// occupies `sectors` data sectors.
fn leaf_blocks(sectors: usize) -> usize {
    let doubly = sectors.saturating_sub(NDIRECT + NINDIRECT);
    (doubly + NINDIRECT - 1) / NINDIRECT
}

/// Grows `dnode` to `new_length` bytes, zero-filling every new data sector.
/// Either the whole extension happens or `dnode` is left unchanged and the
/// free map gets every preallocated sector back.
fn extend(fs: &FileSystem, dnode: &mut DiskInode, new_length: usize) -> Result<()> {
    if new_length > MAXFILE {
        return Err(Error::TooBig);
    }
    let cur = sectors_for(dnode.len());
    let tgt = sectors_for(new_length);
    if tgt == cur {
        dnode.length = new_length as i32;
        return Ok(());
    }

    // Everything the grown map needs: data sectors plus any indirection
    // sectors that do not exist yet.
    let mut needed = tgt - cur;
    if cur <= NDIRECT && tgt > NDIRECT {
        needed += 1;
    }
    if cur <= NDIRECT + NINDIRECT && tgt > NDIRECT + NINDIRECT {
        needed += 1;
    }
    needed += leaf_blocks(tgt) - leaf_blocks(cur);

    // Preallocate the whole batch before touching the inode; a failed
    // allocation returns the partial batch and leaves the map unchanged.
    let mut batch = scopeguard::guard(Vec::with_capacity(needed), |sectors: Vec<u32>| {
        for s in sectors {
            fs.freemap().release(fs.cache(), s);
        }
    });
    for _ in 0..needed {
        match fs.freemap().allocate(fs.cache()) {
            Some(s) => batch.push(s),
            None => {
                debug!(
                    "inode: extension to {} bytes failed, {} sectors short",
                    new_length,
                    needed - batch.len()
                );
                return Err(Error::NoSpace);
            }
        }
    }
    let batch = ScopeGuard::into_inner(batch);
    let mut take = batch.into_iter();
    let mut grab = || take.next().expect("extension batch underrun");

    // Direct sectors.
    for bn in cur..cmp::min(tgt, NDIRECT) {
        let s = grab();
        dnode.direct[bn] = s;
        fs.cache().zero(s);
    }

    // Indirect region.
    if tgt > NDIRECT && cur < NDIRECT + NINDIRECT {
        let mut blk = if dnode.indirect == 0 {
            dnode.indirect = grab();
            IndirectBlock::empty()
        } else {
            read_indirect(fs, dnode.indirect)
        };
        for bn in cmp::max(cur, NDIRECT)..cmp::min(tgt, NDIRECT + NINDIRECT) {
            let s = grab();
            blk.entries[bn - NDIRECT] = s;
            fs.cache().zero(s);
        }
        fs.cache().write(dnode.indirect, blk.as_bytes(), 0);
    }

    // Doubly-indirect region.
    if tgt > NDIRECT + NINDIRECT {
        let mut dbl = if dnode.doubly_indirect == 0 {
            dnode.doubly_indirect = grab();
            IndirectBlock::empty()
        } else {
            read_indirect(fs, dnode.doubly_indirect)
        };
        let mut d = cmp::max(cur, NDIRECT + NINDIRECT) - (NDIRECT + NINDIRECT);
        let end = tgt - (NDIRECT + NINDIRECT);
        while d < end {
            let l1 = d / NINDIRECT;
            let mut leaf = if dbl.entries[l1] == 0 {
                dbl.entries[l1] = grab();
                IndirectBlock::empty()
            } else {
                read_indirect(fs, dbl.entries[l1])
            };
            let group_end = cmp::min(end, (l1 + 1) * NINDIRECT);
            while d < group_end {
                let s = grab();
                leaf.entries[d % NINDIRECT] = s;
                fs.cache().zero(s);
                d += 1;
            }
            fs.cache().write(dbl.entries[l1], leaf.as_bytes(), 0);
        }
        fs.cache().write(dnode.doubly_indirect, dbl.as_bytes(), 0);
    }

    debug_assert!(take.next().is_none(), "extension batch overrun");
    dnode.length = new_length as i32;
    Ok(())
}

/// Builds a fresh on-disk inode of `length` bytes at `sector`. The inode
/// sector itself goes straight to the device so the sector is consistent on
/// disk immediately; any cached copy from the sector's previous life is
/// dropped first.
pub(crate) fn create(fs: &FileSystem, sector: u32, length: usize, is_dir: bool) -> Result<()> {
    let mut dnode = DiskInode::new(is_dir);
    extend(fs, &mut dnode, length)?;
    fs.cache().discard(sector);
    let bytes: &[u8; SECTOR_SIZE] = dnode.as_bytes().try_into().expect("inode is one sector");
    fs.device().write_sector(sector, bytes);
    Ok(())
}

/// Returns every sector reachable from the inode at `sector`, and the inode
/// sector itself, to the free map.
fn free_disk_inode(fs: &FileSystem, sector: u32) {
    let dnode = read_disk_inode(fs, sector);
    for s in dnode.direct.iter().cloned().filter(|&s| s != 0) {
        fs.freemap().release(fs.cache(), s);
    }
    if let Some(ind) = nonzero(dnode.indirect) {
        let blk = read_indirect(fs, ind);
        for s in blk.entries.iter().cloned().filter(|&s| s != 0) {
            fs.freemap().release(fs.cache(), s);
        }
        fs.freemap().release(fs.cache(), ind);
    }
    if let Some(dbl) = nonzero(dnode.doubly_indirect) {
        let first = read_indirect(fs, dbl);
        for l1 in first.entries.iter().cloned().filter(|&s| s != 0) {
            let leaf = read_indirect(fs, l1);
            for s in leaf.entries.iter().cloned().filter(|&s| s != 0) {
                fs.freemap().release(fs.cache(), s);
            }
            fs.freemap().release(fs.cache(), l1);
        }
        fs.freemap().release(fs.cache(), dbl);
    }
    fs.freemap().release(fs.cache(), sector);
}

/// In-memory inode. One per on-disk inode; all openers share it.
pub struct Inode {
    /// On-disk sector, doubling as the inode number.
    sector: u32,

    is_dir: bool,

    /// Guards metadata access: block-map lookups, length, extension.
    lock: Mutex<()>,

    removed: AtomicBool,

    deny_write: AtomicU32,

    /// Openers. Updated only under the itable lock.
    open_count: AtomicU32,
}

impl Inode {
    /// The inode's stable identity.
    pub fn sector(&self) -> u32 {
        self.sector
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Relaxed)
    }

    /// Pins the file against modification; writes return 0 until the
    /// matching [`allow_write`](Inode::allow_write).
    pub fn deny_write(&self) {
        self.deny_write.fetch_add(1, Ordering::Relaxed);
    }

    pub fn allow_write(&self) {
        let prev = self.deny_write.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "allow_write without deny_write");
    }

    pub(crate) fn lock(&self) -> InodeGuard<'_> {
        InodeGuard {
            inode: self,
            _guard: self.lock.lock(),
        }
    }

    /// Current length, straight from the on-disk inode.
    pub fn len(&self, fs: &FileSystem) -> usize {
        self.lock().len(fs)
    }

    /// Copies bytes at `offset` into `dst`. A request crossing the end of
    /// the file reads nothing and returns 0. The metadata lookup for each
    /// sector runs under the inode lock; the copy itself does not.
    pub fn read_at(&self, fs: &FileSystem, dst: &mut [u8], offset: usize) -> usize {
        let size = dst.len();
        match offset.checked_add(size) {
            Some(end) if end <= self.len(fs) => {}
            _ => return 0,
        }
        let mut done = 0;
        while done < size {
            let off = offset + done;
            let n = cmp::min(size - done, SECTOR_SIZE - off % SECTOR_SIZE);
            let sector = self.lock().sector_at(fs, off);
            match sector {
                Some(s) => {
                    fs.cache().read(s, &mut dst[done..done + n], off % SECTOR_SIZE);
                }
                None => {
                    for b in dst[done..done + n].iter_mut() {
                        *b = 0;
                    }
                }
            }
            done += n;
        }
        size
    }

    /// Copies `src` into the file at `offset`, extending and zero-filling as
    /// needed. Returns the number of bytes written: all of `src`, or 0 when
    /// writes are denied or the extension cannot complete.
    pub fn write_at(&self, fs: &FileSystem, src: &[u8], offset: usize) -> usize {
        self.try_write_at(fs, src, offset).unwrap_or(0)
    }

    /// [`write_at`](Inode::write_at) with the failure reason.
    pub(crate) fn try_write_at(&self, fs: &FileSystem, src: &[u8], offset: usize) -> Result<usize> {
        if self.deny_write.load(Ordering::Relaxed) > 0 {
            return Err(Error::ReadOnly);
        }
        if src.is_empty() {
            return Ok(0);
        }
        let run = self.lock().prepare_write(fs, offset, src.len())?;
        stream_write(fs, &run, src, offset);
        Ok(src.len())
    }
}

/// Holds the per-inode metadata mutex. Every method assumes (and proves, by
/// existing) that the lock is held.
pub(crate) struct InodeGuard<'a> {
    inode: &'a Inode,
    _guard: MutexGuard<'a, ()>,
}

impl InodeGuard<'_> {
    pub(crate) fn len(&self, fs: &FileSystem) -> usize {
        read_disk_inode(fs, self.inode.sector).len()
    }

    fn sector_at(&self, fs: &FileSystem, offset: usize) -> Option<u32> {
        let dnode = read_disk_inode(fs, self.inode.sector);
        map_sector(fs, &dnode, offset / SECTOR_SIZE)
    }

    /// Whole-range read with the lock held throughout. The directory layer
    /// uses this to scan atomically with respect to inserts.
    pub(crate) fn read_at(&self, fs: &FileSystem, dst: &mut [u8], offset: usize) -> usize {
        let size = dst.len();
        let dnode = read_disk_inode(fs, self.inode.sector);
        match offset.checked_add(size) {
            Some(end) if end <= dnode.len() => {}
            _ => return 0,
        }
        let mut done = 0;
        while done < size {
            let off = offset + done;
            let n = cmp::min(size - done, SECTOR_SIZE - off % SECTOR_SIZE);
            match map_sector(fs, &dnode, off / SECTOR_SIZE) {
                Some(s) => {
                    fs.cache().read(s, &mut dst[done..done + n], off % SECTOR_SIZE);
                }
                None => {
                    for b in dst[done..done + n].iter_mut() {
                        *b = 0;
                    }
                }
            }
            done += n;
        }
        size
    }

    /// Whole-range write with the lock held throughout.
    pub(crate) fn write_at(&mut self, fs: &FileSystem, src: &[u8], offset: usize) -> Result<usize> {
        if self.inode.deny_write.load(Ordering::Relaxed) > 0 {
            return Err(Error::ReadOnly);
        }
        if src.is_empty() {
            return Ok(0);
        }
        let run = self.prepare_write(fs, offset, src.len())?;
        stream_write(fs, &run, src, offset);
        Ok(src.len())
    }

    /// Extends the file far enough to hold the write, persists the updated
    /// inode through the cache, and resolves the byte range to the run of
    /// data sectors it covers, so the copy loop needs no further metadata.
    fn prepare_write(&mut self, fs: &FileSystem, offset: usize, size: usize) -> Result<Vec<u32>> {
        let end = offset.checked_add(size).ok_or(Error::TooBig)?;
        let mut dnode = read_disk_inode(fs, self.inode.sector);
        if end > dnode.len() {
            extend(fs, &mut dnode, end)?;
            fs.cache().write(self.inode.sector, dnode.as_bytes(), 0);
        }
        let first = offset / SECTOR_SIZE;
        let last = (end - 1) / SECTOR_SIZE;
        let mut run = Vec::with_capacity(last - first + 1);
        for bn in first..=last {
            run.push(map_sector(fs, &dnode, bn).expect("mapped range has holes"));
        }
        Ok(run)
    }
}

/// Streams `src` into the resolved sector `run`; pure data traffic, no
/// locks, no metadata.
fn stream_write(fs: &FileSystem, run: &[u32], src: &[u8], offset: usize) {
    let mut done = 0;
    for (i, &sector) in run.iter().enumerate() {
        let off = if i == 0 { offset % SECTOR_SIZE } else { 0 };
        let n = cmp::min(src.len() - done, SECTOR_SIZE - off);
        fs.cache().write(sector, &src[done..done + n], off);
        done += n;
    }
    debug_assert_eq!(done, src.len());
}

/// Open-inode table: at most one in-memory inode per sector.
pub(crate) struct Itable {
    map: Mutex<HashMap<u32, Arc<Inode>>>,
}

impl Itable {
    pub(crate) fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Finds or creates the shared in-memory inode for `sector` and bumps
    /// its opener count.
    pub(crate) fn open(&self, fs: &FileSystem, sector: u32) -> Result<Arc<Inode>> {
        // Read before taking the table lock so the lock never covers device
        // traffic. On a race the loser's copy is simply discarded.
        let dnode = read_disk_inode(fs, sector);
        if dnode.magic != INODE_MAGIC {
            return Err(Error::Corrupted);
        }
        let mut map = self.map.lock();
        if let Some(ip) = map.get(&sector) {
            ip.open_count.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(ip));
        }
        let ip = Arc::new(Inode {
            sector,
            is_dir: dnode.is_dir != 0,
            lock: Mutex::new(()),
            removed: AtomicBool::new(false),
            deny_write: AtomicU32::new(0),
            open_count: AtomicU32::new(1),
        });
        map.insert(sector, Arc::clone(&ip));
        Ok(ip)
    }

    /// Drops one reference. The last close unlinks the inode from the table
    /// and, if it was removed, frees everything it owned on disk.
    pub(crate) fn close(&self, fs: &FileSystem, ip: Arc<Inode>) {
        let mut map = self.map.lock();
        if ip.open_count.fetch_sub(1, Ordering::Relaxed) > 1 {
            return;
        }
        map.remove(&ip.sector);
        drop(map);
        if ip.is_removed() {
            debug!("inode: freeing removed inode at sector {}", ip.sector);
            free_disk_inode(fs, ip.sector);
        }
    }

    /// Current opener count for `sector`; 0 when not open.
    pub(crate) fn openers(&self, sector: u32) -> u32 {
        self.map
            .lock()
            .get(&sector)
            .map(|ip| ip.open_count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RamDisk;
    use crate::param::MAXDEV;

    fn fresh_fs(nsectors: u32) -> FileSystem {
        FileSystem::format(RamDisk::new(nsectors)).unwrap()
    }

    /// Allocate an inode sector and build an inode there.
    fn new_inode(fs: &FileSystem, length: usize, is_dir: bool) -> u32 {
        let sector = fs.freemap().allocate(fs.cache()).unwrap();
        create(fs, sector, length, is_dir).unwrap();
        sector
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
    fn layout_matches_the_disk_format() {
        assert_eq!(mem::size_of::<DiskInode>(), SECTOR_SIZE);
        assert_eq!(mem::size_of::<IndirectBlock>(), SECTOR_SIZE);
        assert_eq!(MAXFILE, (123 + 128 + 128 * 128) * 512);
    }

    #[test]
    fn created_file_reads_back_zeros() {
        let fs = fresh_fs(256);
        let sector = new_inode(&fs, 3000, false);
        let ip = fs.itable().open(&fs, sector).unwrap();
        assert_eq!(ip.len(&fs), 3000);
        let mut buf = vec![0xffu8; 3000];
        assert_eq!(ip.read_at(&fs, &mut buf, 0), 3000);
        assert!(buf.iter().all(|&b| b == 0));
        fs.itable().close(&fs, ip);
    }

    #[test]
    fn zero_length_file_is_legal() {
        let fs = fresh_fs(64);
        let sector = new_inode(&fs, 0, false);
        let ip = fs.itable().open(&fs, sector).unwrap();
        assert_eq!(ip.len(&fs), 0);
        let mut buf = [0u8; 8];
        assert_eq!(ip.read_at(&fs, &mut buf, 0), 0);
        fs.itable().close(&fs, ip);
    }

    #[test]
    fn reads_never_cross_eof() {
        let fs = fresh_fs(64);
        let sector = new_inode(&fs, 100, false);
        let ip = fs.itable().open(&fs, sector).unwrap();
        let mut buf = vec![0u8; 100];
        assert_eq!(ip.read_at(&fs, &mut buf, 0), 100);
        // Crossing the end reads nothing rather than a short prefix.
        assert_eq!(ip.read_at(&fs, &mut buf[..50], 60), 0);
        assert_eq!(ip.read_at(&fs, &mut buf[..1], 100), 0);
        fs.itable().close(&fs, ip);
    }

    #[test]
    fn write_then_read_roundtrip() {
        let fs = fresh_fs(256);
        let sector = new_inode(&fs, 0, false);
        let ip = fs.itable().open(&fs, sector).unwrap();
        let data = pattern(5000, 7);
        assert_eq!(ip.write_at(&fs, &data, 0), 5000);
        assert_eq!(ip.len(&fs), 5000);
        let mut out = vec![0u8; 5000];
        assert_eq!(ip.read_at(&fs, &mut out, 0), 5000);
        assert_eq!(out, data);
        fs.itable().close(&fs, ip);
    }

    #[test]
    fn write_past_eof_zero_fills_the_gap() {
        let fs = fresh_fs(256);
        let sector = new_inode(&fs, 10, false);
        let ip = fs.itable().open(&fs, sector).unwrap();
        let data = [0xabu8; 16];
        assert_eq!(ip.write_at(&fs, &data, 2000), 16);
        assert_eq!(ip.len(&fs), 2016);
        let mut out = vec![0xffu8; 2016];
        assert_eq!(ip.read_at(&fs, &mut out, 0), 2016);
        assert!(out[..2000].iter().all(|&b| b == 0));
        assert_eq!(&out[2000..], &data);
        fs.itable().close(&fs, ip);
    }

    #[test]
    fn large_file_spans_all_three_regions() {
        let fs = fresh_fs(MAXDEV as u32);
        let sector = new_inode(&fs, 0, false);
        let ip = fs.itable().open(&fs, sector).unwrap();
        let data = pattern(500 * 1024, 99);
        assert_eq!(ip.write_at(&fs, &data, 0), data.len());
        let mut out = vec![0u8; data.len()];
        assert_eq!(ip.read_at(&fs, &mut out, 0), data.len());
        assert_eq!(out, data);
        fs.itable().close(&fs, ip);
    }

    #[test]
    fn failed_extension_rolls_back() {
        let fs = fresh_fs(256);
        let sector = new_inode(&fs, 1024, false);
        let ip = fs.itable().open(&fs, sector).unwrap();

        // Exhaust the map down to three sectors.
        while fs.freemap().free_count() > 3 {
            fs.freemap().allocate(fs.cache()).unwrap();
        }
        let free_before = fs.freemap().free_count();

        let data = [1u8; 8 * SECTOR_SIZE];
        assert_eq!(ip.write_at(&fs, &data, 1024), 0);
        assert_eq!(ip.len(&fs), 1024, "failed extension changed the length");
        assert_eq!(
            fs.freemap().free_count(),
            free_before,
            "failed extension leaked sectors"
        );
        fs.itable().close(&fs, ip);
    }

    #[test]
    fn oversized_extension_is_rejected_up_front() {
        let fs = fresh_fs(64);
        let sector = new_inode(&fs, 0, false);
        let ip = fs.itable().open(&fs, sector).unwrap();
        let free_before = fs.freemap().free_count();
        assert_eq!(
            ip.try_write_at(&fs, &[0u8; 4], MAXFILE),
            Err(Error::TooBig)
        );
        assert_eq!(fs.freemap().free_count(), free_before);
        fs.itable().close(&fs, ip);
    }

    #[test]
    fn deny_write_blocks_writers() {
        let fs = fresh_fs(64);
        let sector = new_inode(&fs, 0, false);
        let ip = fs.itable().open(&fs, sector).unwrap();
        ip.deny_write();
        assert_eq!(ip.write_at(&fs, &[1, 2, 3], 0), 0);
        ip.allow_write();
        assert_eq!(ip.write_at(&fs, &[1, 2, 3], 0), 3);
        fs.itable().close(&fs, ip);
    }

    #[test]
    fn openers_share_one_inode() {
        let fs = fresh_fs(64);
        let sector = new_inode(&fs, 0, false);
        let a = fs.itable().open(&fs, sector).unwrap();
        let b = fs.itable().open(&fs, sector).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(fs.itable().openers(sector), 2);
        fs.itable().close(&fs, a);
        assert_eq!(fs.itable().openers(sector), 1);
        fs.itable().close(&fs, b);
        assert_eq!(fs.itable().openers(sector), 0);
    }

    #[test]
    fn removed_inode_frees_every_sector_on_last_close() {
        let fs = fresh_fs(512);
        let free_before = fs.freemap().free_count();
        // Big enough to need the indirect sector too.
        let sector = new_inode(&fs, (NDIRECT + 5) * SECTOR_SIZE, false);
        assert!(fs.freemap().free_count() < free_before);
        let ip = fs.itable().open(&fs, sector).unwrap();
        ip.mark_removed();
        fs.itable().close(&fs, ip);
        assert_eq!(fs.freemap().free_count(), free_before);
    }

    #[test]
    fn opening_a_data_sector_fails() {
        let fs = fresh_fs(64);
        let sector = fs.freemap().allocate(fs.cache()).unwrap();
        fs.cache().zero(sector);
        assert_eq!(fs.itable().open(&fs, sector).err(), Some(Error::Corrupted));
    }
}
