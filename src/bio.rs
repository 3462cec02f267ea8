//! Sector cache.
//!
//! The cache is a fixed array of slots holding copies of disk sectors.
//! Caching sectors in memory reduces the number of device transfers and also
//! provides a synchronization point for sectors used by multiple threads.
//!
//! Interface:
//! * To copy bytes out of a sector, call `read`.
//! * To copy bytes into a sector, call `write`; the slot turns dirty and the
//!   device copy is updated on eviction or `flush_all`.
//! * `zero` clears a whole sector without reading the device first.
//! * `discard` drops a cached copy whose sector is about to be rewritten
//!   behind the cache's back.
//!
//! A slot's identity (sector number, valid bit) is guarded by the index
//! lock; its payload and dirty/recently-used bits are guarded by the slot
//! mutex. Retagging a victim requires both. Replacement is a clock sweep
//! that only considers slots whose mutex can be taken without blocking, so
//! a slot in active use is never stolen and the index lock is held for
//! bounded work only.

use alloc::sync::Arc;
use core::cmp;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicU64, Ordering};

use array_macro::array;
use bitflags::bitflags;
use log::debug;
use spin::{Mutex, MutexGuard};

use crate::device::BlockDevice;
use crate::param::{NSLOT, SECTOR_SIZE};

bitflags! {
    /// Per-slot state, guarded by the slot mutex.
    struct SlotFlags: u8 {
        /// Payload differs from the device copy.
        const DIRTY = 1 << 0;
        /// Touched since the clock hand last passed.
        const RECENTLY_USED = 1 << 1;
    }
}

struct SlotInner {
    flags: SlotFlags,
    data: [u8; SECTOR_SIZE],
}

struct CacheSlot {
    inner: Mutex<SlotInner>,
}

impl CacheSlot {
    fn new() -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                flags: SlotFlags::empty(),
                data: [0; SECTOR_SIZE],
            }),
        }
    }
}

/// Identity of one slot, guarded by the index lock.
#[derive(Clone, Copy)]
struct SlotMeta {
    sector: u32,
    valid: bool,
}

struct CacheIndex {
    meta: [SlotMeta; NSLOT],
    hand: usize,
}

struct Counters {
    tries: AtomicU64,
    hits: AtomicU64,
    device_reads: AtomicU64,
    device_writes: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            tries: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            device_reads: AtomicU64::new(0),
            device_writes: AtomicU64::new(0),
        }
    }
}

/// Snapshot of the monotonic cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups started.
    pub tries: u64,
    /// Lookups satisfied without claiming a new slot.
    pub hits: u64,
    /// Sectors read from the device.
    pub device_reads: u64,
    /// Sectors written to the device.
    pub device_writes: u64,
}

pub(crate) struct Bcache {
    device: Arc<dyn BlockDevice>,
    index: Mutex<CacheIndex>,
    slots: [CacheSlot; NSLOT],
    counters: Counters,
}

impl Bcache {
    pub(crate) fn new(device: Arc<dyn BlockDevice>) -> Self {
        Self {
            device,
            index: Mutex::new(CacheIndex {
                meta: [SlotMeta {
                    sector: 0,
                    valid: false,
                }; NSLOT],
                hand: 0,
            }),
            slots: array![_ => CacheSlot::new(); NSLOT],
            counters: Counters::new(),
        }
    }

    /// Returns the slot holding `sector`, mutex held. On a miss the clock
    /// sweep claims a victim; with `fill` set the payload is then read from
    /// the device, otherwise the caller overwrites all of it before the
    /// mutex is released.
    fn acquire(&self, sector: u32, fill: bool) -> MutexGuard<'_, SlotInner> {
        self.counters.tries.fetch_add(1, Ordering::Relaxed);
        loop {
            let mut index = self.index.lock();
            if let Some(i) = index
                .meta
                .iter()
                .position(|m| m.valid && m.sector == sector)
            {
                match self.slots[i].inner.try_lock() {
                    Some(guard) => {
                        self.counters.hits.fetch_add(1, Ordering::Relaxed);
                        drop(index);
                        return guard;
                    }
                    // The slot is mid-fill or mid-copy for the same sector.
                    // Retry the lookup; the holder releases shortly.
                    None => {
                        drop(index);
                        spin_loop();
                        continue;
                    }
                }
            }

            let (i, mut guard) = self.evict(&mut index);
            index.meta[i] = SlotMeta {
                sector,
                valid: true,
            };
            drop(index);
            if fill {
                self.device.read_sector(sector, &mut guard.data);
                self.counters.device_reads.fetch_add(1, Ordering::Relaxed);
            }
            return guard;
        }
    }

    /// Clock sweep. Runs with the index lock held and returns a victim slot
    /// whose mutex is held, dirty payload written back, and identity cleared.
    /// Busy slots are skipped rather than waited on; the hand rotates until
    /// some slot gives in.
    fn evict(&self, index: &mut CacheIndex) -> (usize, MutexGuard<'_, SlotInner>) {
        loop {
            index.hand = (index.hand + 1) % NSLOT;
            let i = index.hand;
            let mut guard = match self.slots[i].inner.try_lock() {
                Some(guard) => guard,
                None => continue,
            };
            if !index.meta[i].valid {
                return (i, guard);
            }
            if guard.flags.contains(SlotFlags::RECENTLY_USED) {
                // Second chance.
                guard.flags.remove(SlotFlags::RECENTLY_USED);
                continue;
            }
            if guard.flags.contains(SlotFlags::DIRTY) {
                self.device.write_sector(index.meta[i].sector, &guard.data);
                self.counters.device_writes.fetch_add(1, Ordering::Relaxed);
                guard.flags.remove(SlotFlags::DIRTY);
            }
            index.meta[i].valid = false;
            return (i, guard);
        }
    }

    /// Copies up to `dst.len()` bytes out of `sector` starting at `offset`.
    /// Returns the number of bytes copied; 0 if `offset` is past the sector
    /// end.
    pub(crate) fn read(&self, sector: u32, dst: &mut [u8], offset: usize) -> usize {
        if offset >= SECTOR_SIZE {
            return 0;
        }
        let n = cmp::min(dst.len(), SECTOR_SIZE - offset);
        if n == 0 {
            return 0;
        }
        let mut guard = self.acquire(sector, true);
        dst[..n].copy_from_slice(&guard.data[offset..offset + n]);
        guard.flags.insert(SlotFlags::RECENTLY_USED);
        n
    }

    /// Copies up to `src.len()` bytes into `sector` starting at `offset` and
    /// marks the slot dirty. A write covering the whole sector claims a slot
    /// without reading the device.
    pub(crate) fn write(&self, sector: u32, src: &[u8], offset: usize) -> usize {
        if offset >= SECTOR_SIZE {
            return 0;
        }
        let n = cmp::min(src.len(), SECTOR_SIZE - offset);
        if n == 0 {
            return 0;
        }
        let whole = offset == 0 && n == SECTOR_SIZE;
        let mut guard = self.acquire(sector, !whole);
        guard.data[offset..offset + n].copy_from_slice(&src[..n]);
        guard.flags.insert(SlotFlags::DIRTY | SlotFlags::RECENTLY_USED);
        n
    }

    /// Zeroes a whole sector through the cache without reading the device.
    pub(crate) fn zero(&self, sector: u32) {
        let mut guard = self.acquire(sector, false);
        guard.data.fill(0);
        guard.flags.insert(SlotFlags::DIRTY | SlotFlags::RECENTLY_USED);
    }

    /// Drops any cached copy of `sector` without writing it back. The next
    /// access reads the device again.
    pub(crate) fn discard(&self, sector: u32) {
        let mut index = self.index.lock();
        if let Some(i) = index
            .meta
            .iter()
            .position(|m| m.valid && m.sector == sector)
        {
            let mut guard = self.slots[i].inner.lock();
            index.meta[i].valid = false;
            guard.flags = SlotFlags::empty();
        }
    }

    /// Writes every dirty slot back to the device and clears its dirty bit.
    pub(crate) fn flush_all(&self) {
        let mut flushed = 0u32;
        for i in 0..NSLOT {
            let index = self.index.lock();
            if !index.meta[i].valid {
                continue;
            }
            let sector = index.meta[i].sector;
            let mut guard = self.slots[i].inner.lock();
            drop(index);
            if guard.flags.contains(SlotFlags::DIRTY) {
                self.device.write_sector(sector, &guard.data);
                self.counters.device_writes.fetch_add(1, Ordering::Relaxed);
                guard.flags.remove(SlotFlags::DIRTY);
                flushed += 1;
            }
        }
        if flushed > 0 {
            debug!("bcache: flushed {} dirty sectors", flushed);
        }
    }

    /// Flushes, invalidates every slot, and zeroes the counters. Exclusive
    /// access guarantees no lookup or sweep is in flight.
    pub(crate) fn reset(&mut self) {
        self.flush_all();
        let index = self.index.get_mut();
        index.hand = 0;
        for m in index.meta.iter_mut() {
            m.valid = false;
        }
        for slot in self.slots.iter_mut() {
            slot.inner.get_mut().flags = SlotFlags::empty();
        }
        self.counters = Counters::new();
    }

    pub(crate) fn stats(&self) -> CacheStats {
        CacheStats {
            tries: self.counters.tries.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            device_reads: self.counters.device_reads.load(Ordering::Relaxed),
            device_writes: self.counters.device_writes.load(Ordering::Relaxed),
        }
    }

    /// No sector may be resident in two slots at once, and a dirty slot is
    /// always valid.
    #[cfg(test)]
    fn check_invariants(&self) {
        let index = self.index.lock();
        let mut seen = std::collections::HashSet::new();
        for (i, m) in index.meta.iter().enumerate() {
            if m.valid {
                assert!(seen.insert(m.sector), "sector {} cached twice", m.sector);
            } else {
                let guard = self.slots[i].inner.lock();
                assert!(
                    !guard.flags.contains(SlotFlags::DIRTY),
                    "invalid slot {} is dirty",
                    i
                );
            }
        }
        assert!(index.hand < NSLOT);
    }
}
