//! Free map.
//!
//! One bit per device sector, set while the sector is handed out. The whole
//! bitmap lives in the reserved [`FREE_MAP_SECTOR`] and is written through
//! the cache on every change, so a clean flush always persists an up-to-date
//! map. Allocate and release are serialized internally; the layers above
//! assume they can be called from any thread.

use spin::Mutex;

use crate::bio::Bcache;
use crate::param::{FREE_MAP_SECTOR, MAXDEV, SECTOR_SIZE};

struct Bitmap {
    bits: [u8; SECTOR_SIZE],
    nsectors: u32,
}

pub(crate) struct FreeMap {
    inner: Mutex<Bitmap>,
}

impl FreeMap {
    /// Fresh map for a device of `nsectors`, with its own sector claimed.
    pub(crate) fn create(nsectors: u32) -> Self {
        assert!(nsectors as usize <= MAXDEV, "device too large for free map");
        let mut bits = [0u8; SECTOR_SIZE];
        bits[FREE_MAP_SECTOR as usize / 8] |= 1u8 << (FREE_MAP_SECTOR % 8);
        Self {
            inner: Mutex::new(Bitmap { bits, nsectors }),
        }
    }

    /// Map read back from its reserved sector on an existing device.
    pub(crate) fn open(cache: &Bcache, nsectors: u32) -> Self {
        assert!(nsectors as usize <= MAXDEV, "device too large for free map");
        let mut bits = [0; SECTOR_SIZE];
        cache.read(FREE_MAP_SECTOR, &mut bits, 0);
        Self {
            inner: Mutex::new(Bitmap { bits, nsectors }),
        }
    }

    /// Hands out the lowest free sector, or `None` when the device is full.
    pub(crate) fn allocate(&self, cache: &Bcache) -> Option<u32> {
        let mut map = self.inner.lock();
        for sector in 0..map.nsectors {
            let (byte, mask) = (sector as usize / 8, 1u8 << (sector % 8));
            if map.bits[byte] & mask == 0 {
                map.bits[byte] |= mask;
                cache.write(FREE_MAP_SECTOR, &map.bits, 0);
                return Some(sector);
            }
        }
        None
    }

    /// Returns `sector` to the pool.
    pub(crate) fn release(&self, cache: &Bcache, sector: u32) {
        let mut map = self.inner.lock();
        assert!(sector < map.nsectors);
        let (byte, mask) = (sector as usize / 8, 1u8 << (sector % 8));
        assert_ne!(map.bits[byte] & mask, 0, "freeing free sector {}", sector);
        map.bits[byte] &= !mask;
        cache.write(FREE_MAP_SECTOR, &map.bits, 0);
    }

    /// Marks a specific sector allocated. Fails if it already is.
    pub(crate) fn claim(&self, cache: &Bcache, sector: u32) -> bool {
        let mut map = self.inner.lock();
        assert!(sector < map.nsectors);
        let (byte, mask) = (sector as usize / 8, 1u8 << (sector % 8));
        if map.bits[byte] & mask != 0 {
            return false;
        }
        map.bits[byte] |= mask;
        cache.write(FREE_MAP_SECTOR, &map.bits, 0);
        true
    }

    /// Number of sectors currently free.
    pub(crate) fn free_count(&self) -> usize {
        let map = self.inner.lock();
        (0..map.nsectors)
            .filter(|&s| map.bits[s as usize / 8] & (1 << (s % 8)) == 0)
            .count()
    }
}
