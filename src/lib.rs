//! File system implementation.  Four layers:
//!   + Sectors: a write-back cache of disk sectors with clock replacement.
//!   + Free map: bitmap allocator handing out one sector at a time.
//!   + Inodes: reading, writing, atomic extension, metadata.
//!   + Directories and names: fixed-width entries and path resolution.
//!
//! The whole stack is owned by a [`FileSystem`] value built over any
//! [`BlockDevice`], so several independent file systems can coexist in one
//! process. All sector traffic goes through the cache; dirty sectors reach
//! the device on eviction, on [`FileSystem::flush`], or when the file system
//! is dropped.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod bio;
mod device;
mod error;
mod freemap;
mod fs;
mod param;

pub use bio::CacheStats;
pub use device::{BlockDevice, RamDisk};
pub use error::Error;
pub use fs::{CurrentDir, Dir, File, FileSystem};
pub use param::{DIRSIZ, MAXFILE, SECTOR_SIZE};

pub type Result<T> = core::result::Result<T, Error>;
