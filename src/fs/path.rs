//! Path names.
//!
//! A path is a `/`-separated byte sequence; no encoding is assumed. A
//! leading `/` makes it absolute, otherwise resolution starts at the
//! caller's current directory (or the root when there is none). Repeated
//! and trailing slashes are tolerated. `.` and `..` are ordinary names:
//! every directory carries them as real entries, so the walk needs no
//! special cases.

use alloc::sync::Arc;

use arrayvec::ArrayVec;
use scopeguard::ScopeGuard;

use super::dir::Dir;
use super::inode::Inode;
use super::FileSystem;
use crate::error::Error;
use crate::param::{DIRSIZ, ROOT_SECTOR};
use crate::Result;

/// One validated path component: 1..=`DIRSIZ` bytes, no `/`, no NUL.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Name {
    bytes: ArrayVec<u8, DIRSIZ>,
}

impl Name {
    pub fn new(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() || bytes.contains(&b'/') || bytes.contains(&0) {
            return Err(Error::BadName);
        }
        let mut v = ArrayVec::new();
        v.try_extend_from_slice(bytes).map_err(|_| Error::BadName)?;
        Ok(Self { bytes: v })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Splits the next component off `path`.
///
/// Returns `None` when no component remains (empty path or nothing but
/// slashes). The remainder has no leading slashes, so `rest.is_empty()`
/// tells the caller the component was the last one.
fn split_component(path: &[u8]) -> Option<(&[u8], &[u8])> {
    let start = path.iter().position(|&c| c != b'/')?;
    let path = &path[start..];
    let len = path
        .iter()
        .position(|&c| c == b'/')
        .unwrap_or(path.len());
    let (component, rest) = path.split_at(len);
    let next = rest
        .iter()
        .position(|&c| c != b'/')
        .unwrap_or(rest.len());
    Some((component, &rest[next..]))
}

/// Turns an open inode into a directory handle, returning the reference to
/// the itable when it is not one.
fn into_dir(fs: &FileSystem, ip: Arc<Inode>) -> Result<Dir> {
    if !ip.is_dir() {
        fs.itable().close(fs, ip);
        return Err(Error::NotADirectory);
    }
    Dir::new(ip)
}

/// Walks `path` to its final component.
///
/// Returns the open containing directory and the final name; the name is
/// `None` when the path is the root (or empty), in which case the directory
/// is the walk's endpoint itself. Every intermediate component must be a
/// live directory.
pub(crate) fn resolve(
    fs: &FileSystem,
    cwd: Option<&Arc<Inode>>,
    path: &str,
) -> Result<(Dir, Option<Name>)> {
    let start = match cwd {
        Some(ip) if !path.starts_with('/') => ip.sector(),
        _ => ROOT_SECTOR,
    };
    let cur = fs.itable().open(fs, start)?;
    let mut cur = scopeguard::guard(cur, |ip| fs.itable().close(fs, ip));
    let mut rest = path.as_bytes();

    loop {
        let (component, next) = match split_component(rest) {
            Some(parts) => parts,
            None => {
                let dir = into_dir(fs, ScopeGuard::into_inner(cur))?;
                return Ok((dir, None));
            }
        };
        let name = Name::new(component)?;
        if next.is_empty() {
            let dir = into_dir(fs, ScopeGuard::into_inner(cur))?;
            return Ok((dir, Some(name)));
        }

        // Step into an intermediate component. The transient handle shares
        // `cur`'s table reference, so it is not closed separately.
        let dir = Dir::new(Arc::clone(&cur))?;
        let child = dir.lookup(fs, &name)?;
        if !child.is_dir() || child.is_removed() {
            let missing = !child.is_dir();
            fs.itable().close(fs, child);
            return Err(if missing {
                Error::NotADirectory
            } else {
                Error::NotFound
            });
        }
        let old = core::mem::replace(&mut *cur, child);
        fs.itable().close(fs, old);
        rest = next;
    }
}

/// Like [`resolve`], but the final component must itself be a live
/// directory, returned open.
pub(crate) fn resolve_dir(
    fs: &FileSystem,
    cwd: Option<&Arc<Inode>>,
    path: &str,
) -> Result<Dir> {
    let (dir, name) = resolve(fs, cwd, path)?;
    let name = match name {
        Some(name) => name,
        None => return Ok(dir),
    };
    let dir = scopeguard::guard(dir, |d| fs.itable().close(fs, d.into_inode()));
    let child = dir.lookup(fs, &name)?;
    if child.is_removed() {
        fs.itable().close(fs, child);
        return Err(Error::NotFound);
    }
    into_dir(fs, child)
}
