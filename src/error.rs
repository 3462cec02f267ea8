use core::fmt;

/// Failure categories surfaced by the file system.
///
/// Byte-count interfaces (`read_at`, `write_at`) do not return these; they
/// report failure as a zero count. Everything else propagates `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A path component does not exist.
    NotFound,
    /// The target name is already present in the directory.
    AlreadyExists,
    /// The free map has no sector left to hand out.
    NoSpace,
    /// The file would outgrow the doubly-indirect map.
    TooBig,
    /// The directory still has entries besides `.` and `..`.
    NotEmpty,
    /// The inode is the root, a current directory, or open elsewhere.
    Busy,
    /// A name component is empty, longer than [`DIRSIZ`], or contains
    /// `/` or NUL.
    ///
    /// [`DIRSIZ`]: crate::DIRSIZ
    BadName,
    /// A file stands where the path needs a directory.
    NotADirectory,
    /// Writes to the inode are denied.
    ReadOnly,
    /// The on-disk state is not a file system this crate understands.
    Corrupted,
    /// The device has more sectors than the free map can track.
    DeviceTooLarge,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::NotFound => "no such file or directory",
            Error::AlreadyExists => "already exists",
            Error::NoSpace => "out of sectors",
            Error::TooBig => "file too big",
            Error::NotEmpty => "directory not empty",
            Error::Busy => "in use",
            Error::BadName => "bad file name",
            Error::NotADirectory => "not a directory",
            Error::ReadOnly => "writes denied",
            Error::Corrupted => "not a valid file system",
            Error::DeviceTooLarge => "device too large",
        };
        write!(f, "{}", msg)
    }
}
