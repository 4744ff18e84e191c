/*!
 * One filesystem object discovered by the crawl
 */

use std::fs::FileType;
use std::path::PathBuf;

/// What kind of object an entry is. Only regular files contribute bytes to
/// bucket accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    /// Sockets, fifos, devices; handed to rsync untouched
    Other,
}

impl EntryKind {
    pub fn from_file_type(file_type: &FileType) -> Self {
        if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::Regular
        } else {
            EntryKind::Other
        }
    }
}

/// Immutable record of one crawled object. The path is relative to the
/// source root, byte-exact as the filesystem returned it; the root itself is
/// recorded as `.`.
#[derive(Debug, Clone)]
pub struct Entry {
    pub path: PathBuf,
    pub size: u64,
    pub kind: EntryKind,
}

impl Entry {
    /// `size` is only meaningful for regular files and zeroed otherwise.
    pub fn new(path: PathBuf, size: u64, kind: EntryKind) -> Self {
        let size = match kind {
            EntryKind::Regular => size,
            _ => 0,
        };
        Self { path, size, kind }
    }
}
