use alloc::vec::Vec;

use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Descriptors 0-2 belong to the console and never appear in the table.
pub const FIRST_FD: i32 = 3;

/// One open descriptor: exactly one of the two handles is present.
pub struct FileTableEntry {
    pub fd: i32,
    pub file: Option<File>,
    pub dir: Option<Dir>,
}

/// Per-process descriptor table. Descriptors are handed out monotonically:
/// 3 when the table is empty, otherwise one past the last entry.
#[derive(Default)]
pub struct FileTable {
    entries: Vec<FileTableEntry>,
}

impl FileTable {
    pub fn new() -> Self {
        FileTable::default()
    }

    fn next_fd(&self) -> i32 {
        match self.entries.last() {
            None => FIRST_FD,
            Some(entry) => entry.fd + 1,
        }
    }

    pub fn add_file(&mut self, file: File) -> i32 {
        let fd = self.next_fd();
        self.entries.push(FileTableEntry {
            fd,
            file: Some(file),
            dir: None,
        });
        fd
    }

    pub fn add_dir(&mut self, dir: Dir) -> i32 {
        let fd = self.next_fd();
        self.entries.push(FileTableEntry {
            fd,
            file: None,
            dir: Some(dir),
        });
        fd
    }

    pub fn get(&self, fd: i32) -> Option<&FileTableEntry> {
        self.entries.iter().find(|e| e.fd == fd)
    }

    /// Removes and returns the entry; dropping it closes the handle.
    pub fn remove(&mut self, fd: i32) -> Option<FileTableEntry> {
        let idx = self.entries.iter().position(|e| e.fd == fd)?;
        Some(self.entries.remove(idx))
    }

    /// Closes everything, for process exit.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
