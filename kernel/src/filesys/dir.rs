use alloc::string::{String, ToString};
use alloc::sync::Arc;
use spin::Mutex;

use super::inode::Inode;
use super::{FsError, NAME_MAX};

/// An open directory handle: a directory inode plus an iteration position
/// for `read_entry`.
pub struct Dir {
    inode: Arc<Inode>,
    pos: Mutex<usize>,
}

impl Dir {
    /// Opens `inode` as a directory; fails if it is a regular file.
    pub fn open(inode: Arc<Inode>) -> Option<Dir> {
        if !inode.is_dir() {
            return None;
        }
        Some(Dir {
            inode,
            pos: Mutex::new(0),
        })
    }

    pub fn reopen(&self) -> Dir {
        Dir {
            inode: self.inode.clone(),
            pos: Mutex::new(0),
        }
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// Looks `name` up in this directory. `.` and `..` resolve through the
    /// inode itself and its parent link.
    pub fn lookup(&self, name: &str) -> Option<Arc<Inode>> {
        match name {
            "." => Some(self.inode.clone()),
            ".." => self.inode.dir()?.parent.lock().upgrade(),
            _ => self.inode.dir()?.entries.lock().get(name).cloned(),
        }
    }

    /// Adds `child` under `name`. Fails on an invalid name, a duplicate, or
    /// a directory that has already been removed.
    pub fn add(&self, name: &str, child: &Arc<Inode>) -> Result<(), FsError> {
        if name.is_empty() || name == "." || name == ".." {
            return Err(FsError::EmptyName);
        }
        if name.len() > NAME_MAX {
            return Err(FsError::NameTooLong);
        }
        if self.inode.is_removed() {
            return Err(FsError::Removed);
        }

        let inner = self.inode.dir().ok_or(FsError::WrongType)?;
        let mut entries = inner.entries.lock();
        if entries.contains_key(name) {
            return Err(FsError::Exists);
        }
        entries.insert(name.to_string(), child.clone());
        Ok(())
    }

    /// Removes the entry for `name`. A directory must be empty; the removed
    /// inode is marked so open handles keep working but new opens through
    /// it fail.
    pub fn remove(&self, name: &str) -> Result<(), FsError> {
        if name == "." || name == ".." {
            return Err(FsError::WrongType);
        }

        let inner = self.inode.dir().ok_or(FsError::WrongType)?;
        let mut entries = inner.entries.lock();
        let child = entries.get(name).ok_or(FsError::NotFound)?;

        if let Some(child_dir) = child.dir()
            && !child_dir.entries.lock().is_empty()
        {
            return Err(FsError::NotEmpty);
        }

        let child = entries.remove(name).unwrap();
        child.mark_removed();
        Ok(())
    }

    /// Yields the next entry name, skipping `.` and `..` (which are not
    /// stored as entries). None at the end of the directory.
    pub fn read_entry(&self) -> Option<String> {
        let inner = self.inode.dir()?;
        let entries = inner.entries.lock();
        let mut pos = self.pos.lock();
        let name = entries.keys().nth(*pos)?;
        *pos += 1;
        Some(name.clone())
    }

    /// Entry count excluding `.` and `..`.
    pub fn is_empty(&self) -> bool {
        self.inode
            .dir()
            .is_none_or(|inner| inner.entries.lock().is_empty())
    }
}
