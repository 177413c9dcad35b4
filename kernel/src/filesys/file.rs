use core::sync::atomic::{AtomicBool, Ordering};

use alloc::sync::Arc;
use spin::Mutex;

use super::inode::Inode;

/// An open file handle: an inode plus a seek position. Independent handles
/// on the same inode have independent positions.
pub struct File {
    inode: Arc<Inode>,
    pos: Mutex<usize>,
    denied: AtomicBool,
}

impl core::fmt::Debug for File {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("File").finish_non_exhaustive()
    }
}

impl File {
    pub fn open(inode: Arc<Inode>) -> File {
        File {
            inode,
            pos: Mutex::new(0),
            denied: AtomicBool::new(false),
        }
    }

    /// A fresh handle on the same inode, position reset.
    pub fn reopen(&self) -> File {
        File::open(self.inode.clone())
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut pos = self.pos.lock();
        let n = self.inode.read_at(buf, *pos);
        *pos += n;
        n
    }

    /// Positionless read, used by the fault handler so demand paging never
    /// disturbs the handle's seek position.
    pub fn read_at(&self, buf: &mut [u8], ofs: usize) -> usize {
        self.inode.read_at(buf, ofs)
    }

    pub fn write(&self, buf: &[u8]) -> usize {
        let mut pos = self.pos.lock();
        let n = self.inode.write_at(buf, *pos);
        *pos += n;
        n
    }

    pub fn seek(&self, pos: usize) {
        *self.pos.lock() = pos;
    }

    pub fn tell(&self) -> usize {
        *self.pos.lock()
    }

    pub fn length(&self) -> usize {
        self.inode.length()
    }

    /// Rejects writes to the inode until this handle allows them again (or
    /// is closed). Idempotent per handle.
    pub fn deny_write(&self) {
        if !self.denied.swap(true, Ordering::SeqCst) {
            self.inode.deny_write();
        }
    }

    pub fn allow_write(&self) {
        if self.denied.swap(false, Ordering::SeqCst) {
            self.inode.allow_write();
        }
    }
}

impl Drop for File {
    fn drop(&mut self) {
        self.allow_write();
    }
}
