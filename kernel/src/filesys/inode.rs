//! In-memory inodes. A file inode owns its bytes; a directory inode owns a
//! name → inode map plus a link to its parent (the `..` of a directory is
//! the parent link, and `.` is the inode itself, so neither occupies an
//! entry slot). Inode numbers stand in for header sectors.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use alloc::collections::btree_map::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use spin::{Mutex, RwLock};

pub type InodeNum = u32;

pub(crate) struct DirInner {
    pub(crate) entries: Mutex<BTreeMap<String, Arc<Inode>>>,
    pub(crate) parent: Mutex<Weak<Inode>>,
}

pub(crate) enum InodePayload {
    File(RwLock<Vec<u8>>),
    Dir(DirInner),
}

pub struct Inode {
    number: InodeNum,
    pub(crate) payload: InodePayload,
    removed: AtomicBool,
    deny_write_cnt: AtomicU32,
}

impl Inode {
    pub(crate) fn new_file(number: InodeNum, size: usize) -> Arc<Inode> {
        Arc::new(Inode {
            number,
            payload: InodePayload::File(RwLock::new(vec![0; size])),
            removed: AtomicBool::new(false),
            deny_write_cnt: AtomicU32::new(0),
        })
    }

    pub(crate) fn new_dir(number: InodeNum, parent: &Arc<Inode>) -> Arc<Inode> {
        Arc::new(Inode {
            number,
            payload: InodePayload::Dir(DirInner {
                entries: Mutex::new(BTreeMap::new()),
                parent: Mutex::new(Arc::downgrade(parent)),
            }),
            removed: AtomicBool::new(false),
            deny_write_cnt: AtomicU32::new(0),
        })
    }

    /// The root directory is its own parent.
    pub(crate) fn new_root(number: InodeNum) -> Arc<Inode> {
        Arc::new_cyclic(|weak| Inode {
            number,
            payload: InodePayload::Dir(DirInner {
                entries: Mutex::new(BTreeMap::new()),
                parent: Mutex::new(weak.clone()),
            }),
            removed: AtomicBool::new(false),
            deny_write_cnt: AtomicU32::new(0),
        })
    }

    pub fn number(&self) -> InodeNum {
        self.number
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.payload, InodePayload::Dir(_))
    }

    pub fn length(&self) -> usize {
        match &self.payload {
            InodePayload::File(data) => data.read().len(),
            InodePayload::Dir(_) => 0,
        }
    }

    /// Reads up to `buf.len()` bytes at `ofs`; short at end of file, 0 for
    /// directories.
    pub fn read_at(&self, buf: &mut [u8], ofs: usize) -> usize {
        let InodePayload::File(data) = &self.payload else {
            return 0;
        };
        let data = data.read();
        if ofs >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - ofs);
        buf[..n].copy_from_slice(&data[ofs..ofs + n]);
        n
    }

    /// Writes up to `buf.len()` bytes at `ofs`, stopping at end of file
    /// (files do not grow). Returns 0 while writes are denied.
    pub fn write_at(&self, buf: &[u8], ofs: usize) -> usize {
        if self.deny_write_cnt.load(Ordering::SeqCst) > 0 {
            return 0;
        }
        let InodePayload::File(data) = &self.payload else {
            return 0;
        };
        let mut data = data.write();
        if ofs >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - ofs);
        data[ofs..ofs + n].copy_from_slice(&buf[..n]);
        n
    }

    pub fn deny_write(&self) {
        self.deny_write_cnt.fetch_add(1, Ordering::SeqCst);
    }

    pub fn allow_write(&self) {
        let prev = self.deny_write_cnt.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "allow_write without matching deny_write");
    }

    pub fn write_denied(&self) -> bool {
        self.deny_write_cnt.load(Ordering::SeqCst) > 0
    }

    pub fn mark_removed(&self) {
        self.removed.store(true, Ordering::SeqCst);
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    pub(crate) fn dir(&self) -> Option<&DirInner> {
        match &self.payload {
            InodePayload::Dir(inner) => Some(inner),
            InodePayload::File(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_reads_are_bounded() {
        let inode = Inode::new_file(2, 8);
        assert_eq!(inode.write_at(b"abcdefgh", 0), 8);

        let mut buf = [0u8; 16];
        assert_eq!(inode.read_at(&mut buf, 0), 8);
        assert_eq!(&buf[..8], b"abcdefgh");
        assert_eq!(inode.read_at(&mut buf, 6), 2);
        assert_eq!(&buf[..2], b"gh");
        assert_eq!(inode.read_at(&mut buf, 8), 0);
    }

    #[test]
    fn files_do_not_grow() {
        let inode = Inode::new_file(2, 4);
        assert_eq!(inode.write_at(b"abcdef", 0), 4);
        assert_eq!(inode.write_at(b"x", 4), 0);
        assert_eq!(inode.length(), 4);
    }

    #[test]
    fn deny_write_blocks_and_unblocks() {
        let inode = Inode::new_file(2, 4);
        inode.deny_write();
        assert_eq!(inode.write_at(b"no", 0), 0);
        inode.deny_write();
        inode.allow_write();
        assert_eq!(inode.write_at(b"no", 0), 0);
        inode.allow_write();
        assert_eq!(inode.write_at(b"ok", 0), 2);
    }

    #[test]
    fn root_is_its_own_parent() {
        let root = Inode::new_root(1);
        let parent = root.dir().unwrap().parent.lock().upgrade().unwrap();
        assert_eq!(parent.number(), root.number());
    }
}
