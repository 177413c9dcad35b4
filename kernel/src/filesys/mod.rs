//! The filesystem: flat file and directory storage underneath, the
//! hierarchical path layer on top. The single coarse lock the system-call
//! layer wraps around these calls lives in the kernel context, not here;
//! inode-level locking keeps the loader and the fault handler safe without
//! it.

use core::sync::atomic::{AtomicU32, Ordering};

use alloc::sync::Arc;

use self::dir::Dir;
use self::file::File;
use self::inode::{Inode, InodeNum};

pub mod dir;
pub mod file;
pub mod inode;
pub mod path;

/// Longest permitted name component, in bytes.
pub const NAME_MAX: usize = 14;

pub const ROOT_INUM: InodeNum = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    Exists,
    EmptyName,
    NameTooLong,
    NotEmpty,
    Removed,
    WrongType,
}

pub struct Filesys {
    root: Arc<Inode>,
    next_inum: AtomicU32,
}

impl Filesys {
    /// Formats a fresh filesystem with an empty root directory.
    pub fn format() -> Filesys {
        Filesys {
            root: Inode::new_root(ROOT_INUM),
            next_inum: AtomicU32::new(ROOT_INUM + 1),
        }
    }

    pub fn root_dir(&self) -> Dir {
        Dir::open(self.root.clone()).expect("root inode is a directory")
    }

    fn alloc_inum(&self) -> InodeNum {
        self.next_inum.fetch_add(1, Ordering::SeqCst)
    }

    /// Creates a regular file of `initial_size` zero bytes at `path`.
    pub fn create(&self, cwd: Option<&Dir>, path: &str, initial_size: usize) -> Result<(), FsError> {
        if path.is_empty() {
            return Err(FsError::EmptyName);
        }
        let (dirname, filename) = path::extract_name(path);
        if filename.is_empty() {
            return Err(FsError::EmptyName);
        }
        let dir = path::open_path(self, cwd, dirname).ok_or(FsError::NotFound)?;

        let inode = Inode::new_file(self.alloc_inum(), initial_size);
        dir.add(filename, &inode)
    }

    /// Creates a directory at `path`; its `.` and `..` resolve to itself
    /// and the parent it is created under.
    pub fn mkdir(&self, cwd: Option<&Dir>, path: &str) -> Result<(), FsError> {
        if path.is_empty() {
            return Err(FsError::EmptyName);
        }
        let (dirname, filename) = path::extract_name(path);
        if filename.is_empty() {
            return Err(FsError::EmptyName);
        }
        let parent = path::open_path(self, cwd, dirname).ok_or(FsError::NotFound)?;

        let inode = Inode::new_dir(self.alloc_inum(), parent.inode());
        parent.add(filename, &inode)
    }

    /// Opens `path` as a file handle. Directory paths (including paths with
    /// a trailing slash) yield a handle on the directory's inode, which the
    /// descriptor layer converts into a directory descriptor.
    pub fn open(&self, cwd: Option<&Dir>, path: &str) -> Result<File, FsError> {
        if path.is_empty() {
            return Err(FsError::EmptyName);
        }
        let (dirname, filename) = path::extract_name(path);
        let dir = path::open_path(self, cwd, dirname).ok_or(FsError::NotFound)?;

        let inode = if filename.is_empty() {
            dir.inode().clone()
        } else {
            dir.lookup(filename).ok_or(FsError::NotFound)?
        };

        if inode.is_removed() {
            return Err(FsError::Removed);
        }
        Ok(File::open(inode))
    }

    /// Removes the file or empty directory at `path`. Open handles on the
    /// removed inode keep working until they are closed.
    pub fn remove(&self, cwd: Option<&Dir>, path: &str) -> Result<(), FsError> {
        if path.is_empty() {
            return Err(FsError::EmptyName);
        }
        let (dirname, filename) = path::extract_name(path);
        if filename.is_empty() {
            return Err(FsError::EmptyName);
        }
        let dir = path::open_path(self, cwd, dirname).ok_or(FsError::NotFound)?;
        dir.remove(filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_open_read_write() {
        let fs = Filesys::format();
        fs.create(None, "f", 6).unwrap();
        assert_eq!(fs.create(None, "f", 6), Err(FsError::Exists));

        let file = fs.open(None, "f").unwrap();
        assert_eq!(file.write(b"ferrix"), 6);

        let again = fs.open(None, "f").unwrap();
        let mut buf = [0u8; 6];
        assert_eq!(again.read(&mut buf), 6);
        assert_eq!(&buf, b"ferrix");
    }

    #[test]
    fn nested_paths() {
        let fs = Filesys::format();
        fs.mkdir(None, "/a").unwrap();
        fs.mkdir(None, "/a/b").unwrap();
        fs.create(None, "/a/b/c", 1).unwrap();

        assert!(fs.open(None, "/a/b/c").is_ok());
        assert!(fs.open(None, "/a/b/").unwrap().inode().is_dir());
        assert_eq!(fs.open(None, "/a/x/c").unwrap_err(), FsError::NotFound);
        assert_eq!(fs.create(None, "/a/x/d", 0), Err(FsError::NotFound));
    }

    #[test]
    fn relative_paths_use_cwd() {
        let fs = Filesys::format();
        fs.mkdir(None, "a").unwrap();
        let a = path::open_path(&fs, None, "a").unwrap();

        fs.create(Some(&a), "f", 2).unwrap();
        assert!(fs.open(None, "/a/f").is_ok());
        assert!(fs.open(Some(&a), "f").is_ok());
        assert_eq!(fs.open(None, "f").unwrap_err(), FsError::NotFound);
    }

    #[test]
    fn removed_files_stay_readable_through_open_handles() {
        let fs = Filesys::format();
        fs.create(None, "f", 3).unwrap();
        let file = fs.open(None, "f").unwrap();
        file.write(b"abc");

        fs.remove(None, "f").unwrap();
        assert_eq!(fs.open(None, "f").unwrap_err(), FsError::NotFound);

        let mut buf = [0u8; 3];
        assert_eq!(file.read(&mut buf), 3);
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn mkdir_through_removed_directory_fails() {
        let fs = Filesys::format();
        fs.mkdir(None, "d").unwrap();
        let d = path::open_path(&fs, None, "d").unwrap();
        fs.remove(None, "d").unwrap();

        assert_eq!(fs.mkdir(Some(&d), "sub"), Err(FsError::Removed));
        assert_eq!(fs.create(None, "d/f", 0), Err(FsError::NotFound));
    }

    #[test]
    fn directory_removal_requires_empty() {
        let fs = Filesys::format();
        fs.mkdir(None, "d").unwrap();
        fs.create(None, "d/f", 0).unwrap();

        assert_eq!(fs.remove(None, "d"), Err(FsError::NotEmpty));
        fs.remove(None, "d/f").unwrap();
        fs.remove(None, "d").unwrap();
    }

    #[test]
    fn inode_numbers_are_stable_across_opens() {
        let fs = Filesys::format();
        fs.create(None, "f", 0).unwrap();
        let a = fs.open(None, "f").unwrap().inode().number();
        let b = fs.open(None, "f").unwrap().inode().number();
        assert_eq!(a, b);
        assert_ne!(a, ROOT_INUM);
    }
}
