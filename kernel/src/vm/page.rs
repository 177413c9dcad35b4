//! Per-process supplemental page table: for every user page a process has
//! touched, where its contents live when they are not in a frame.

use alloc::collections::btree_map::BTreeMap;
use alloc::sync::Arc;
use spin::Mutex;

use crate::filesys::file::File;
use crate::user::process::Process;

use super::frame::FrameTable;
use super::palloc::FrameIdx;
use super::swap::SwapArea;
use super::{Vaddr, pg_ofs};

/// Where a page's bytes come from. `SwapSlot` is only ever produced by
/// eviction; the loader and fault handler create the other three.
#[derive(Clone)]
pub enum PageBacking {
    OnFrame,
    AllZero,
    SwapSlot {
        slot: usize,
    },
    FromFilesys {
        file: Arc<File>,
        ofs: usize,
        read_bytes: usize,
        zero_bytes: usize,
    },
}

/// Payload-free view of a backing, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    OnFrame,
    AllZero,
    SwapSlot,
    FromFilesys,
}

impl PageBacking {
    pub fn state(&self) -> PageState {
        match self {
            PageBacking::OnFrame => PageState::OnFrame,
            PageBacking::AllZero => PageState::AllZero,
            PageBacking::SwapSlot { .. } => PageState::SwapSlot,
            PageBacking::FromFilesys { .. } => PageState::FromFilesys,
        }
    }
}

#[derive(Clone)]
pub struct SupPageTableEntry {
    pub page: Vaddr,
    pub frame: Option<FrameIdx>,
    pub writable: bool,
    pub present: bool,
    pub backing: PageBacking,
}

pub struct SupPageTable {
    entries: Mutex<BTreeMap<Vaddr, SupPageTableEntry>>,
}

impl Default for SupPageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SupPageTable {
    pub fn new() -> Self {
        SupPageTable {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Records a new page. Rejects pages that already have an entry.
    ///
    /// `OnFrame` entries are born resident and need `frame`; a
    /// `FromFilesys` entry with nothing to read is stored as `AllZero`.
    pub fn create(
        &self,
        page: Vaddr,
        frame: Option<FrameIdx>,
        writable: bool,
        backing: PageBacking,
    ) -> bool {
        debug_assert_eq!(pg_ofs(page), 0);

        let (backing, present, frame) = match backing {
            PageBacking::OnFrame => {
                debug_assert!(frame.is_some());
                (PageBacking::OnFrame, true, frame)
            }
            PageBacking::AllZero => (PageBacking::AllZero, false, None),
            PageBacking::FromFilesys { read_bytes: 0, .. } => (PageBacking::AllZero, false, None),
            backing @ PageBacking::FromFilesys { .. } => (backing, false, None),
            PageBacking::SwapSlot { .. } => {
                unreachable!("swap-backed pages are created by eviction only")
            }
        };

        let mut entries = self.entries.lock();
        if entries.contains_key(&page) {
            return false;
        }
        entries.insert(
            page,
            SupPageTableEntry {
                page,
                frame,
                writable,
                present,
                backing,
            },
        );
        true
    }

    pub fn lookup(&self, page: Vaddr) -> Option<SupPageTableEntry> {
        self.entries.lock().get(&page).cloned()
    }

    pub fn state_of(&self, page: Vaddr) -> Option<PageState> {
        self.entries.lock().get(&page).map(|e| e.backing.state())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Marks a page resident after the fault handler materialized it.
    /// File pages keep their file backing so a clean copy can be dropped
    /// by eviction later; everything else becomes `OnFrame`.
    pub fn set_resident(&self, page: Vaddr, frame: FrameIdx) {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&page).expect("resident page has no entry");
        entry.frame = Some(frame);
        entry.present = true;
        match entry.backing {
            PageBacking::AllZero | PageBacking::SwapSlot { .. } => {
                entry.backing = PageBacking::OnFrame;
            }
            PageBacking::OnFrame | PageBacking::FromFilesys { .. } => {}
        }
    }

    /// Eviction chose swap for this page.
    pub fn evicted_to_swap(&self, page: Vaddr, slot: usize) {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&page).expect("evicted page has no entry");
        entry.frame = None;
        entry.present = false;
        entry.backing = PageBacking::SwapSlot { slot };
    }

    /// Eviction dropped a clean file-backed page; it will be re-read from
    /// the file on the next fault.
    pub fn evicted_to_file(&self, page: Vaddr) {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&page).expect("evicted page has no entry");
        debug_assert!(matches!(entry.backing, PageBacking::FromFilesys { .. }));
        entry.frame = None;
        entry.present = false;
    }

    /// Tears the table down at process exit. The process is detached from
    /// the global frame table first so eviction cannot race the sweep;
    /// frames themselves are released by the page directory destructor.
    pub fn destroy(&self, frames: &FrameTable, swap: &SwapArea, owner: &Process) {
        frames.purge(owner);

        let mut entries = self.entries.lock();
        for (_, entry) in core::mem::take(&mut *entries) {
            if let PageBacking::SwapSlot { slot } = entry.backing {
                swap.swap_free(slot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_pages_are_rejected() {
        let spt = SupPageTable::new();
        assert!(spt.create(0x1000, None, true, PageBacking::AllZero));
        assert!(!spt.create(0x1000, None, true, PageBacking::AllZero));
        assert_eq!(spt.len(), 1);
    }

    #[test]
    fn on_frame_entries_are_resident() {
        let spt = SupPageTable::new();
        assert!(spt.create(
            0x2000,
            Some(FrameIdx(3)),
            true,
            PageBacking::OnFrame
        ));
        let entry = spt.lookup(0x2000).unwrap();
        assert!(entry.present);
        assert_eq!(entry.frame, Some(FrameIdx(3)));
        assert_eq!(entry.backing.state(), PageState::OnFrame);
    }

    #[test]
    fn zero_length_file_page_becomes_all_zero() {
        let spt = SupPageTable::new();
        let fs = crate::filesys::Filesys::format();
        fs.create(None, "exe", 0).unwrap();
        let file = Arc::new(fs.open(None, "exe").unwrap());

        assert!(spt.create(
            0x3000,
            None,
            true,
            PageBacking::FromFilesys {
                file,
                ofs: 0,
                read_bytes: 0,
                zero_bytes: crate::vm::PG_SIZE,
            }
        ));
        assert_eq!(spt.state_of(0x3000), Some(PageState::AllZero));
        assert!(!spt.lookup(0x3000).unwrap().present);
    }

    #[test]
    fn swap_transitions() {
        let spt = SupPageTable::new();
        spt.create(0x4000, Some(FrameIdx(0)), true, PageBacking::OnFrame);

        spt.evicted_to_swap(0x4000, 7);
        let entry = spt.lookup(0x4000).unwrap();
        assert!(!entry.present);
        assert_eq!(entry.frame, None);
        assert_eq!(entry.backing.state(), PageState::SwapSlot);

        spt.set_resident(0x4000, FrameIdx(1));
        let entry = spt.lookup(0x4000).unwrap();
        assert!(entry.present);
        assert_eq!(entry.backing.state(), PageState::OnFrame);
    }
}
