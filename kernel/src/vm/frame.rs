//! Global frame table: one entry per user-pool frame in use, kept in
//! insertion order for the clock sweep. A single mutex guards the list,
//! the clock hand, and the whole eviction path, swap I/O included; only
//! one eviction can be in flight at a time.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use spin::Mutex;

use crate::user::process::{Pid, Process};

use super::page::PageBacking;
use super::palloc::{FrameIdx, PalFlags, UserPool};
use super::swap::SwapArea;
use super::Vaddr;

pub struct FrameTableEntry {
    frame: FrameIdx,
    page: Vaddr,
    owner: Weak<Process>,
    /// A frame being filled by a fault or by the loader is not yet backed
    /// by a consistent page; the clock must not take it.
    pinned: bool,
}

struct FrameTableInner {
    entries: Vec<FrameTableEntry>,
    hand: usize,
}

pub struct FrameTable {
    inner: Mutex<FrameTableInner>,
    pool: Arc<UserPool>,
}

impl FrameTable {
    pub fn new(pool: Arc<UserPool>) -> Self {
        FrameTable {
            inner: Mutex::new(FrameTableInner {
                entries: Vec::new(),
                hand: 0,
            }),
            pool,
        }
    }

    /// Gets a user-pool frame for `owner`'s page at `page`, evicting if the
    /// pool is dry. The retry after eviction must succeed: eviction freed a
    /// frame and nobody else can take it while we hold the lock.
    ///
    /// The frame comes back pinned; the caller unpins it once the page's
    /// contents and mapping are in place.
    pub fn allocate(
        &self,
        swap: &SwapArea,
        flags: PalFlags,
        page: Vaddr,
        owner: &Arc<Process>,
    ) -> Option<FrameIdx> {
        let mut inner = self.inner.lock();

        let frame = match self.pool.alloc(flags) {
            Some(frame) => frame,
            None => {
                self.evict_one(&mut inner, swap);
                self.pool
                    .alloc(flags)
                    .expect("user pool empty right after eviction")
            }
        };

        inner.entries.push(FrameTableEntry {
            frame,
            page,
            owner: Arc::downgrade(owner),
            pinned: true,
        });
        Some(frame)
    }

    /// Makes a freshly-filled frame eligible for eviction.
    pub fn unpin(&self, frame: FrameIdx) {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .iter_mut()
            .find(|e| e.frame == frame)
            .expect("unpin of an untracked frame");
        entry.pinned = false;
    }

    /// Removes the entry for `frame` and returns the frame to the pool.
    pub fn free(&self, frame: FrameIdx) {
        let mut inner = self.inner.lock();
        Self::remove_entry(&mut inner, frame);
        self.pool.free(frame);
    }

    /// Drops every entry owned by `owner` without releasing the frames;
    /// the owner's page directory destructor frees those. Called on the
    /// exit path before the supplemental page table is swept, in one
    /// critical section, so no eviction can pick one of the dying
    /// process's frames mid-teardown.
    pub fn purge(&self, owner: &Process) {
        let mut inner = self.inner.lock();
        let owner_ptr = owner as *const Process;
        let mut idx = 0;
        while idx < inner.entries.len() {
            if core::ptr::eq(inner.entries[idx].owner.as_ptr(), owner_ptr) {
                inner.entries.remove(idx);
                if inner.hand > idx {
                    inner.hand -= 1;
                }
            } else {
                idx += 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// (frame, page, owning pid) for every entry, for invariant checks.
    pub fn snapshot(&self) -> Vec<(FrameIdx, Vaddr, Pid)> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter_map(|e| e.owner.upgrade().map(|owner| (e.frame, e.page, owner.pid)))
            .collect()
    }

    fn remove_entry(inner: &mut FrameTableInner, frame: FrameIdx) {
        let idx = inner
            .entries
            .iter()
            .position(|e| e.frame == frame)
            .expect("frame has no table entry");
        inner.entries.remove(idx);
        if inner.hand > idx {
            inner.hand -= 1;
        }
    }

    /// Clock (second-chance) eviction. Sweeps the list from the hand:
    /// accessed entries get their bit cleared and are skipped; the first
    /// un-accessed entry is the victim. The victim's present bit goes away
    /// first (dirty survives), then the page either falls back to its file
    /// (clean file pages) or goes to swap.
    fn evict_one(&self, inner: &mut FrameTableInner, swap: &SwapArea) {
        assert!(
            !inner.entries.is_empty(),
            "user pool exhausted with an empty frame table"
        );

        let mut sweeps = 0;
        let victim = loop {
            if inner.hand >= inner.entries.len() {
                inner.hand = 0;
                sweeps += 1;
                assert!(sweeps <= 3, "no evictable frame: every frame is pinned");
            }
            let entry = &inner.entries[inner.hand];
            if entry.pinned {
                inner.hand += 1;
                continue;
            }
            let owner = entry
                .owner
                .upgrade()
                .expect("frame owner exited without purging its frames");
            let pagedir = owner.pagedir().expect("frame owner has no page directory");
            if pagedir.is_accessed(entry.page) {
                pagedir.set_accessed(entry.page, false);
                inner.hand += 1;
            } else {
                break inner.hand;
            }
        };

        let entry = inner.entries.remove(victim);
        let owner = entry
            .owner
            .upgrade()
            .expect("frame owner exited without purging its frames");
        let pagedir = owner.pagedir().expect("frame owner has no page directory");

        pagedir.clear_page(entry.page);
        let dirty = pagedir.is_dirty(entry.page);

        let spte = owner
            .spt
            .lookup(entry.page)
            .expect("evicted frame has no supplemental entry");

        if !dirty && matches!(spte.backing, PageBacking::FromFilesys { .. }) {
            // Clean file page: drop it, the file still has the bytes.
            owner.spt.evicted_to_file(entry.page);
            log::debug!(
                "evict: pid {} page {:#x} dropped (clean file page)",
                owner.pid,
                entry.page
            );
        } else {
            let slot = swap
                .swap_out(self.pool.frame(entry.frame))
                .unwrap_or_else(|| panic!("no free swap slot"));
            owner.spt.evicted_to_swap(entry.page, slot);
            log::debug!(
                "evict: pid {} page {:#x} to swap slot {}",
                owner.pid,
                entry.page,
                slot
            );
        }

        self.pool.free(entry.frame);
    }
}
