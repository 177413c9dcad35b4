//! Per-process page table, standing in for the hardware page directory.
//! Entries carry the present/writable/accessed/dirty bits an MMU would
//! keep; the access paths maintain accessed and dirty exactly like page
//! table walks do, which is what the clock eviction relies on.

use alloc::collections::btree_map::BTreeMap;
use alloc::sync::Arc;
use spin::Mutex;

use super::palloc::{FrameIdx, UserPool};
use super::{PG_SIZE, Vaddr, pg_ofs, pg_round_down};

#[derive(Debug, Clone, Copy)]
struct PageEntry {
    frame: FrameIdx,
    writable: bool,
    present: bool,
    accessed: bool,
    dirty: bool,
}

pub struct PageDir {
    entries: Mutex<BTreeMap<Vaddr, PageEntry>>,
    pool: Arc<UserPool>,
}

impl PageDir {
    pub fn new(pool: Arc<UserPool>) -> Self {
        PageDir {
            entries: Mutex::new(BTreeMap::new()),
            pool,
        }
    }

    /// Maps `upage` to `frame`. Fails if a present mapping already exists.
    pub fn set_page(&self, upage: Vaddr, frame: FrameIdx, writable: bool) -> bool {
        debug_assert_eq!(pg_ofs(upage), 0);
        let mut entries = self.entries.lock();
        if entries.get(&upage).is_some_and(|e| e.present) {
            return false;
        }
        entries.insert(
            upage,
            PageEntry {
                frame,
                writable,
                present: true,
                accessed: false,
                dirty: false,
            },
        );
        true
    }

    /// The frame mapped at `upage`, if the mapping is present.
    pub fn get_page(&self, upage: Vaddr) -> Option<FrameIdx> {
        let entries = self.entries.lock();
        entries
            .get(&upage)
            .filter(|e| e.present)
            .map(|e| e.frame)
    }

    /// Marks `upage` not-present. Accessed and dirty bits survive so the
    /// eviction path can still consult them.
    pub fn clear_page(&self, upage: Vaddr) {
        if let Some(entry) = self.entries.lock().get_mut(&upage) {
            entry.present = false;
        }
    }

    pub fn is_dirty(&self, upage: Vaddr) -> bool {
        self.entries
            .lock()
            .get(&upage)
            .is_some_and(|e| e.dirty)
    }

    pub fn is_accessed(&self, upage: Vaddr) -> bool {
        self.entries
            .lock()
            .get(&upage)
            .is_some_and(|e| e.accessed)
    }

    pub fn set_accessed(&self, upage: Vaddr, accessed: bool) {
        if let Some(entry) = self.entries.lock().get_mut(&upage) {
            entry.accessed = accessed;
        }
    }

    /// Reads the byte at `va` through the table, setting the accessed bit.
    /// The read happens under the table lock, so it cannot race an
    /// eviction's present-bit clear and frame copy-out.
    pub fn read_byte(&self, va: Vaddr) -> Option<u8> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&pg_round_down(va))?;
        if !entry.present {
            return None;
        }
        entry.accessed = true;
        Some(self.pool.frame(entry.frame).byte(pg_ofs(va)))
    }

    /// Writes the byte at `va` through the table, setting accessed and
    /// dirty. User-mode writes respect the writable bit; kernel-mode
    /// writes (through the kernel alias) do not. Runs under the table
    /// lock for the same reason as [`PageDir::read_byte`].
    pub fn write_byte(&self, va: Vaddr, value: u8, kernel: bool) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&pg_round_down(va)) else {
            return false;
        };
        if !entry.present || (!kernel && !entry.writable) {
            return false;
        }
        entry.accessed = true;
        entry.dirty = true;
        self.pool.frame(entry.frame).set_byte(pg_ofs(va), value);
        true
    }

    /// Whether `va` has a present mapping that is not writable from user
    /// mode; a user write there is a rights violation, not a missing page.
    pub fn is_write_protected(&self, va: Vaddr) -> bool {
        self.entries
            .lock()
            .get(&pg_round_down(va))
            .is_some_and(|e| e.present && !e.writable)
    }

    /// Frees every frame still mapped present and drops the table. Frames
    /// already evicted (present bit clear) were released by the evictor.
    pub fn destroy(&self) {
        let mut entries = self.entries.lock();
        for (_, entry) in core::mem::take(&mut *entries) {
            if entry.present {
                self.pool.free(entry.frame);
            }
        }
    }

    pub fn mapped_pages(&self) -> usize {
        self.entries.lock().values().filter(|e| e.present).count()
    }
}

impl Drop for PageDir {
    fn drop(&mut self) {
        // Catches teardown paths that forget the explicit destroy.
        let entries = self.entries.get_mut();
        for (_, entry) in core::mem::take(entries) {
            if entry.present {
                self.pool.free(entry.frame);
            }
        }
    }
}

const _: () = assert!(PG_SIZE.is_power_of_two());
