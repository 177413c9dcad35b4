//! The swap area: page-sized slots laid out contiguously from sector 0 of
//! the swap device, with a bitmap tracking which slots hold a page.

use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::block::{MemDisk, SECTOR_SIZE};

use super::PG_SIZE;
use super::palloc::FramePage;

pub const SECTORS_PER_PAGE: usize = PG_SIZE / SECTOR_SIZE;

/// Fixed-size bit set. Bit set = slot in use.
struct Bitmap {
    bits: Vec<u64>,
    len: usize,
}

impl Bitmap {
    fn new(len: usize) -> Self {
        Bitmap {
            bits: vec![0; len.div_ceil(64)],
            len,
        }
    }

    fn test(&self, idx: usize) -> bool {
        assert!(idx < self.len);
        self.bits[idx / 64] & (1 << (idx % 64)) != 0
    }

    fn set(&mut self, idx: usize, value: bool) {
        assert!(idx < self.len);
        if value {
            self.bits[idx / 64] |= 1 << (idx % 64);
        } else {
            self.bits[idx / 64] &= !(1 << (idx % 64));
        }
    }

    /// Finds the first clear bit, sets it, and returns its index.
    fn scan_and_set(&mut self) -> Option<usize> {
        for idx in 0..self.len {
            if !self.test(idx) {
                self.set(idx, true);
                return Some(idx);
            }
        }
        None
    }

    fn count_set(&self) -> usize {
        (0..self.len).filter(|&idx| self.test(idx)).count()
    }
}

pub struct SwapArea {
    device: MemDisk,
    used: Mutex<Bitmap>,
    slots: usize,
}

impl SwapArea {
    pub fn new(device: MemDisk) -> Self {
        let slots = device.sector_count() / SECTORS_PER_PAGE;
        SwapArea {
            device,
            used: Mutex::new(Bitmap::new(slots)),
            slots,
        }
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn used_slots(&self) -> usize {
        self.used.lock().count_set()
    }

    /// Writes `frame` into the first free slot. None when the swap is full.
    pub fn swap_out(&self, frame: &FramePage) -> Option<usize> {
        let slot = self.used.lock().scan_and_set()?;

        let mut sector_buf = [0u8; SECTOR_SIZE];
        for i in 0..SECTORS_PER_PAGE {
            frame.read(i * SECTOR_SIZE, &mut sector_buf);
            self.device.write(slot * SECTORS_PER_PAGE + i, &sector_buf);
        }
        log::trace!("swapped out to slot {}", slot);
        Some(slot)
    }

    /// Reads `slot` back into `frame` and releases the slot.
    ///
    /// # Panics
    /// Panics if `slot` is not in use.
    pub fn swap_in(&self, slot: usize, frame: &FramePage) {
        {
            let mut used = self.used.lock();
            assert!(used.test(slot), "swap_in of free slot {}", slot);
            used.set(slot, false);
        }

        let mut sector_buf = [0u8; SECTOR_SIZE];
        for i in 0..SECTORS_PER_PAGE {
            self.device.read(slot * SECTORS_PER_PAGE + i, &mut sector_buf);
            frame.write(i * SECTOR_SIZE, &sector_buf);
        }
        log::trace!("swapped in from slot {}", slot);
    }

    /// Releases `slot` without reading it; used when a process exits with
    /// pages still swapped out.
    pub fn swap_free(&self, slot: usize) {
        let mut used = self.used.lock();
        assert!(used.test(slot), "swap_free of free slot {}", slot);
        used.set(slot, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::palloc::{PalFlags, UserPool};

    #[test]
    fn bitmap_scan_finds_lowest_free() {
        let mut map = Bitmap::new(130);
        assert_eq!(map.scan_and_set(), Some(0));
        assert_eq!(map.scan_and_set(), Some(1));
        map.set(0, false);
        assert_eq!(map.scan_and_set(), Some(0));
        assert_eq!(map.count_set(), 2);
    }

    #[test]
    fn bitmap_fills_up() {
        let mut map = Bitmap::new(3);
        for _ in 0..3 {
            assert!(map.scan_and_set().is_some());
        }
        assert_eq!(map.scan_and_set(), None);
    }

    #[test]
    fn swap_round_trip_is_bitwise() {
        let pool = UserPool::new(2);
        let swap = SwapArea::new(MemDisk::new(4 * SECTORS_PER_PAGE));
        assert_eq!(swap.slots(), 4);

        let frame = pool.alloc(PalFlags::ZERO).unwrap();
        let page = pool.frame(frame);
        for i in 0..PG_SIZE {
            page.set_byte(i, (i % 251) as u8);
        }

        let slot = swap.swap_out(page).unwrap();
        assert_eq!(swap.used_slots(), 1);

        let other = pool.alloc(PalFlags::ZERO).unwrap();
        let other_page = pool.frame(other);
        swap.swap_in(slot, other_page);
        assert_eq!(swap.used_slots(), 0);

        for i in 0..PG_SIZE {
            assert_eq!(other_page.byte(i), (i % 251) as u8);
        }
    }

    #[test]
    fn swap_exhaustion_reports_no_slot() {
        let pool = UserPool::new(1);
        let swap = SwapArea::new(MemDisk::new(SECTORS_PER_PAGE));
        let frame = pool.alloc(PalFlags::ZERO).unwrap();

        assert!(swap.swap_out(pool.frame(frame)).is_some());
        assert!(swap.swap_out(pool.frame(frame)).is_none());
    }

    #[test]
    fn swap_free_releases_slot() {
        let pool = UserPool::new(1);
        let swap = SwapArea::new(MemDisk::new(2 * SECTORS_PER_PAGE));
        let frame = pool.alloc(PalFlags::ZERO).unwrap();

        let slot = swap.swap_out(pool.frame(frame)).unwrap();
        swap.swap_free(slot);
        assert_eq!(swap.used_slots(), 0);
        assert_eq!(swap.swap_out(pool.frame(frame)), Some(slot));
    }
}
