//! The user page pool: a fixed array of page-sized physical frames with a
//! free list. Frame contents are atomic bytes, so an eviction copying a
//! frame out races the owner's last stores the way real memory would,
//! without either copy being undefined.

use core::sync::atomic::{AtomicU8, Ordering};

use alloc::vec::Vec;
use bitflags::bitflags;
use spin::Mutex;

use super::PG_SIZE;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PalFlags: u8 {
        /// Zero the frame before handing it out.
        const ZERO = 1;
    }
}

/// Index of a frame within the user pool; stands in for a physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameIdx(pub usize);

pub struct FramePage {
    bytes: Vec<AtomicU8>,
}

impl FramePage {
    fn new() -> Self {
        let mut bytes = Vec::with_capacity(PG_SIZE);
        bytes.resize_with(PG_SIZE, || AtomicU8::new(0));
        FramePage { bytes }
    }

    pub fn byte(&self, ofs: usize) -> u8 {
        self.bytes[ofs].load(Ordering::Relaxed)
    }

    pub fn set_byte(&self, ofs: usize, value: u8) {
        self.bytes[ofs].store(value, Ordering::Relaxed);
    }

    /// Copies the frame (or a prefix of it) out, starting at `ofs`.
    pub fn read(&self, ofs: usize, buf: &mut [u8]) {
        for (i, out) in buf.iter_mut().enumerate() {
            *out = self.byte(ofs + i);
        }
    }

    /// Copies `buf` into the frame starting at `ofs`.
    pub fn write(&self, ofs: usize, buf: &[u8]) {
        for (i, value) in buf.iter().enumerate() {
            self.set_byte(ofs + i, *value);
        }
    }

    pub fn zero(&self) {
        for byte in &self.bytes {
            byte.store(0, Ordering::Relaxed);
        }
    }
}

pub struct UserPool {
    frames: Vec<FramePage>,
    free: Mutex<Vec<usize>>,
}

impl UserPool {
    pub fn new(frame_count: usize) -> Self {
        let mut frames = Vec::with_capacity(frame_count);
        frames.resize_with(frame_count, FramePage::new);
        UserPool {
            frames,
            free: Mutex::new((0..frame_count).rev().collect()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    pub fn alloc(&self, flags: PalFlags) -> Option<FrameIdx> {
        let idx = self.free.lock().pop()?;
        if flags.contains(PalFlags::ZERO) {
            self.frames[idx].zero();
        }
        Some(FrameIdx(idx))
    }

    pub fn free(&self, frame: FrameIdx) {
        let mut free = self.free.lock();
        debug_assert!(!free.contains(&frame.0), "double free of frame {:?}", frame);
        free.push(frame.0);
    }

    pub fn frame(&self, frame: FrameIdx) -> &FramePage {
        &self.frames[frame.0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhausts_and_recycles() {
        let pool = UserPool::new(2);
        let a = pool.alloc(PalFlags::empty()).unwrap();
        let b = pool.alloc(PalFlags::empty()).unwrap();
        assert_ne!(a, b);
        assert!(pool.alloc(PalFlags::empty()).is_none());

        pool.free(a);
        let c = pool.alloc(PalFlags::empty()).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn zero_flag_clears_previous_contents() {
        let pool = UserPool::new(1);
        let frame = pool.alloc(PalFlags::empty()).unwrap();
        pool.frame(frame).set_byte(17, 0xab);
        pool.free(frame);

        let frame = pool.alloc(PalFlags::ZERO).unwrap();
        assert_eq!(pool.frame(frame).byte(17), 0);
    }

    #[test]
    fn frame_read_write_round_trip() {
        let pool = UserPool::new(1);
        let frame = pool.alloc(PalFlags::ZERO).unwrap();
        let page = pool.frame(frame);

        page.write(100, b"ferrix");
        let mut buf = [0u8; 6];
        page.read(100, &mut buf);
        assert_eq!(&buf, b"ferrix");
    }
}
