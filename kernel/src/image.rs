//! ELF32 image construction: the mkfs-side tooling that turns segment
//! descriptions into executables the loader accepts, and installs them
//! into the filesystem. Demos and tests build their programs with this.

use alloc::vec;
use alloc::vec::Vec;

use crate::Kernel;
use crate::filesys::FsError;
use crate::user::loader::{EHDR_SIZE, PHDR_SIZE, PT_LOAD, Pf};
use crate::vm::{PG_SIZE, pg_round_down};

struct BuildSegment {
    vaddr: u32,
    data: Vec<u8>,
    mem_size: u32,
    flags: Pf,
}

pub struct ElfBuilder {
    entry: u32,
    segments: Vec<BuildSegment>,
}

impl ElfBuilder {
    pub fn new(entry: u32) -> ElfBuilder {
        ElfBuilder {
            entry,
            segments: Vec::new(),
        }
    }

    /// Adds a PT_LOAD segment: `data.len()` bytes from the file, zero
    /// bytes up to `mem_size`.
    pub fn segment(mut self, vaddr: u32, data: &[u8], mem_size: u32, writable: bool) -> Self {
        debug_assert!(mem_size as usize >= data.len());
        let flags = if writable { Pf::R | Pf::W } else { Pf::R | Pf::X };
        self.segments.push(BuildSegment {
            vaddr,
            data: data.to_vec(),
            mem_size,
            flags,
        });
        self
    }

    /// Emits the image: header, program headers, then each segment's file
    /// bytes at an offset congruent to its vaddr modulo the page size (the
    /// loader insists on that).
    pub fn build(&self) -> Vec<u8> {
        let phnum = self.segments.len();
        let mut cursor = EHDR_SIZE + phnum * PHDR_SIZE;

        let mut offsets = Vec::with_capacity(phnum);
        for seg in &self.segments {
            let want = seg.vaddr as usize % PG_SIZE;
            let mut ofs = pg_round_down(cursor) + want;
            if ofs < cursor {
                ofs += PG_SIZE;
            }
            offsets.push(ofs);
            cursor = ofs + seg.data.len();
        }

        let mut image = vec![0u8; cursor];

        image[..7].copy_from_slice(b"\x7fELF\x01\x01\x01");
        put_u16(&mut image, 16, 2); // ET_EXEC
        put_u16(&mut image, 18, 3); // EM_386
        put_u32(&mut image, 20, 1); // EV_CURRENT
        put_u32(&mut image, 24, self.entry);
        put_u32(&mut image, 28, EHDR_SIZE as u32); // e_phoff
        put_u16(&mut image, 40, EHDR_SIZE as u16); // e_ehsize
        put_u16(&mut image, 42, PHDR_SIZE as u16);
        put_u16(&mut image, 44, phnum as u16);

        for (i, (seg, &ofs)) in self.segments.iter().zip(&offsets).enumerate() {
            let base = EHDR_SIZE + i * PHDR_SIZE;
            put_u32(&mut image, base, PT_LOAD);
            put_u32(&mut image, base + 4, ofs as u32);
            put_u32(&mut image, base + 8, seg.vaddr);
            put_u32(&mut image, base + 12, seg.vaddr); // p_paddr, unused
            put_u32(&mut image, base + 16, seg.data.len() as u32);
            put_u32(&mut image, base + 20, seg.mem_size);
            put_u32(&mut image, base + 24, seg.flags.bits());
            put_u32(&mut image, base + 28, PG_SIZE as u32); // p_align

            image[ofs..ofs + seg.data.len()].copy_from_slice(&seg.data);
        }

        image
    }
}

fn put_u16(image: &mut [u8], ofs: usize, value: u16) {
    image[ofs..ofs + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(image: &mut [u8], ofs: usize, value: u32) {
    image[ofs..ofs + 4].copy_from_slice(&value.to_le_bytes());
}

/// Creates `path` in the kernel's filesystem holding `image`.
pub fn install(kernel: &Kernel, path: &str, image: &[u8]) -> Result<(), FsError> {
    kernel.filesys.create(None, path, image.len())?;
    let file = kernel.filesys.open(None, path)?;
    assert_eq!(file.write(image), image.len());
    Ok(())
}
