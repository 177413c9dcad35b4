//! ELF32 executable loading. Segments are not read at load time: each page
//! of a PT_LOAD segment becomes a file-backed supplemental page table
//! entry, and the fault handler pulls the bytes in on first touch. Only
//! the initial stack page is materialized eagerly.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;

use crate::Kernel;
use crate::filesys::file::File;
use crate::user::process::Process;
use crate::user::umem;
use crate::vm::page::PageBacking;
use crate::vm::pagedir::PageDir;
use crate::vm::palloc::{FrameIdx, PalFlags};
use crate::vm::{PG_SIZE, PHYS_BASE, Vaddr, is_user_vaddr, pg_ofs, pg_round_down, pg_round_up};

pub const EHDR_SIZE: usize = 52;
pub const PHDR_SIZE: usize = 32;
pub const PHNUM_MAX: u16 = 1024;

pub const PT_NULL: u32 = 0;
pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_INTERP: u32 = 3;
pub const PT_SHLIB: u32 = 5;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Pf: u32 {
        const X = 1;
        const W = 2;
        const R = 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    Open,
    Header,
    Segment,
    Memory,
}

/// Executable header, little-endian on disk.
pub struct Elf32Ehdr {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u32,
    pub e_phoff: u32,
    pub e_phentsize: u16,
    pub e_phnum: u16,
}

impl Elf32Ehdr {
    pub fn parse(buf: &[u8; EHDR_SIZE]) -> Elf32Ehdr {
        let half = |ofs: usize| u16::from_le_bytes([buf[ofs], buf[ofs + 1]]);
        let word =
            |ofs: usize| u32::from_le_bytes([buf[ofs], buf[ofs + 1], buf[ofs + 2], buf[ofs + 3]]);
        Elf32Ehdr {
            e_ident: buf[..16].try_into().unwrap(),
            e_type: half(16),
            e_machine: half(18),
            e_version: word(20),
            e_entry: word(24),
            e_phoff: word(28),
            e_phentsize: half(42),
            e_phnum: half(44),
        }
    }

    /// 32-bit little-endian x86 executable with sane program headers.
    pub fn check(&self) -> bool {
        self.e_ident[..7] == *b"\x7fELF\x01\x01\x01"
            && self.e_type == 2
            && self.e_machine == 3
            && self.e_version == 1
            && self.e_phentsize as usize == PHDR_SIZE
            && self.e_phnum <= PHNUM_MAX
    }
}

pub struct Elf32Phdr {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: u32,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: Pf,
}

impl Elf32Phdr {
    pub fn parse(buf: &[u8; PHDR_SIZE]) -> Elf32Phdr {
        let word =
            |ofs: usize| u32::from_le_bytes([buf[ofs], buf[ofs + 1], buf[ofs + 2], buf[ofs + 3]]);
        Elf32Phdr {
            p_type: word(0),
            p_offset: word(4),
            p_vaddr: word(8),
            p_filesz: word(16),
            p_memsz: word(20),
            p_flags: Pf::from_bits_truncate(word(24)),
        }
    }
}

pub struct LoadedImage {
    pub entry: Vaddr,
    pub esp: Vaddr,
    pub executable: Arc<File>,
}

/// Loads argv[0] into `process`'s fresh address space and builds the
/// initial stack. On success the executable handle is returned still open;
/// the lifecycle layer keeps it (write-denied) until exit.
pub fn load(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    argv: &[String],
) -> Result<LoadedImage, LoadError> {
    *process.pagedir.lock() = Some(Arc::new(PageDir::new(kernel.pool.clone())));

    let name = argv.first().ok_or(LoadError::Open)?;
    let file = {
        let cwd = process.cwd.lock();
        kernel
            .filesys
            .open(cwd.as_ref(), name)
            .map_err(|_| LoadError::Open)?
    };
    let file = Arc::new(file);

    let mut hbuf = [0u8; EHDR_SIZE];
    if file.read_at(&mut hbuf, 0) != EHDR_SIZE {
        return Err(LoadError::Header);
    }
    let ehdr = Elf32Ehdr::parse(&hbuf);
    if !ehdr.check() {
        return Err(LoadError::Header);
    }

    let mut file_ofs = ehdr.e_phoff as usize;
    for _ in 0..ehdr.e_phnum {
        if file_ofs > file.length() {
            return Err(LoadError::Segment);
        }
        let mut pbuf = [0u8; PHDR_SIZE];
        if file.read_at(&mut pbuf, file_ofs) != PHDR_SIZE {
            return Err(LoadError::Segment);
        }
        file_ofs += PHDR_SIZE;

        let phdr = Elf32Phdr::parse(&pbuf);
        match phdr.p_type {
            PT_DYNAMIC | PT_INTERP | PT_SHLIB => return Err(LoadError::Segment),
            PT_LOAD => {
                if !validate_segment(&phdr, &file) {
                    return Err(LoadError::Segment);
                }

                let writable = phdr.p_flags.contains(Pf::W);
                let file_page = pg_round_down(phdr.p_offset as usize);
                let mem_page = pg_round_down(phdr.p_vaddr as usize);
                let page_offset = pg_ofs(phdr.p_vaddr as usize);

                let (read_bytes, zero_bytes) = if phdr.p_filesz > 0 {
                    let read_bytes = page_offset + phdr.p_filesz as usize;
                    let total = page_offset + phdr.p_memsz as usize;
                    (read_bytes, pg_round_up(total) - read_bytes)
                } else {
                    let total = page_offset + phdr.p_memsz as usize;
                    (0, pg_round_up(total))
                };

                load_segment(
                    process, &file, file_page, mem_page, read_bytes, zero_bytes, writable,
                )?;
            }
            // PT_NULL, PT_NOTE, PT_PHDR, PT_STACK and friends carry no
            // mapping.
            _ => {}
        }
    }

    let esp = setup_stack(kernel, process, argv)?;

    Ok(LoadedImage {
        entry: ehdr.e_entry as Vaddr,
        esp,
        executable: file,
    })
}

/// Whether PHDR describes a loadable segment this process may map.
fn validate_segment(phdr: &Elf32Phdr, file: &File) -> bool {
    // Offset and vaddr must agree modulo page size, and the offset must
    // point into the file.
    if pg_ofs(phdr.p_offset as usize) != pg_ofs(phdr.p_vaddr as usize) {
        return false;
    }
    if phdr.p_offset as usize > file.length() {
        return false;
    }

    if phdr.p_memsz < phdr.p_filesz || phdr.p_memsz == 0 {
        return false;
    }

    // The region must fit in user space without wrapping the 32-bit
    // address space.
    let start = phdr.p_vaddr as u64;
    let end = start + phdr.p_memsz as u64;
    if end > u32::MAX as u64 {
        return false;
    }
    if !is_user_vaddr(start as Vaddr) || !is_user_vaddr(end as Vaddr) {
        return false;
    }

    // Page 0 stays unmapped so user null pointers fault instead of
    // reaching the kernel's string helpers.
    if (phdr.p_vaddr as usize) < PG_SIZE {
        return false;
    }

    true
}

/// Records one lazy, file-backed supplemental entry per page of the
/// segment: READ_BYTES from the file, then ZERO_BYTES of zeros.
fn load_segment(
    process: &Arc<Process>,
    file: &Arc<File>,
    mut ofs: usize,
    mut upage: Vaddr,
    mut read_bytes: usize,
    mut zero_bytes: usize,
    writable: bool,
) -> Result<(), LoadError> {
    debug_assert_eq!((read_bytes + zero_bytes) % PG_SIZE, 0);
    debug_assert_eq!(pg_ofs(upage), 0);
    debug_assert_eq!(ofs % PG_SIZE, 0);

    while read_bytes > 0 || zero_bytes > 0 {
        let page_read_bytes = read_bytes.min(PG_SIZE);
        let page_zero_bytes = PG_SIZE - page_read_bytes;

        let backing = PageBacking::FromFilesys {
            file: file.clone(),
            ofs,
            read_bytes: page_read_bytes,
            zero_bytes: page_zero_bytes,
        };
        if !process.spt.create(upage, None, writable, backing) {
            return Err(LoadError::Segment);
        }

        ofs += page_read_bytes;
        read_bytes -= page_read_bytes;
        zero_bytes -= page_zero_bytes;
        upage += PG_SIZE;
    }
    Ok(())
}

/// Maps `upage` to `frame` and records the supplemental entry, the eager
/// counterpart of `load_segment`. Fails if `upage` is taken.
fn install_page(process: &Arc<Process>, upage: Vaddr, frame: FrameIdx, writable: bool) -> bool {
    let Some(pagedir) = process.pagedir() else {
        return false;
    };
    if pagedir.get_page(upage).is_some() || !pagedir.set_page(upage, frame, writable) {
        return false;
    }
    if !process
        .spt
        .create(upage, Some(frame), writable, PageBacking::OnFrame)
    {
        pagedir.clear_page(upage);
        return false;
    }
    true
}

/// Builds the initial stack in a zeroed page at the top of user space:
/// argv strings (reversed, NUL-terminated), word alignment, the argv
/// pointer array with its NULL sentinel, argv, argc, and a zero return
/// address.
fn setup_stack(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    argv: &[String],
) -> Result<Vaddr, LoadError> {
    let stack_page = PHYS_BASE - PG_SIZE;
    let frame = kernel
        .frames
        .allocate(&kernel.swap, PalFlags::ZERO, stack_page, process)
        .ok_or(LoadError::Memory)?;
    if !install_page(process, stack_page, frame, true) {
        kernel.frames.free(frame);
        return Err(LoadError::Memory);
    }
    kernel.frames.unpin(frame);

    let mut esp = PHYS_BASE;
    let push_bytes = |esp: &mut Vaddr, bytes: &[u8]| -> Result<(), LoadError> {
        *esp -= bytes.len();
        if umem::copy_out(kernel, process, *esp, bytes, *esp) {
            Ok(())
        } else {
            Err(LoadError::Memory)
        }
    };

    let mut arg_addrs = vec![0 as Vaddr; argv.len()];
    for i in (0..argv.len()).rev() {
        let mut bytes = argv[i].as_bytes().to_vec();
        bytes.push(0);
        push_bytes(&mut esp, &bytes)?;
        arg_addrs[i] = esp;
    }

    esp &= !3;

    push_bytes(&mut esp, &0u32.to_le_bytes())?; // argv[argc] sentinel
    for i in (0..argv.len()).rev() {
        push_bytes(&mut esp, &(arg_addrs[i] as u32).to_le_bytes())?;
    }
    let argv_ptr = esp;
    push_bytes(&mut esp, &(argv_ptr as u32).to_le_bytes())?;
    push_bytes(&mut esp, &(argv.len() as u32).to_le_bytes())?;
    push_bytes(&mut esp, &0u32.to_le_bytes())?; // fake return address

    Ok(esp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_ehdr() -> [u8; EHDR_SIZE] {
        let mut buf = [0u8; EHDR_SIZE];
        buf[..7].copy_from_slice(b"\x7fELF\x01\x01\x01");
        buf[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        buf[18..20].copy_from_slice(&3u16.to_le_bytes()); // EM_386
        buf[20..24].copy_from_slice(&1u32.to_le_bytes()); // EV_CURRENT
        buf[24..28].copy_from_slice(&0x0804_8000u32.to_le_bytes());
        buf[28..32].copy_from_slice(&(EHDR_SIZE as u32).to_le_bytes());
        buf[42..44].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        buf[44..46].copy_from_slice(&1u16.to_le_bytes());
        buf
    }

    #[test]
    fn accepts_a_well_formed_header() {
        let ehdr = Elf32Ehdr::parse(&valid_ehdr());
        assert!(ehdr.check());
        assert_eq!(ehdr.e_entry, 0x0804_8000);
        assert_eq!(ehdr.e_phoff as usize, EHDR_SIZE);
    }

    #[test]
    fn rejects_wrong_magic_machine_and_phnum() {
        let mut bad_magic = valid_ehdr();
        bad_magic[0] = b'E';
        assert!(!Elf32Ehdr::parse(&bad_magic).check());

        let mut bad_machine = valid_ehdr();
        bad_machine[18..20].copy_from_slice(&62u16.to_le_bytes()); // x86-64
        assert!(!Elf32Ehdr::parse(&bad_machine).check());

        let mut shared_object = valid_ehdr();
        shared_object[16..18].copy_from_slice(&3u16.to_le_bytes());
        assert!(!Elf32Ehdr::parse(&shared_object).check());

        let mut too_many = valid_ehdr();
        too_many[44..46].copy_from_slice(&2000u16.to_le_bytes());
        assert!(!Elf32Ehdr::parse(&too_many).check());
    }

    fn phdr(p_offset: u32, p_vaddr: u32, p_filesz: u32, p_memsz: u32) -> Elf32Phdr {
        Elf32Phdr {
            p_type: PT_LOAD,
            p_offset,
            p_vaddr,
            p_filesz,
            p_memsz,
            p_flags: Pf::R | Pf::W,
        }
    }

    fn file_of_len(len: usize) -> File {
        let fs = crate::filesys::Filesys::format();
        fs.create(None, "exe", len).unwrap();
        fs.open(None, "exe").unwrap()
    }

    #[test]
    fn segment_validation() {
        let file = file_of_len(0x3000);

        assert!(validate_segment(&phdr(0x1000, 0x0804_8000, 0x100, 0x200), &file));

        // offset and vaddr disagree modulo page size
        assert!(!validate_segment(&phdr(0x1234, 0x0804_8000, 0x100, 0x200), &file));
        // offset beyond the file
        assert!(!validate_segment(&phdr(0x4000, 0x0804_8000, 0x100, 0x200), &file));
        // memsz below filesz, and empty segments
        assert!(!validate_segment(&phdr(0x1000, 0x0804_8000, 0x200, 0x100), &file));
        assert!(!validate_segment(&phdr(0x1000, 0x0804_8000, 0, 0), &file));
        // page 0 and kernel space are off-limits
        assert!(!validate_segment(&phdr(0, 0x0, 0x100, 0x200), &file));
        assert!(!validate_segment(&phdr(0, 0xc000_0000, 0x100, 0x200), &file));
        // region may not wrap
        assert!(!validate_segment(&phdr(0, 0xffff_f000, 0x100, 0x2000), &file));
    }
}
