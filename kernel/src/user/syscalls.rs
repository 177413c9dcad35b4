//! The system-call gateway. The trap layer hands us an interrupt frame
//! whose user stack holds the call number at `esp` and 4-byte arguments at
//! `esp+4k`; the return value goes back in `eax`. Every pointer coming off
//! that stack is validated byte by byte through the MMU before it is
//! dereferenced, and a pointer that cannot be made good terminates the
//! process with status -1. Filesystem calls run under the kernel's single
//! filesystem lock, which is released before any terminating path.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;

use crate::Kernel;
use crate::filesys::NAME_MAX;
use crate::filesys::dir::Dir;
use crate::filesys::path;
use crate::threads;
use crate::user::process::{self, Pid, Process};
use crate::user::umem;
use crate::vm::{Vaddr, is_user_vaddr};

pub const SYS_HALT: u32 = 0;
pub const SYS_EXIT: u32 = 1;
pub const SYS_EXEC: u32 = 2;
pub const SYS_WAIT: u32 = 3;
pub const SYS_CREATE: u32 = 4;
pub const SYS_REMOVE: u32 = 5;
pub const SYS_OPEN: u32 = 6;
pub const SYS_FILESIZE: u32 = 7;
pub const SYS_READ: u32 = 8;
pub const SYS_WRITE: u32 = 9;
pub const SYS_SEEK: u32 = 10;
pub const SYS_TELL: u32 = 11;
pub const SYS_CLOSE: u32 = 12;
pub const SYS_CHDIR: u32 = 15;
pub const SYS_MKDIR: u32 = 16;
pub const SYS_READDIR: u32 = 17;
pub const SYS_ISDIR: u32 = 18;
pub const SYS_INUMBER: u32 = 19;

/// Saved user registers at the trap boundary.
#[derive(Debug, Default, Clone)]
pub struct IntrFrame {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: Vaddr,
    pub eip: Vaddr,
}

/// The process died inside the call (its own `exit`, or a kill); the trap
/// does not return to user code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    Exited,
}

/// Entry point from the trap layer (vector 0x30).
pub fn syscall_handler(kernel: &Arc<Kernel>, frame: &mut IntrFrame) -> Result<(), Trap> {
    let process = threads::current_process().expect("system call without a process");

    let nr = read_user_u32(kernel, &process, frame.esp, frame.esp)?;
    log::trace!("syscall {} from pid {}", nr, process.pid);

    match nr {
        SYS_HALT => {
            kernel.halt();
            Err(Trap::Exited)
        }

        SYS_EXIT => {
            let status = arg(kernel, &process, frame, 1)? as i32;
            process::exit(kernel, status);
            Err(Trap::Exited)
        }

        SYS_EXEC => {
            let cmdline = string_arg(kernel, &process, frame, 1)?;
            let _fs = kernel.fs_lock.lock();
            frame.eax = process::execute(kernel, &cmdline) as u32;
            Ok(())
        }

        SYS_WAIT => {
            let pid = arg(kernel, &process, frame, 1)? as Pid;
            frame.eax = process::wait(kernel, pid) as u32;
            Ok(())
        }

        SYS_CREATE => {
            let name = string_arg(kernel, &process, frame, 1)?;
            let size = arg(kernel, &process, frame, 2)? as usize;
            let cwd = cwd_of(&process);
            let _fs = kernel.fs_lock.lock();
            frame.eax = kernel.filesys.create(cwd.as_ref(), &name, size).is_ok() as u32;
            Ok(())
        }

        SYS_REMOVE => {
            let name = string_arg(kernel, &process, frame, 1)?;
            let cwd = cwd_of(&process);
            let _fs = kernel.fs_lock.lock();
            frame.eax = kernel.filesys.remove(cwd.as_ref(), &name).is_ok() as u32;
            Ok(())
        }

        SYS_OPEN => {
            let name = string_arg(kernel, &process, frame, 1)?;
            let cwd = cwd_of(&process);
            let _fs = kernel.fs_lock.lock();
            frame.eax = match kernel.filesys.open(cwd.as_ref(), &name) {
                Err(_) => -1i32 as u32,
                Ok(file) => {
                    let mut files = process.files.lock();
                    if file.inode().is_dir() {
                        // Reopen as a directory handle; the dummy file
                        // handle closes when it drops.
                        let dir = Dir::open(file.inode().clone())
                            .expect("directory inode refused a directory handle");
                        files.add_dir(dir) as u32
                    } else {
                        files.add_file(file) as u32
                    }
                }
            };
            Ok(())
        }

        SYS_FILESIZE => {
            let fd = arg(kernel, &process, frame, 1)? as i32;
            let _fs = kernel.fs_lock.lock();
            let files = process.files.lock();
            frame.eax = match files.get(fd).and_then(|e| e.file.as_ref()) {
                Some(file) => file.length() as u32,
                None => -1i32 as u32,
            };
            Ok(())
        }

        SYS_READ => sys_read(kernel, &process, frame),
        SYS_WRITE => sys_write(kernel, &process, frame),

        SYS_SEEK => {
            let fd = arg(kernel, &process, frame, 1)? as i32;
            let pos = arg(kernel, &process, frame, 2)? as usize;
            let _fs = kernel.fs_lock.lock();
            let files = process.files.lock();
            if let Some(file) = files.get(fd).and_then(|e| e.file.as_ref()) {
                file.seek(pos);
            }
            Ok(())
        }

        SYS_TELL => {
            let fd = arg(kernel, &process, frame, 1)? as i32;
            let _fs = kernel.fs_lock.lock();
            let files = process.files.lock();
            frame.eax = match files.get(fd).and_then(|e| e.file.as_ref()) {
                Some(file) => file.tell() as u32,
                None => -1i32 as u32,
            };
            Ok(())
        }

        SYS_CLOSE => {
            let fd = arg(kernel, &process, frame, 1)? as i32;
            let _fs = kernel.fs_lock.lock();
            process.files.lock().remove(fd);
            Ok(())
        }

        SYS_CHDIR => {
            let name = string_arg(kernel, &process, frame, 1)?;
            let cwd = cwd_of(&process);
            let _fs = kernel.fs_lock.lock();
            frame.eax = match path::open_path(&kernel.filesys, cwd.as_ref(), &name) {
                Some(dir) => {
                    *process.cwd.lock() = Some(dir);
                    1
                }
                None => 0,
            };
            Ok(())
        }

        SYS_MKDIR => {
            let name = string_arg(kernel, &process, frame, 1)?;
            let cwd = cwd_of(&process);
            let _fs = kernel.fs_lock.lock();
            frame.eax = kernel.filesys.mkdir(cwd.as_ref(), &name).is_ok() as u32;
            Ok(())
        }

        SYS_READDIR => sys_readdir(kernel, &process, frame),

        SYS_ISDIR => {
            let fd = arg(kernel, &process, frame, 1)? as i32;
            let _fs = kernel.fs_lock.lock();
            let files = process.files.lock();
            frame.eax = files.get(fd).is_some_and(|e| e.dir.is_some()) as u32;
            Ok(())
        }

        SYS_INUMBER => {
            let fd = arg(kernel, &process, frame, 1)? as i32;
            let _fs = kernel.fs_lock.lock();
            let files = process.files.lock();
            frame.eax = match files.get(fd) {
                Some(entry) => match (&entry.file, &entry.dir) {
                    (Some(file), _) => file.inode().number(),
                    (_, Some(dir)) => dir.inode().number(),
                    _ => -1i32 as u32,
                },
                None => -1i32 as u32,
            };
            Ok(())
        }

        // mmap/munmap are unimplemented; those numbers and anything else
        // unknown kill the caller.
        _ => Err(kill(kernel)),
    }
}

/// fd 0 reads keys from the console; other descriptors must be regular
/// files. Returns the byte count, or -1 for a bad descriptor.
fn sys_read(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    frame: &mut IntrFrame,
) -> Result<(), Trap> {
    let fd = arg(kernel, process, frame, 1)? as i32;
    let buf = arg(kernel, process, frame, 2)? as Vaddr;
    let size = arg(kernel, process, frame, 3)? as usize;
    verify_buffer(kernel, process, buf, size, frame)?;

    if fd == 0 {
        let fs = kernel.fs_lock.lock();
        for i in 0..size {
            let key = kernel.console.getc();
            if !umem::write_byte(kernel, process, buf + i, key, frame.esp) {
                drop(fs);
                return Err(kill(kernel));
            }
        }
        frame.eax = size as u32;
        return Ok(());
    }

    let mut kbuf = vec![0u8; size];
    let n = {
        let _fs = kernel.fs_lock.lock();
        let files = process.files.lock();
        let Some(file) = files.get(fd).and_then(|e| e.file.as_ref()) else {
            frame.eax = -1i32 as u32;
            return Ok(());
        };
        file.read(&mut kbuf)
    };

    if !umem::copy_out(kernel, process, buf, &kbuf[..n], frame.esp) {
        return Err(kill(kernel));
    }
    frame.eax = n as u32;
    Ok(())
}

/// fd 1 writes to the console in one `putbuf`; other descriptors must be
/// regular files (a directory descriptor is an error). Returns the bytes
/// written, which write-denial can force to 0.
fn sys_write(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    frame: &mut IntrFrame,
) -> Result<(), Trap> {
    let fd = arg(kernel, process, frame, 1)? as i32;
    let buf = arg(kernel, process, frame, 2)? as Vaddr;
    let size = arg(kernel, process, frame, 3)? as usize;
    verify_buffer(kernel, process, buf, size, frame)?;

    let Some(kbuf) = umem::copy_in(kernel, process, buf, size, frame.esp) else {
        return Err(kill(kernel));
    };

    if fd == 1 {
        let _fs = kernel.fs_lock.lock();
        kernel.console.putbuf(&kbuf);
        frame.eax = size as u32;
        return Ok(());
    }

    let _fs = kernel.fs_lock.lock();
    let files = process.files.lock();
    let Some(file) = files.get(fd).and_then(|e| e.file.as_ref()) else {
        frame.eax = -1i32 as u32;
        return Ok(());
    };
    frame.eax = file.write(&kbuf) as u32;
    Ok(())
}

/// Copies the next entry name of a directory descriptor into the caller's
/// buffer. False once the directory is exhausted, or for a non-directory
/// descriptor.
fn sys_readdir(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    frame: &mut IntrFrame,
) -> Result<(), Trap> {
    let fd = arg(kernel, process, frame, 1)? as i32;
    let name_out = arg(kernel, process, frame, 2)? as Vaddr;
    verify_buffer(kernel, process, name_out, NAME_MAX + 1, frame)?;

    let entry_name = {
        let _fs = kernel.fs_lock.lock();
        let files = process.files.lock();
        let Some(dir) = files.get(fd).and_then(|e| e.dir.as_ref()) else {
            frame.eax = 0;
            return Ok(());
        };
        dir.read_entry()
    };

    frame.eax = match entry_name {
        Some(name) => {
            let mut bytes = name.into_bytes();
            bytes.push(0);
            if !umem::copy_out(kernel, process, name_out, &bytes, frame.esp) {
                return Err(kill(kernel));
            }
            1
        }
        None => 0,
    };
    Ok(())
}

/// Terminates the current process for a bad user access.
fn kill(kernel: &Arc<Kernel>) -> Trap {
    process::exit(kernel, -1);
    Trap::Exited
}

fn cwd_of(process: &Process) -> Option<Dir> {
    process.cwd.lock().as_ref().map(|d| d.reopen())
}

/// Fetches argument word `k` (k = 0 is the call number).
fn arg(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    frame: &IntrFrame,
    k: usize,
) -> Result<u32, Trap> {
    read_user_u32(kernel, process, frame.esp + 4 * k, frame.esp)
}

/// Fetches argument word `k` and walks it as a user string pointer.
fn string_arg(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    frame: &IntrFrame,
    k: usize,
) -> Result<String, Trap> {
    let uaddr = arg(kernel, process, frame, k)? as Vaddr;
    verify_string(kernel, process, uaddr, frame)
}

fn read_user_u32(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    uaddr: Vaddr,
    esp: Vaddr,
) -> Result<u32, Trap> {
    let mut buf = [0u8; 4];
    user_mem_read(kernel, process, &mut buf, uaddr, esp)?;
    Ok(u32::from_le_bytes(buf))
}

/// Copies `dest.len()` bytes from user memory, killing the caller on a
/// null pointer, a kernel-range pointer, or an unmappable byte.
fn user_mem_read(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    dest: &mut [u8],
    uaddr: Vaddr,
    esp: Vaddr,
) -> Result<(), Trap> {
    if uaddr == 0 || !is_user_vaddr(uaddr) {
        return Err(kill(kernel));
    }
    for (i, out) in dest.iter_mut().enumerate() {
        match umem::read_byte(kernel, process, uaddr + i, esp) {
            Some(byte) => *out = byte,
            None => return Err(kill(kernel)),
        }
    }
    Ok(())
}

/// Walks a NUL-terminated user string, validating every byte.
fn verify_string(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    uaddr: Vaddr,
    frame: &IntrFrame,
) -> Result<String, Trap> {
    if uaddr == 0 {
        return Err(kill(kernel));
    }
    let mut bytes = alloc::vec::Vec::new();
    let mut va = uaddr;
    loop {
        if !is_user_vaddr(va) {
            return Err(kill(kernel));
        }
        match umem::read_byte(kernel, process, va, frame.esp) {
            None => return Err(kill(kernel)),
            Some(0) => break,
            Some(byte) => bytes.push(byte),
        }
        va += 1;
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Probes every byte of a user buffer the caller wants transferred.
fn verify_buffer(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    uaddr: Vaddr,
    len: usize,
    frame: &IntrFrame,
) -> Result<(), Trap> {
    for i in 0..len {
        let va = uaddr + i;
        if va == 0 || !is_user_vaddr(va) {
            return Err(kill(kernel));
        }
        if umem::read_byte(kernel, process, va, frame.esp).is_none() {
            return Err(kill(kernel));
        }
    }
    Ok(())
}
