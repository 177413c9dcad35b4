//! Simulated user mode. A program body runs on its process's kernel
//! thread with a `UserCtx` as its machine: an `esp` register, loads and
//! stores that go through the page table (faulting exactly like user
//! instructions), and a `syscall` operation that builds the INT 0x30
//! frame: call number at `esp`, arguments at `esp+4k`, result in `eax`.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::Kernel;
use crate::filesys::NAME_MAX;
use crate::user::process::{Pid, Process};
use crate::user::syscalls::{self, IntrFrame, Trap};
use crate::vm::fault::{self, FaultCode};
use crate::vm::{Vaddr, is_user_vaddr};

/// The process died mid-instruction (killed by the kernel, or it exited).
/// Program bodies propagate this with `?`; there is nothing to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserDead;

pub type UserResult<T> = Result<T, UserDead>;

pub struct UserCtx {
    kernel: Arc<Kernel>,
    process: Arc<Process>,
    entry: Vaddr,
    esp: Vaddr,
}

impl UserCtx {
    pub fn new(kernel: Arc<Kernel>, process: Arc<Process>, entry: Vaddr, esp: Vaddr) -> UserCtx {
        UserCtx {
            kernel,
            process,
            entry,
            esp,
        }
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    pub fn pid(&self) -> Pid {
        self.process.pid
    }

    /// The ELF entry point the loader produced.
    pub fn entry(&self) -> Vaddr {
        self.entry
    }

    /// Where the page holding `va` is backed right now, for diagnostics.
    pub fn page_state(&self, va: Vaddr) -> Option<crate::vm::page::PageState> {
        self.process.spt.state_of(crate::vm::pg_round_down(va))
    }

    pub fn esp(&self) -> Vaddr {
        self.esp
    }

    pub fn set_esp(&mut self, esp: Vaddr) {
        self.esp = esp;
    }

    /// The process was killed under us.
    fn die(&self) -> UserDead {
        crate::user::process::exit(&self.kernel, -1);
        UserDead
    }

    /// A user-mode load from `va`.
    pub fn read_byte(&mut self, va: Vaddr) -> UserResult<u8> {
        loop {
            if !is_user_vaddr(va) {
                return Err(self.die());
            }
            let Some(pagedir) = self.process.pagedir() else {
                return Err(UserDead);
            };
            if let Some(byte) = pagedir.read_byte(va) {
                return Ok(byte);
            }
            if fault::handle_fault(&self.kernel, &self.process, va, self.esp, FaultCode::USER)
                .is_err()
            {
                return Err(self.die());
            }
        }
    }

    /// A user-mode store to `va`. Stores to read-only pages are rights
    /// violations and kill the process.
    pub fn write_byte(&mut self, va: Vaddr, value: u8) -> UserResult<()> {
        loop {
            if !is_user_vaddr(va) {
                return Err(self.die());
            }
            let Some(pagedir) = self.process.pagedir() else {
                return Err(UserDead);
            };
            if pagedir.write_byte(va, value, false) {
                return Ok(());
            }

            let mut code = FaultCode::USER | FaultCode::WRITE;
            if pagedir.is_write_protected(va) {
                code |= FaultCode::PRESENT;
            }
            if fault::handle_fault(&self.kernel, &self.process, va, self.esp, code).is_err() {
                return Err(self.die());
            }
        }
    }

    pub fn read_word(&mut self, va: Vaddr) -> UserResult<u32> {
        let mut buf = [0u8; 4];
        for (i, out) in buf.iter_mut().enumerate() {
            *out = self.read_byte(va + i)?;
        }
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_word(&mut self, va: Vaddr, value: u32) -> UserResult<()> {
        for (i, byte) in value.to_le_bytes().into_iter().enumerate() {
            self.write_byte(va + i, byte)?;
        }
        Ok(())
    }

    pub fn read_bytes(&mut self, va: Vaddr, len: usize) -> UserResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(len);
        for i in 0..len {
            buf.push(self.read_byte(va + i)?);
        }
        Ok(buf)
    }

    pub fn write_bytes(&mut self, va: Vaddr, bytes: &[u8]) -> UserResult<()> {
        for (i, &byte) in bytes.iter().enumerate() {
            self.write_byte(va + i, byte)?;
        }
        Ok(())
    }

    /// PUSH: decrement esp, store the word.
    pub fn push(&mut self, value: u32) -> UserResult<()> {
        self.esp -= 4;
        self.write_word(self.esp, value)
    }

    /// Pushes raw bytes (no alignment) and returns their address.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> UserResult<Vaddr> {
        self.esp -= bytes.len();
        self.write_bytes(self.esp, bytes)?;
        Ok(self.esp)
    }

    /// Pushes a NUL-terminated string and returns its address.
    pub fn push_str(&mut self, s: &str) -> UserResult<Vaddr> {
        self.push_bytes(&[0])?;
        self.push_bytes(s.as_bytes())
    }

    /// INT 0x30: pushes the arguments and call number onto the user stack
    /// and enters the gateway. The caller's stack pointer is restored
    /// afterwards, like a caller-cleans ABI.
    pub fn syscall(&mut self, nr: u32, args: &[u32]) -> UserResult<i32> {
        let saved_esp = self.esp;
        for &value in args.iter().rev() {
            self.push(value)?;
        }
        self.push(nr)?;

        let mut frame = IntrFrame {
            esp: self.esp,
            eip: self.entry,
            ..IntrFrame::default()
        };
        let result = syscalls::syscall_handler(&self.kernel, &mut frame);
        self.esp = saved_esp;

        match result {
            Ok(()) => Ok(frame.eax as i32),
            Err(Trap::Exited) => Err(UserDead),
        }
    }

    /// Reads argc and the argv strings the loader placed on the stack.
    /// At entry, `[esp]` is the fake return address, `[esp+4]` argc, and
    /// `[esp+8]` argv.
    pub fn args(&mut self) -> UserResult<Vec<String>> {
        let argc = self.read_word(self.esp + 4)? as usize;
        let argv = self.read_word(self.esp + 8)? as Vaddr;

        let mut args = Vec::with_capacity(argc);
        for i in 0..argc {
            let mut ptr = self.read_word(argv + 4 * i)? as Vaddr;
            let mut bytes = Vec::new();
            loop {
                match self.read_byte(ptr)? {
                    0 => break,
                    byte => bytes.push(byte),
                }
                ptr += 1;
            }
            args.push(String::from_utf8_lossy(&bytes).into_owned());
        }
        Ok(args)
    }

    // The user-library wrappers, one per system call.

    pub fn halt(&mut self) -> UserResult<i32> {
        self.syscall(syscalls::SYS_HALT, &[])
    }

    pub fn exit(&mut self, status: i32) -> UserResult<i32> {
        self.syscall(syscalls::SYS_EXIT, &[status as u32])
    }

    pub fn exec(&mut self, cmdline: &str) -> UserResult<Pid> {
        let saved_esp = self.esp;
        let ptr = self.push_str(cmdline)?;
        let pid = self.syscall(syscalls::SYS_EXEC, &[ptr as u32])?;
        self.esp = saved_esp;
        Ok(pid)
    }

    pub fn wait(&mut self, pid: Pid) -> UserResult<i32> {
        self.syscall(syscalls::SYS_WAIT, &[pid as u32])
    }

    pub fn create(&mut self, name: &str, initial_size: u32) -> UserResult<bool> {
        let saved_esp = self.esp;
        let ptr = self.push_str(name)?;
        let ok = self.syscall(syscalls::SYS_CREATE, &[ptr as u32, initial_size])?;
        self.esp = saved_esp;
        Ok(ok != 0)
    }

    pub fn remove(&mut self, name: &str) -> UserResult<bool> {
        let saved_esp = self.esp;
        let ptr = self.push_str(name)?;
        let ok = self.syscall(syscalls::SYS_REMOVE, &[ptr as u32])?;
        self.esp = saved_esp;
        Ok(ok != 0)
    }

    pub fn open(&mut self, name: &str) -> UserResult<i32> {
        let saved_esp = self.esp;
        let ptr = self.push_str(name)?;
        let fd = self.syscall(syscalls::SYS_OPEN, &[ptr as u32])?;
        self.esp = saved_esp;
        Ok(fd)
    }

    pub fn filesize(&mut self, fd: i32) -> UserResult<i32> {
        self.syscall(syscalls::SYS_FILESIZE, &[fd as u32])
    }

    /// read() into a caller-chosen user address.
    pub fn read(&mut self, fd: i32, buf: Vaddr, size: u32) -> UserResult<i32> {
        self.syscall(syscalls::SYS_READ, &[fd as u32, buf as u32, size])
    }

    /// write() from a caller-chosen user address.
    pub fn write(&mut self, fd: i32, buf: Vaddr, size: u32) -> UserResult<i32> {
        self.syscall(syscalls::SYS_WRITE, &[fd as u32, buf as u32, size])
    }

    /// Convenience: stage `data` on the user stack and write() it.
    pub fn write_buf(&mut self, fd: i32, data: &[u8]) -> UserResult<i32> {
        let saved_esp = self.esp;
        let ptr = self.push_bytes(data)?;
        let n = self.write(fd, ptr, data.len() as u32)?;
        self.esp = saved_esp;
        Ok(n)
    }

    pub fn seek(&mut self, fd: i32, pos: u32) -> UserResult<i32> {
        self.syscall(syscalls::SYS_SEEK, &[fd as u32, pos])
    }

    pub fn tell(&mut self, fd: i32) -> UserResult<i32> {
        self.syscall(syscalls::SYS_TELL, &[fd as u32])
    }

    pub fn close(&mut self, fd: i32) -> UserResult<i32> {
        self.syscall(syscalls::SYS_CLOSE, &[fd as u32])
    }

    pub fn chdir(&mut self, path: &str) -> UserResult<bool> {
        let saved_esp = self.esp;
        let ptr = self.push_str(path)?;
        let ok = self.syscall(syscalls::SYS_CHDIR, &[ptr as u32])?;
        self.esp = saved_esp;
        Ok(ok != 0)
    }

    pub fn mkdir(&mut self, path: &str) -> UserResult<bool> {
        let saved_esp = self.esp;
        let ptr = self.push_str(path)?;
        let ok = self.syscall(syscalls::SYS_MKDIR, &[ptr as u32])?;
        self.esp = saved_esp;
        Ok(ok != 0)
    }

    /// readdir() through a scratch buffer on the user stack.
    pub fn readdir(&mut self, fd: i32) -> UserResult<Option<String>> {
        let saved_esp = self.esp;
        self.esp -= NAME_MAX + 1;
        let ptr = self.esp;
        // Touch the buffer so the probe has something to find even at the
        // very first use of a fresh stack page.
        self.write_bytes(ptr, &[0; NAME_MAX + 1])?;

        let found = self.syscall(syscalls::SYS_READDIR, &[fd as u32, ptr as u32])?;
        let name = if found != 0 {
            let bytes = self.read_bytes(ptr, NAME_MAX + 1)?;
            let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            Some(String::from_utf8_lossy(&bytes[..len]).into_owned())
        } else {
            None
        };
        self.esp = saved_esp;
        Ok(name)
    }

    pub fn isdir(&mut self, fd: i32) -> UserResult<bool> {
        Ok(self.syscall(syscalls::SYS_ISDIR, &[fd as u32])? != 0)
    }

    pub fn inumber(&mut self, fd: i32) -> UserResult<i32> {
        self.syscall(syscalls::SYS_INUMBER, &[fd as u32])
    }
}
