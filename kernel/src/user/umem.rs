//! Kernel access to user memory. Every byte goes through the process's
//! page table; a miss is routed through the page-fault handler, which is
//! the explicit-walk substitute for a fixup-label trap catch. Writes use
//! the kernel alias, so the writable bit does not apply, exactly like a
//! kernel copying through its own mapping of the frame.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::Kernel;
use crate::user::process::Process;
use crate::vm::fault::{self, FaultCode};
use crate::vm::{Vaddr, is_user_vaddr};

/// Reads the byte at user address `va`. None if the address is bad and the
/// fault handler could not make it good; the caller decides to kill.
pub fn read_byte(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    va: Vaddr,
    esp: Vaddr,
) -> Option<u8> {
    if !is_user_vaddr(va) {
        return None;
    }
    loop {
        let pagedir = process.pagedir()?;
        if let Some(byte) = pagedir.read_byte(va) {
            return Some(byte);
        }
        fault::handle_fault(kernel, process, va, esp, FaultCode::empty()).ok()?;
    }
}

/// Writes one byte at user address `va` through the kernel alias.
pub fn write_byte(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    va: Vaddr,
    value: u8,
    esp: Vaddr,
) -> bool {
    if !is_user_vaddr(va) {
        return false;
    }
    loop {
        let Some(pagedir) = process.pagedir() else {
            return false;
        };
        if pagedir.write_byte(va, value, true) {
            return true;
        }
        if fault::handle_fault(kernel, process, va, esp, FaultCode::WRITE).is_err() {
            return false;
        }
    }
}

/// Copies `len` bytes from user memory starting at `uaddr`.
pub fn copy_in(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    uaddr: Vaddr,
    len: usize,
    esp: Vaddr,
) -> Option<Vec<u8>> {
    let mut buf = Vec::with_capacity(len);
    for i in 0..len {
        buf.push(read_byte(kernel, process, uaddr + i, esp)?);
    }
    Some(buf)
}

/// Copies `buf` into user memory at `uaddr`.
pub fn copy_out(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    uaddr: Vaddr,
    buf: &[u8],
    esp: Vaddr,
) -> bool {
    buf.iter()
        .enumerate()
        .all(|(i, &value)| write_byte(kernel, process, uaddr + i, value, esp))
}
