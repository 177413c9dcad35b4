//! Page-fault resolution. Called from every simulated user access and from
//! the kernel's user-buffer probes; either the page is materialized and the
//! access retries, or the fault is unrecoverable and the caller terminates
//! the process.

use alloc::sync::Arc;
use alloc::vec;
use bitflags::bitflags;

use crate::Kernel;
use crate::threads;
use crate::user::process::Process;

use super::page::{PageBacking, SupPageTableEntry};
use super::palloc::PalFlags;
use super::{PG_SIZE, PHYS_BASE, STACK_MAX, Vaddr, is_user_vaddr, pg_round_down};

bitflags! {
    /// x86-style page fault error code.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultCode: u32 {
        /// Set when the fault was a rights violation on a present page,
        /// clear when the page was simply not present.
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
    }
}

/// The fault could not be resolved; the process must die with status -1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unrecoverable;

/// Resolves a fault at `addr`. `esp` is the faulting context's user stack
/// pointer, which drives the stack-growth heuristic.
pub fn handle_fault(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    addr: Vaddr,
    esp: Vaddr,
    code: FaultCode,
) -> Result<(), Unrecoverable> {
    if !is_user_vaddr(addr) || code.contains(FaultCode::PRESENT) {
        // Kernel-range access or a rights violation: nothing to page in.
        return Err(Unrecoverable);
    }

    let page = pg_round_down(addr);

    loop {
        let Some(entry) = process.spt.lookup(page) else {
            return grow_stack(kernel, process, page, addr, esp);
        };

        if entry.present {
            let pagedir = process.pagedir().ok_or(Unrecoverable)?;
            if pagedir.get_page(page).is_some() {
                // Mapping is really there; the fault was spurious (the
                // access raced a completed materialization).
                return Ok(());
            }
            // The entry still says resident but the present bit is gone:
            // an eviction is mid-flight. Wait for it to settle.
            threads::yield_now();
            continue;
        }

        return materialize(kernel, process, &entry);
    }
}

/// Brings one non-resident page into a frame and maps it.
fn materialize(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    entry: &SupPageTableEntry,
) -> Result<(), Unrecoverable> {
    let page = entry.page;
    let pagedir = process.pagedir().ok_or(Unrecoverable)?;

    match &entry.backing {
        PageBacking::AllZero => {
            let frame = kernel
                .frames
                .allocate(&kernel.swap, PalFlags::ZERO, page, process)
                .ok_or(Unrecoverable)?;
            if !pagedir.set_page(page, frame, true) {
                kernel.frames.free(frame);
                return Err(Unrecoverable);
            }
            process.spt.set_resident(page, frame);
            kernel.frames.unpin(frame);
        }

        PageBacking::SwapSlot { slot } => {
            let frame = kernel
                .frames
                .allocate(&kernel.swap, PalFlags::empty(), page, process)
                .ok_or(Unrecoverable)?;
            if !pagedir.set_page(page, frame, entry.writable) {
                kernel.frames.free(frame);
                return Err(Unrecoverable);
            }
            kernel.swap.swap_in(*slot, kernel.pool.frame(frame));
            process.spt.set_resident(page, frame);
            kernel.frames.unpin(frame);
        }

        PageBacking::FromFilesys {
            file,
            ofs,
            read_bytes,
            zero_bytes,
        } => {
            let frame = kernel
                .frames
                .allocate(&kernel.swap, PalFlags::empty(), page, process)
                .ok_or(Unrecoverable)?;

            let mut buf = vec![0u8; *read_bytes];
            if file.read_at(&mut buf, *ofs) != *read_bytes {
                kernel.frames.free(frame);
                return Err(Unrecoverable);
            }
            let frame_page = kernel.pool.frame(frame);
            frame_page.write(0, &buf);
            for i in *read_bytes..*read_bytes + *zero_bytes {
                frame_page.set_byte(i, 0);
            }

            if !pagedir.set_page(page, frame, entry.writable) {
                kernel.frames.free(frame);
                return Err(Unrecoverable);
            }
            process.spt.set_resident(page, frame);
            kernel.frames.unpin(frame);
        }

        PageBacking::OnFrame => unreachable!("non-present page marked OnFrame"),
    }

    log::trace!("fault: pid {} page {:#x} materialized", process.pid, page);
    Ok(())
}

/// Stack-growth heuristic: the access must stay in user space, land at or
/// above `esp - 32` (PUSH and PUSHA write just below the stack pointer),
/// and keep the stack within STACK_MAX of the top of user space. New pages
/// between the fault and the existing stack are recorded zero-filled; the
/// retry in `handle_fault` materializes the faulting one.
fn grow_stack(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    page: Vaddr,
    addr: Vaddr,
    esp: Vaddr,
) -> Result<(), Unrecoverable> {
    let in_reach = esp.checked_sub(32).is_none_or(|limit| addr >= limit);
    let in_stack_region = addr >= PHYS_BASE - STACK_MAX;
    if !is_user_vaddr(addr) || !in_reach || !in_stack_region {
        return Err(Unrecoverable);
    }

    let mut upage = page;
    while upage < PHYS_BASE && process.spt.lookup(upage).is_none() {
        if !process.spt.create(upage, None, true, PageBacking::AllZero) {
            return Err(Unrecoverable);
        }
        upage += PG_SIZE;
    }

    handle_fault(kernel, process, addr, esp, FaultCode::USER)
}
