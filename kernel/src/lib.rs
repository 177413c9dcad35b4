//! Ferrix: the user-process execution core of a small teaching OS.
//!
//! The crate implements executable loading, demand-paged virtual memory
//! with swap, the system-call gateway, per-process file descriptors, and
//! the spawn/wait/exit lifecycle. The pieces a real machine would provide
//! (kernel threads, the page-table hardware, the swap disk, user-mode
//! execution itself) are explicit simulation seams, so the whole core
//! runs and is tested on the host.
//!
//! All boot-time state lives in a [`Kernel`] handle: build one with
//! [`Kernel::boot`], install executables with [`image`], register program
//! bodies, then [`Kernel::execute`] and [`Kernel::wait`] like init would.

extern crate alloc;

pub mod block;
pub mod console;
pub mod filesys;
pub mod image;
pub mod threads;
pub mod user;
pub mod vm;

use core::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use alloc::collections::btree_map::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Mutex, RwLock};
use std::thread::JoinHandle;

use crate::block::MemDisk;
use crate::console::Console;
use crate::filesys::Filesys;
use crate::user::machine::{UserCtx, UserResult};
use crate::user::process::{self, Pid, Process};
use crate::vm::frame::FrameTable;
use crate::vm::palloc::UserPool;
use crate::vm::swap::SwapArea;

/// A registered user program: the stand-in for an executable's text. The
/// loader still builds the address space from the ELF image; the body then
/// runs against it through the [`UserCtx`] machine.
pub type ProgramBody = Arc<dyn Fn(&mut UserCtx) -> UserResult<i32> + Send + Sync>;

pub struct KernelConfig {
    /// Frames in the user pool. Small pools force eviction early.
    pub user_frames: usize,
    /// Sectors on the swap device (8 sectors per slot).
    pub swap_sectors: usize,
    /// Keyboard queue depth.
    pub input_capacity: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            user_frames: 64,
            swap_sectors: 1024,
            input_capacity: 256,
        }
    }
}

/// Every boot-time singleton of the machine, gathered into one handle and
/// passed around explicitly. Each `Kernel` is a fully independent machine;
/// tests boot as many as they like in parallel.
pub struct Kernel {
    pub console: Console,
    pub pool: Arc<UserPool>,
    pub frames: FrameTable,
    pub swap: SwapArea,
    pub filesys: Filesys,
    /// The single coarse lock the system-call layer wraps around every
    /// filesystem call.
    pub(crate) fs_lock: Mutex<()>,
    programs: RwLock<BTreeMap<String, ProgramBody>>,
    boot_children: Mutex<Vec<Arc<Process>>>,
    next_pid: AtomicI32,
    halted: AtomicBool,
    process_count: Arc<AtomicUsize>,
    threads: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Kernel {
    pub fn boot(config: KernelConfig) -> Arc<Kernel> {
        let pool = Arc::new(UserPool::new(config.user_frames));
        let swap = SwapArea::new(MemDisk::new(config.swap_sectors));
        log::info!(
            "boot: {} user frames, {} swap slots",
            pool.capacity(),
            swap.slots()
        );

        Arc::new(Kernel {
            console: Console::new(config.input_capacity),
            frames: FrameTable::new(pool.clone()),
            pool,
            swap,
            filesys: Filesys::format(),
            fs_lock: Mutex::new(()),
            programs: RwLock::new(BTreeMap::new()),
            boot_children: Mutex::new(Vec::new()),
            next_pid: AtomicI32::new(1),
            halted: AtomicBool::new(false),
            process_count: Arc::new(AtomicUsize::new(0)),
            threads: std::sync::Mutex::new(Vec::new()),
        })
    }

    /// Binds `name` (matched against argv[0]) to a program body. A loaded
    /// executable with no body just exits 0.
    pub fn register_program<F>(&self, name: &str, body: F)
    where
        F: Fn(&mut UserCtx) -> UserResult<i32> + Send + Sync + 'static,
    {
        self.programs
            .write()
            .insert(name.to_string(), Arc::new(body));
    }

    pub(crate) fn program(&self, name: &str) -> Option<ProgramBody> {
        self.programs.read().get(name).cloned()
    }

    /// Spawns `cmdline` as a child of the boot thread (or of the calling
    /// process, when called from a program body).
    pub fn execute(self: &Arc<Self>, cmdline: &str) -> Pid {
        process::execute(self, cmdline)
    }

    /// Waits on a child, like init reaping.
    pub fn wait(self: &Arc<Self>, pid: Pid) -> i32 {
        process::wait(self, pid)
    }

    /// Spawns `cmdline` and waits for it; the usual way to run one task.
    pub fn run(self: &Arc<Self>, cmdline: &str) -> i32 {
        let pid = self.execute(cmdline);
        self.wait(pid)
    }

    pub(crate) fn next_pid(&self) -> Pid {
        self.next_pid.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn boot_children(&self) -> &Mutex<Vec<Arc<Process>>> {
        &self.boot_children
    }

    /// Process descriptors currently allocated on this kernel, zombies
    /// included. Proves orphan/zombie reclamation in tests.
    pub fn live_processes(&self) -> usize {
        self.process_count.load(Ordering::SeqCst)
    }

    pub(crate) fn process_counter(&self) -> Arc<AtomicUsize> {
        self.process_count.clone()
    }

    pub(crate) fn halt(&self) {
        log::info!("halt");
        self.halted.store(true, Ordering::SeqCst);
    }

    pub fn halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub(crate) fn register_thread(&self, handle: JoinHandle<()>) {
        self.threads.lock().unwrap().push(handle);
    }

    /// Joins every kernel thread spawned so far, including ones spawned
    /// while joining. Quiesces the machine so tests can check invariants.
    pub fn join_all(&self) {
        loop {
            let handles: Vec<_> = {
                let mut threads = self.threads.lock().unwrap();
                threads.drain(..).collect()
            };
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                let _ = handle.join();
            }
        }
    }
}
