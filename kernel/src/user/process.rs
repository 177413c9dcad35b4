//! Process descriptors and the spawn / wait / exit lifecycle.
//!
//! Ownership runs one way: the parent owns each child's descriptor through
//! its child list, and the child holds nothing back; dropping the last
//! `Arc` is what "freeing the PCB" means here. A child whose parent has
//! already exited is flagged `orphan` and reclaims itself when its own
//! thread finishes; a child that exited first lingers as a zombie until
//! the parent waits or exits.

use core::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::Kernel;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::threads::{self, Semaphore};
use crate::user::fd::FileTable;
use crate::user::loader;
use crate::user::machine::UserCtx;
use crate::vm::page::SupPageTable;
use crate::vm::pagedir::PageDir;

pub type Pid = i32;
pub const PID_ERROR: Pid = -1;

pub struct Process {
    pub pid: Pid,
    /// First token of the command line; used for the exit banner and to
    /// find the registered program body.
    pub name: String,
    exit_status: AtomicI32,
    already_waited: AtomicBool,
    killed: AtomicBool,
    orphan: AtomicBool,
    load_failed: AtomicBool,
    pub(crate) executable: Mutex<Option<Arc<File>>>,
    pub(crate) children: Mutex<Vec<Arc<Process>>>,
    exec_ready: Semaphore,
    wait_done: Semaphore,
    pub(crate) pagedir: Mutex<Option<Arc<PageDir>>>,
    pub spt: SupPageTable,
    pub(crate) files: Mutex<FileTable>,
    pub(crate) cwd: Mutex<Option<Dir>>,
    /// The owning kernel's descriptor count; dropping the PCB decrements
    /// it, which is how tests see zombies and orphans reclaimed.
    live: Arc<AtomicUsize>,
}

impl Process {
    fn new(kernel: &Arc<Kernel>, name: &str) -> Arc<Process> {
        let live = kernel.process_counter();
        live.fetch_add(1, Ordering::SeqCst);
        Arc::new(Process {
            pid: kernel.next_pid(),
            name: name.to_string(),
            exit_status: AtomicI32::new(0),
            already_waited: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            orphan: AtomicBool::new(false),
            load_failed: AtomicBool::new(false),
            executable: Mutex::new(None),
            children: Mutex::new(Vec::new()),
            exec_ready: Semaphore::new(0),
            wait_done: Semaphore::new(0),
            pagedir: Mutex::new(None),
            spt: SupPageTable::new(),
            files: Mutex::new(FileTable::new()),
            cwd: Mutex::new(Some(kernel.filesys.root_dir())),
            live,
        })
    }

    pub fn exit_status(&self) -> i32 {
        self.exit_status.load(Ordering::SeqCst)
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn pagedir(&self) -> Option<Arc<PageDir>> {
        self.pagedir.lock().clone()
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Spawns a process running `cmdline` and waits for its loader to report
/// in. Returns the child's pid, or PID_ERROR if the load failed.
///
/// The command line is copied into the kernel before the child thread
/// starts, so the caller's buffer (a user page, for `exec`) cannot change
/// underneath the loader.
pub fn execute(kernel: &Arc<Kernel>, cmdline: &str) -> Pid {
    let cmdline = cmdline.to_string();
    let Some(name) = cmdline.split_whitespace().next() else {
        return PID_ERROR;
    };

    let child = Process::new(kernel, name);
    log::debug!("execute: pid {} {:?}", child.pid, cmdline);

    match threads::current_process() {
        Some(parent) => parent.children.lock().push(child.clone()),
        None => kernel.boot_children().lock().push(child.clone()),
    }

    let thread_kernel = kernel.clone();
    let thread_child = child.clone();
    threads::spawn(kernel, child.clone(), move || {
        start_process(thread_kernel, thread_child, cmdline);
    });

    child.exec_ready.down();
    if child.load_failed.load(Ordering::SeqCst) {
        return PID_ERROR;
    }
    child.pid
}

/// Thread body for a new process: load the executable, report the result
/// to the spawner, then run the program.
fn start_process(kernel: Arc<Kernel>, process: Arc<Process>, cmdline: String) {
    let argv: Vec<String> = cmdline.split_whitespace().map(str::to_string).collect();

    match loader::load(&kernel, &process, &argv) {
        Ok(image) => {
            image.executable.deny_write();
            *process.executable.lock() = Some(image.executable.clone());
            process.exec_ready.up();

            let body = kernel.program(&process.name);
            let mut ctx = UserCtx::new(kernel.clone(), process.clone(), image.entry, image.esp);
            let result = match body {
                Some(body) => body(&mut ctx),
                None => Ok(0),
            };
            if let Ok(status) = result
                && !process.killed()
                && !kernel.halted()
            {
                exit(&kernel, status);
            }
        }
        Err(err) => {
            log::debug!("load: {}: {:?}", process.name, err);
            // Publish the failure before raising exec_ready, so the
            // spawner cannot read a stale status.
            process.load_failed.store(true, Ordering::SeqCst);
            process.exit_status.store(-1, Ordering::SeqCst);
            process.exec_ready.up();
            exit(&kernel, -1);
        }
    }
}

/// Waits for child `pid` to die and returns its exit status. Returns -1
/// immediately for a pid that is not an unwaited child of the caller, or
/// for the spawn-failure sentinel.
pub fn wait(kernel: &Arc<Kernel>, pid: Pid) -> i32 {
    if pid == PID_ERROR {
        return -1;
    }

    let parent = threads::current_process();
    let children = match &parent {
        Some(parent) => &parent.children,
        None => kernel.boot_children(),
    };

    let Some(child) = children.lock().iter().find(|c| c.pid == pid).cloned() else {
        return -1;
    };
    if child.already_waited.swap(true, Ordering::SeqCst) {
        return -1;
    }

    if !child.killed() {
        child.wait_done.down();
    }
    debug_assert!(child.killed());

    let status = child.exit_status();
    children.lock().retain(|c| c.pid != pid);
    status
}

/// Terminates the current process with `status`: prints the exit banner,
/// sweeps children, closes every handle, and tears the address space down.
pub fn exit(kernel: &Arc<Kernel>, status: i32) {
    let cur = threads::current_process().expect("exit from the boot thread");

    kernel
        .console
        .putbuf(format!("{}: exit({})\n", cur.name, status).as_bytes());
    cur.exit_status.store(status, Ordering::SeqCst);

    // Zombie children are reaped here (dropping the Arc frees them); live
    // ones are cut loose and will free themselves.
    for child in cur.children.lock().drain(..) {
        if !child.killed() {
            child.orphan.store(true, Ordering::SeqCst);
        }
    }

    cur.files.lock().clear();
    *cur.cwd.lock() = None;
    // The supplemental page table still shares this handle; release the
    // write denial now rather than when the last sharer drops.
    if let Some(executable) = cur.executable.lock().take() {
        executable.allow_write();
    }

    cur.killed.store(true, Ordering::SeqCst);
    cur.wait_done.up();

    cur.spt.destroy(&kernel.frames, &kernel.swap, &cur);

    // The directory must leave the process before it dies: nothing may
    // reach a destroyed table through a live process handle.
    let pagedir = cur.pagedir.lock().take();
    if let Some(pagedir) = pagedir {
        pagedir.destroy();
    }

    if cur.orphan.load(Ordering::SeqCst) {
        // Nobody will ever wait on this descriptor; it frees itself when
        // the thread lets go of it.
        log::debug!("exit: orphan pid {} self-reclaims", cur.pid);
    }
    log::debug!("exit: pid {} status {}", cur.pid, status);
}
