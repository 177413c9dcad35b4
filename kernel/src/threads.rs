//! Kernel-thread shim. One user process runs on one kernel thread; the
//! scheduler itself is the host's. The core only ever needs `spawn`, the
//! identity of the current task, and a counting semaphore, so that is the
//! whole surface here.

use core::cell::RefCell;

use alloc::sync::Arc;
use std::sync::{Condvar, Mutex};
use std::thread;

use crate::Kernel;
use crate::user::process::Process;

/// Counting semaphore, initial value 0 for the lifecycle handshakes.
pub struct Semaphore {
    value: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(value: usize) -> Self {
        Semaphore {
            value: Mutex::new(value),
            cond: Condvar::new(),
        }
    }

    /// Blocks until the value is positive, then decrements it.
    pub fn down(&self) {
        let mut value = self.value.lock().unwrap();
        while *value == 0 {
            value = self.cond.wait(value).unwrap();
        }
        *value -= 1;
    }

    pub fn up(&self) {
        let mut value = self.value.lock().unwrap();
        *value += 1;
        self.cond.notify_one();
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Process>>> = const { RefCell::new(None) };
}

/// Starts a kernel thread for `process` and runs `f` on it with the
/// process bound, so `current_process()` works from anywhere on that
/// thread. The join handle is parked in the kernel for `Kernel::join_all`.
pub fn spawn<F>(kernel: &Arc<Kernel>, process: Arc<Process>, f: F)
where
    F: FnOnce() + Send + 'static,
{
    let name = process.name.clone();
    let registry = kernel.clone();
    let handle = thread::Builder::new()
        .name(name)
        .spawn(move || {
            CURRENT.with(|current| *current.borrow_mut() = Some(process));
            f();
            CURRENT.with(|current| current.borrow_mut().take());
        })
        .expect("kernel thread creation failed");
    registry.register_thread(handle);
}

/// The process bound to this thread, or None on the boot thread.
pub fn current_process() -> Option<Arc<Process>> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Polite spin: used while waiting out an in-flight eviction.
pub fn yield_now() {
    thread::yield_now();
}
