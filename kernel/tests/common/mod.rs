#![allow(dead_code)]

use std::sync::Arc;

use ferrix_kernel::image::{self, ElfBuilder};
use ferrix_kernel::{Kernel, KernelConfig};

pub const CODE_BASE: u32 = 0x0804_8000;
pub const DATA_BASE: u32 = 0x0804_9000;

pub fn boot(user_frames: usize) -> Arc<Kernel> {
    let _ = env_logger::builder().is_test(true).try_init();
    Kernel::boot(KernelConfig {
        user_frames,
        ..KernelConfig::default()
    })
}

/// Installs a minimal executable: one read-only code page of NOPs.
pub fn install_trivial(kernel: &Kernel, name: &str) {
    let image_bytes = ElfBuilder::new(CODE_BASE)
        .segment(CODE_BASE, &[0x90; 16], 16, false)
        .build();
    image::install(kernel, name, &image_bytes).unwrap();
}

/// The machine is fully quiesced and every VM resource is back where it
/// started: no frames in use, no swap slots held, no PCBs alive.
pub fn assert_quiesced(kernel: &Kernel) {
    kernel.join_all();
    assert_eq!(kernel.live_processes(), 0, "leaked process descriptors");
    assert!(kernel.frames.is_empty(), "leaked frame table entries");
    assert_eq!(kernel.swap.used_slots(), 0, "leaked swap slots");
    assert_eq!(
        kernel.pool.free_count(),
        kernel.pool.capacity(),
        "leaked user frames"
    );
}
