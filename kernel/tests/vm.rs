//! Demand paging end to end: lazy segment loading, zero pages, eviction
//! and swap round trips under a tiny frame pool, stack growth, and the
//! faults that must kill.

mod common;

use common::*;
use ferrix_kernel::image::{self, ElfBuilder};
use ferrix_kernel::vm::PG_SIZE;
use ferrix_kernel::vm::page::PageState;

#[test]
fn data_and_bss_pages_load_lazily() {
    let kernel = boot(16);

    let mut data = vec![0u8; 100];
    data[0] = 11;
    data[99] = 22;
    // 100 file bytes, then zeros out to 100 + 8 KiB: page 0 is file-backed
    // with a zero tail, pages 1 and 2 are pure bss.
    let image_bytes = ElfBuilder::new(CODE_BASE)
        .segment(CODE_BASE, &[0x90; 16], 16, false)
        .segment(DATA_BASE, &data, 100 + 8192, true)
        .build();
    image::install(&kernel, "bss", &image_bytes).unwrap();

    kernel.register_program("bss", |ctx| {
        let data = DATA_BASE as usize;
        let bss_page = data + PG_SIZE;
        let mut fails = 0;

        // the bss page never touches the file: it is recorded zero-backed
        if ctx.page_state(bss_page) != Some(PageState::AllZero) {
            fails |= 1;
        }
        if ctx.read_byte(bss_page)? != 0 {
            fails |= 2;
        }
        if ctx.page_state(bss_page) != Some(PageState::OnFrame) {
            fails |= 4;
        }

        // the data page carries its file bytes, then zeros
        if ctx.page_state(data) != Some(PageState::FromFilesys) {
            fails |= 8;
        }
        if ctx.read_byte(data)? != 11 || ctx.read_byte(data + 99)? != 22 {
            fails |= 16;
        }
        if ctx.read_byte(data + 100)? != 0 {
            fails |= 32;
        }

        // writes stick, and a resident file page keeps its file backing
        ctx.write_byte(data, 0x5a)?;
        if ctx.read_byte(data)? != 0x5a {
            fails |= 64;
        }
        if ctx.page_state(data) != Some(PageState::FromFilesys) {
            fails |= 128;
        }

        ctx.exit(fails)
    });

    assert_eq!(kernel.run("bss"), 0);
    assert_quiesced(&kernel);
}

#[test]
fn eviction_swaps_dirty_pages_and_restores_them() {
    // 4 frames for a stack page plus 8 touched data pages: most of the
    // working set has to cycle through swap.
    let kernel = boot(4);
    const PAGES: usize = 8;

    let image_bytes = ElfBuilder::new(CODE_BASE)
        .segment(CODE_BASE, &[0x90; 16], 16, false)
        .segment(DATA_BASE, &[], (PAGES * PG_SIZE) as u32, true)
        .build();
    image::install(&kernel, "thrash", &image_bytes).unwrap();

    kernel.register_program("thrash", |ctx| {
        let data = DATA_BASE as usize;
        let mut fails = 0;

        for i in 0..PAGES {
            ctx.write_byte(data + i * PG_SIZE, (i + 1) as u8)?;
            ctx.write_byte(data + i * PG_SIZE + 17, (i + 101) as u8)?;
        }
        // 9 live pages cannot fit in 4 frames; the dirty overflow must be
        // sitting in swap right now
        if ctx.kernel().swap.used_slots() == 0 {
            fails |= 1;
        }
        if ctx.kernel().frames.len() > ctx.kernel().pool.capacity() {
            fails |= 2;
        }

        // every page comes back bitwise intact
        for i in 0..PAGES {
            if ctx.read_byte(data + i * PG_SIZE)? != (i + 1) as u8 {
                fails |= 4;
            }
            if ctx.read_byte(data + i * PG_SIZE + 17)? != (i + 101) as u8 {
                fails |= 8;
            }
        }
        ctx.exit(fails)
    });

    assert_eq!(kernel.run("thrash"), 0);
    assert_quiesced(&kernel);
}

#[test]
fn clean_code_pages_are_dropped_and_reread() {
    let kernel = boot(4);
    const PAGES: usize = 8;

    let mut code = vec![0x90u8; 64];
    code[0] = 0xab;
    let image_bytes = ElfBuilder::new(CODE_BASE)
        .segment(CODE_BASE, &code, 64, false)
        .segment(DATA_BASE, &[], (PAGES * PG_SIZE) as u32, true)
        .build();
    image::install(&kernel, "reread", &image_bytes).unwrap();

    kernel.register_program("reread", |ctx| {
        let code = CODE_BASE as usize;
        let data = DATA_BASE as usize;
        let mut fails = 0;

        if ctx.read_byte(code)? != 0xab {
            fails |= 1;
        }
        // flood the pool so the clean code page gets evicted (dropped,
        // not swapped: its backing file still has the bytes)
        for i in 0..PAGES {
            ctx.write_byte(data + i * PG_SIZE, 1)?;
        }
        if ctx.read_byte(code)? != 0xab {
            fails |= 2;
        }
        if ctx.page_state(code) != Some(PageState::FromFilesys) {
            fails |= 4;
        }
        ctx.exit(fails)
    });

    assert_eq!(kernel.run("reread"), 0);
    assert_quiesced(&kernel);
}

#[test]
fn stack_grows_for_pushes_within_reach() {
    let kernel = boot(16);
    install_trivial(&kernel, "grow");

    kernel.register_program("grow", |ctx| {
        let base = ctx.esp();
        let mut fails = 0;

        ctx.set_esp(base - 3 * PG_SIZE);
        let esp = ctx.esp();
        ctx.write_byte(esp - 4, 0xaa)?; // PUSH
        ctx.write_byte(esp - 32, 0xbb)?; // PUSHA's farthest write
        if ctx.read_byte(esp - 4)? != 0xaa || ctx.read_byte(esp - 32)? != 0xbb {
            fails |= 1;
        }

        // the gap up to the original stack got zero pages recorded
        if ctx.page_state(base - 2 * PG_SIZE).is_none() {
            fails |= 2;
        }
        // addresses above esp in the grown region are fair game
        ctx.write_byte(esp + 100, 1)?;
        if ctx.read_byte(esp + 100)? != 1 {
            fails |= 4;
        }
        ctx.exit(fails)
    });

    assert_eq!(kernel.run("grow"), 0);
    assert_quiesced(&kernel);
}

#[test]
fn push_reach_boundary_is_exactly_32_bytes() {
    let kernel = boot(16);
    install_trivial(&kernel, "edge_ok");
    install_trivial(&kernel, "edge_kill");

    // With a page-aligned esp, both esp-32 and esp-33 land on the same
    // unmapped page below it; only the first is within PUSHA's reach.
    kernel.register_program("edge_ok", |ctx| {
        let esp = (ctx.esp() & !(PG_SIZE - 1)) - 2 * PG_SIZE;
        ctx.set_esp(esp);
        ctx.write_byte(esp - 32, 1)?;
        ctx.exit(0)
    });
    kernel.register_program("edge_kill", |ctx| {
        let esp = (ctx.esp() & !(PG_SIZE - 1)) - 2 * PG_SIZE;
        ctx.set_esp(esp);
        ctx.write_byte(esp - 33, 1)?;
        ctx.exit(0)
    });

    assert_eq!(kernel.run("edge_ok"), 0);
    assert_eq!(kernel.run("edge_kill"), -1);
    assert!(kernel.console.output_string().contains("edge_kill: exit(-1)"));
}

#[test]
fn far_below_the_stack_pointer_kills() {
    let kernel = boot(16);
    install_trivial(&kernel, "deep");
    kernel.register_program("deep", |ctx| {
        let esp = ctx.esp();
        ctx.write_byte(esp - 8 * PG_SIZE, 1)?;
        ctx.exit(0)
    });

    assert_eq!(kernel.run("deep"), -1);
    assert_quiesced(&kernel);
}

#[test]
fn kernel_addresses_kill_from_user_mode() {
    let kernel = boot(16);
    install_trivial(&kernel, "ktouch");
    kernel.register_program("ktouch", |ctx| {
        ctx.read_byte(0xc000_0000)?;
        ctx.exit(0)
    });

    assert_eq!(kernel.run("ktouch"), -1);
}

#[test]
fn writing_read_only_code_kills() {
    let kernel = boot(16);
    install_trivial(&kernel, "rowrite");
    kernel.register_program("rowrite", |ctx| {
        let code = CODE_BASE as usize;
        ctx.read_byte(code)?; // materialize the page read-only
        ctx.write_byte(code, 0)?; // rights violation
        ctx.exit(0)
    });

    assert_eq!(kernel.run("rowrite"), -1);
    assert!(kernel.console.output_string().contains("rowrite: exit(-1)"));
}

#[test]
fn frame_table_matches_resident_pages() {
    let kernel = boot(16);
    install_trivial(&kernel, "inspect");
    kernel.register_program("inspect", |ctx| {
        let mut fails = 0;

        // grow some stack, then check every frame this process owns is
        // recorded as a resident supplemental entry
        let esp = ctx.esp();
        ctx.set_esp(esp - 2 * PG_SIZE);
        ctx.write_byte(ctx.esp(), 9)?;

        let pid = ctx.pid();
        for (_, page, owner) in ctx.kernel().frames.snapshot() {
            if owner != pid {
                continue;
            }
            match ctx.page_state(page) {
                Some(PageState::OnFrame) | Some(PageState::FromFilesys) => {}
                other => {
                    let _ = other;
                    fails |= 1;
                }
            }
        }
        ctx.exit(fails)
    });

    assert_eq!(kernel.run("inspect"), 0);
    assert_quiesced(&kernel);
}
