//! Boots a machine, installs a handful of user programs, runs one command
//! line, and echoes the console:
//!
//!     cargo run --bin ferrix -- echo hello world
//!     cargo run --bin ferrix -- cat hello.txt
//!     cargo run --bin ferrix -- ls

use std::env;
use std::process::ExitCode;

use ferrix_kernel::image::{self, ElfBuilder};
use ferrix_kernel::{Kernel, KernelConfig};

const CODE_BASE: u32 = 0x0804_8000;

fn install(kernel: &Kernel, name: &str) {
    let bytes = ElfBuilder::new(CODE_BASE)
        .segment(CODE_BASE, &[0x90; 16], 16, false)
        .build();
    image::install(kernel, name, &bytes).expect("installing a program failed");
}

fn main() -> ExitCode {
    let cmdline = env::args().skip(1).collect::<Vec<_>>().join(" ");
    let cmdline = if cmdline.is_empty() {
        "echo hello from ferrix".to_string()
    } else {
        cmdline
    };

    let kernel = Kernel::boot(KernelConfig::default());

    for name in ["echo", "cat", "ls"] {
        install(&kernel, name);
    }
    kernel
        .filesys
        .create(None, "hello.txt", 14)
        .expect("creating hello.txt failed");
    kernel
        .filesys
        .open(None, "hello.txt")
        .expect("opening hello.txt failed")
        .write(b"hello, world!\n");

    kernel.register_program("echo", |ctx| {
        let args = ctx.args()?;
        ctx.write_buf(1, args[1..].join(" ").as_bytes())?;
        ctx.write_buf(1, b"\n")?;
        ctx.exit(0)
    });

    kernel.register_program("cat", |ctx| {
        let args = ctx.args()?;
        for path in &args[1..] {
            let fd = ctx.open(path)?;
            if fd < 0 {
                return ctx.exit(1);
            }
            let buf = ctx.esp() - 256;
            loop {
                let n = ctx.read(fd, buf, 128)?;
                if n <= 0 {
                    break;
                }
                let bytes = ctx.read_bytes(buf, n as usize)?;
                ctx.write_buf(1, &bytes)?;
            }
            ctx.close(fd)?;
        }
        ctx.exit(0)
    });

    kernel.register_program("ls", |ctx| {
        let fd = ctx.open("/")?;
        while let Some(name) = ctx.readdir(fd)? {
            ctx.write_buf(1, name.as_bytes())?;
            ctx.write_buf(1, b"\n")?;
        }
        ctx.exit(0)
    });

    let status = kernel.run(&cmdline);
    kernel.join_all();
    print!("{}", kernel.console.output_string());

    if status == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
