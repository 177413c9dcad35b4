use alloc::string::String;
use alloc::vec::Vec;
use crossbeam_queue::ArrayQueue;
use spin::Mutex;

use crate::threads::Semaphore;

/// The console device: fd 1 writes land in `output`, fd 0 reads drain the
/// keyboard queue. Output is captured rather than rendered so callers (and
/// tests) can inspect exactly what the machine printed.
pub struct Console {
    output: Mutex<Vec<u8>>,
    input: ArrayQueue<u8>,
    input_avail: Semaphore,
}

impl Console {
    pub fn new(input_capacity: usize) -> Self {
        Console {
            output: Mutex::new(Vec::new()),
            input: ArrayQueue::new(input_capacity),
            input_avail: Semaphore::new(0),
        }
    }

    /// Writes `buf` to the console in one piece.
    pub fn putbuf(&self, buf: &[u8]) {
        log::trace!("console: {:?}", String::from_utf8_lossy(buf));
        self.output.lock().extend_from_slice(buf);
    }

    /// Retrieves one key, blocking until a key is available.
    pub fn getc(&self) -> u8 {
        self.input_avail.down();
        self.input
            .pop()
            .expect("input semaphore raised without a queued key")
    }

    /// Feeds keystrokes to the console. Keys past the queue capacity are
    /// dropped, like an overrun keyboard buffer.
    pub fn push_input(&self, keys: &[u8]) {
        for &key in keys {
            if self.input.push(key).is_ok() {
                self.input_avail.up();
            }
        }
    }

    /// Everything written so far, leaving the buffer in place.
    pub fn output(&self) -> Vec<u8> {
        self.output.lock().clone()
    }

    pub fn output_string(&self) -> String {
        String::from_utf8_lossy(&self.output.lock()).into_owned()
    }

    /// Drains and returns the captured output.
    pub fn take_output(&self) -> Vec<u8> {
        core::mem::take(&mut *self.output.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_accumulates() {
        let console = Console::new(8);
        console.putbuf(b"hello ");
        console.putbuf(b"world");
        assert_eq!(console.output_string(), "hello world");
        assert_eq!(console.take_output(), b"hello world");
        assert_eq!(console.output(), b"");
    }

    #[test]
    fn input_is_fifo() {
        let console = Console::new(8);
        console.push_input(b"abc");
        assert_eq!(console.getc(), b'a');
        assert_eq!(console.getc(), b'b');
        assert_eq!(console.getc(), b'c');
    }

    #[test]
    fn overrun_keys_are_dropped() {
        let console = Console::new(2);
        console.push_input(b"xyz");
        assert_eq!(console.getc(), b'x');
        assert_eq!(console.getc(), b'y');
        // 'z' was dropped; the semaphore was only raised twice
    }
}
