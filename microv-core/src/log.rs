//! Hypervisor logging subsystem
//!
//! Lock-free ring-buffer logging that works in a `no_std` environment.
//! The buffer is memory-mapped so an external debugger can fetch logs
//! without hypervisor intervention.
//!
//! • Logs are pushed via the `log!` macro which accepts standard `format!`
//!   syntax.
//! • The ring buffer is 64 KiB and overwrites old data when full.
//! • With the `uart` feature, bytes are also sent out the legacy COM1
//!   port for early debugging.

#![allow(dead_code)]

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicUsize, Ordering};

const LOG_BUF_SIZE: usize = 64 * 1024; // 64 KiB
static mut LOG_BUFFER: [u8; LOG_BUF_SIZE] = [0; LOG_BUF_SIZE];
static WRITE_POS: AtomicUsize = AtomicUsize::new(0);

#[cfg(all(target_arch = "x86_64", feature = "uart"))]
const UART_BASE: u16 = 0x3F8;

#[inline(always)]
fn uart_write_byte(_byte: u8) {
    #[cfg(all(target_arch = "x86_64", feature = "uart"))]
    unsafe {
        core::arch::asm!("out dx, al", in("dx") UART_BASE, in("al") _byte, options(nomem, nostack, preserves_flags));
    }
}

/// Internal writer implementing `core::fmt::Write`.
pub struct RingBufferWriter;

impl Write for RingBufferWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            write_byte(b);
        }
        Ok(())
    }
}

#[inline]
fn write_byte(b: u8) {
    let pos = WRITE_POS.fetch_add(1, Ordering::Relaxed) % LOG_BUF_SIZE;
    unsafe {
        (*core::ptr::addr_of_mut!(LOG_BUFFER))[pos] = b;
    }
    uart_write_byte(b);
}

/// Low-level logging macro
#[macro_export]
macro_rules! log {
    ($($arg:tt)*) => {{
        use core::fmt::Write as _;
        let _ = core::fmt::write(&mut $crate::log::RingBufferWriter, format_args!($($arg)*));
        let _ = $crate::log::RingBufferWriter.write_str("\r\n");
    }};
}

/// Expose log buffer for external tools (read-only).
pub fn buffer() -> *const u8 {
    core::ptr::addr_of!(LOG_BUFFER) as *const u8
}
