//! Console sink and the `print!`/`info!`/`debug!`/`warning!` macro family.
//!
//! The subsystems never touch a serial port or a framebuffer directly; they
//! write through the [`Console`] trait, which an embedding kernel installs
//! once at boot via [`set_console`]. [`QUIET`] gates everything except
//! `print!`/`println!` themselves, mirroring how a grader or test harness
//! silences chatter without losing deliberate output. Before a console is
//! installed (and in host-side unit tests, which never install one), output
//! is simply dropped.

use crate::sync::SpinLock;
use core::sync::atomic::{AtomicBool, Ordering};

/// A sink capable of accepting raw bytes of kernel console output.
pub trait Console: Send {
    /// Writes `data` to the console. Best-effort; console I/O has no error path.
    fn write(&mut self, data: &[u8]);
}

static CONSOLE: SpinLock<Option<&'static mut dyn Console>> = SpinLock::new(None);

/// Installs the console sink used by `print!` and friends.
///
/// Intended to be called exactly once, at boot.
pub fn set_console(console: &'static mut dyn Console) {
    let mut guard = CONSOLE.lock();
    *guard = Some(console);
    guard.unlock();
}

/// Silences `info!`, `warning!`, and `debug!` output when set.
pub static QUIET: AtomicBool = AtomicBool::new(false);

/// Writes formatted arguments to the installed console, if any.
#[doc(hidden)]
pub fn _print(args: core::fmt::Arguments<'_>) {
    use core::fmt::Write;

    struct Adapter<'a>(&'a mut dyn Console);
    impl core::fmt::Write for Adapter<'_> {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            self.0.write(s.as_bytes());
            Ok(())
        }
    }

    let mut guard = CONSOLE.lock();
    if let Some(console) = guard.as_mut() {
        let mut adapter = Adapter(*console);
        let _ = write!(adapter, "{args}");
    }
    guard.unlock();
}

/// Prints without a trailing newline.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::console::_print(format_args!($($arg)*)));
}

/// Prints with a trailing newline.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Prints an informational message, suppressed while [`QUIET`] is set.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => (
        if !$crate::console::QUIET.load(core::sync::atomic::Ordering::SeqCst) {
            $crate::println!("[INFO] {}", format_args!($($arg)*))
        }
    );
}

/// Prints a warning, suppressed while [`QUIET`] is set.
#[macro_export]
macro_rules! warning {
    ($($arg:tt)*) => (
        if !$crate::console::QUIET.load(core::sync::atomic::Ordering::SeqCst) {
            $crate::println!("[WARN] {}", format_args!($($arg)*))
        }
    );
}

/// Prints a debug message, suppressed while [`QUIET`] is set.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => (
        if !$crate::console::QUIET.load(core::sync::atomic::Ordering::SeqCst) {
            $crate::println!("[DEBUG] {}", format_args!($($arg)*))
        }
    );
}
