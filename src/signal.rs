//! SIGINT handling for the command-line driver.
//!
//! The first Ctrl-C raises the interrupt flag, which stops `Machine::run`
//! at the next instruction boundary. A second Ctrl-C exits immediately with
//! status 130, for programs blocked in IN or a socket read.

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// Exit status used after an interrupt.
pub const EXIT_INTERRUPTED: i32 = 130;

static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

#[cfg(unix)]
extern "C" fn on_sigint(_: libc::c_int) {
    if let Some(flag) = FLAG.get() {
        if flag.swap(true, Ordering::SeqCst) {
            // Second interrupt: the machine never reached a boundary.
            unsafe { libc::_exit(EXIT_INTERRUPTED) };
        }
    }
}

/// Install the handler and return the flag it raises. Repeated calls
/// return the same flag.
pub fn install() -> Arc<AtomicBool> {
    let flag = FLAG.get_or_init(|| Arc::new(AtomicBool::new(false))).clone();
    #[cfg(unix)]
    {
        let handler = on_sigint as extern "C" fn(libc::c_int);
        unsafe {
            libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        }
    }
    flag
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_returns_shared_flag() {
        let a = install();
        let b = install();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!a.load(Ordering::SeqCst));
    }
}
