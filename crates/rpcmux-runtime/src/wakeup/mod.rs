//! Wakeup fds
//!
//! A wakeup fd is a pollable descriptor that another thread can make
//! readable. A thread about to block in `poll(2)` adds one to its fd set;
//! a kicker calls `wakeup()` to end that poll early.
//!
//! Signals coalesce: any number of `wakeup()` calls before the owner drains
//! the fd make it readable once, and one `consume()` clears them all.

use std::io;
use std::os::unix::io::RawFd;

/// Pollable cross-thread wakeup.
pub trait WakeupFd: Send + Sync {
    /// Descriptor to poll for readability.
    fn read_fd(&self) -> RawFd;

    /// Make `read_fd` readable. Never blocks.
    fn wakeup(&self) -> io::Result<()>;

    /// Clear any pending wakeups. Never blocks.
    fn consume(&self) -> io::Result<()>;
}

mod pipe_fallback;
pub use pipe_fallback::PipeWakeupFd;

// Platform-specific implementations
cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod eventfd_linux;
        pub use eventfd_linux::EventFdWakeupFd;

        fn create_platform() -> io::Result<Box<dyn WakeupFd>> {
            match EventFdWakeupFd::create() {
                Ok(fd) => Ok(Box::new(fd)),
                Err(e) => {
                    log::warn!("eventfd unavailable ({e}), falling back to pipe");
                    Ok(Box::new(PipeWakeupFd::create()?))
                }
            }
        }
    } else {
        fn create_platform() -> io::Result<Box<dyn WakeupFd>> {
            Ok(Box::new(PipeWakeupFd::create()?))
        }
    }
}

/// Create a new platform-appropriate wakeup fd.
pub fn new_wakeup_fd() -> io::Result<Box<dyn WakeupFd>> {
    create_platform()
}

/// Zero-timeout readability check.
pub(crate) fn is_readable(fd: RawFd) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let n = unsafe { libc::poll(&mut pfd, 1, 0) };
    n == 1 && pfd.revents & libc::POLLIN != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_wakeup_then_consume() {
        let fd = new_wakeup_fd().unwrap();
        assert!(!is_readable(fd.read_fd()));
        fd.wakeup().unwrap();
        fd.wakeup().unwrap();
        assert!(is_readable(fd.read_fd()));
        fd.consume().unwrap();
        assert!(!is_readable(fd.read_fd()));
        // Draining an idle fd is harmless.
        fd.consume().unwrap();
    }

    #[test]
    fn test_cross_thread_wakeup() {
        let fd: Arc<dyn WakeupFd> = Arc::from(new_wakeup_fd().unwrap());
        let kicker = Arc::clone(&fd);
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            kicker.wakeup().unwrap();
        });

        let mut pfd = libc::pollfd {
            fd: fd.read_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let n = unsafe { libc::poll(&mut pfd, 1, 5_000) };
        assert_eq!(n, 1);
        h.join().unwrap();
        fd.consume().unwrap();
    }
}
