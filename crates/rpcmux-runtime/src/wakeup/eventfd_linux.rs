//! Linux eventfd wakeup
//!
//! The eventfd counter is the pending-wakeup count: `wakeup` adds one,
//! `consume` reads (and so zeroes) it.

use std::io;
use std::os::unix::io::RawFd;

use nix::errno::Errno;

use super::WakeupFd;

pub struct EventFdWakeupFd {
    fd: RawFd,
}

impl EventFdWakeupFd {
    /// New eventfd with `EFD_NONBLOCK | EFD_CLOEXEC`.
    pub fn create() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(Errno::last().into());
        }
        Ok(Self { fd })
    }
}

impl WakeupFd for EventFdWakeupFd {
    fn read_fd(&self) -> RawFd {
        self.fd
    }

    fn wakeup(&self) -> io::Result<()> {
        let val: u64 = 1;
        loop {
            let ret = unsafe {
                libc::write(
                    self.fd,
                    &val as *const u64 as *const libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if ret >= 0 {
                return Ok(());
            }
            match Errno::last() {
                Errno::EINTR => continue,
                // Counter saturated: a wakeup is already pending.
                Errno::EAGAIN => return Ok(()),
                e => return Err(e.into()),
            }
        }
    }

    fn consume(&self) -> io::Result<()> {
        let mut val: u64 = 0;
        loop {
            let ret = unsafe {
                libc::read(
                    self.fd,
                    &mut val as *mut u64 as *mut libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if ret >= 0 {
                return Ok(());
            }
            match Errno::last() {
                Errno::EINTR => continue,
                Errno::EAGAIN => return Ok(()),
                e => return Err(e.into()),
            }
        }
    }
}

impl Drop for EventFdWakeupFd {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}
