//! Pipe-based wakeup for platforms without eventfd
//!
//! `wakeup` writes one byte to the write end; `consume` drains the read
//! end. A full pipe already means a wakeup is pending.

use std::io;
use std::os::unix::io::RawFd;

use nix::errno::Errno;

use super::WakeupFd;

pub struct PipeWakeupFd {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl PipeWakeupFd {
    /// New pipe with both ends non-blocking and close-on-exec.
    pub fn create() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(Errno::last().into());
        }
        let pipe = Self {
            read_fd: fds[0],
            write_fd: fds[1],
        };
        set_nonblocking_cloexec(pipe.read_fd)?;
        set_nonblocking_cloexec(pipe.write_fd)?;
        Ok(pipe)
    }
}

fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(Errno::last().into());
        }
        let fd_flags = libc::fcntl(fd, libc::F_GETFD);
        if fd_flags < 0 || libc::fcntl(fd, libc::F_SETFD, fd_flags | libc::FD_CLOEXEC) < 0 {
            return Err(Errno::last().into());
        }
    }
    Ok(())
}

impl WakeupFd for PipeWakeupFd {
    fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    fn wakeup(&self) -> io::Result<()> {
        let byte = 0u8;
        loop {
            let ret = unsafe {
                libc::write(self.write_fd, &byte as *const u8 as *const libc::c_void, 1)
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

    fn consume(&self) -> io::Result<()> {
        let mut buf = [0u8; 128];
        loop {
            let ret = unsafe {
                libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if ret > 0 {
                continue;
            }
            if ret == 0 {
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

impl Drop for PipeWakeupFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}
