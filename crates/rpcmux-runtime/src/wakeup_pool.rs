//! `WakeupFdPool` - bounded cache of idle wakeup fds.
//!
//! Every polling round needs a wakeup fd for its registration. Creating and
//! closing one per round costs two syscalls, so finished registrations hand
//! their fd back here. The free list is a lock-free bounded queue; an fd
//! released into a full pool is closed.
//!
//! The pool is an explicit object shared by `Arc`. There is no process-wide
//! cache; tests and embedders create as many pools as they need.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_queue::ArrayQueue;

use crate::config::{ConfigError, MuxConfig};
use crate::wakeup::{new_wakeup_fd, WakeupFd};

pub struct WakeupFdPool {
    free: ArrayQueue<Box<dyn WakeupFd>>,
    shutdown: AtomicBool,
}

impl WakeupFdPool {
    /// Pool caching at most `cap` idle fds (at least 1).
    pub fn new(cap: usize) -> Self {
        Self {
            free: ArrayQueue::new(cap.max(1)),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Pool sized by `config.wakeup_fd_cache`, after validating `config`.
    pub fn from_config(config: &MuxConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(config.wakeup_fd_cache))
    }

    /// A cached fd, or a freshly created one if the cache is empty.
    pub fn acquire(&self) -> io::Result<Box<dyn WakeupFd>> {
        match self.free.pop() {
            Some(fd) => Ok(fd),
            None => new_wakeup_fd(),
        }
    }

    /// Return `fd` for reuse. Closed instead if the pool is full or shut
    /// down, or if its pending wakeups cannot be drained.
    pub fn release(&self, fd: Box<dyn WakeupFd>) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        // A stale wakeup would end the next owner's poll for nothing.
        if let Err(e) = fd.consume() {
            log::warn!("dropping wakeup fd {}: drain failed: {e}", fd.read_fd());
            return;
        }
        if let Err(fd) = self.free.push(fd) {
            log::trace!("wakeup fd cache full, closing fd {}", fd.read_fd());
        }
    }

    /// Idle fds currently cached.
    pub fn cached(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.free.capacity()
    }

    /// Close every cached fd; later releases close their fd.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let mut closed = 0;
        while self.free.pop().is_some() {
            closed += 1;
        }
        log::debug!("wakeup fd pool shut down, closed {closed} cached fds");
    }
}

impl Drop for WakeupFdPool {
    fn drop(&mut self) {
        if !self.shutdown.load(Ordering::Acquire) {
            self.shutdown();
        }
    }
}

impl std::fmt::Debug for WakeupFdPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeupFdPool")
            .field("cached", &self.cached())
            .field("capacity", &self.capacity())
            .finish()
    }
}
