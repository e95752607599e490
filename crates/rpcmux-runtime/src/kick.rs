//! Pollset kicking
//!
//! Several threads may block in `poll(2)` on behalf of one pollset. Each
//! registers a wakeup fd before polling and includes it in its fd set. A
//! kick makes exactly one registered fd readable, waking one poller.
//!
//! Registration lifecycle:
//!
//! ```text
//! pre_poll() --> registered(fd) --consume()--> consumed --post_poll()--> unregistered
//!     \
//!      `--> AlreadyKicked   (a kick arrived while nobody was polling)
//! ```
//!
//! A kick with no registrations is remembered and absorbed by the next
//! `pre_poll`, so it is never lost between two polling rounds.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::wakeup::{is_readable, WakeupFd};
use crate::wakeup_pool::WakeupFdPool;

/// Live registration returned by `pre_poll`.
///
/// Not `Clone`: `post_poll` consumes it, so a registration is released
/// exactly once.
#[derive(Debug)]
pub struct KickFdInfo {
    id: u64,
    read_fd: RawFd,
}

impl KickFdInfo {
    /// Descriptor to poll for readability alongside the caller's fds.
    #[inline]
    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }
}

/// Result of `pre_poll`.
#[derive(Debug)]
pub enum PrePoll {
    /// A pending kick was absorbed; skip polling this round.
    AlreadyKicked,
    /// Poll including `KickFdInfo::read_fd`.
    Poll(KickFdInfo),
}

struct Registration {
    id: u64,
    fd: Box<dyn WakeupFd>,
}

struct KickState {
    /// Kicked while no registration existed.
    kicked: bool,
    /// Oldest first; kicks go to the front.
    registrations: VecDeque<Registration>,
    next_id: u64,
}

pub struct PollsetKick {
    state: Mutex<KickState>,
    pool: Arc<WakeupFdPool>,
}

impl PollsetKick {
    pub fn new(pool: Arc<WakeupFdPool>) -> Self {
        Self {
            state: Mutex::new(KickState {
                kicked: false,
                registrations: VecDeque::new(),
                next_id: 1,
            }),
            pool,
        }
    }

    /// Register for the coming poll, or absorb a pending kick.
    pub fn pre_poll(&self) -> io::Result<PrePoll> {
        let mut state = self.lock();
        if state.kicked {
            state.kicked = false;
            log::trace!("pre_poll: absorbed pending kick");
            return Ok(PrePoll::AlreadyKicked);
        }

        let fd = self.pool.acquire()?;
        let id = state.next_id;
        state.next_id += 1;
        let read_fd = fd.read_fd();
        state.registrations.push_back(Registration { id, fd });
        Ok(PrePoll::Poll(KickFdInfo { id, read_fd }))
    }

    /// Wake one poller, or remember the kick if nobody is polling.
    ///
    /// The woken registration moves to the back, so consecutive kicks
    /// rotate across pollers.
    pub fn kick(&self) -> io::Result<()> {
        let mut state = self.lock();
        match state.registrations.pop_front() {
            Some(reg) => {
                let result = reg.fd.wakeup();
                state.registrations.push_back(reg);
                result
            }
            None => {
                state.kicked = true;
                Ok(())
            }
        }
    }

    /// Wake every poller and leave a pending kick for the next `pre_poll`.
    pub fn kick_all(&self) -> io::Result<()> {
        let mut state = self.lock();
        let mut first_err = None;
        for reg in &state.registrations {
            if let Err(e) = reg.fd.wakeup() {
                first_err.get_or_insert(e);
            }
        }
        state.kicked = true;
        first_err.map_or(Ok(()), Err)
    }

    /// Drain the wakeup of a registration whose fd fired.
    pub fn consume(&self, info: &KickFdInfo) -> io::Result<()> {
        let state = self.lock();
        match state.registrations.iter().find(|r| r.id == info.id) {
            Some(reg) => reg.fd.consume(),
            None => Ok(()),
        }
    }

    /// Unregister; the fd goes back to the pool (or is closed if the pool
    /// is full).
    ///
    /// A kick delivered after `poll(2)` returned but before this call is
    /// still pending on the fd; it is carried over as `kicked` so the next
    /// `pre_poll` absorbs it instead of the pool draining it away.
    pub fn post_poll(&self, info: KickFdInfo) {
        let reg = {
            let mut state = self.lock();
            let pos = state.registrations.iter().position(|r| r.id == info.id);
            let reg = pos.and_then(|p| state.registrations.remove(p));
            if let Some(reg) = &reg {
                if is_readable(reg.fd.read_fd()) {
                    log::trace!("post_poll: carrying over unconsumed kick");
                    state.kicked = true;
                }
            }
            reg
        };
        match reg {
            Some(reg) => self.pool.release(reg.fd),
            None => log::warn!("post_poll: unknown registration {}", info.id),
        }
    }

    /// Active registrations.
    pub fn pollers(&self) -> usize {
        self.lock().registrations.len()
    }

    /// # Panics
    ///
    /// If a registration is still active.
    pub fn destroy(self) {
        let active = self.pollers();
        assert!(active == 0, "pollset destroyed with {active} active registrations");
    }

    fn lock(&self) -> MutexGuard<'_, KickState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for PollsetKick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("PollsetKick")
            .field("kicked", &state.kicked)
            .field("registrations", &state.registrations.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn kicker(cap: usize) -> (Arc<WakeupFdPool>, PollsetKick) {
        let pool = Arc::new(WakeupFdPool::new(cap));
        (Arc::clone(&pool), PollsetKick::new(pool))
    }

    fn registered(kick: &PollsetKick) -> KickFdInfo {
        match kick.pre_poll().unwrap() {
            PrePoll::Poll(info) => info,
            PrePoll::AlreadyKicked => panic!("unexpected pending kick"),
        }
    }

    #[test]
    fn test_kick_without_pollers_is_remembered() {
        let (pool, kick) = kicker(4);
        let warm = registered(&kick);
        kick.post_poll(warm);
        assert_eq!(pool.cached(), 1);

        kick.kick().unwrap();
        assert!(matches!(kick.pre_poll().unwrap(), PrePoll::AlreadyKicked));
        // No fd was taken from the pool for the absorbed round.
        assert_eq!(pool.cached(), 1);

        // Absorbed: the next round registers normally.
        let info = registered(&kick);
        kick.post_poll(info);
        kick.destroy();
    }

    #[test]
    fn test_kick_wakes_registered_fd() {
        let (_pool, kick) = kicker(4);
        let info = registered(&kick);
        assert!(!is_readable(info.read_fd()));

        kick.kick().unwrap();
        assert!(is_readable(info.read_fd()));
        kick.consume(&info).unwrap();
        assert!(!is_readable(info.read_fd()));

        kick.post_poll(info);
        kick.destroy();
    }

    #[test]
    fn test_kick_between_poll_return_and_post_poll_is_kept() {
        let (pool, kick) = kicker(4);
        let info = registered(&kick);

        // poll(2) already returned; the kick lands before post_poll.
        kick.kick().unwrap();
        kick.post_poll(info);

        assert!(matches!(kick.pre_poll().unwrap(), PrePoll::AlreadyKicked));
        // The cached fd was drained on release.
        let next = registered(&kick);
        assert!(!is_readable(next.read_fd()));
        kick.post_poll(next);
        assert_eq!(pool.cached(), 1);
        kick.destroy();
    }

    #[test]
    fn test_consumed_kick_is_not_carried_over() {
        let (_pool, kick) = kicker(4);
        let info = registered(&kick);
        kick.kick().unwrap();
        kick.consume(&info).unwrap();
        kick.post_poll(info);

        let next = registered(&kick);
        kick.post_poll(next);
        kick.destroy();
    }

    #[test]
    fn test_kick_wakes_only_one_and_rotates() {
        let (_pool, kick) = kicker(4);
        let a = registered(&kick);
        let b = registered(&kick);

        kick.kick().unwrap();
        assert!(is_readable(a.read_fd()));
        assert!(!is_readable(b.read_fd()));

        kick.kick().unwrap();
        assert!(is_readable(b.read_fd()));

        kick.post_poll(a);
        kick.post_poll(b);
        kick.destroy();
    }

    #[test]
    fn test_kick_all() {
        let (_pool, kick) = kicker(4);
        let a = registered(&kick);
        let b = registered(&kick);
        kick.kick_all().unwrap();
        assert!(is_readable(a.read_fd()));
        assert!(is_readable(b.read_fd()));
        kick.post_poll(a);
        kick.post_poll(b);
        assert!(matches!(kick.pre_poll().unwrap(), PrePoll::AlreadyKicked));
    }

    #[test]
    fn test_cache_never_exceeds_cap() {
        let pool = Arc::new(WakeupFdPool::new(50));
        for _ in 0..200 {
            let kick = PollsetKick::new(Arc::clone(&pool));
            let infos: Vec<_> = (0..3).map(|_| registered(&kick)).collect();
            for info in infos {
                kick.post_poll(info);
            }
            kick.destroy();
            assert!(pool.cached() <= 50);
        }

        let kick = PollsetKick::new(Arc::clone(&pool));
        let infos: Vec<_> = (0..80).map(|_| registered(&kick)).collect();
        for info in infos {
            kick.post_poll(info);
        }
        assert_eq!(pool.cached(), 50);
    }

    #[test]
    fn test_kick_from_another_thread() {
        let (_pool, kick) = kicker(4);
        let kick = Arc::new(kick);
        let info = registered(&kick);

        let remote = Arc::clone(&kick);
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.kick().unwrap();
        });

        let mut pfd = libc::pollfd {
            fd: info.read_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let n = unsafe { libc::poll(&mut pfd, 1, 5_000) };
        assert_eq!(n, 1);
        kick.consume(&info).unwrap();
        kick.post_poll(info);
        h.join().unwrap();
    }

    #[test]
    #[should_panic(expected = "active registrations")]
    fn test_destroy_with_live_registration_panics() {
        let (_pool, kick) = kicker(4);
        let _info = registered(&kick);
        kick.destroy();
    }
}
