//! One polling round over caller fds plus a kick registration.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;

use crate::config::{defaults, ConfigError, MuxConfig};
use crate::kick::{KickFdInfo, PollsetKick, PrePoll};
use crate::wakeup_pool::WakeupFdPool;

/// How a polling round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Woken by a kick (pending or delivered during the poll).
    Kicked,
    /// `n` caller fds have events; see their `revents`.
    Ready(usize),
    /// Nothing happened before the timeout.
    TimedOut,
}

pub struct Pollset {
    kick: PollsetKick,
    default_timeout: Duration,
}

impl Pollset {
    /// Pollset with the library default poll timeout.
    pub fn new(pool: Arc<WakeupFdPool>) -> Self {
        Self {
            kick: PollsetKick::new(pool),
            default_timeout: Duration::from_millis(defaults::POLL_TIMEOUT_MS),
        }
    }

    /// Pollset whose default round is `config.poll_timeout`.
    pub fn with_config(pool: Arc<WakeupFdPool>, config: &MuxConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            kick: PollsetKick::new(pool),
            default_timeout: config.poll_timeout,
        })
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Wake one thread inside `poll`.
    pub fn kick(&self) -> io::Result<()> {
        self.kick.kick()
    }

    pub fn kicker(&self) -> &PollsetKick {
        &self.kick
    }

    /// Poll `fds` until an event, a kick, or `timeout` (the configured
    /// default when `None`). Caller `revents` are updated in place.
    pub fn poll(
        &self,
        fds: &mut [libc::pollfd],
        timeout: Option<Duration>,
    ) -> io::Result<PollOutcome> {
        let info = match self.kick.pre_poll()? {
            PrePoll::AlreadyKicked => return Ok(PollOutcome::Kicked),
            PrePoll::Poll(info) => info,
        };

        let result = self.poll_registered(&info, fds, timeout.unwrap_or(self.default_timeout));
        self.kick.post_poll(info);
        result
    }

    fn poll_registered(
        &self,
        info: &KickFdInfo,
        fds: &mut [libc::pollfd],
        timeout: Duration,
    ) -> io::Result<PollOutcome> {
        let mut set = Vec::with_capacity(fds.len() + 1);
        set.push(libc::pollfd {
            fd: info.read_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        set.extend(fds.iter().map(|p| libc::pollfd {
            fd: p.fd,
            events: p.events,
            revents: 0,
        }));

        let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        let n = unsafe { libc::poll(set.as_mut_ptr(), set.len() as libc::nfds_t, timeout_ms) };
        if n < 0 {
            return match Errno::last() {
                Errno::EINTR => Ok(PollOutcome::TimedOut),
                e => Err(e.into()),
            };
        }

        for (dst, src) in fds.iter_mut().zip(&set[1..]) {
            dst.revents = src.revents;
        }

        if set[0].revents & libc::POLLIN != 0 {
            self.kick.consume(info)?;
            return Ok(PollOutcome::Kicked);
        }
        let ready = set[1..].iter().filter(|p| p.revents != 0).count();
        if ready > 0 {
            Ok(PollOutcome::Ready(ready))
        } else {
            Ok(PollOutcome::TimedOut)
        }
    }
}

impl std::fmt::Debug for Pollset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pollset")
            .field("kick", &self.kick)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wakeup::new_wakeup_fd;
    use std::thread;
    use std::time::Instant;

    fn pollset() -> Arc<Pollset> {
        Arc::new(Pollset::new(Arc::new(WakeupFdPool::new(4))))
    }

    #[test]
    fn test_times_out_when_idle() {
        let ps = pollset();
        let start = Instant::now();
        let out = ps.poll(&mut [], Some(Duration::from_millis(30))).unwrap();
        assert_eq!(out, PollOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_pending_kick_skips_poll() {
        let ps = pollset();
        ps.kick().unwrap();
        let out = ps.poll(&mut [], Some(Duration::from_secs(5))).unwrap();
        assert_eq!(out, PollOutcome::Kicked);
    }

    #[test]
    fn test_kick_ends_blocked_poll() {
        let ps = pollset();
        let remote = Arc::clone(&ps);
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            remote.kick().unwrap();
        });
        let start = Instant::now();
        let out = ps.poll(&mut [], Some(Duration::from_secs(5))).unwrap();
        assert_eq!(out, PollOutcome::Kicked);
        assert!(start.elapsed() < Duration::from_secs(4));
        h.join().unwrap();
        assert_eq!(ps.kicker().pollers(), 0);
    }

    #[test]
    fn test_caller_fd_ready() {
        let ps = pollset();
        let signal = new_wakeup_fd().unwrap();
        signal.wakeup().unwrap();
        let mut fds = [libc::pollfd {
            fd: signal.read_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        let out = ps.poll(&mut fds, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(out, PollOutcome::Ready(1));
        assert!(fds[0].revents & libc::POLLIN != 0);
    }

    #[test]
    fn test_with_config_uses_poll_timeout() {
        let pool = Arc::new(WakeupFdPool::new(4));
        let config = MuxConfig::new().poll_timeout(Duration::from_millis(20));
        let ps = Pollset::with_config(Arc::clone(&pool), &config).unwrap();
        assert_eq!(ps.default_timeout(), Duration::from_millis(20));

        let start = Instant::now();
        assert_eq!(ps.poll(&mut [], None).unwrap(), PollOutcome::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(2));

        let bad = MuxConfig::new().poll_timeout(Duration::ZERO);
        assert!(Pollset::with_config(pool, &bad).is_err());
    }
}
