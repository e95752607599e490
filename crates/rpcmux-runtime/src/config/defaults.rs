//! Library defaults for `MuxConfig`.

/// Idle wakeup fds kept for reuse.
pub const WAKEUP_FD_CACHE: usize = 50;

/// Threads allowed to pluck one completion queue at once.
pub const MAX_PLUCKERS: usize = 6;

/// Initial stream table capacity per connection.
pub const STREAM_MAP_CAPACITY: usize = 8;

/// Upper bound on one polling round when the caller gives no timeout.
pub const POLL_TIMEOUT_MS: u64 = 100;
