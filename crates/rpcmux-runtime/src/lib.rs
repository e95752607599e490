//! # rpcmux-runtime
//!
//! Platform-specific runtime pieces for rpcmux.
//!
//! This crate provides:
//! - Wakeup fds (eventfd on Linux, non-blocking pipe elsewhere)
//! - A bounded cache of idle wakeup fds
//! - Pollset kicking: waking exactly one thread blocked in `poll(2)`
//! - Runtime configuration with environment overrides

#[cfg(not(unix))]
compile_error!("rpcmux-runtime requires a Unix platform");

pub mod config;
pub mod wakeup;
pub mod wakeup_pool;
pub mod kick;
pub mod pollset;

// Re-exports
pub use config::{ConfigError, MuxConfig};
pub use wakeup::{new_wakeup_fd, WakeupFd};
pub use wakeup_pool::WakeupFdPool;
pub use kick::{KickFdInfo, PollsetKick, PrePoll};
pub use pollset::{PollOutcome, Pollset};
