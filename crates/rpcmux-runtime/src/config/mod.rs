//! rpcmux configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (read by `from_env`)
//! 3. Library defaults (`defaults`)
//!
//! # Example
//!
//! ```rust,ignore
//! use rpcmux_runtime::config::MuxConfig;
//!
//! let config = MuxConfig::from_env()
//!     .wakeup_fd_cache(16)
//!     .poll_timeout(Duration::from_millis(20));
//! config.validate()?;
//! ```

pub mod defaults;

use std::fmt;
use std::time::Duration;

use rpcmux_core::env::{env_get, env_get_millis};
use thiserror::Error;

/// Runtime configuration with builder pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxConfig {
    /// Idle wakeup fds cached by `WakeupFdPool`
    pub wakeup_fd_cache: usize,
    /// Concurrent pluckers per completion queue
    pub max_pluckers: usize,
    /// Initial stream table capacity per connection
    pub stream_map_capacity: usize,
    /// Default bound on one `Pollset::poll` round
    pub poll_timeout: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl MuxConfig {
    /// Library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `RPCMUX_WAKEUP_FD_CACHE` - Cached idle wakeup fds
    /// - `RPCMUX_MAX_PLUCKERS` - Concurrent pluckers per queue
    /// - `RPCMUX_STREAM_MAP_CAPACITY` - Initial stream table capacity
    /// - `RPCMUX_POLL_TIMEOUT_MS` - Default poll round in milliseconds
    pub fn from_env() -> Self {
        Self {
            wakeup_fd_cache: env_get("RPCMUX_WAKEUP_FD_CACHE", defaults::WAKEUP_FD_CACHE),
            max_pluckers: env_get("RPCMUX_MAX_PLUCKERS", defaults::MAX_PLUCKERS),
            stream_map_capacity: env_get(
                "RPCMUX_STREAM_MAP_CAPACITY",
                defaults::STREAM_MAP_CAPACITY,
            ),
            poll_timeout: env_get_millis("RPCMUX_POLL_TIMEOUT_MS", defaults::POLL_TIMEOUT_MS),
        }
    }

    /// Library defaults only; the environment is ignored.
    pub fn new() -> Self {
        Self {
            wakeup_fd_cache: defaults::WAKEUP_FD_CACHE,
            max_pluckers: defaults::MAX_PLUCKERS,
            stream_map_capacity: defaults::STREAM_MAP_CAPACITY,
            poll_timeout: Duration::from_millis(defaults::POLL_TIMEOUT_MS),
        }
    }

    // Builder methods

    pub fn wakeup_fd_cache(mut self, n: usize) -> Self {
        self.wakeup_fd_cache = n;
        self
    }

    pub fn max_pluckers(mut self, n: usize) -> Self {
        self.max_pluckers = n;
        self
    }

    pub fn stream_map_capacity(mut self, n: usize) -> Self {
        self.stream_map_capacity = n;
        self
    }

    pub fn poll_timeout(mut self, d: Duration) -> Self {
        self.poll_timeout = d;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wakeup_fd_cache == 0 {
            return Err(ConfigError::InvalidValue("wakeup_fd_cache must be > 0"));
        }
        if self.wakeup_fd_cache > 4096 {
            return Err(ConfigError::InvalidValue("wakeup_fd_cache must be <= 4096"));
        }
        if self.max_pluckers == 0 {
            return Err(ConfigError::InvalidValue("max_pluckers must be > 0"));
        }
        if self.stream_map_capacity < 2 {
            return Err(ConfigError::InvalidValue("stream_map_capacity must be >= 2"));
        }
        if self.poll_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("poll_timeout must be > 0"));
        }
        Ok(())
    }
}

impl fmt::Display for MuxConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "rpcmux configuration:")?;
        writeln!(f, "  wakeup_fd_cache:      {}", self.wakeup_fd_cache)?;
        writeln!(f, "  max_pluckers:         {}", self.max_pluckers)?;
        writeln!(f, "  stream_map_capacity:  {}", self.stream_map_capacity)?;
        write!(f, "  poll_timeout:         {:?}", self.poll_timeout)
    }
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = MuxConfig::new();
        assert_eq!(config.wakeup_fd_cache, 50);
        assert_eq!(config.max_pluckers, 6);
        assert_eq!(config.stream_map_capacity, 8);
        assert_eq!(config.poll_timeout, Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("RPCMUX_STREAM_MAP_CAPACITY", "32");
        let config = MuxConfig::from_env();
        std::env::remove_var("RPCMUX_STREAM_MAP_CAPACITY");
        assert_eq!(config.stream_map_capacity, 32);
    }

    #[test]
    fn test_builder() {
        let config = MuxConfig::new()
            .wakeup_fd_cache(4)
            .max_pluckers(2)
            .poll_timeout(Duration::from_millis(5));
        assert_eq!(config.wakeup_fd_cache, 4);
        assert_eq!(config.max_pluckers, 2);
        assert_eq!(config.poll_timeout, Duration::from_millis(5));
    }

    #[test]
    fn test_validation() {
        assert!(MuxConfig::new().wakeup_fd_cache(0).validate().is_err());
        assert!(MuxConfig::new().max_pluckers(0).validate().is_err());
        assert_eq!(
            MuxConfig::new().stream_map_capacity(1).validate(),
            Err(ConfigError::InvalidValue("stream_map_capacity must be >= 2"))
        );
        assert!(MuxConfig::new().poll_timeout(Duration::ZERO).validate().is_err());
    }
}
