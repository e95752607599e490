//! Environment variable helpers
//!
//! Every tunable in rpcmux has a library default that an `RPCMUX_*`
//! variable may override. Unparseable values fall back to the default
//! rather than failing, so a typo in the environment never takes a
//! process down.
//!
//! ```ignore
//! use rpcmux_core::env::{env_get, env_get_bool};
//!
//! let pluckers: usize = env_get("RPCMUX_MAX_PLUCKERS", 6);
//! let flush = env_get_bool("RPCMUX_FLUSH_LOG", false);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, or return `default` when unset or malformed.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as `T`. `None` when unset or malformed.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean variable: "1", "true", "yes", "on" (any case) are true,
/// anything else that is set is false. Unset returns `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(
            val.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

/// String variable with a fallback.
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Millisecond duration variable with a fallback.
#[inline]
pub fn env_get_millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_get(key, default_ms))
}

/// True if `key` is present in the environment, whatever its value.
#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var_os(key).is_some()
}
