//! Environment variable helpers
//!
//! Used by `ServerConfig::from_env` to layer `SHARDNET_*` variables over
//! the defaults. Unset or unparsable values fall back silently.

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, or return `default`
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as `T` if set and valid
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean flag: "1", "true", "yes", "on" (any case) are true,
/// any other set value is false, unset returns `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Millisecond count as a `Duration`
#[inline]
pub fn env_get_duration_ms(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__SHARDNET_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        assert_eq!(env_get_opt::<u16>("__SHARDNET_TEST_UNSET__"), None);
    }

    #[test]
    fn test_env_get_parses() {
        std::env::set_var("__SHARDNET_TEST_SHARDS__", " 8 ");
        let val: usize = env_get("__SHARDNET_TEST_SHARDS__", 1);
        assert_eq!(val, 8);
        std::env::remove_var("__SHARDNET_TEST_SHARDS__");
    }

    #[test]
    fn test_env_get_invalid_falls_back() {
        std::env::set_var("__SHARDNET_TEST_BAD__", "many");
        let val: usize = env_get("__SHARDNET_TEST_BAD__", 3);
        assert_eq!(val, 3);
        std::env::remove_var("__SHARDNET_TEST_BAD__");
    }

    #[test]
    fn test_env_bool_and_duration() {
        std::env::set_var("__SHARDNET_TEST_FLAG__", "Yes");
        assert!(env_get_bool("__SHARDNET_TEST_FLAG__", false));
        std::env::remove_var("__SHARDNET_TEST_FLAG__");
        assert!(env_get_bool("__SHARDNET_TEST_FLAG__", true));

        std::env::set_var("__SHARDNET_TEST_MS__", "250");
        assert_eq!(
            env_get_duration_ms("__SHARDNET_TEST_MS__", Duration::from_secs(1)),
            Duration::from_millis(250)
        );
        std::env::remove_var("__SHARDNET_TEST_MS__");
    }
}
