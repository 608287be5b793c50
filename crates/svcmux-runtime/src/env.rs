//! Environment variable utilities
//!
//! Generic `env_get<T>` for parsing environment variables with defaults.

use std::str::FromStr;

/// Get environment variable parsed as type T, or return default
///
/// Works with any type that implements `FromStr`. Unset or unparsable
/// values return the default.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get environment variable as string, or return default
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__SVCMUX_TEST_UNSET__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_set_and_invalid() {
        std::env::set_var("__SVCMUX_TEST_NUM__", "123");
        let val: usize = env_get("__SVCMUX_TEST_NUM__", 0);
        assert_eq!(val, 123);

        std::env::set_var("__SVCMUX_TEST_NUM__", "not_a_number");
        let val: usize = env_get("__SVCMUX_TEST_NUM__", 99);
        assert_eq!(val, 99);

        std::env::remove_var("__SVCMUX_TEST_NUM__");
    }

    #[test]
    fn test_env_get_str_default() {
        let val = env_get_str("__SVCMUX_TEST_UNSET__", "hello");
        assert_eq!(val, "hello");
    }
}
