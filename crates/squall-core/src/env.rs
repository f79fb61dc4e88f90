//! Environment-variable helpers for runtime configuration overrides

use std::str::FromStr;

/// Get an environment variable parsed as `T`, or the default
///
/// Unset or unparseable values fall back to the default silently; config
/// validation reports out-of-range values later.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or(default),
        Err(_) => default,
    }
}

/// Get an environment variable as a boolean
///
/// "1", "true", "yes", "on" (case-insensitive) count as true; any other set
/// value is false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Get an environment variable if set and parseable
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok()?.parse().ok()
}

/// Get an environment variable as a string, or the default
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__SQUALL_TEST_UNSET__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_set() {
        std::env::set_var("__SQUALL_TEST_NUM__", "123");
        let val: usize = env_get("__SQUALL_TEST_NUM__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__SQUALL_TEST_NUM__");
    }

    #[test]
    fn test_env_get_invalid_parse() {
        std::env::set_var("__SQUALL_TEST_BAD__", "not_a_number");
        let val: usize = env_get("__SQUALL_TEST_BAD__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__SQUALL_TEST_BAD__");
    }

    #[test]
    fn test_env_get_bool() {
        assert!(env_get_bool("__SQUALL_TEST_UNSET__", true));
        std::env::set_var("__SQUALL_TEST_BOOL__", "yes");
        assert!(env_get_bool("__SQUALL_TEST_BOOL__", false));
        std::env::set_var("__SQUALL_TEST_BOOL__", "0");
        assert!(!env_get_bool("__SQUALL_TEST_BOOL__", true));
        std::env::remove_var("__SQUALL_TEST_BOOL__");
    }

    #[test]
    fn test_env_get_opt() {
        let val: Option<u16> = env_get_opt("__SQUALL_TEST_UNSET__");
        assert!(val.is_none());
    }
}
