use std::str::FromStr;

use crate::error::ConfigError;

/// Read an env var, treating empty values as unset.
pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "value is not valid UTF-8".to_string(),
        }),
    }
}

/// Parse a boolean env var, accepting `true/false`, `1/0`, `yes/no`, `on/off`.
pub(crate) fn parse_bool_env(key: &str, default: bool) -> Result<bool, ConfigError> {
    let Some(raw) = optional_env(key)? else {
        return Ok(default);
    };
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("must be 'true' or 'false', got '{other}'"),
        }),
    }
}

/// Parse an env var with `FromStr`, falling back to `default` when unset.
pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(key)? {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        None => Ok(default),
    }
}

/// Serializes tests that mutate process-wide environment variables.
#[cfg(test)]
pub(crate) static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optional_env_treats_blank_as_unset() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        // SAFETY: guarded by ENV_LOCK; no other thread reads this key.
        unsafe { std::env::set_var("TOOLFORGE_TEST_BLANK", "   ") };
        assert_eq!(optional_env("TOOLFORGE_TEST_BLANK").unwrap(), None);
        unsafe { std::env::remove_var("TOOLFORGE_TEST_BLANK") };
    }

    #[test]
    fn test_parse_bool_env_variants() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        for (raw, expected) in [("yes", true), ("0", false), ("On", true), ("FALSE", false)] {
            unsafe { std::env::set_var("TOOLFORGE_TEST_BOOL", raw) };
            assert_eq!(parse_bool_env("TOOLFORGE_TEST_BOOL", !expected).unwrap(), expected);
        }
        unsafe { std::env::set_var("TOOLFORGE_TEST_BOOL", "maybe") };
        let err = parse_bool_env("TOOLFORGE_TEST_BOOL", false).unwrap_err();
        assert!(err.to_string().contains("TOOLFORGE_TEST_BOOL"));
        unsafe { std::env::remove_var("TOOLFORGE_TEST_BOOL") };
        assert!(parse_bool_env("TOOLFORGE_TEST_BOOL", true).unwrap());
    }

    #[test]
    fn test_parse_optional_env_rejects_garbage() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        unsafe { std::env::set_var("TOOLFORGE_TEST_NUM", "twelve") };
        assert!(parse_optional_env::<u32>("TOOLFORGE_TEST_NUM", 5).is_err());
        unsafe { std::env::set_var("TOOLFORGE_TEST_NUM", " 12 ") };
        assert_eq!(parse_optional_env::<u32>("TOOLFORGE_TEST_NUM", 5).unwrap(), 12);
        unsafe { std::env::remove_var("TOOLFORGE_TEST_NUM") };
        assert_eq!(parse_optional_env::<u32>("TOOLFORGE_TEST_NUM", 5).unwrap(), 5);
    }
}
