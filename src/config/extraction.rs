//! Typed extraction from a stage's flag map.
//!
//! Parses flag values via plain `FromStr`, since stage flags arrive as
//! argv strings rather than structured values.

use std::str::FromStr;

use super::types::StageConfig;

/// Extracts `key` from `config.flags`, parsing via `FromStr`; falls back to
/// `default` if the key is absent or fails to parse.
pub fn extract_flag<T>(config: &StageConfig, key: &str, default: T) -> T
where
    T: FromStr,
{
    config
        .flags
        .get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Like [`extract_flag`] but returns `None` instead of a default, so callers
/// can distinguish "absent" from "present with a parseable value".
pub fn extract_flag_opt<T>(config: &StageConfig, key: &str) -> Option<T>
where
    T: FromStr,
{
    config.flags.get(key).and_then(|v| v.parse().ok())
}

/// Boolean flags are `--flag` (present, no value) or `--flag=false`/`true`;
/// absence means `false`.
pub fn extract_bool_flag(config: &StageConfig, key: &str) -> bool {
    match config.flags.get(key) {
        None => false,
        Some(v) if v.is_empty() => true,
        Some(v) => v.parse().unwrap_or(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_returns_default() {
        let cfg = StageConfig::new("tcp");
        assert_eq!(extract_flag(&cfg, "timeout", 10u64), 10);
    }

    #[test]
    fn present_key_parses() {
        let mut cfg = StageConfig::new("tcp");
        cfg.flags.insert("timeout".into(), "30".into());
        assert_eq!(extract_flag(&cfg, "timeout", 10u64), 30);
    }

    #[test]
    fn bool_flag_present_without_value_is_true() {
        let mut cfg = StageConfig::new("tcp");
        cfg.flags.insert("md5".into(), String::new());
        assert!(extract_bool_flag(&cfg, "md5"));
    }
}
