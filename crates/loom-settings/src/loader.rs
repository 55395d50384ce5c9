//! Settings loading.
//!
//! 1. Compiled [`LoomSettings::default()`]
//! 2. `~/.loom/settings.json` deep-merged over the defaults
//! 3. `LOOM_*` environment overrides
//!
//! Objects merge per key, arrays and primitives are replaced, nulls in the
//! file are skipped.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::{home_dir, LoomSettings};

pub fn settings_path() -> PathBuf {
    home_dir().join(".loom").join("settings.json")
}

pub fn load_settings() -> Result<LoomSettings> {
    load_settings_from_path(&settings_path())
}

/// Load from `path` with env overrides. A missing file yields defaults; a
/// malformed one is an error.
pub fn load_settings_from_path(path: &Path) -> Result<LoomSettings> {
    let mut settings = load_file(path)?;
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    Ok(settings)
}

fn load_file(path: &Path) -> Result<LoomSettings> {
    let defaults = serde_json::to_value(LoomSettings::default())?;
    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_owned(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_owned(),
            source,
        })?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };
    Ok(serde_json::from_value(merged)?)
}

pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `LOOM_*` overrides read through `lookup`. Invalid values are ignored
/// with a warning.
pub fn apply_env_overrides(settings: &mut LoomSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };
    if let Some(v) = env.string("LOOM_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.parsed("LOOM_PORT", |s| parse_u64_range(s, 1, 65_535)) {
        settings.server.port = v as u16;
    }
    if let Some(v) = env.string("LOOM_DATA_DIR") {
        settings.server.data_dir = v;
    }
    if let Some(v) = env.parsed("LOOM_STALENESS_SECS", |s| parse_u64_range(s, 1, 30 * 86_400)) {
        settings.sync.staleness_secs = v;
    }
    if let Some(v) = env.parsed("LOOM_QUEUE_MAX", |s| parse_u64_range(s, 0, 10_000)) {
        settings.queue.max_size = v as usize;
    }
    if let Some(v) = env.string("LOOM_AGENT_COMMAND") {
        settings.agent.command = Some(v);
    }
    if let Some(v) = env.string("LOOM_LOG") {
        settings.logging.level = v;
    }
    if let Some(v) = env.parsed("LOOM_LOG_JSON", parse_bool) {
        settings.logging.json = v;
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = self.string(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid env var, ignoring");
        }
        result
    }
}

/// Accepts `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`, case-insensitively.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 1, "host": "a"}});
        let source = serde_json::json!({"server": {"port": 2}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 2);
        assert_eq!(merged["server"]["host"], "a");
    }

    #[test]
    fn merge_null_and_arrays() {
        let target = serde_json::json!({"a": 1, "args": ["x", "y"]});
        let source = serde_json::json!({"a": null, "args": ["z"]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["args"], serde_json::json!(["z"]));
    }

    #[test]
    fn missing_file_is_defaults() {
        let settings = load_file(Path::new("/nonexistent/loom/settings.json")).unwrap();
        assert_eq!(settings.server.port, 7411);
    }

    #[test]
    fn partial_file_merges_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"port": 9000}, "agent": {"command": "my-agent", "args": ["--fast"]}}"#,
        )
        .unwrap();

        let settings = load_file(&path).unwrap();
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.agent.command.as_deref(), Some("my-agent"));
        assert_eq!(settings.agent.args, vec!["--fast"]);
        assert_eq!(settings.sync.max_missed_pings, 3);
    }

    #[test]
    fn malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_file(&path), Err(SettingsError::Parse { .. })));
    }

    #[test]
    fn wrong_value_type_is_shape_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"port": "high"}}"#).unwrap();
        assert!(matches!(load_file(&path), Err(SettingsError::Shape(_))));
    }

    #[test]
    fn env_overrides_apply() {
        let mut settings = LoomSettings::default();
        apply_env_overrides(
            &mut settings,
            env(&[
                ("LOOM_HOST", "0.0.0.0"),
                ("LOOM_PORT", "8123"),
                ("LOOM_QUEUE_MAX", "0"),
                ("LOOM_STALENESS_SECS", "60"),
                ("LOOM_AGENT_COMMAND", "agent"),
                ("LOOM_LOG", "debug"),
            ]),
        );
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 8123);
        assert_eq!(settings.queue.max_size, 0);
        assert_eq!(settings.sync.staleness_secs, 60);
        assert_eq!(settings.agent.command.as_deref(), Some("agent"));
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut settings = LoomSettings::default();
        apply_env_overrides(
            &mut settings,
            env(&[("LOOM_PORT", "0"), ("LOOM_STALENESS_SECS", "soon"), ("LOOM_HOST", "")]),
        );
        assert_eq!(settings.server.port, 7411);
        assert_eq!(settings.sync.staleness_secs, 3600);
        assert_eq!(settings.server.host, "127.0.0.1");
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_u64_range("5", 1, 10), Some(5));
        assert_eq!(parse_u64_range("11", 1, 10), None);
        assert_eq!(parse_u64_range("-1", 0, 10), None);
    }
}
