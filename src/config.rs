use std::path::Path;

use anyhow::{Context, Result};

use crate::settings::Settings;

pub const DEFAULT_CONFIG_FILENAME: &str = "redq.toml";
pub const ENV_CONFIG_KEY: &str = "REDQ_CONFIG";

pub fn resolve_config_source(config_path: Option<&str>) -> (Option<String>, String) {
    if let Some(path) = config_path {
        return (Some(path.to_string()), "--config parameter".to_string());
    }

    if let Ok(env_path) = std::env::var(ENV_CONFIG_KEY)
        && !env_path.is_empty()
    {
        return (Some(env_path), format!("{ENV_CONFIG_KEY} env var"));
    }

    let default_path = Path::new(DEFAULT_CONFIG_FILENAME);
    if default_path.is_file() {
        return (
            Some(default_path.to_string_lossy().to_string()),
            format!("{DEFAULT_CONFIG_FILENAME} in cwd"),
        );
    }

    (None, "defaults".to_string())
}

/// Loads settings from the resolved TOML file (when one exists), then
/// applies `.env` and environment overrides. A missing file means defaults;
/// an explicitly named file that cannot be read is an error.
pub fn load_settings(config_path: Option<&str>) -> Result<Settings> {
    dotenvy::dotenv().ok();

    let (path, _) = resolve_config_source(config_path);
    let mut settings = match path {
        Some(path) => {
            let payload = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config at {path}"))?;
            toml::from_str(&payload).with_context(|| format!("failed to parse TOML at {path}"))?
        }
        None => Settings::default(),
    };
    apply_env_overrides(&mut settings)?;
    Ok(settings)
}

fn apply_env_overrides(settings: &mut Settings) -> Result<()> {
    if let Some(url) = env_nonempty("REDIS_URL") {
        settings.redis_url = url;
    }
    if let Some(level) = env_nonempty("REDQ_LOG_LEVEL") {
        settings.log_level = level;
    }
    if let Some(queues) = env_nonempty("REDQ_QUEUES") {
        settings.queues = queues
            .split(',')
            .map(|queue| queue.trim().to_string())
            .filter(|queue| !queue.is_empty())
            .collect();
    }
    if let Some(concurrency) = env_nonempty("REDQ_CONCURRENCY") {
        settings.concurrency = concurrency
            .parse()
            .with_context(|| format!("invalid REDQ_CONCURRENCY value: {concurrency}"))?;
    }
    Ok(())
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::{Mutex, OnceLock};
    use uuid::Uuid;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    struct EnvGuard {
        _lock: std::sync::MutexGuard<'static, ()>,
        prev: Vec<(&'static str, Option<String>)>,
    }

    #[allow(unsafe_code)] // env var manipulation in tests
    impl EnvGuard {
        fn set_many(pairs: &[(&'static str, &str)]) -> Self {
            let lock = env_lock().lock().unwrap();
            let mut prev = Vec::with_capacity(pairs.len());
            for (key, value) in pairs {
                prev.push((*key, std::env::var(key).ok()));
                unsafe {
                    std::env::set_var(key, value);
                }
            }
            Self { _lock: lock, prev }
        }
    }

    #[allow(unsafe_code)] // env var manipulation in tests
    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, prev) in self.prev.drain(..) {
                if let Some(value) = prev {
                    unsafe {
                        std::env::set_var(key, value);
                    }
                } else {
                    unsafe {
                        std::env::remove_var(key);
                    }
                }
            }
        }
    }

    #[test]
    fn resolve_config_source_prefers_explicit_path() {
        let (path, source) = resolve_config_source(Some("custom.toml"));
        assert_eq!(path, Some("custom.toml".to_string()));
        assert!(source.contains("--config"));
    }

    #[test]
    fn load_settings_reads_toml_and_applies_env_overrides() {
        let tmp_path = std::env::temp_dir().join(format!("redq-test-{}.toml", Uuid::new_v4()));
        let payload = r#"
redis_url = "redis://from-toml:6379/0"
queues = ["default", "mailers"]
concurrency = 3

[queue_concurrency]
mailers = 8
"#;
        fs::write(&tmp_path, payload).unwrap();
        let _guard = EnvGuard::set_many(&[
            ("REDIS_URL", "redis://from-env:6379/1"),
            ("REDQ_LOG_LEVEL", "debug"),
        ]);
        let settings = load_settings(Some(tmp_path.to_str().unwrap())).unwrap();
        assert_eq!(settings.redis_url, "redis://from-env:6379/1");
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.queues, vec!["default", "mailers"]);
        assert_eq!(settings.concurrency, 3);
        assert_eq!(settings.concurrency_for("mailers"), 8);
        let _ = fs::remove_file(&tmp_path);
    }

    #[test]
    fn env_queue_list_is_split_on_commas() {
        let _guard = EnvGuard::set_many(&[
            ("REDQ_QUEUES", "critical, default ,low"),
            ("REDQ_CONCURRENCY", "7"),
            ("REDIS_URL", ""),
            ("REDQ_LOG_LEVEL", ""),
        ]);
        let settings = load_settings(Some("/nonexistent-but-unused")).err();
        // An explicit missing path fails loudly.
        assert!(settings.is_some());

        let mut defaults = Settings::default();
        apply_env_overrides(&mut defaults).unwrap();
        assert_eq!(defaults.queues, vec!["critical", "default", "low"]);
        assert_eq!(defaults.concurrency, 7);
    }

    #[test]
    fn invalid_concurrency_value_is_rejected() {
        let _guard = EnvGuard::set_many(&[("REDQ_CONCURRENCY", "lots")]);
        let mut defaults = Settings::default();
        assert!(apply_env_overrides(&mut defaults).is_err());
    }
}
