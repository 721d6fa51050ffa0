//! Configuration for the machine manager.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::cleanup::CleanupWorkerConfig;

/// Machine manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root for instance and snapshot directories of the local provider.
    pub data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error), used when `RUST_LOG` is
    /// unset.
    pub log_level: String,

    /// Upper bound on provisioning and restore.
    pub provision_timeout: Duration,

    pub cleanup: CleanupWorkerConfig,

    /// SQLite database for snapshot records. In-memory when unset.
    pub snapshot_db: Option<PathBuf>,

    /// Register the mock provider alongside the real ones.
    pub dev: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = lookup("BERTH_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/berth"));

        let log_level = lookup("BERTH_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let provision_timeout_secs: u64 = parse(&lookup, "BERTH_PROVISION_TIMEOUT_SECS", 600)?;
        let cleanup_interval_secs: u64 = parse(&lookup, "BERTH_CLEANUP_INTERVAL_SECS", 30)?;
        let log_after_attempts = parse(&lookup, "BERTH_CLEANUP_LOG_AFTER_ATTEMPTS", 10)?;
        let max_attempts = parse(&lookup, "BERTH_CLEANUP_MAX_ATTEMPTS", 100)?;

        let snapshot_db = lookup("BERTH_SNAPSHOT_DB")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let dev = lookup("BERTH_DEV")
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            data_dir,
            log_level,
            provision_timeout: Duration::from_secs(provision_timeout_secs),
            cleanup: CleanupWorkerConfig {
                interval: Duration::from_secs(cleanup_interval_secs),
                log_after_attempts,
                max_attempts,
            },
            snapshot_db,
            dev,
        })
    }
}

fn parse<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/berth"));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.provision_timeout, Duration::from_secs(600));
        assert_eq!(config.cleanup.interval, Duration::from_secs(30));
        assert_eq!(config.cleanup.log_after_attempts, 10);
        assert_eq!(config.cleanup.max_attempts, 100);
        assert!(config.snapshot_db.is_none());
        assert!(!config.dev);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("BERTH_DATA_DIR", "/tmp/berth"),
            ("BERTH_PROVISION_TIMEOUT_SECS", "5"),
            ("BERTH_CLEANUP_MAX_ATTEMPTS", "3"),
            ("BERTH_SNAPSHOT_DB", "/tmp/berth/snapshots.db"),
            ("BERTH_DEV", "true"),
        ])
        .unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/tmp/berth"));
        assert_eq!(config.provision_timeout, Duration::from_secs(5));
        assert_eq!(config.cleanup.max_attempts, 3);
        assert_eq!(
            config.snapshot_db,
            Some(PathBuf::from("/tmp/berth/snapshots.db"))
        );
        assert!(config.dev);
    }

    #[test]
    fn test_invalid_number_is_reported() {
        let err = load(&[("BERTH_CLEANUP_INTERVAL_SECS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("BERTH_CLEANUP_INTERVAL_SECS"));
    }
}
