use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct QuotaTrackerConfig {
    pub data_dir: PathBuf,
    pub snapshot_path: PathBuf,
    pub recalculation_interval_secs: u64,
    pub log_level: String,
}

impl Default for QuotaTrackerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/quota"),
            snapshot_path: PathBuf::from("data/inventory.json"),
            recalculation_interval_secs: 300,
            log_level: "info".to_string(),
        }
    }
}

impl QuotaTrackerConfig {
    /// Reads overrides from the environment without validating, so command
    /// line flags can still be applied on top.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Ok(dir) = env::var("QUOTA_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Ok(path) = env::var("QUOTA_SNAPSHOT_PATH") {
            cfg.snapshot_path = PathBuf::from(path);
        }
        if let Ok(interval) = env::var("RECALCULATION_INTERVAL_SECS") {
            cfg.recalculation_interval_secs = interval
                .parse()
                .context("RECALCULATION_INTERVAL_SECS must be a positive integer")?;
        }
        if let Ok(level) = env::var("LOG_LEVEL") {
            cfg.log_level = level;
        }

        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        ensure_directory(&self.data_dir)?;

        if !self.snapshot_path.is_file() {
            anyhow::bail!(
                "inventory snapshot {} does not exist",
                self.snapshot_path.display()
            );
        }
        if self.recalculation_interval_secs == 0 {
            anyhow::bail!("RECALCULATION_INTERVAL_SECS must be greater than zero");
        }

        Ok(())
    }

    pub fn recalculation_interval(&self) -> Duration {
        Duration::from_secs(self.recalculation_interval_secs)
    }
}

fn ensure_directory(path: &Path) -> Result<()> {
    if path.exists() {
        if !path.is_dir() {
            anyhow::bail!("{} exists but is not a directory", path.display());
        }
    } else {
        fs::create_dir_all(path)
            .with_context(|| format!("unable to create data directory {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> QuotaTrackerConfig {
        let snapshot_path = dir.path().join("inventory.json");
        fs::write(&snapshot_path, r#"{"entities": []}"#).unwrap();
        QuotaTrackerConfig {
            data_dir: dir.path().join("quota"),
            snapshot_path,
            ..QuotaTrackerConfig::default()
        }
    }

    #[test]
    fn test_config_validation() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);

        // Valid configuration; the data directory is created on demand
        assert!(config.validate().is_ok());
        assert!(config.data_dir.is_dir());

        // Invalid: zero interval
        config.recalculation_interval_secs = 0;
        assert!(config.validate().is_err());
        config.recalculation_interval_secs = 60;

        // Invalid: missing snapshot
        config.snapshot_path = dir.path().join("missing.json");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_data_dir_must_be_directory() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.data_dir = config.snapshot_path.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_interval() {
        let config = QuotaTrackerConfig::default();
        assert_eq!(config.recalculation_interval(), Duration::from_secs(300));
        assert_eq!(config.log_level, "info");
    }
}
