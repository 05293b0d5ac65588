use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_service_user() -> String {
    "_service".to_string()
}

fn default_read_buffer_size() -> usize {
    128 * 1024
}

fn default_max_disk_path_len() -> usize {
    3700
}

/// Runtime settings, loadable from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// On-disk root of the whole tree. `<root>/home` holds user homes.
    pub root: PathBuf,

    /// Name of the privileged service identity.
    #[serde(default = "default_service_user")]
    pub service_user: String,

    /// Default chunk size for streamed reads.
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    /// Ceiling on resolved on-disk path length, in bytes.
    #[serde(default = "default_max_disk_path_len")]
    pub max_disk_path_len: usize,
}

impl Settings {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Settings {
            root: root.into(),
            service_user: default_service_user(),
            read_buffer_size: default_read_buffer_size(),
            max_disk_path_len: default_max_disk_path_len(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let settings: Settings = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(settings)
    }

    pub fn write_default_config(path: &Path) -> Result<()> {
        let defaults = Settings::new("/srv/wardfs");
        let rendered = toml::to_string_pretty(&defaults).context("failed to render defaults")?;
        fs::write(path, rendered)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let settings: Settings = toml::from_str("root = \"/srv/files\"").unwrap();
        assert_eq!(settings.root, PathBuf::from("/srv/files"));
        assert_eq!(settings.service_user, "_service");
        assert_eq!(settings.read_buffer_size, 128 * 1024);
        assert_eq!(settings.max_disk_path_len, 3700);
    }

    #[test]
    fn test_write_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wardfs.toml");
        Settings::write_default_config(&path).unwrap();

        let loaded = Settings::from_file(&path).unwrap();
        assert_eq!(loaded.root, PathBuf::from("/srv/wardfs"));
        assert_eq!(loaded.service_user, "_service");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Settings::from_file(Path::new("/nonexistent/wardfs.toml")).is_err());
    }
}
