use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::service::types::ProcessingOptions;

/// Environment variable overriding `service.base_url`.
pub const BASE_URL_ENV: &str = "TUBESCRIPT_BASE_URL";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub service: ServiceConfig,
  pub cache: CacheConfig,
  pub polling: PollingConfig,
  pub processing: ProcessingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
  /// Root of the TubeScript API, e.g. http://localhost:8000
  pub base_url: String,
  /// Per-request timeout
  pub timeout_secs: u64,
}

impl Default for ServiceConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:8000".to_string(),
      timeout_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub enabled: bool,
  /// Database file (defaults to the user data dir)
  pub path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      path: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
  pub job_interval_ms: u64,
  pub batch_interval_ms: u64,
}

impl Default for PollingConfig {
  fn default() -> Self {
    Self {
      job_interval_ms: 1000,
      batch_interval_ms: 2000,
    }
  }
}

impl PollingConfig {
  pub fn job_interval(&self) -> Duration {
    Duration::from_millis(self.job_interval_ms.max(1))
  }

  pub fn batch_interval(&self) -> Duration {
    Duration::from_millis(self.batch_interval_ms.max(1))
  }
}

/// Defaults for new jobs when neither the command line nor stored settings
/// say otherwise.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
  pub diarization_enabled: Option<bool>,
  pub diarization_sensitivity: Option<f64>,
}

impl ProcessingConfig {
  pub fn options(&self) -> ProcessingOptions {
    ProcessingOptions {
      diarization_enabled: self.diarization_enabled,
      diarization_sensitivity: self.diarization_sensitivity,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tubescript.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tubescript/config.yaml
  ///
  /// Without a config file the defaults are used. `TUBESCRIPT_BASE_URL`
  /// overrides the configured base URL either way.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    Ok(config.with_base_url_override(std::env::var(BASE_URL_ENV).ok()))
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("tubescript.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tubescript").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    // An empty file parses as null rather than an empty mapping.
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Replace the base URL when `value` is set and non-blank.
  pub fn with_base_url_override(mut self, value: Option<String>) -> Self {
    if let Some(url) = value.filter(|url| !url.trim().is_empty()) {
      self.service.base_url = url.trim().to_string();
    }
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
  }

  #[test]
  fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.service.base_url, "http://localhost:8000");
    assert_eq!(config.service.timeout_secs, 30);
    assert!(config.cache.enabled);
    assert_eq!(config.polling.job_interval(), Duration::from_secs(1));
    assert_eq!(config.polling.batch_interval(), Duration::from_secs(2));
  }

  #[test]
  fn test_partial_file_keeps_other_defaults() {
    let file = write_config(
      "service:\n  base_url: https://transcribe.example.com\npolling:\n  job_interval_ms: 500\n",
    );
    let config = Config::load_from_path(file.path()).unwrap();

    assert_eq!(config.service.base_url, "https://transcribe.example.com");
    assert_eq!(config.service.timeout_secs, 30);
    assert_eq!(config.polling.job_interval_ms, 500);
    assert_eq!(config.polling.batch_interval_ms, 2000);
    assert!(config.cache.enabled);
  }

  #[test]
  fn test_full_file() {
    let file = write_config(
      "cache:\n  enabled: false\n  path: /tmp/ts.db\nprocessing:\n  diarization_enabled: true\n  diarization_sensitivity: 0.6\n",
    );
    let config = Config::load_from_path(file.path()).unwrap();

    assert!(!config.cache.enabled);
    assert_eq!(config.cache.path, Some(PathBuf::from("/tmp/ts.db")));
    let options = config.processing.options();
    assert_eq!(options.diarization_enabled, Some(true));
    assert_eq!(options.diarization_sensitivity, Some(0.6));
  }

  #[test]
  fn test_empty_file_is_defaults() {
    let file = write_config("");
    let config = Config::load_from_path(file.path()).unwrap();
    assert_eq!(config.service.base_url, "http://localhost:8000");
  }

  #[test]
  fn test_invalid_file_is_an_error() {
    let file = write_config("service: [not, a, mapping]\n");
    assert!(Config::load_from_path(file.path()).is_err());
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Config::load(Some(&dir.path().join("missing.yaml"))).is_err());
  }

  #[test]
  fn test_base_url_override() {
    let config = Config::default().with_base_url_override(Some(" http://10.0.0.2:8000 ".to_string()));
    assert_eq!(config.service.base_url, "http://10.0.0.2:8000");

    let config = Config::default().with_base_url_override(Some("  ".to_string()));
    assert_eq!(config.service.base_url, "http://localhost:8000");
  }
}
