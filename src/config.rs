use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::cache::{BatchOptions, LayerConfig, StoreConfig};
use crate::resources::ResourceKind;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the resource API, e.g. `https://dash.example.com/api/v1`
  pub url: String,
  /// Per-request timeout; a timed out request counts as a failed fetch
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Freshness budget for every kind without an override. When unset, each
  /// kind keeps its built-in budget.
  pub default_stale_ms: Option<u64>,
  pub gc_grace_ms: u64,
  pub gc_interval_ms: u64,
  pub batch_spacing_ms: u64,
  /// Per-kind freshness overrides, e.g. `{ tasks: 5000 }`
  pub stale_ms: BTreeMap<ResourceKind, u64>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      default_stale_ms: None,
      gc_grace_ms: 300_000,
      gc_interval_ms: 60_000,
      batch_spacing_ms: 250,
      stale_ms: BTreeMap::new(),
    }
  }
}

impl CacheConfig {
  /// Freshness budget for a kind: the per-kind override, then
  /// `default_stale_ms`, then the kind's built-in budget.
  pub fn stale_after(&self, kind: ResourceKind) -> chrono::Duration {
    self
      .stale_ms
      .get(&kind)
      .copied()
      .or(self.default_stale_ms)
      .map(millis)
      .unwrap_or_else(|| kind.default_stale_after())
  }

  pub fn layer_config(&self) -> LayerConfig {
    LayerConfig {
      store: StoreConfig {
        default_stale_after: self
          .default_stale_ms
          .map(millis)
          .unwrap_or_else(|| StoreConfig::default().default_stale_after),
        gc_grace: millis(self.gc_grace_ms),
      },
      batch: BatchOptions {
        spacing: std::time::Duration::from_millis(self.batch_spacing_ms),
      },
    }
  }

  pub fn gc_interval(&self) -> std::time::Duration {
    std::time::Duration::from_millis(self.gc_interval_ms.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default filter directive; `RUST_LOG` takes precedence
  pub level: String,
  /// Write to a daily rolling file instead of stderr
  pub file: bool,
  /// Log directory (defaults to the user data dir)
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: false,
      directory: None,
    }
  }
}

fn default_timeout_secs() -> u64 {
  30
}

fn millis(ms: u64) -> chrono::Duration {
  i64::try_from(ms)
    .ok()
    .and_then(chrono::Duration::try_milliseconds)
    .unwrap_or(chrono::Duration::MAX)
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./bizdash.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/bizdash/config.yaml
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/bizdash/config.yaml\n\
                 See bizdash.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("bizdash.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("bizdash").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    url::Url::parse(&config.api.url)
      .map_err(|e| eyre!("Invalid api.url '{}': {}", config.api.url, e))?;
    Ok(config)
  }

  /// Get the API bearer token from the environment, if set.
  ///
  /// Checks BIZDASH_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("BIZDASH_API_TOKEN")
      .ok()
      .filter(|token| !token.trim().is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn minimal_config_uses_defaults() {
    let config = Config::from_yaml("api:\n  url: https://dash.example.com/api\n").unwrap();
    assert_eq!(config.api.timeout_secs, 30);
    assert_eq!(config.cache.default_stale_ms, None);
    assert_eq!(
      config.cache.stale_after(ResourceKind::Entities),
      ResourceKind::Entities.default_stale_after()
    );
    assert_eq!(config.logging.level, "info");
    assert!(!config.logging.file);

    let layer = config.cache.layer_config();
    assert_eq!(layer.store.gc_grace, chrono::Duration::minutes(5));
    assert_eq!(layer.batch.spacing, std::time::Duration::from_millis(250));
  }

  #[test]
  fn per_kind_budgets_override_the_configured_default() {
    let yaml = r#"
api:
  url: https://dash.example.com/api
cache:
  default_stale_ms: 10000
  stale_ms:
    tasks: 5000
    invoices: 0
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(
      config.cache.stale_after(ResourceKind::Tasks),
      chrono::Duration::seconds(5)
    );
    assert_eq!(
      config.cache.stale_after(ResourceKind::Invoices),
      chrono::Duration::zero()
    );
    assert_eq!(
      config.cache.stale_after(ResourceKind::Entities),
      chrono::Duration::seconds(10)
    );
    assert_eq!(
      config.cache.layer_config().store.default_stale_after,
      chrono::Duration::seconds(10)
    );
  }

  #[test]
  fn rejects_unknown_kinds_and_bad_urls() {
    let unknown = "api:\n  url: https://x.test\ncache:\n  stale_ms:\n    projects: 1\n";
    assert!(Config::from_yaml(unknown).is_err());
    assert!(Config::from_yaml("api:\n  url: not a url\n").is_err());
  }

  #[test]
  fn explicit_missing_path_is_an_error() {
    let err = Config::load(Some(Path::new("/nonexistent/bizdash.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
