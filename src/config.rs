use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::SyncTimings;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Authenticated user the records belong to
  pub user_id: Option<String>,
  pub remote: RemoteConfig,
  #[serde(default)]
  pub local: LocalConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Root directory of the document store (e.g. a mounted sync folder)
  pub root: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocalConfig {
  /// SQLite file for the local cache (defaults to the data directory)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub debounce_ms: u64,
  pub read_deadline_ms: u64,
  pub write_deadline_ms: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    let timings = SyncTimings::default();
    Self {
      debounce_ms: timings.debounce.as_millis() as u64,
      read_deadline_ms: timings.read_deadline.as_millis() as u64,
      write_deadline_ms: timings.write_deadline.as_millis() as u64,
    }
  }
}

impl SyncConfig {
  pub fn timings(&self) -> SyncTimings {
    SyncTimings {
      debounce: Duration::from_millis(self.debounce_ms),
      read_deadline: Duration::from_millis(self.read_deadline_ms),
      write_deadline: Duration::from_millis(self.write_deadline_ms),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Default filter directive, overridden by RUST_LOG
  pub level: String,
  /// Directory for the log file (defaults to the data directory)
  pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      dir: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./daybook.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/daybook/config.yaml
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
        "No configuration file found. Create one at ~/.config/daybook/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("daybook.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("daybook").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Resolve the user id: explicit override, then DAYBOOK_USER, then the file.
  pub fn user_id(&self, explicit: Option<&str>) -> Result<String> {
    if let Some(user) = explicit {
      return Ok(user.to_string());
    }
    std::env::var("DAYBOOK_USER")
      .ok()
      .or_else(|| self.user_id.clone())
      .filter(|user| !user.is_empty())
      .ok_or_else(|| eyre!("No user id. Set user_id in the config or DAYBOOK_USER."))
  }

  /// Directory the log file is written to.
  pub fn log_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.log.dir {
      return Ok(dir.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;
    Ok(data_dir.join("daybook"))
  }
}
