// Configuration: a TOML file in the user's config directory, overridable
// from the environment. Loaded once by the binary and passed down into the
// constructors that need it.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::capture::CaptureTool;
use crate::retry::RetryPolicy;

pub const DEFAULT_API_URL: &str = "https://puush.me";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub api_url: String,
    pub capture_tool: CaptureTool,
    pub screenshot_dir: PathBuf,
    pub keep_screenshots: bool,
    pub history_file: PathBuf,
    pub copy_url: bool,
    pub timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("puush");
        let screenshot_dir = dirs::picture_dir()
            .map(|p| p.join("puush"))
            .unwrap_or_else(|| data_dir.join("screenshots"));
        Self {
            api_key: None,
            api_url: DEFAULT_API_URL.to_string(),
            capture_tool: CaptureTool::default(),
            screenshot_dir,
            keep_screenshots: true,
            history_file: data_dir.join("history.jsonl"),
            copy_url: true,
            timeout_secs: 30,
            retry: RetryPolicy::default(),
        }
    }
}

impl Config {
    /// `<config dir>/puush/config.toml`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("puush")
            .join("config.toml")
    }

    /// Read `path` (a missing file means defaults), then apply `PUUSH_API_KEY`
    /// and `PUUSH_API_URL` from the environment.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => {
                debug!("loading config from {}", path.display());
                toml::from_str(&text)
                    .with_context(|| format!("Invalid config file {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read config file {}", path.display()))
            }
        }
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(key) = var("PUUSH_API_KEY").filter(|k| !k.trim().is_empty()) {
            self.api_key = Some(key);
        }
        if let Some(url) = var("PUUSH_API_URL").filter(|u| !u.trim().is_empty()) {
            self.api_url = url;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.api_url)
            .with_context(|| format!("Invalid api_url `{}`", self.api_url))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            anyhow::bail!("api_url must be http or https, got `{}`", self.api_url);
        }
        if self.timeout_secs == 0 {
            anyhow::bail!("timeout_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Set `api_key` in the file at `path`, creating it if needed. Every other
/// key stays exactly as the user wrote it (or absent, so defaults keep
/// following the platform directories).
pub fn store_api_key(path: &Path, api_key: &str) -> Result<()> {
    let mut table = match fs::read_to_string(path) {
        Ok(text) => text
            .parse::<toml::Table>()
            .with_context(|| format!("Invalid config file {}", path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => toml::Table::new(),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read config file {}", path.display()))
        }
    };
    table.insert("api_key".to_string(), toml::Value::String(api_key.to_string()));

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let text = toml::to_string_pretty(&table).context("Failed to encode config")?;
    fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))?;
    info!("saved API key to {}", path.display());
    Ok(())
}
