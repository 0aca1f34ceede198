use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use spanbackup_storage::{CopySettings, DEFAULT_CHUNK_SIZE};

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub backup: BackupConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct BackupConfig {
    pub host: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub chunk_size: Option<usize>,
    pub verify_existing: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: Option<String>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading config file {path:?}"))?;
    toml::from_str(&contents).with_context(|| format!("parsing config file {path:?}"))
}

/// Effective settings: environment first, then the config file, then
/// built-in defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub host: String,
    /// Where new run logs are created.
    pub log_dir: PathBuf,
    pub chunk_size: usize,
    pub verify_existing: bool,
    pub log_filter: String,
}

impl Settings {
    pub fn resolve(cfg: &Config) -> Result<Self> {
        Self::resolve_with(cfg, |key| std::env::var(key).ok())
    }

    pub fn resolve_with(cfg: &Config, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let host = match env("SPANBACKUP_HOST").or_else(|| cfg.backup.host.clone()) {
            Some(host) => host,
            None => local_hostname()?,
        };

        let log_dir = env("SPANBACKUP_LOG_DIR")
            .map(PathBuf::from)
            .or_else(|| cfg.backup.log_dir.clone())
            .unwrap_or_else(|| PathBuf::from("."));

        let chunk_size = env("SPANBACKUP_CHUNK_SIZE")
            .and_then(|v| v.parse::<usize>().ok())
            .or(cfg.backup.chunk_size)
            .unwrap_or(DEFAULT_CHUNK_SIZE)
            .max(1);

        Ok(Self {
            host,
            log_dir,
            chunk_size,
            verify_existing: cfg.backup.verify_existing.unwrap_or(true),
            log_filter: cfg.logging.filter.clone().unwrap_or_else(|| "info".to_owned()),
        })
    }

    pub fn copy_settings(&self) -> CopySettings {
        CopySettings {
            host: self.host.clone(),
            chunk_size: self.chunk_size,
            verify_existing: self.verify_existing,
        }
    }
}

fn local_hostname() -> Result<String> {
    let raw = nix::unistd::gethostname().context("read host name")?;
    Ok(raw.to_string_lossy().into_owned())
}
