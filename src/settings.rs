use serde::Deserialize;

use std::env;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use backtrace::Backtrace;
use log::{error, warn};

use crate::mail_reader::attachment_store::{RetryPolicy, StoreMode};

// Main configuration struct
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub imap: ImapConfig,
    pub storage: StorageConfig,
    pub server: ServerConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ImapConfig {
    pub server: String,
    pub port: u16,
    pub folder: String,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            server: "imap.mail.ru".to_string(),
            port: 993,
            folder: "INBOX".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub attachments_dir: PathBuf,
    pub cursor_file: PathBuf,
    pub store_mode: StoreMode,
    pub retry_policy: RetryPolicy,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            attachments_dir: PathBuf::from("attachments"),
            cursor_file: PathBuf::from("sync_cursor.json"),
            store_mode: StoreMode::default(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

// REST server configuration
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConfig {
    /// Size of the window used when a request does not name one.
    pub since_days: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { since_days: 90 }
    }
}

impl Config {
    /// Environment variables win over the file: `ATTACHMENTS_DIR`,
    /// `CURSOR_FILE` and `PORT`.
    pub fn apply_env_overrides(mut self) -> Result<Self> {
        self.apply_overrides(|key| env::var(key).ok())?;
        Ok(self)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = lookup("ATTACHMENTS_DIR") {
            self.storage.attachments_dir = PathBuf::from(dir);
        }
        if let Some(file) = lookup("CURSOR_FILE") {
            self.storage.cursor_file = PathBuf::from(file);
        }
        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("PORT is not a port number: {}", port))?;
        }
        Ok(())
    }
}

pub fn load_settings(path: &Path) -> Result<Config> {
    if !path.exists() {
        warn!("{} not found, using defaults", path.display());
        return Config::default().apply_env_overrides();
    }

    let file = File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let reader = BufReader::new(file);

    // Parse the YAML file into the Config struct
    let config: Config = serde_yaml::from_reader(reader)
        .inspect_err(|err| {
            error!("Error: {}", err);

            // Capture and print the backtrace
            let backtrace = Backtrace::new();
            error!("Backtrace:\n{:?}", backtrace);
        })
        .with_context(|| format!("Cannot deserialize settings from {}", path.display()))?;

    config.apply_env_overrides()
}
