//! Process-wide settings backed by a single JSON file.
//!
//! The in-memory map always holds every built-in key. Persisted values are laid
//! over the defaults at startup and the whole map is rewritten on each mutation.

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

pub const RATE_LIMIT_SECONDS: &str = "RATE_LIMIT_SECONDS";
pub const DEFAULT_TOKENS: &str = "DEFAULT_TOKENS";
pub const MAINTENANCE_MODE: &str = "MAINTENANCE_MODE";
pub const MAINTENANCE_MESSAGE: &str = "MAINTENANCE_MESSAGE";

pub const DEFAULT_RATE_LIMIT_SECONDS: i64 = 60;
pub const DEFAULT_DAILY_TOKENS: i64 = 5;
pub const DEFAULT_MAINTENANCE_MESSAGE: &str =
    "System is currently undergoing maintenance. Please try again later.";

/// Keys accepted by [`SettingsStore::update`].
pub const KNOWN_KEYS: [&str; 4] = [
    RATE_LIMIT_SECONDS,
    DEFAULT_TOKENS,
    MAINTENANCE_MODE,
    MAINTENANCE_MESSAGE,
];

pub fn default_settings() -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(RATE_LIMIT_SECONDS.to_string(), json!(DEFAULT_RATE_LIMIT_SECONDS));
    map.insert(DEFAULT_TOKENS.to_string(), json!(DEFAULT_DAILY_TOKENS));
    map.insert(MAINTENANCE_MODE.to_string(), json!(false));
    map.insert(
        MAINTENANCE_MESSAGE.to_string(),
        json!(DEFAULT_MAINTENANCE_MESSAGE),
    );
    map
}

/// Upload limits in effect at the moment they were read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub window_secs: i64,
    pub daily_tokens: i64,
}

pub struct SettingsStore {
    path: Option<PathBuf>,
    values: RwLock<Map<String, Value>>,
}

impl SettingsStore {
    /// Builds the store from defaults plus whatever `path` holds. Never fails:
    /// an unreadable or malformed file is logged and ignored.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut values = default_settings();
        match read_overrides(&path) {
            Ok(Some(saved)) => {
                for (key, value) in saved {
                    values.insert(key, value);
                }
                info!("Settings loaded from {}", path.display());
            }
            Ok(None) => info!("No settings file at {}, using defaults", path.display()),
            Err(e) => error!("Error loading settings: {:#}", e),
        }
        Self {
            path: Some(path),
            values: RwLock::new(values),
        }
    }

    /// Defaults only, nothing is written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            values: RwLock::new(default_settings()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.values.read().await.get(key).cloned()
    }

    /// Typed lookup. Absent keys and values of the wrong shape yield `default`.
    pub async fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        let Some(value) = self.get(key).await else {
            return default;
        };
        match serde_json::from_value(value) {
            Ok(v) => v,
            Err(e) => {
                warn!("Setting {} has an unexpected type ({}), using default", key, e);
                default
            }
        }
    }

    pub async fn snapshot(&self) -> Map<String, Value> {
        self.values.read().await.clone()
    }

    /// Replaces the value of a built-in key and persists. Unknown keys are refused.
    pub async fn update(&self, key: &str, value: Value) -> bool {
        if !KNOWN_KEYS.contains(&key) {
            warn!("Refusing to update unknown setting {}", key);
            return false;
        }
        let mut values = self.values.write().await;
        info!("Updated setting {}: {}", key, value);
        values.insert(key.to_string(), value);
        self.persist_logged(&values).await;
        true
    }

    pub async fn set_maintenance_mode(&self, enabled: bool, message: Option<String>) {
        let mut values = self.values.write().await;
        values.insert(MAINTENANCE_MODE.to_string(), json!(enabled));
        if let Some(message) = message.filter(|m| enabled && !m.is_empty()) {
            values.insert(MAINTENANCE_MESSAGE.to_string(), json!(message));
        }
        self.persist_logged(&values).await;
        info!(
            "Maintenance mode {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    pub async fn limits(&self) -> Limits {
        Limits {
            window_secs: self
                .get_or(RATE_LIMIT_SECONDS, DEFAULT_RATE_LIMIT_SECONDS)
                .await
                .max(0),
            daily_tokens: self.get_or(DEFAULT_TOKENS, DEFAULT_DAILY_TOKENS).await,
        }
    }

    /// The notice to show while maintenance mode is on, `None` otherwise.
    pub async fn maintenance_notice(&self) -> Option<String> {
        if !self.get_or(MAINTENANCE_MODE, false).await {
            return None;
        }
        Some(
            self.get_or(
                MAINTENANCE_MESSAGE,
                DEFAULT_MAINTENANCE_MESSAGE.to_string(),
            )
            .await,
        )
    }

    /// Called with the write guard held so that saves land in mutation order.
    async fn persist_logged(&self, values: &Map<String, Value>) {
        let Some(path) = self.path.as_deref() else {
            return;
        };
        match write_settings(path, values).await {
            Ok(()) => info!("Settings saved to {}", path.display()),
            Err(e) => error!("Error saving settings: {:#}", e),
        }
    }
}

fn read_overrides(path: &Path) -> Result<Option<Map<String, Value>>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading {} failed", path.display()))?;
    match serde_json::from_str::<Value>(&raw).context("JSON parse failed")? {
        Value::Object(map) => Ok(Some(map)),
        other => Err(anyhow!(
            "{} must hold a JSON object, found {}",
            path.display(),
            other
        )),
    }
}

async fn write_settings(path: &Path, values: &Map<String, Value>) -> Result<()> {
    let body = serde_json::to_vec_pretty(values).context("serializing settings failed")?;
    tokio::fs::write(path, body)
        .await
        .with_context(|| format!("writing {} failed", path.display()))
}
