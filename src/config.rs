use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::publish::ROBLOX_API_BASE;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:5000";
const DEFAULT_SETTINGS_PATH: &str = "settings.json";
const DEFAULT_MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;
const DEFAULT_QUOTA_SWEEP_SECS: u64 = 3600;

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub settings_path: PathBuf,
    pub publish_api_base: String,
    pub publish_timeout: Option<Duration>,
    pub max_upload_bytes: usize,
    pub trust_proxy_headers: bool,
    /// `None` disables the sweep of stale quota records.
    pub quota_sweep_interval: Option<Duration>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bind_addr = parse_or(
            var("BIND_ADDR"),
            "BIND_ADDR",
            DEFAULT_BIND_ADDR.parse::<SocketAddr>()?,
        )?;
        let publish_timeout = var("PUBLISH_TIMEOUT_SECS")
            .map(|v| parse::<u64>(&v, "PUBLISH_TIMEOUT_SECS"))
            .transpose()?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        let sweep_secs = parse_or(
            var("QUOTA_SWEEP_SECS"),
            "QUOTA_SWEEP_SECS",
            DEFAULT_QUOTA_SWEEP_SECS,
        )?;

        Ok(Self {
            bind_addr,
            settings_path: var("SETTINGS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH)),
            publish_api_base: var("PUBLISH_API_BASE")
                .unwrap_or_else(|| ROBLOX_API_BASE.to_string()),
            publish_timeout,
            max_upload_bytes: parse_or(
                var("MAX_UPLOAD_BYTES"),
                "MAX_UPLOAD_BYTES",
                DEFAULT_MAX_UPLOAD_BYTES,
            )?,
            trust_proxy_headers: var("TRUST_PROXY_HEADERS")
                .map(|v| parse_flag(&v))
                .transpose()?
                .unwrap_or(false),
            quota_sweep_interval: (sweep_secs > 0).then(|| Duration::from_secs(sweep_secs)),
        })
    }
}

fn parse<T>(raw: &str, key: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse::<T>()
        .with_context(|| format!("Invalid value for {}: {:?}", key, raw))
}

fn parse_or<T>(raw: Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw {
        Some(v) => parse(&v, key),
        None => Ok(default),
    }
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("Invalid value for TRUST_PROXY_HEADERS: {:?}", raw),
    }
}
