//! Inspect or edit the relay's settings file without going through HTTP.
//! Usage:
//!   cargo run --bin settings_props -- show
//!   cargo run --bin settings_props -- set DEFAULT_TOKENS 10
//!   cargo run --bin settings_props -- maintenance on Back in ten minutes
//!   cargo run --bin settings_props -- maintenance off
//! Uses SETTINGS_PATH from the environment (.env supported), default settings.json.

use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use rbxl_relay::config::Config;
use rbxl_relay::settings::SettingsStore;
use serde_json::Value;
use std::env;

/// Accepts JSON literals (`10`, `true`, `"text"`) and falls back to a plain string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv();
    let config = Config::from_env()?;
    let store = SettingsStore::load(&config.settings_path);

    let args: Vec<String> = env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        [] | ["show"] => {}
        ["set", key, value @ ..] if !value.is_empty() => {
            let value = parse_value(&value.join(" "));
            if !store.update(key, value).await {
                bail!("{} is not a known setting", key);
            }
        }
        ["maintenance", "on", message @ ..] => {
            let message = (!message.is_empty()).then(|| message.join(" "));
            store.set_maintenance_mode(true, message).await;
        }
        ["maintenance", "off"] => store.set_maintenance_mode(false, None).await,
        _ => bail!("usage: settings_props [show | set <KEY> <VALUE> | maintenance on [MESSAGE] | maintenance off]"),
    }

    println!("# {}", config.settings_path.display());
    let snapshot = Value::Object(store.snapshot().await);
    println!(
        "{}",
        serde_json::to_string_pretty(&snapshot).context("serializing settings failed")?
    );
    Ok(())
}
