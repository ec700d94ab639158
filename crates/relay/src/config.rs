use std::fs;

use anyhow::Context;
use serde::Deserialize;

pub const SETTINGS_FILE: &str = "relay.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub bind_addr: String,
    pub jwt_secret: String,
    pub max_message_bytes: usize,
    pub rate_limit_per_second: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8443".into(),
            jwt_secret: "devsecret".into(),
            max_message_bytes: 64 * 1024,
            rate_limit_per_second: 50,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    bind_addr: Option<String>,
    jwt_secret: Option<String>,
    max_message_bytes: Option<usize>,
    rate_limit_per_second: Option<u32>,
}

pub fn load_settings() -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(SETTINGS_FILE) {
        apply_file(&mut settings, &raw)
            .with_context(|| format!("failed to parse {SETTINGS_FILE}"))?;
    }
    apply_env(&mut settings, |key| std::env::var(key).ok());

    Ok(settings)
}

fn apply_file(settings: &mut Settings, raw: &str) -> anyhow::Result<()> {
    let file_cfg: FileSettings = toml::from_str(raw)?;
    if let Some(v) = file_cfg.bind_addr {
        settings.bind_addr = v;
    }
    if let Some(v) = file_cfg.jwt_secret {
        settings.jwt_secret = v;
    }
    if let Some(v) = file_cfg.max_message_bytes {
        settings.max_message_bytes = v;
    }
    if let Some(v) = file_cfg.rate_limit_per_second {
        settings.rate_limit_per_second = v;
    }
    Ok(())
}

fn apply_env(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("RELAY_BIND") {
        settings.bind_addr = v;
    }
    if let Some(v) = var("APP__BIND_ADDR") {
        settings.bind_addr = v;
    }

    if let Some(v) = var("RELAY_JWT_SECRET") {
        settings.jwt_secret = v;
    }
    if let Some(v) = var("APP__JWT_SECRET") {
        settings.jwt_secret = v;
    }

    if let Some(parsed) = var("APP__MAX_MESSAGE_BYTES").and_then(|v| v.parse::<usize>().ok()) {
        settings.max_message_bytes = parsed;
    }
    if let Some(parsed) = var("APP__RATE_LIMIT_PER_SECOND").and_then(|v| v.parse::<u32>().ok()) {
        settings.rate_limit_per_second = parsed;
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
