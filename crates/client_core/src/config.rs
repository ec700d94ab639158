use std::{fs, time::Duration};

use anyhow::Context;
use serde::Deserialize;

use crate::session::DEFAULT_RETIRED_SESSION_CAPACITY;

pub const CALL_SETTINGS_FILE: &str = "call.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSettings {
    pub relay_url: String,
    pub ring_timeout: Duration,
    pub negotiation_timeout: Duration,
    pub reconnect_delay: Duration,
    pub retired_session_capacity: usize,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            relay_url: "http://127.0.0.1:8443".into(),
            ring_timeout: Duration::from_secs(30),
            negotiation_timeout: Duration::from_secs(20),
            reconnect_delay: Duration::from_secs(2),
            retired_session_capacity: DEFAULT_RETIRED_SESSION_CAPACITY,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    relay_url: Option<String>,
    ring_timeout_secs: Option<u64>,
    negotiation_timeout_secs: Option<u64>,
    reconnect_delay_ms: Option<u64>,
    retired_session_capacity: Option<usize>,
}

/// Defaults, then `call.toml` from the working directory, then environment.
pub fn load_call_settings() -> anyhow::Result<CallSettings> {
    let mut settings = CallSettings::default();

    if let Ok(raw) = fs::read_to_string(CALL_SETTINGS_FILE) {
        apply_file(&mut settings, &raw)
            .with_context(|| format!("failed to parse {CALL_SETTINGS_FILE}"))?;
    }
    apply_env(&mut settings, |key| std::env::var(key).ok());

    Ok(settings)
}

fn apply_file(settings: &mut CallSettings, raw: &str) -> anyhow::Result<()> {
    let file_cfg: FileSettings = toml::from_str(raw)?;
    if let Some(v) = file_cfg.relay_url {
        settings.relay_url = v;
    }
    if let Some(v) = file_cfg.ring_timeout_secs {
        settings.ring_timeout = Duration::from_secs(v);
    }
    if let Some(v) = file_cfg.negotiation_timeout_secs {
        settings.negotiation_timeout = Duration::from_secs(v);
    }
    if let Some(v) = file_cfg.reconnect_delay_ms {
        settings.reconnect_delay = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.retired_session_capacity {
        settings.retired_session_capacity = v;
    }
    Ok(())
}

fn apply_env(settings: &mut CallSettings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("CALL_RELAY_URL") {
        settings.relay_url = v;
    }
    if let Some(secs) = var("CALL_RING_TIMEOUT_SECS").and_then(|v| v.parse::<u64>().ok()) {
        settings.ring_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = var("CALL_NEGOTIATION_TIMEOUT_SECS").and_then(|v| v.parse::<u64>().ok()) {
        settings.negotiation_timeout = Duration::from_secs(secs);
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
