use std::{collections::HashMap, fs, time::Duration};

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// HTTP base the REST API lives under; the websocket endpoint is derived
    /// from it by scheme substitution.
    pub endpoint_base: String,
    pub heartbeat_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    /// Capacity of the inbound event fan-out channel.
    pub event_buffer: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            endpoint_base: "http://127.0.0.1:8443".into(),
            heartbeat_interval_ms: 25_000,
            reconnect_delay_ms: 3_000,
            event_buffer: 1024,
        }
    }
}

impl Settings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("client.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            if let Some(v) = file_cfg.get("endpoint_base").and_then(|v| v.as_str()) {
                settings.endpoint_base = v.to_string();
            }
            if let Some(v) = file_cfg
                .get("heartbeat_interval_ms")
                .and_then(|v| v.as_integer())
            {
                settings.heartbeat_interval_ms = v as u64;
            }
            if let Some(v) = file_cfg
                .get("reconnect_delay_ms")
                .and_then(|v| v.as_integer())
            {
                settings.reconnect_delay_ms = v as u64;
            }
        }
    }

    if let Ok(v) = std::env::var("APP__ENDPOINT_BASE") {
        settings.endpoint_base = v;
    }
    if let Ok(v) = std::env::var("APP__HEARTBEAT_INTERVAL_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.heartbeat_interval_ms = parsed;
        }
    }
    if let Ok(v) = std::env::var("APP__RECONNECT_DELAY_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.reconnect_delay_ms = parsed;
        }
    }

    settings
}
