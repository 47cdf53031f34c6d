//! Engine configuration stored in `~/.reengage/config.json`.
//!
//! A missing file is not an error: every field has a usable default, so a
//! fresh install runs with the built-in hourly schedule and no push gateway.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[serde(default)]
    pub schedule: ScheduleEntry,
    /// Endpoint for outbound push delivery. `None` disables the push channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_gateway_url: Option<String>,
    /// Override for the database location; defaults to `~/.reengage/reengage.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            schedule: ScheduleEntry::default(),
            push_gateway_url: None,
            db_path: None,
        }
    }
}

/// When the periodic evaluation pass runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_cron")]
    pub cron: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for ScheduleEntry {
    fn default() -> Self {
        Self {
            enabled: true,
            cron: default_cron(),
            timezone: default_timezone(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// Top of every hour.
fn default_cron() -> String {
    "0 * * * *".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn config_path() -> Result<PathBuf, EngineError> {
    let home = dirs::home_dir()
        .ok_or_else(|| EngineError::Configuration("Could not determine home directory".into()))?;
    Ok(home.join(".reengage").join("config.json"))
}

/// Load the engine configuration, falling back to defaults when the file
/// does not exist. A file that exists but fails to parse is an error: a
/// half-read config silently dropping the schedule would be worse.
pub fn load_config() -> Result<EngineConfig, EngineError> {
    let path = config_path()?;
    if !path.exists() {
        log::info!("No config at {}, using defaults", path.display());
        return Ok(EngineConfig::default());
    }
    let content = fs::read_to_string(&path)
        .map_err(|e| EngineError::Configuration(format!("Failed to read config: {}", e)))?;
    serde_json::from_str(&content)
        .map_err(|e| EngineError::Configuration(format!("Failed to parse config: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_fields_absent() {
        let config: EngineConfig = serde_json::from_str("{}").expect("parse");
        assert!(config.schedule.enabled);
        assert_eq!(config.schedule.cron, "0 * * * *");
        assert_eq!(config.schedule.timezone, "UTC");
        assert!(config.push_gateway_url.is_none());
        assert!(config.db_path.is_none());
    }

    #[test]
    fn test_parses_full_config() {
        let json = r#"{
            "schedule": {"enabled": false, "cron": "*/30 * * * *", "timezone": "America/New_York"},
            "pushGatewayUrl": "https://push.example.com/send",
            "dbPath": "/var/lib/reengage/engine.db"
        }"#;
        let config: EngineConfig = serde_json::from_str(json).expect("parse");
        assert!(!config.schedule.enabled);
        assert_eq!(config.schedule.cron, "*/30 * * * *");
        assert_eq!(
            config.push_gateway_url.as_deref(),
            Some("https://push.example.com/send")
        );
        assert_eq!(config.db_path.as_deref(), Some("/var/lib/reengage/engine.db"));
    }

    #[test]
    fn test_partial_schedule_fills_defaults() {
        let json = r#"{"schedule": {"cron": "0 9 * * 1-5"}}"#;
        let config: EngineConfig = serde_json::from_str(json).expect("parse");
        assert!(config.schedule.enabled);
        assert_eq!(config.schedule.cron, "0 9 * * 1-5");
        assert_eq!(config.schedule.timezone, "UTC");
    }

    #[test]
    fn test_rejects_malformed_json() {
        let result: Result<EngineConfig, _> = serde_json::from_str("{not json");
        assert!(result.is_err());
    }
}
