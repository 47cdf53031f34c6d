//! Shared type definitions for the database layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),
}

/// A row from the `users` table (the audience directory collaborator).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbUser {
    pub id: String,
    pub display_name: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: String,
    pub coach_id: Option<String>,
    pub created_at: String,
    pub verified_at: Option<String>,
    pub updated_at: String,
}

/// A row from `user_automation_state` — one state machine instance per
/// (rule, user) pair.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbAutomationState {
    pub rule_id: String,
    pub user_id: String,
    pub current_stage: i64,
    pub muted_until: Option<String>,
    pub last_message_at: Option<String>,
    pub last_alert_at: Option<String>,
    pub last_assist_at: Option<String>,
    pub updated_at: String,
}

/// A row from `automation_audit_log`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbAuditEntry {
    pub id: String,
    pub rule_id: String,
    pub user_id: String,
    pub action_kind: String,
    pub stage: i64,
    pub rendered_message: Option<String>,
    pub status: String,
    pub reason: Option<String>,
    pub channel_detail: Option<String>,
    pub created_at: String,
}

/// Parse a stored timestamp. Accepts RFC3339 (the engine's own writes) and
/// SQLite's `datetime('now')` format (rows seeded by the wider platform).
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}
