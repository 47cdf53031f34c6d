//! Signal Aggregator.
//!
//! A registry of named signal sources, each a function that answers one
//! question: "when did this user last do the thing?" Sources are queried
//! independently and only when enabled on the rule; the aggregate is the most
//! recent timestamp across all sources that returned one. A source failing or
//! returning nothing never blocks the others.

use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::db::{parse_timestamp, EngineDb};

/// Function signature for a signal source query.
pub type SignalQueryFn = fn(&EngineDb, &str) -> Result<Option<DateTime<Utc>>, String>;

/// A registered signal source.
pub struct SignalEntry {
    pub name: String,
    pub query: SignalQueryFn,
}

#[derive(Default)]
pub struct SignalRegistry {
    sources: Vec<SignalEntry>,
}

impl SignalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, query: SignalQueryFn) {
        self.sources.push(SignalEntry {
            name: name.to_string(),
            query,
        });
    }

    fn get(&self, name: &str) -> Option<&SignalEntry> {
        self.sources.iter().find(|s| s.name == name)
    }

    /// Most recent activity for a user across the enabled sources.
    ///
    /// Unknown source names and per-source errors are logged and treated as
    /// "no reading from that source". `None` means no enabled source ever saw
    /// this user — the caller classifies that as never active, not no-risk.
    pub fn last_activity(
        &self,
        db: &EngineDb,
        user_id: &str,
        enabled: &[String],
    ) -> Option<DateTime<Utc>> {
        let mut latest: Option<DateTime<Utc>> = None;
        for name in enabled {
            let Some(entry) = self.get(name) else {
                log::warn!("Unknown signal source '{}' enabled on a rule; ignoring", name);
                continue;
            };
            match (entry.query)(db, user_id) {
                Ok(Some(ts)) => {
                    if latest.map(|cur| ts > cur).unwrap_or(true) {
                        latest = Some(ts);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    log::warn!(
                        "Signal source '{}' failed for user {}: {}",
                        name,
                        user_id,
                        e
                    );
                }
            }
        }
        latest
    }
}

// ---------------------------------------------------------------------------
// Built-in sources
// ---------------------------------------------------------------------------

fn max_timestamp(
    db: &EngineDb,
    sql: &str,
    user_id: &str,
    source: &str,
) -> Result<Option<DateTime<Utc>>, String> {
    let raw: Option<String> = db
        .conn_ref()
        .query_row(sql, params![user_id], |row| row.get(0))
        .map_err(|e| format!("{} query failed: {}", source, e))?;
    Ok(raw.as_deref().and_then(parse_timestamp))
}

fn last_workout(db: &EngineDb, user_id: &str) -> Result<Option<DateTime<Utc>>, String> {
    max_timestamp(
        db,
        "SELECT MAX(logged_at) FROM workout_logs WHERE user_id = ?1",
        user_id,
        "workouts",
    )
}

fn last_meal_log(db: &EngineDb, user_id: &str) -> Result<Option<DateTime<Utc>>, String> {
    max_timestamp(
        db,
        "SELECT MAX(logged_at) FROM meal_logs WHERE user_id = ?1",
        user_id,
        "meals",
    )
}

fn last_inbound_message(db: &EngineDb, user_id: &str) -> Result<Option<DateTime<Utc>>, String> {
    max_timestamp(
        db,
        "SELECT MAX(sent_at) FROM messages WHERE sender_id = ?1",
        user_id,
        "messages",
    )
}

fn last_completed_session(db: &EngineDb, user_id: &str) -> Result<Option<DateTime<Utc>>, String> {
    max_timestamp(
        db,
        "SELECT MAX(completed_at) FROM completed_sessions WHERE user_id = ?1",
        user_id,
        "sessions",
    )
}

fn last_wearable_sync(db: &EngineDb, user_id: &str) -> Result<Option<DateTime<Utc>>, String> {
    max_timestamp(
        db,
        "SELECT MAX(synced_at) FROM wearable_syncs WHERE user_id = ?1",
        user_id,
        "wearables",
    )
}

/// Build the default registry with all five platform sources.
pub fn default_registry() -> SignalRegistry {
    let mut registry = SignalRegistry::new();
    registry.register("workouts", last_workout);
    registry.register("meals", last_meal_log);
    registry.register("messages", last_inbound_message);
    registry.register("sessions", last_completed_session);
    registry.register("wearables", last_wearable_sync);
    registry
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
