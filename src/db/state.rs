//! State Store operations: the persistent per-(rule, user) state machine rows.
//!
//! Rows are created lazily on first evaluation and never hard-deleted; a
//! disabled rule simply orphans its rows, keeping history for dashboards.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::{DbAutomationState, EngineDb};
use crate::rules::ActionKind;

impl EngineDb {
    /// Fetch the state row for a (rule, user) pair, if one exists yet.
    pub fn get_state(
        &self,
        rule_id: &str,
        user_id: &str,
    ) -> Result<Option<DbAutomationState>, String> {
        self.conn_ref()
            .query_row(
                "SELECT rule_id, user_id, current_stage, muted_until,
                        last_message_at, last_alert_at, last_assist_at, updated_at
                 FROM user_automation_state
                 WHERE rule_id = ?1 AND user_id = ?2",
                params![rule_id, user_id],
                |row| {
                    Ok(DbAutomationState {
                        rule_id: row.get(0)?,
                        user_id: row.get(1)?,
                        current_stage: row.get(2)?,
                        muted_until: row.get(3)?,
                        last_message_at: row.get(4)?,
                        last_alert_at: row.get(5)?,
                        last_assist_at: row.get(6)?,
                        updated_at: row.get(7)?,
                    })
                },
            )
            .optional()
            .map_err(|e| format!("Failed to read automation state: {}", e))
    }

    /// Persist a computed stage for a (rule, user) pair, creating the row
    /// lazily. This is the single write of the read-modify-write cycle; it
    /// never touches mute or last-fired columns.
    pub fn set_stage(
        &self,
        rule_id: &str,
        user_id: &str,
        stage: i64,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        self.conn_ref()
            .execute(
                "INSERT INTO user_automation_state (rule_id, user_id, current_stage, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(rule_id, user_id) DO UPDATE SET
                     current_stage = excluded.current_stage,
                     updated_at = excluded.updated_at",
                params![rule_id, user_id, stage, now.to_rfc3339()],
            )
            .map_err(|e| format!("Failed to persist stage: {}", e))?;
        Ok(())
    }

    /// Record that an action of the given kind fired for this pair.
    pub fn record_action_fired(
        &self,
        rule_id: &str,
        user_id: &str,
        kind: ActionKind,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        let column = match kind {
            ActionKind::Message => "last_message_at",
            ActionKind::Alert => "last_alert_at",
            ActionKind::Assist => "last_assist_at",
        };
        let now_iso = now.to_rfc3339();
        self.conn_ref()
            .execute(
                &format!(
                    "INSERT INTO user_automation_state (rule_id, user_id, {col}, updated_at)
                     VALUES (?1, ?2, ?3, ?3)
                     ON CONFLICT(rule_id, user_id) DO UPDATE SET
                         {col} = excluded.{col},
                         updated_at = excluded.updated_at",
                    col = column
                ),
                params![rule_id, user_id, now_iso],
            )
            .map_err(|e| format!("Failed to record fired action: {}", e))?;
        Ok(())
    }

    /// Manual coach override: suppress all evaluation for this pair until the
    /// given time. `None` clears the mute.
    pub fn set_mute(
        &self,
        rule_id: &str,
        user_id: &str,
        until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        self.conn_ref()
            .execute(
                "INSERT INTO user_automation_state (rule_id, user_id, muted_until, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(rule_id, user_id) DO UPDATE SET
                     muted_until = excluded.muted_until,
                     updated_at = excluded.updated_at",
                params![
                    rule_id,
                    user_id,
                    until.map(|u| u.to_rfc3339()),
                    now.to_rfc3339()
                ],
            )
            .map_err(|e| format!("Failed to set mute: {}", e))?;
        Ok(())
    }

    /// Per-rule count of users currently above stage 0. Backs the
    /// "clients at risk" dashboard query and the `status` subcommand.
    pub fn at_risk_counts(&self) -> Result<Vec<(String, i64)>, String> {
        let mut stmt = self
            .conn_ref()
            .prepare(
                "SELECT rule_id, COUNT(*)
                 FROM user_automation_state
                 WHERE current_stage > 0
                 GROUP BY rule_id
                 ORDER BY rule_id",
            )
            .map_err(|e| format!("Failed to prepare at-risk query: {}", e))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(|e| format!("Failed to query at-risk counts: {}", e))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| format!("Failed to read at-risk row: {}", e))?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use crate::db::test_utils::test_db;
    use crate::rules::ActionKind;
    use chrono::{Duration, Utc};

    #[test]
    fn test_state_created_lazily() {
        let db = test_db();
        assert!(db.get_state("r1", "u1").expect("read").is_none());

        db.set_stage("r1", "u1", 2, Utc::now()).expect("write");
        let state = db.get_state("r1", "u1").expect("read").expect("row");
        assert_eq!(state.current_stage, 2);
        assert!(state.muted_until.is_none());
    }

    #[test]
    fn test_set_stage_preserves_other_columns() {
        let db = test_db();
        let now = Utc::now();

        db.set_mute("r1", "u1", Some(now + Duration::days(7)), now)
            .expect("mute");
        db.record_action_fired("r1", "u1", ActionKind::Message, now)
            .expect("fired");
        db.set_stage("r1", "u1", 3, now).expect("stage");

        let state = db.get_state("r1", "u1").expect("read").expect("row");
        assert_eq!(state.current_stage, 3);
        assert!(state.muted_until.is_some(), "stage write must not clear mute");
        assert!(
            state.last_message_at.is_some(),
            "stage write must not clear last-fired"
        );
    }

    #[test]
    fn test_record_action_fired_per_kind() {
        let db = test_db();
        let now = Utc::now();

        db.record_action_fired("r1", "u1", ActionKind::Alert, now)
            .expect("fired");
        let state = db.get_state("r1", "u1").expect("read").expect("row");
        assert!(state.last_alert_at.is_some());
        assert!(state.last_message_at.is_none());
        assert!(state.last_assist_at.is_none());
    }

    #[test]
    fn test_unmute_clears() {
        let db = test_db();
        let now = Utc::now();

        db.set_mute("r1", "u1", Some(now + Duration::days(1)), now)
            .expect("mute");
        db.set_mute("r1", "u1", None, now).expect("unmute");

        let state = db.get_state("r1", "u1").expect("read").expect("row");
        assert!(state.muted_until.is_none());
    }

    #[test]
    fn test_at_risk_counts() {
        let db = test_db();
        let now = Utc::now();

        db.set_stage("r1", "u1", 1, now).expect("write");
        db.set_stage("r1", "u2", 3, now).expect("write");
        db.set_stage("r1", "u3", 0, now).expect("write");
        db.set_stage("r2", "u1", 2, now).expect("write");

        let counts = db.at_risk_counts().expect("counts");
        assert_eq!(counts, vec![("r1".to_string(), 2), ("r2".to_string(), 1)]);
    }

    #[test]
    fn test_state_tracked_per_rule() {
        let db = test_db();
        let now = Utc::now();

        db.set_stage("r1", "u1", 2, now).expect("write");
        db.set_stage("r2", "u1", 1, now).expect("write");

        assert_eq!(
            db.get_state("r1", "u1").unwrap().unwrap().current_stage,
            2
        );
        assert_eq!(
            db.get_state("r2", "u1").unwrap().unwrap().current_stage,
            1
        );
    }
}
