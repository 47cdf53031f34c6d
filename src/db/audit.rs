//! Audit Log operations.
//!
//! Append-only: one row per attempted action, whether it was sent, skipped,
//! or failed. The log doubles as the compliance trail and as the sole source
//! of truth for cooldown and lifetime-cap checks — it is queried, never
//! mutated.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use super::{DbAuditEntry, EngineDb};

/// Fields for a new audit entry. `created_at` comes from the run context so
/// a whole pass shares one clock.
pub struct NewAuditEntry<'a> {
    pub rule_id: &'a str,
    pub user_id: &'a str,
    pub action_kind: &'a str,
    pub stage: i64,
    pub rendered_message: Option<&'a str>,
    pub status: &'a str,
    pub reason: Option<&'a str>,
    pub channel_detail: Option<&'a str>,
}

impl EngineDb {
    /// Append one audit entry. Returns the generated entry id.
    pub fn append_audit(
        &self,
        entry: &NewAuditEntry<'_>,
        now: DateTime<Utc>,
    ) -> Result<String, String> {
        let id = format!("aud-{}", Uuid::new_v4());
        self.conn_ref()
            .execute(
                "INSERT INTO automation_audit_log
                     (id, rule_id, user_id, action_kind, stage, rendered_message,
                      status, reason, channel_detail, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    id,
                    entry.rule_id,
                    entry.user_id,
                    entry.action_kind,
                    entry.stage,
                    entry.rendered_message,
                    entry.status,
                    entry.reason,
                    entry.channel_detail,
                    now.to_rfc3339(),
                ],
            )
            .map_err(|e| format!("Failed to append audit entry: {}", e))?;
        Ok(id)
    }

    /// Timestamp of the most recent `sent` entry for a (rule, user) pair.
    /// Feeds the cooldown check.
    pub fn last_sent_at(&self, rule_id: &str, user_id: &str) -> Result<Option<String>, String> {
        self.conn_ref()
            .query_row(
                "SELECT created_at FROM automation_audit_log
                 WHERE rule_id = ?1 AND user_id = ?2 AND status = 'sent'
                 ORDER BY created_at DESC
                 LIMIT 1",
                params![rule_id, user_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| format!("Failed to query last sent: {}", e))
    }

    /// Lifetime count of `sent` entries for a (rule, user) pair.
    /// Feeds the cap check.
    pub fn sent_count(&self, rule_id: &str, user_id: &str) -> Result<i64, String> {
        self.conn_ref()
            .query_row(
                "SELECT COUNT(*) FROM automation_audit_log
                 WHERE rule_id = ?1 AND user_id = ?2 AND status = 'sent'",
                params![rule_id, user_id],
                |row| row.get(0),
            )
            .map_err(|e| format!("Failed to count sent entries: {}", e))
    }

    /// All audit entries affecting one user, newest first, across rules.
    /// Backs the per-user history view in dashboards.
    pub fn audit_entries_for_user(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<DbAuditEntry>, String> {
        let mut stmt = self
            .conn_ref()
            .prepare(
                "SELECT id, rule_id, user_id, action_kind, stage, rendered_message,
                        status, reason, channel_detail, created_at
                 FROM automation_audit_log
                 WHERE user_id = ?1
                 ORDER BY created_at DESC
                 LIMIT ?2",
            )
            .map_err(|e| format!("Failed to prepare audit query: {}", e))?;
        let rows = stmt
            .query_map(params![user_id, limit as i64], |row| {
                Ok(DbAuditEntry {
                    id: row.get(0)?,
                    rule_id: row.get(1)?,
                    user_id: row.get(2)?,
                    action_kind: row.get(3)?,
                    stage: row.get(4)?,
                    rendered_message: row.get(5)?,
                    status: row.get(6)?,
                    reason: row.get(7)?,
                    channel_detail: row.get(8)?,
                    created_at: row.get(9)?,
                })
            })
            .map_err(|e| format!("Failed to query audit entries: {}", e))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| format!("Failed to read audit row: {}", e))?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use chrono::Duration;

    fn sent(rule: &'static str, user: &'static str) -> NewAuditEntry<'static> {
        NewAuditEntry {
            rule_id: rule,
            user_id: user,
            action_kind: "message",
            stage: 1,
            rendered_message: Some("Hey, we miss you"),
            status: "sent",
            reason: None,
            channel_detail: None,
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let db = test_db();
        let now = Utc::now();

        db.append_audit(&sent("r1", "u1"), now).expect("append");

        let entries = db.audit_entries_for_user("u1", 10).expect("query");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, "sent");
        assert_eq!(entries[0].rule_id, "r1");
    }

    #[test]
    fn test_last_sent_ignores_skipped() {
        let db = test_db();
        let earlier = Utc::now() - Duration::days(3);
        let later = Utc::now();

        db.append_audit(&sent("r1", "u1"), earlier).expect("append");
        db.append_audit(
            &NewAuditEntry {
                status: "skipped",
                reason: Some("cooldown active"),
                ..sent("r1", "u1")
            },
            later,
        )
        .expect("append skipped");

        let last = db.last_sent_at("r1", "u1").expect("query").expect("some");
        assert_eq!(last, earlier.to_rfc3339(), "skipped entries must not count");
    }

    #[test]
    fn test_sent_count_scoped_per_pair() {
        let db = test_db();
        let now = Utc::now();

        db.append_audit(&sent("r1", "u1"), now).expect("append");
        db.append_audit(&sent("r1", "u1"), now).expect("append");
        db.append_audit(&sent("r2", "u1"), now).expect("append");
        db.append_audit(&sent("r1", "u2"), now).expect("append");

        assert_eq!(db.sent_count("r1", "u1").expect("count"), 2);
        assert_eq!(db.sent_count("r2", "u1").expect("count"), 1);
        assert_eq!(db.sent_count("r2", "u2").expect("count"), 0);
    }

    #[test]
    fn test_entries_for_user_spans_rules() {
        let db = test_db();
        let now = Utc::now();

        db.append_audit(&sent("r1", "u1"), now - Duration::minutes(2))
            .expect("append");
        db.append_audit(&sent("r2", "u1"), now).expect("append");

        let entries = db.audit_entries_for_user("u1", 10).expect("query");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].rule_id, "r2", "newest first");
    }
}
