//! Audience Resolver: trigger-specific candidate queries against the user
//! directory.
//!
//! Each `TriggerKind` variant defines its own query; scope and role filters
//! are applied uniformly. Resolution is a pure read — it is always safe to
//! consume only part of the candidate set (e.g. when a pass is cut short).

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params_from_iter, OptionalExtension};

use crate::db::{DbUser, EngineDb};
use crate::error::EngineError;
use crate::rules::{AutomationRule, RuleScope, TriggerKind};

/// A candidate (tenant, user) pair produced by resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub user_id: String,
    pub coach_id: Option<String>,
}

/// Resolve the candidate set for one rule. Deduplicated by user id.
pub fn resolve(
    db: &EngineDb,
    rule: &AutomationRule,
    now: DateTime<Utc>,
) -> Result<Vec<Candidate>, EngineError> {
    let mut sql = String::from("SELECT id, coach_id FROM users WHERE ");
    let mut args: Vec<String> = Vec::new();

    match &rule.trigger {
        TriggerKind::Inactivity { min_days } => {
            // Coarse heuristic only; the Signal Aggregator refines per user.
            sql.push_str("updated_at <= ?1");
            args.push((now - Duration::days(*min_days)).to_rfc3339());
        }
        TriggerKind::RecentSignup { lookback_days } => {
            sql.push_str("created_at >= ?1");
            args.push((now - Duration::days(*lookback_days)).to_rfc3339());
        }
        TriggerKind::VerificationCompleted { lookback_days } => {
            sql.push_str("verified_at IS NOT NULL AND verified_at >= ?1");
            args.push((now - Duration::days(*lookback_days)).to_rfc3339());
        }
    }

    if rule.scope == RuleScope::Coach {
        let owner = rule
            .owner_id
            .as_ref()
            .ok_or_else(|| EngineError::RuleConfig {
                rule_id: rule.id.clone(),
                message: "coach-scoped rule has no owner".to_string(),
            })?;
        args.push(owner.clone());
        sql.push_str(&format!(" AND coach_id = ?{}", args.len()));
    }

    if !rule.audience_roles.is_empty() {
        let placeholders: Vec<String> = rule
            .audience_roles
            .iter()
            .map(|role| {
                args.push(role.clone());
                format!("?{}", args.len())
            })
            .collect();
        sql.push_str(&format!(" AND role IN ({})", placeholders.join(", ")));
    }

    sql.push_str(" ORDER BY id");

    let mut stmt = db
        .conn_ref()
        .prepare(&sql)
        .map_err(|e| EngineError::Audience {
            rule_id: rule.id.clone(),
            message: e.to_string(),
        })?;

    let rows = stmt
        .query_map(params_from_iter(args.iter()), |row| {
            Ok(Candidate {
                user_id: row.get(0)?,
                coach_id: row.get(1)?,
            })
        })
        .map_err(|e| EngineError::Audience {
            rule_id: rule.id.clone(),
            message: e.to_string(),
        })?;

    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    for row in rows {
        let candidate = row.map_err(|e| EngineError::Audience {
            rule_id: rule.id.clone(),
            message: e.to_string(),
        })?;
        if seen.insert(candidate.user_id.clone()) {
            candidates.push(candidate);
        }
    }
    Ok(candidates)
}

/// Fetch a user's display attributes for templating.
pub fn fetch_profile(db: &EngineDb, user_id: &str) -> Result<Option<DbUser>, String> {
    db.conn_ref()
        .query_row(
            "SELECT id, display_name, first_name, last_name, role, coach_id,
                    created_at, verified_at, updated_at
             FROM users WHERE id = ?1",
            [user_id],
            |row| {
                Ok(DbUser {
                    id: row.get(0)?,
                    display_name: row.get(1)?,
                    first_name: row.get(2)?,
                    last_name: row.get(3)?,
                    role: row.get(4)?,
                    coach_id: row.get(5)?,
                    created_at: row.get(6)?,
                    verified_at: row.get(7)?,
                    updated_at: row.get(8)?,
                })
            },
        )
        .optional()
        .map_err(|e| format!("Failed to fetch user profile: {}", e))
}

/// Ids of every platform admin; platform-scoped alerts fan out to these.
pub fn admin_ids(db: &EngineDb) -> Result<Vec<String>, String> {
    let mut stmt = db
        .conn_ref()
        .prepare("SELECT id FROM users WHERE role = 'admin' ORDER BY id")
        .map_err(|e| format!("Failed to prepare admin query: {}", e))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| format!("Failed to query admins: {}", e))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| format!("Failed to read admin row: {}", e))?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::{backdate_user, seed_user, test_db};
    use crate::rules::test_utils::sample_rule;
    use rusqlite::params;

    #[test]
    fn test_inactivity_uses_coarse_heuristic() {
        let db = test_db();
        seed_user(&db, "stale", "client", None);
        backdate_user(&db, "stale", 10);
        seed_user(&db, "fresh", "client", None);

        let rule = sample_rule("r1"); // inactivity, min_days 3
        let candidates = resolve(&db, &rule, Utc::now()).expect("resolve");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].user_id, "stale");
    }

    #[test]
    fn test_coach_scope_restricts_to_owned_clients() {
        let db = test_db();
        seed_user(&db, "mine", "client", Some("coach-1"));
        backdate_user(&db, "mine", 10);
        seed_user(&db, "theirs", "client", Some("coach-2"));
        backdate_user(&db, "theirs", 10);

        let mut rule = sample_rule("r1");
        rule.scope = RuleScope::Coach;
        rule.owner_id = Some("coach-1".to_string());

        let candidates = resolve(&db, &rule, Utc::now()).expect("resolve");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].user_id, "mine");
        assert_eq!(candidates[0].coach_id.as_deref(), Some("coach-1"));
    }

    #[test]
    fn test_role_filter() {
        let db = test_db();
        seed_user(&db, "client-1", "client", None);
        backdate_user(&db, "client-1", 10);
        seed_user(&db, "coach-1", "coach", None);
        backdate_user(&db, "coach-1", 10);

        let mut rule = sample_rule("r1");
        rule.audience_roles = vec!["client".to_string()];

        let candidates = resolve(&db, &rule, Utc::now()).expect("resolve");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].user_id, "client-1");
    }

    #[test]
    fn test_recent_signup_window() {
        let db = test_db();
        seed_user(&db, "new", "client", None);
        seed_user(&db, "old", "client", None);
        backdate_user(&db, "old", 30);

        let mut rule = sample_rule("r1");
        rule.trigger = TriggerKind::RecentSignup { lookback_days: 7 };

        let candidates = resolve(&db, &rule, Utc::now()).expect("resolve");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].user_id, "new");
    }

    #[test]
    fn test_verification_completed_requires_verified_at() {
        let db = test_db();
        seed_user(&db, "verified", "client", None);
        db.conn_ref()
            .execute(
                "UPDATE users SET verified_at = ?1 WHERE id = 'verified'",
                params![Utc::now().to_rfc3339()],
            )
            .unwrap();
        seed_user(&db, "unverified", "client", None);

        let mut rule = sample_rule("r1");
        rule.trigger = TriggerKind::VerificationCompleted { lookback_days: 2 };

        let candidates = resolve(&db, &rule, Utc::now()).expect("resolve");
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].user_id, "verified");
    }

    #[test]
    fn test_fetch_profile_missing_user() {
        let db = test_db();
        assert!(fetch_profile(&db, "nobody").expect("query").is_none());
    }

    #[test]
    fn test_admin_ids() {
        let db = test_db();
        seed_user(&db, "admin-1", "admin", None);
        seed_user(&db, "client-1", "client", None);

        let admins = admin_ids(&db).expect("query");
        assert_eq!(admins, vec!["admin-1".to_string()]);
    }
}
