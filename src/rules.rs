//! Rule Store: typed automation rule model, loading, and validation.
//!
//! Rule configuration is stored as JSON columns but parsed into closed,
//! validated structs at load time. A malformed rule is quarantined (logged
//! and skipped) before the batch starts, so a bad config can never fail
//! mid-pass.

use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::db::EngineDb;
use crate::error::EngineError;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    /// Owned by a single coach; audience restricted to that coach's clients.
    Coach,
    /// Platform-wide; audience spans all tenants.
    Platform,
}

/// The closed set of actions a stage can bind to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Auto-message the user directly.
    Message,
    /// Alert the rule owner (or platform admins) only; no user-facing message.
    Alert,
    /// Flag for assisted, manual follow-up by the owner.
    Assist,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Message => "message",
            ActionKind::Alert => "alert",
            ActionKind::Assist => "assist",
        }
    }
}

/// Delivery channels a rule may target. In-app is the primary channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    InApp,
    Push,
    Email,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::InApp => "in_app",
            Channel::Push => "push",
            Channel::Email => "email",
        }
    }
}

/// Trigger variants. Each defines its own audience query; adding a trigger
/// type means adding a variant here and an arm in `audience::resolve`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerKind {
    /// Users whose coarse last-update heuristic is at least `min_days` old.
    Inactivity { min_days: i64 },
    /// Users created within the last `lookback_days`.
    RecentSignup { lookback_days: i64 },
    /// Users whose verification completed within the last `lookback_days`.
    VerificationCompleted { lookback_days: i64 },
}

#[derive(Debug, Deserialize)]
struct InactivityConfig {
    min_days: i64,
}

#[derive(Debug, Deserialize)]
struct LookbackConfig {
    lookback_days: i64,
}

impl TriggerKind {
    /// Parse the `trigger_type` discriminator plus its JSON config column.
    pub fn parse(trigger_type: &str, config_json: &str) -> Result<Self, String> {
        match trigger_type {
            "inactivity" => {
                let cfg: InactivityConfig = serde_json::from_str(config_json)
                    .map_err(|e| format!("bad inactivity config: {}", e))?;
                if cfg.min_days < 1 {
                    return Err("inactivity min_days must be >= 1".to_string());
                }
                Ok(TriggerKind::Inactivity {
                    min_days: cfg.min_days,
                })
            }
            "recent_signup" => {
                let cfg: LookbackConfig = serde_json::from_str(config_json)
                    .map_err(|e| format!("bad recent_signup config: {}", e))?;
                if cfg.lookback_days < 1 {
                    return Err("recent_signup lookback_days must be >= 1".to_string());
                }
                Ok(TriggerKind::RecentSignup {
                    lookback_days: cfg.lookback_days,
                })
            }
            "verification_completed" => {
                let cfg: LookbackConfig = serde_json::from_str(config_json)
                    .map_err(|e| format!("bad verification_completed config: {}", e))?;
                if cfg.lookback_days < 1 {
                    return Err("verification_completed lookback_days must be >= 1".to_string());
                }
                Ok(TriggerKind::VerificationCompleted {
                    lookback_days: cfg.lookback_days,
                })
            }
            other => Err(format!("unknown trigger type '{}'", other)),
        }
    }
}

/// One severity stage. Stage 0 (baseline, no action) is implicit and never
/// appears in this list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDef {
    pub threshold_days: i64,
    pub action: ActionKind,
    #[serde(default)]
    pub tone: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AudienceFilters {
    #[serde(default)]
    roles: Vec<String>,
}

/// A fully parsed, validated automation rule.
#[derive(Debug, Clone)]
pub struct AutomationRule {
    pub id: String,
    pub scope: RuleScope,
    pub owner_id: Option<String>,
    pub priority: i64,
    pub trigger: TriggerKind,
    pub audience_roles: Vec<String>,
    pub signals_enabled: Vec<String>,
    pub stages: Vec<StageDef>,
    pub channels: Vec<Channel>,
    pub cooldown_days: Option<i64>,
    pub max_sends_per_user: Option<i64>,
}

impl AutomationRule {
    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<(), String> {
        if self.stages.is_empty() {
            return Err("rule has no stages".to_string());
        }
        let mut prev = 0i64;
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.threshold_days <= prev {
                return Err(format!(
                    "stage {} threshold {}d is not strictly increasing (previous {}d)",
                    i + 1,
                    stage.threshold_days,
                    prev
                ));
            }
            prev = stage.threshold_days;
        }
        if self.scope == RuleScope::Coach && self.owner_id.is_none() {
            return Err("coach-scoped rule has no owner".to_string());
        }
        if let Some(cd) = self.cooldown_days {
            if cd < 1 {
                return Err("cooldown_days must be >= 1 when set".to_string());
            }
        }
        if let Some(cap) = self.max_sends_per_user {
            if cap < 1 {
                return Err("max_sends_per_user must be >= 1 when set".to_string());
            }
        }
        if self.channels.is_empty() {
            return Err("rule has no delivery channels".to_string());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

struct RawRuleRow {
    id: String,
    scope: String,
    owner_id: Option<String>,
    priority: i64,
    trigger_type: String,
    trigger_config: String,
    audience_filters: Option<String>,
    signals_enabled: String,
    stages: String,
    channels: String,
    cooldown_days: Option<i64>,
    max_sends_per_user: Option<i64>,
}

fn parse_rule(raw: RawRuleRow) -> Result<AutomationRule, String> {
    let scope = match raw.scope.as_str() {
        "coach" => RuleScope::Coach,
        "platform" => RuleScope::Platform,
        other => return Err(format!("unknown scope '{}'", other)),
    };
    let trigger = TriggerKind::parse(&raw.trigger_type, &raw.trigger_config)?;
    let filters: AudienceFilters = match raw.audience_filters.as_deref() {
        Some(json) if !json.trim().is_empty() => {
            serde_json::from_str(json).map_err(|e| format!("bad audience filters: {}", e))?
        }
        _ => AudienceFilters::default(),
    };
    let signals_enabled: Vec<String> = serde_json::from_str(&raw.signals_enabled)
        .map_err(|e| format!("bad signals_enabled: {}", e))?;
    let stages: Vec<StageDef> =
        serde_json::from_str(&raw.stages).map_err(|e| format!("bad stages: {}", e))?;
    let channels: Vec<Channel> =
        serde_json::from_str(&raw.channels).map_err(|e| format!("bad channels: {}", e))?;

    let rule = AutomationRule {
        id: raw.id,
        scope,
        owner_id: raw.owner_id,
        priority: raw.priority,
        trigger,
        audience_roles: filters.roles,
        signals_enabled,
        stages,
        channels,
        cooldown_days: raw.cooldown_days,
        max_sends_per_user: raw.max_sends_per_user,
    };
    rule.validate()?;
    Ok(rule)
}

/// Load all enabled rules ordered by priority (higher first).
///
/// A row that fails to parse or validate is quarantined: logged with its
/// reason and excluded from the returned set. Only the query itself failing
/// is fatal to the pass.
pub fn load_enabled_rules(db: &EngineDb) -> Result<Vec<AutomationRule>, EngineError> {
    let mut stmt = db
        .conn_ref()
        .prepare(
            "SELECT id, scope, owner_id, priority, trigger_type, trigger_config,
                    audience_filters, signals_enabled, stages, channels,
                    cooldown_days, max_sends_per_user
             FROM automation_rules
             WHERE enabled = 1
             ORDER BY priority DESC, id ASC",
        )
        .map_err(|e| EngineError::RuleSetUnavailable(e.to_string()))?;

    let rows = stmt
        .query_map(params![], |row| {
            Ok(RawRuleRow {
                id: row.get(0)?,
                scope: row.get(1)?,
                owner_id: row.get(2)?,
                priority: row.get(3)?,
                trigger_type: row.get(4)?,
                trigger_config: row.get(5)?,
                audience_filters: row.get(6)?,
                signals_enabled: row.get(7)?,
                stages: row.get(8)?,
                channels: row.get(9)?,
                cooldown_days: row.get(10)?,
                max_sends_per_user: row.get(11)?,
            })
        })
        .map_err(|e| EngineError::RuleSetUnavailable(e.to_string()))?;

    let mut rules = Vec::new();
    for row in rows {
        let raw = row.map_err(|e| EngineError::RuleSetUnavailable(e.to_string()))?;
        let id = raw.id.clone();
        match parse_rule(raw) {
            Ok(rule) => rules.push(rule),
            Err(reason) => {
                log::warn!("Quarantined rule {}: {}", id, reason);
            }
        }
    }
    Ok(rules)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::test_utils::{insert_rule_row, sample_rule};
    use super::*;
    use crate::db::test_utils::test_db;

    const STAGES: &str = r#"[
        {"threshold_days": 3, "action": "message", "tone": "supportive"},
        {"threshold_days": 7, "action": "alert"},
        {"threshold_days": 14, "action": "alert"}
    ]"#;

    #[test]
    fn test_trigger_parse_inactivity() {
        let trigger = TriggerKind::parse("inactivity", r#"{"min_days": 5}"#).expect("parse");
        assert_eq!(trigger, TriggerKind::Inactivity { min_days: 5 });
    }

    #[test]
    fn test_trigger_parse_unknown_type() {
        let result = TriggerKind::parse("full_moon", "{}");
        assert!(result.is_err());
    }

    #[test]
    fn test_trigger_rejects_zero_days() {
        assert!(TriggerKind::parse("inactivity", r#"{"min_days": 0}"#).is_err());
    }

    #[test]
    fn test_validate_thresholds_strictly_increasing() {
        let mut rule = sample_rule("r1");
        rule.stages[1].threshold_days = 3; // equal to stage 1
        assert!(rule.validate().is_err());

        rule.stages[1].threshold_days = 2; // decreasing
        assert!(rule.validate().is_err());

        rule.stages[1].threshold_days = 7;
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn test_validate_coach_rule_needs_owner() {
        let mut rule = sample_rule("r1");
        rule.scope = RuleScope::Coach;
        assert!(rule.validate().is_err());

        rule.owner_id = Some("coach-1".to_string());
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn test_validate_no_stages() {
        let mut rule = sample_rule("r1");
        rule.stages.clear();
        assert!(rule.validate().is_err());
    }

    #[test]
    fn test_load_orders_by_priority() {
        let db = test_db();
        insert_rule_row(
            &db, "low", "platform", None, "inactivity", r#"{"min_days": 3}"#, STAGES, None, None,
        );
        db.conn_ref()
            .execute("UPDATE automation_rules SET priority = 10 WHERE id = 'low'", [])
            .unwrap();
        insert_rule_row(
            &db, "high", "platform", None, "inactivity", r#"{"min_days": 3}"#, STAGES, None, None,
        );
        db.conn_ref()
            .execute("UPDATE automation_rules SET priority = 20 WHERE id = 'high'", [])
            .unwrap();

        let rules = load_enabled_rules(&db).expect("load");
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].id, "high");
        assert_eq!(rules[1].id, "low");
    }

    #[test]
    fn test_load_skips_disabled() {
        let db = test_db();
        insert_rule_row(
            &db, "r1", "platform", None, "inactivity", r#"{"min_days": 3}"#, STAGES, None, None,
        );
        db.conn_ref()
            .execute("UPDATE automation_rules SET enabled = 0 WHERE id = 'r1'", [])
            .unwrap();

        let rules = load_enabled_rules(&db).expect("load");
        assert!(rules.is_empty());
    }

    #[test]
    fn test_load_quarantines_malformed() {
        let db = test_db();
        insert_rule_row(
            &db, "good", "platform", None, "inactivity", r#"{"min_days": 3}"#, STAGES, None, None,
        );
        // Thresholds out of order
        insert_rule_row(
            &db,
            "bad-order",
            "platform",
            None,
            "inactivity",
            r#"{"min_days": 3}"#,
            r#"[{"threshold_days": 7, "action": "alert"}, {"threshold_days": 3, "action": "alert"}]"#,
            None,
            None,
        );
        // Unparseable trigger config
        insert_rule_row(
            &db, "bad-json", "platform", None, "inactivity", "not json", STAGES, None, None,
        );
        // Unknown trigger type
        insert_rule_row(
            &db, "bad-trigger", "platform", None, "full_moon", "{}", STAGES, None, None,
        );

        let rules = load_enabled_rules(&db).expect("load");
        assert_eq!(rules.len(), 1, "malformed rules must be quarantined");
        assert_eq!(rules[0].id, "good");
    }

    #[test]
    fn test_stage_json_roundtrip() {
        let stages: Vec<StageDef> = serde_json::from_str(STAGES).expect("parse");
        assert_eq!(stages.len(), 3);
        assert_eq!(stages[0].action, ActionKind::Message);
        assert_eq!(stages[0].tone.as_deref(), Some("supportive"));
        assert!(stages[1].tone.is_none());
    }
}
