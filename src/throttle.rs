//! Cooldown/Cap Controller.
//!
//! Gates dispatch for a forward transition that is otherwise ready to fire.
//! Both checks read the audit log only; the stage the state machine already
//! persisted is never rolled back — state reflects reality, dispatch is
//! merely throttled.

use chrono::{DateTime, Utc};

use crate::db::{parse_timestamp, EngineDb};
use crate::rules::AutomationRule;

/// Outcome of the throttle check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    Proceed,
    /// A `sent` entry for this pair is newer than the rule's cooldown window.
    CooldownActive { days_since_last: f64 },
    /// Lifetime `sent` count has reached the rule's cap.
    CapReached { sent: i64 },
}

impl Verdict {
    /// Audit-log reason string for a veto; `None` for `Proceed`.
    pub fn skip_reason(&self) -> Option<&'static str> {
        match self {
            Verdict::Proceed => None,
            Verdict::CooldownActive { .. } => Some("cooldown active"),
            Verdict::CapReached { .. } => Some("max sends reached"),
        }
    }
}

/// Decide whether a forward transition's action actually dispatches.
pub fn check(
    db: &EngineDb,
    rule: &AutomationRule,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<Verdict, String> {
    if let Some(cooldown_days) = rule.cooldown_days {
        if let Some(last_iso) = db.last_sent_at(&rule.id, user_id)? {
            if let Some(last) = parse_timestamp(&last_iso) {
                let elapsed_days = (now - last).num_seconds() as f64 / 86_400.0;
                if elapsed_days < cooldown_days as f64 {
                    return Ok(Verdict::CooldownActive {
                        days_since_last: elapsed_days,
                    });
                }
            }
        }
    }

    if let Some(cap) = rule.max_sends_per_user {
        let sent = db.sent_count(&rule.id, user_id)?;
        if sent >= cap {
            return Ok(Verdict::CapReached { sent });
        }
    }

    Ok(Verdict::Proceed)
}
