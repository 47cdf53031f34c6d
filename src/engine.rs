//! Evaluation pass orchestration.
//!
//! One pass: load enabled rules by priority, resolve each rule's audience,
//! aggregate signals per candidate, advance the per-(rule, user) state
//! machine, and dispatch throttled interventions. Rules are isolated from
//! each other and users from each other: a failure never bubbles past the
//! unit that raised it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::audience::{self, Candidate};
use crate::db::audit::NewAuditEntry;
use crate::db::EngineDb;
use crate::dispatch::{aggregate_ok, channel_detail_json, ChannelOutcome, Dispatcher};
use crate::error::EngineError;
use crate::rules::{self, ActionKind, AutomationRule, RuleScope, StageDef};
use crate::signals::SignalRegistry;
use crate::stage::{classify, decide, Elapsed, Transition};
use crate::template::{template_for_stage, MessageRenderer, PlaceholderContext};
use crate::throttle;

/// Everything an evaluation pass needs besides the database. Explicit and
/// passed through every component — no process-wide mutable state.
pub struct RunContext<'a> {
    pub now: DateTime<Utc>,
    pub run_id: String,
    pub registry: &'a SignalRegistry,
    pub renderer: &'a dyn MessageRenderer,
    pub dispatcher: Dispatcher<'a>,
}

impl<'a> RunContext<'a> {
    pub fn new(
        registry: &'a SignalRegistry,
        renderer: &'a dyn MessageRenderer,
        dispatcher: Dispatcher<'a>,
    ) -> Self {
        Self {
            now: Utc::now(),
            run_id: format!("run-{}", Uuid::new_v4()),
            registry,
            renderer,
            dispatcher,
        }
    }
}

/// Counters returned by one pass, for logs and observability dashboards.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub processed: usize,
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "processed={} sent={} skipped={} failed={}",
            self.processed, self.sent, self.skipped, self.failed
        )
    }
}

/// Outcome of evaluating one (rule, user) pair.
enum UserOutcome {
    /// Mute bypass — nothing evaluated, nothing written.
    Muted,
    /// Stage unchanged — silent no-op.
    NoChange,
    /// Stage reset to 0 after renewed activity; no dispatch.
    Recovered,
    /// Forward transition dispatched and audited as `sent`.
    Sent,
    /// Forward transition vetoed by cooldown or cap; audited as `skipped`.
    Throttled,
    /// Dispatch attempted but failed; audited as `failed`.
    DispatchFailed,
    /// Classifier produced an undefined decrease; logged, not applied.
    DataError,
}

/// Releases the advisory run lock when the pass ends, however it ends.
struct RunLockGuard<'a> {
    db: &'a EngineDb,
    holder: String,
}

impl Drop for RunLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.db.release_run_lock(&self.holder) {
            log::warn!("Failed to release run lock: {}", e);
        }
    }
}

/// Run one evaluation pass. Idempotent: a second pass over unchanged data
/// produces no new dispatches.
pub fn run_pass(db: &EngineDb, ctx: &RunContext<'_>) -> Result<RunSummary, EngineError> {
    let acquired = db
        .try_acquire_run_lock(&ctx.run_id, ctx.now)
        .map_err(EngineError::Db)?;
    if !acquired {
        return Err(EngineError::RunLockHeld);
    }
    let _guard = RunLockGuard {
        db,
        holder: ctx.run_id.clone(),
    };

    let rules = rules::load_enabled_rules(db)?;
    log::info!(
        "Evaluation pass {} starting: {} enabled rule(s)",
        ctx.run_id,
        rules.len()
    );

    let mut summary = RunSummary::default();
    for rule in &rules {
        if let Err(e) = eval_rule(db, ctx, rule, &mut summary) {
            // Rule-scoped: log and move on to the next rule
            log::warn!("Rule {} aborted: {}", rule.id, e);
        }
    }

    log::info!("Evaluation pass {} finished: {}", ctx.run_id, summary);
    Ok(summary)
}

fn eval_rule(
    db: &EngineDb,
    ctx: &RunContext<'_>,
    rule: &AutomationRule,
    summary: &mut RunSummary,
) -> Result<(), EngineError> {
    let candidates = audience::resolve(db, rule, ctx.now)?;
    log::debug!("Rule {}: {} candidate(s)", rule.id, candidates.len());

    for candidate in &candidates {
        summary.processed += 1;
        match eval_user(db, ctx, rule, candidate) {
            Ok(UserOutcome::Sent) => summary.sent += 1,
            Ok(UserOutcome::Throttled) | Ok(UserOutcome::Muted) => summary.skipped += 1,
            Ok(UserOutcome::NoChange) | Ok(UserOutcome::Recovered) => {}
            Ok(UserOutcome::DispatchFailed) | Ok(UserOutcome::DataError) => summary.failed += 1,
            Err(e) => {
                // User-scoped: audit as failed, keep looping
                summary.failed += 1;
                log::warn!(
                    "Rule {} user {}: evaluation failed: {}",
                    rule.id,
                    candidate.user_id,
                    e
                );
                let reason = e.to_string();
                let entry = NewAuditEntry {
                    rule_id: &rule.id,
                    user_id: &candidate.user_id,
                    action_kind: "evaluation",
                    stage: 0,
                    rendered_message: None,
                    status: "failed",
                    reason: Some(&reason),
                    channel_detail: None,
                };
                if let Err(audit_err) = db.append_audit(&entry, ctx.now) {
                    log::error!("Failed to audit failure: {}", audit_err);
                }
            }
        }
    }
    Ok(())
}

fn eval_user(
    db: &EngineDb,
    ctx: &RunContext<'_>,
    rule: &AutomationRule,
    candidate: &Candidate,
) -> Result<UserOutcome, EngineError> {
    let user_id = &candidate.user_id;
    let state = db.get_state(&rule.id, user_id).map_err(EngineError::StateWrite)?;

    // Mute is a full bypass: no classification, no state change
    if let Some(muted_until) = state.as_ref().and_then(|s| s.muted_until.as_deref()) {
        if crate::db::parse_timestamp(muted_until)
            .map(|until| until > ctx.now)
            .unwrap_or(false)
        {
            log::debug!("Rule {} user {}: muted until {}", rule.id, user_id, muted_until);
            return Ok(UserOutcome::Muted);
        }
    }

    let elapsed = match ctx
        .registry
        .last_activity(db, user_id, &rule.signals_enabled)
    {
        Some(last) => {
            let days = (ctx.now - last).num_seconds() as f64 / 86_400.0;
            Elapsed::Days(days.max(0.0))
        }
        None => Elapsed::Never,
    };

    let current = state.map(|s| s.current_stage).unwrap_or(0);
    let new_stage = classify(elapsed, &rule.stages);

    match decide(current, new_stage) {
        Transition::NoChange => Ok(UserOutcome::NoChange),
        Transition::Recovery { from } => {
            db.set_stage(&rule.id, user_id, 0, ctx.now)
                .map_err(EngineError::StateWrite)?;
            log::info!(
                "Rule {} user {}: recovered from stage {} (activity resumed)",
                rule.id,
                user_id,
                from
            );
            Ok(UserOutcome::Recovered)
        }
        Transition::Invalid { from, to } => {
            log::error!(
                "Rule {} user {}: undefined stage decrease {} -> {}; refusing to apply",
                rule.id,
                user_id,
                from,
                to
            );
            Ok(UserOutcome::DataError)
        }
        Transition::Forward { from, to } => {
            // State advances first; dispatch is gated separately so the risk
            // signal stays accurate even when sends are suppressed.
            db.set_stage(&rule.id, user_id, to, ctx.now)
                .map_err(EngineError::StateWrite)?;
            log::debug!(
                "Rule {} user {}: forward transition {} -> {}",
                rule.id,
                user_id,
                from,
                to
            );

            let stage_def = &rule.stages[(to - 1) as usize];
            let verdict =
                throttle::check(db, rule, user_id, ctx.now).map_err(EngineError::Db)?;
            if let Some(reason) = verdict.skip_reason() {
                db.append_audit(
                    &NewAuditEntry {
                        rule_id: &rule.id,
                        user_id,
                        action_kind: stage_def.action.as_str(),
                        stage: to,
                        rendered_message: None,
                        status: "skipped",
                        reason: Some(reason),
                        channel_detail: None,
                    },
                    ctx.now,
                )
                .map_err(EngineError::Db)?;
                return Ok(UserOutcome::Throttled);
            }

            match stage_def.action {
                ActionKind::Message => {
                    fire_message(db, ctx, rule, user_id, stage_def, to, elapsed)
                }
                ActionKind::Alert | ActionKind::Assist => {
                    fire_staff_alert(db, ctx, rule, user_id, stage_def.action, to, elapsed)
                }
            }
        }
    }
}

fn fire_message(
    db: &EngineDb,
    ctx: &RunContext<'_>,
    rule: &AutomationRule,
    user_id: &str,
    stage_def: &StageDef,
    stage: i64,
    elapsed: Elapsed,
) -> Result<UserOutcome, EngineError> {
    let user = audience::fetch_profile(db, user_id)
        .map_err(EngineError::Db)?
        .ok_or_else(|| {
            EngineError::Dispatch(format!("user {} vanished from directory", user_id))
        })?;

    let placeholder_ctx = PlaceholderContext::from_user(&user, elapsed.whole_days(), ctx.now);
    let body = ctx
        .renderer
        .render(template_for_stage(stage_def), &placeholder_ctx);
    let title = "Checking in";

    let outcomes = ctx
        .dispatcher
        .dispatch(db, user_id, title, &body, &rule.channels);
    let ok = aggregate_ok(&rule.channels, &outcomes);
    let detail = channel_detail_json(&outcomes);

    db.append_audit(
        &NewAuditEntry {
            rule_id: &rule.id,
            user_id,
            action_kind: ActionKind::Message.as_str(),
            stage,
            rendered_message: Some(&body),
            status: if ok { "sent" } else { "failed" },
            reason: if ok { None } else { Some("delivery failed") },
            channel_detail: Some(&detail),
        },
        ctx.now,
    )
    .map_err(EngineError::Db)?;

    if ok {
        db.record_action_fired(&rule.id, user_id, ActionKind::Message, ctx.now)
            .map_err(EngineError::StateWrite)?;
        Ok(UserOutcome::Sent)
    } else {
        Ok(UserOutcome::DispatchFailed)
    }
}

fn fire_staff_alert(
    db: &EngineDb,
    ctx: &RunContext<'_>,
    rule: &AutomationRule,
    user_id: &str,
    kind: ActionKind,
    stage: i64,
    elapsed: Elapsed,
) -> Result<UserOutcome, EngineError> {
    let user = audience::fetch_profile(db, user_id)
        .map_err(EngineError::Db)?
        .ok_or_else(|| {
            EngineError::Dispatch(format!("user {} vanished from directory", user_id))
        })?;

    let recipients: Vec<String> = match rule.scope {
        RuleScope::Coach => rule.owner_id.iter().cloned().collect(),
        RuleScope::Platform => audience::admin_ids(db).map_err(EngineError::Db)?,
    };

    let inactive = elapsed
        .whole_days()
        .map(|d| format!("{} days", d))
        .unwrap_or_else(|| "no recorded activity".to_string());
    let title = match kind {
        ActionKind::Assist => "Follow-up needed",
        _ => "Client at risk",
    };
    let body = format!(
        "{} reached stage {}: {} since last activity.",
        user.display_name, stage, inactive
    );

    let mut outcomes: Vec<ChannelOutcome> = Vec::new();
    for recipient in &recipients {
        let result = ctx.dispatcher.deliver_in_app(db, recipient, title, &body);
        outcomes.push(match result {
            Ok(()) => ChannelOutcome {
                channel: "in_app",
                ok: true,
                detail: Some(format!("recipient {}", recipient)),
            },
            Err(e) => ChannelOutcome {
                channel: "in_app",
                ok: false,
                detail: Some(format!("recipient {}: {}", recipient, e)),
            },
        });
    }

    let ok = !outcomes.is_empty() && outcomes.iter().any(|o| o.ok);
    let detail = channel_detail_json(&outcomes);
    let reason = if recipients.is_empty() {
        Some("no alert recipients")
    } else if !ok {
        Some("delivery failed")
    } else {
        None
    };

    db.append_audit(
        &NewAuditEntry {
            rule_id: &rule.id,
            user_id,
            action_kind: kind.as_str(),
            stage,
            rendered_message: None,
            status: if ok { "sent" } else { "failed" },
            reason,
            channel_detail: Some(&detail),
        },
        ctx.now,
    )
    .map_err(EngineError::Db)?;

    if ok {
        db.record_action_fired(&rule.id, user_id, kind, ctx.now)
            .map_err(EngineError::StateWrite)?;
        Ok(UserOutcome::Sent)
    } else {
        Ok(UserOutcome::DispatchFailed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
