//! Template Renderer.
//!
//! Plain placeholder substitution over a fixed vocabulary. Unknown
//! placeholders are left verbatim so a malformed custom template degrades
//! gracefully instead of blocking the batch. The renderer sits behind a trait
//! so a stricter (typed, escaping-aware) implementation can be swapped in
//! without touching dispatch.

use chrono::{DateTime, Utc};

use crate::db::{parse_timestamp, DbUser};
use crate::rules::StageDef;

/// Values available to every template.
#[derive(Debug, Clone)]
pub struct PlaceholderContext {
    pub display_name: String,
    pub first_name: String,
    pub last_name: String,
    pub role: String,
    pub account_age_days: i64,
    /// `None` when the user never produced a signal reading.
    pub days_inactive: Option<i64>,
}

impl PlaceholderContext {
    pub fn from_user(user: &DbUser, days_inactive: Option<i64>, now: DateTime<Utc>) -> Self {
        let account_age_days = parse_timestamp(&user.created_at)
            .map(|created| (now - created).num_days().max(0))
            .unwrap_or(0);
        Self {
            display_name: user.display_name.clone(),
            first_name: user.first_name.clone().unwrap_or_default(),
            last_name: user.last_name.clone().unwrap_or_default(),
            role: user.role.clone(),
            account_age_days,
            days_inactive,
        }
    }
}

pub trait MessageRenderer {
    fn render(&self, template: &str, ctx: &PlaceholderContext) -> String;
}

/// The default substitution renderer.
#[derive(Default)]
pub struct PlaceholderRenderer;

impl MessageRenderer for PlaceholderRenderer {
    fn render(&self, template: &str, ctx: &PlaceholderContext) -> String {
        let days_inactive = ctx
            .days_inactive
            .map(|d| d.to_string())
            .unwrap_or_else(|| "a while".to_string());
        template
            .replace("{{display_name}}", &ctx.display_name)
            .replace("{{first_name}}", &ctx.first_name)
            .replace("{{last_name}}", &ctx.last_name)
            .replace("{{role}}", &ctx.role)
            .replace("{{account_age_days}}", &ctx.account_age_days.to_string())
            .replace("{{days_inactive}}", &days_inactive)
    }
}

/// Pick the template for a stage: explicit template wins, else the tone-keyed
/// default ("supportive" when no tone is configured).
pub fn template_for_stage(stage: &StageDef) -> &str {
    if let Some(template) = stage.template.as_deref() {
        return template;
    }
    default_for_tone(stage.tone.as_deref().unwrap_or("supportive"))
}

fn default_for_tone(tone: &str) -> &'static str {
    match tone {
        "direct" => {
            "{{first_name}}, it's been {{days_inactive}} days since your last activity. \
             Your plan only works if you do — jump back in today."
        }
        "playful" => {
            "Psst, {{first_name}}! Your workout log is gathering dust ({{days_inactive}} days!). \
             Let's fix that."
        }
        // "supportive" and any unrecognized tone
        _ => {
            "Hi {{first_name}}, we noticed it's been {{days_inactive}} days since you last \
             checked in. No pressure — even a small session counts. We're here when you're ready."
        }
    }
}
