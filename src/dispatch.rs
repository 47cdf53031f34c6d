//! Dispatcher: multi-channel delivery of rendered interventions.
//!
//! Channels are attempted independently; a failure on one never prevents the
//! others. The in-app write is the primary channel — the aggregate outcome is
//! `sent` only if it succeeded (or, when a rule doesn't target in-app, if any
//! configured channel succeeded). Per-channel detail is serialized into the
//! audit entry.

use rusqlite::params;
use serde::Serialize;
use uuid::Uuid;

use crate::db::EngineDb;
use crate::rules::Channel;

/// Result of one channel attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelOutcome {
    pub channel: &'static str,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Outbound push delivery. The production implementation posts to the
/// platform's notification service; tests substitute their own.
pub trait PushGateway {
    fn push(&self, user_id: &str, title: &str, body: &str) -> Result<(), String>;
}

/// Webhook-backed push gateway.
pub struct HttpPushGateway {
    endpoint: String,
    client: reqwest::blocking::Client,
}

impl HttpPushGateway {
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            client: reqwest::blocking::Client::new(),
        }
    }
}

impl PushGateway for HttpPushGateway {
    fn push(&self, user_id: &str, title: &str, body: &str) -> Result<(), String> {
        let payload = serde_json::json!({
            "userId": user_id,
            "title": title,
            "body": body,
        });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .map_err(|e| format!("push request failed: {}", e))?;
        if !response.status().is_success() {
            return Err(format!("push gateway returned {}", response.status()));
        }
        Ok(())
    }
}

pub struct Dispatcher<'a> {
    push: Option<&'a dyn PushGateway>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(push: Option<&'a dyn PushGateway>) -> Self {
        Self { push }
    }

    /// Write an in-app notification row. Used both for user-facing messages
    /// and for staff alerts.
    pub fn deliver_in_app(
        &self,
        db: &EngineDb,
        user_id: &str,
        title: &str,
        body: &str,
    ) -> Result<(), String> {
        db.conn_ref()
            .execute(
                "INSERT INTO notifications (id, user_id, title, body, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    format!("ntf-{}", Uuid::new_v4()),
                    user_id,
                    title,
                    body,
                    chrono::Utc::now().to_rfc3339()
                ],
            )
            .map_err(|e| format!("in-app write failed: {}", e))?;
        Ok(())
    }

    /// Deliver a rendered message to a user over the rule's channels.
    pub fn dispatch(
        &self,
        db: &EngineDb,
        user_id: &str,
        title: &str,
        body: &str,
        channels: &[Channel],
    ) -> Vec<ChannelOutcome> {
        let mut outcomes = Vec::with_capacity(channels.len());
        for channel in channels {
            let result = match channel {
                Channel::InApp => self.deliver_in_app(db, user_id, title, body),
                Channel::Push => match self.push {
                    Some(gateway) => gateway.push(user_id, title, body),
                    None => Err("push gateway not configured".to_string()),
                },
                // Email delivery is handed off at the deployment boundary;
                // here it is a logged stub.
                Channel::Email => {
                    log::debug!("Email dispatch stub for user {}: {}", user_id, title);
                    Ok(())
                }
            };
            outcomes.push(match result {
                Ok(()) => ChannelOutcome {
                    channel: channel.as_str(),
                    ok: true,
                    detail: None,
                },
                Err(e) => ChannelOutcome {
                    channel: channel.as_str(),
                    ok: false,
                    detail: Some(e),
                },
            });
        }
        outcomes
    }
}

/// Aggregate policy: `sent` iff the primary (in-app) channel succeeded; when
/// in-app is not configured, any success counts.
pub fn aggregate_ok(channels: &[Channel], outcomes: &[ChannelOutcome]) -> bool {
    if channels.contains(&Channel::InApp) {
        outcomes
            .iter()
            .any(|o| o.channel == Channel::InApp.as_str() && o.ok)
    } else {
        outcomes.iter().any(|o| o.ok)
    }
}

/// Serialize per-channel outcomes for the audit entry.
pub fn channel_detail_json(outcomes: &[ChannelOutcome]) -> String {
    serde_json::to_string(outcomes).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingPush;
    impl PushGateway for FailingPush {
        fn push(&self, _user_id: &str, _title: &str, _body: &str) -> Result<(), String> {
            Err("gateway unreachable".to_string())
        }
    }

    struct CountingPush(AtomicUsize);
    impl PushGateway for CountingPush {
        fn push(&self, _user_id: &str, _title: &str, _body: &str) -> Result<(), String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn notification_count(db: &crate::db::EngineDb, user_id: &str) -> i64 {
        db.conn_ref()
            .query_row(
                "SELECT COUNT(*) FROM notifications WHERE user_id = ?1",
                [user_id],
                |row| row.get(0),
            )
            .expect("count")
    }

    #[test]
    fn test_in_app_writes_notification_row() {
        let db = test_db();
        let dispatcher = Dispatcher::new(None);

        let outcomes = dispatcher.dispatch(&db, "u1", "Check in", "We miss you", &[Channel::InApp]);
        assert!(outcomes[0].ok);
        assert_eq!(notification_count(&db, "u1"), 1);
    }

    #[test]
    fn test_failed_channel_does_not_block_others() {
        let db = test_db();
        let failing = FailingPush;
        let dispatcher = Dispatcher::new(Some(&failing));

        let outcomes = dispatcher.dispatch(
            &db,
            "u1",
            "Check in",
            "body",
            &[Channel::Push, Channel::InApp],
        );
        assert!(!outcomes[0].ok, "push should fail");
        assert!(outcomes[1].ok, "in-app should still be attempted");
        assert_eq!(notification_count(&db, "u1"), 1);
    }

    #[test]
    fn test_push_without_gateway_fails_that_channel() {
        let db = test_db();
        let dispatcher = Dispatcher::new(None);

        let outcomes = dispatcher.dispatch(&db, "u1", "t", "b", &[Channel::Push]);
        assert!(!outcomes[0].ok);
        assert!(outcomes[0]
            .detail
            .as_deref()
            .unwrap()
            .contains("not configured"));
    }

    #[test]
    fn test_push_gateway_invoked() {
        let db = test_db();
        let counting = CountingPush(AtomicUsize::new(0));
        let dispatcher = Dispatcher::new(Some(&counting));

        dispatcher.dispatch(&db, "u1", "t", "b", &[Channel::Push]);
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_aggregate_primary_channel_policy() {
        let channels = vec![Channel::InApp, Channel::Push];
        let outcomes = vec![
            ChannelOutcome {
                channel: "in_app",
                ok: false,
                detail: Some("disk full".to_string()),
            },
            ChannelOutcome {
                channel: "push",
                ok: true,
                detail: None,
            },
        ];
        assert!(
            !aggregate_ok(&channels, &outcomes),
            "push success cannot stand in for a failed primary channel"
        );

        let push_only = vec![Channel::Push];
        let outcome_ok = vec![ChannelOutcome {
            channel: "push",
            ok: true,
            detail: None,
        }];
        assert!(aggregate_ok(&push_only, &outcome_ok));
    }

    #[test]
    fn test_channel_detail_serializes() {
        let outcomes = vec![ChannelOutcome {
            channel: "in_app",
            ok: true,
            detail: None,
        }];
        let json = channel_detail_json(&outcomes);
        assert!(json.contains("\"in_app\""));
        assert!(json.contains("\"ok\":true"));
    }
}
