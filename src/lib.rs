//! Reengage: a behavioral automation engine for coaching platforms.
//!
//! A periodic batch pass turns engagement signals into staged interventions:
//! resolve each rule's audience, aggregate per-user activity signals,
//! classify inactivity into severity stages, advance a per-(rule, user)
//! state machine, and dispatch throttled messages or staff alerts. Every
//! attempted action lands in an append-only audit log, which is also the
//! source of truth for cooldowns and send caps.

pub mod audience;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod migrations;
pub mod rules;
pub mod scheduler;
pub mod signals;
pub mod stage;
pub mod template;
pub mod throttle;
