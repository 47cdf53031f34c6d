//! Error types for the automation engine.
//!
//! Errors are classified by blast radius:
//! - Run-fatal: the whole evaluation pass aborts (rule set unavailable, lock held)
//! - Rule-scoped: only that rule's processing aborts, the pass continues
//! - User-scoped: caught per user, audited as `failed`, the loop continues

use thiserror::Error;

use crate::db::DbError;

#[derive(Debug, Error)]
pub enum EngineError {
    // Run-fatal
    #[error("Failed to load rule set: {0}")]
    RuleSetUnavailable(String),

    #[error("Another evaluation pass holds the run lock")]
    RunLockHeld,

    #[error("Database error: {0}")]
    Db(String),

    // Rule-scoped
    #[error("Rule {rule_id}: audience resolution failed: {message}")]
    Audience { rule_id: String, message: String },

    #[error("Rule {rule_id}: unknown trigger type '{trigger}'")]
    UnknownTrigger { rule_id: String, trigger: String },

    #[error("Rule {rule_id}: invalid configuration: {message}")]
    RuleConfig { rule_id: String, message: String },

    // User-scoped
    #[error("Signal source '{source_name}' failed: {message}")]
    Signal {
        source_name: String,
        message: String,
    },

    #[error("State write failed: {0}")]
    StateWrite(String),

    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    // Ambient
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl EngineError {
    /// True if this error aborts only the current rule's processing.
    pub fn is_rule_scoped(&self) -> bool {
        matches!(
            self,
            EngineError::Audience { .. }
                | EngineError::UnknownTrigger { .. }
                | EngineError::RuleConfig { .. }
        )
    }

    /// True if this error is caught per user and recorded as a `failed` outcome.
    pub fn is_user_scoped(&self) -> bool {
        matches!(
            self,
            EngineError::Signal { .. } | EngineError::StateWrite(_) | EngineError::Dispatch(_)
        )
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}

impl From<DbError> for EngineError {
    fn from(err: DbError) -> Self {
        EngineError::Db(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_scoped_classification() {
        let err = EngineError::Audience {
            rule_id: "r1".to_string(),
            message: "directory unavailable".to_string(),
        };
        assert!(err.is_rule_scoped());
        assert!(!err.is_user_scoped());
    }

    #[test]
    fn test_user_scoped_classification() {
        let err = EngineError::Dispatch("push gateway timeout".to_string());
        assert!(err.is_user_scoped());
        assert!(!err.is_rule_scoped());
    }

    #[test]
    fn test_fatal_is_neither() {
        let err = EngineError::RuleSetUnavailable("db locked".to_string());
        assert!(!err.is_rule_scoped());
        assert!(!err.is_user_scoped());
    }
}
