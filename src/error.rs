//! Engine Error Taxonomy
//!
//! State-mutating operations surface these errors to the caller. Calculation
//! components (rewards, fraud, badges) return structured outcomes instead.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reasons a share is refused by the limit gate, in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareLimitViolation {
    UserNotFound,
    AppNotFound,
    UserDailyLimitExceeded,
    GlobalDailyLimitExceeded,
    CooldownActive,
    LevelTooLow,
    InsufficientBudget,
    DailyBudgetExceeded,
}

impl ShareLimitViolation {
    /// Stable reason code returned to route handlers
    pub fn as_str(&self) -> &'static str {
        match self {
            ShareLimitViolation::UserNotFound => "user_not_found",
            ShareLimitViolation::AppNotFound => "app_not_found",
            ShareLimitViolation::UserDailyLimitExceeded => "user_daily_limit_exceeded",
            ShareLimitViolation::GlobalDailyLimitExceeded => "global_daily_limit_exceeded",
            ShareLimitViolation::CooldownActive => "cooldown_active",
            ShareLimitViolation::LevelTooLow => "level_too_low",
            ShareLimitViolation::InsufficientBudget => "insufficient_budget",
            ShareLimitViolation::DailyBudgetExceeded => "daily_budget_exceeded",
        }
    }
}

impl std::fmt::Display for ShareLimitViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Reward already awarded: {0}")]
    AlreadyAwarded(String),

    #[error("Not eligible: {0}")]
    NotEligible(String),

    #[error("Limit exceeded: {0}")]
    LimitExceeded(ShareLimitViolation),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("System error: {0}")]
    System(String),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Stable snake_case code for the error class
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound { .. } => "not_found",
            EngineError::AlreadyAwarded(_) => "already_awarded",
            EngineError::NotEligible(_) => "not_eligible",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Validation(_) => "validation_error",
            EngineError::System(_) => "system_error",
        }
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(EngineError::not_found("user", "u1").code(), "not_found");
        assert_eq!(
            EngineError::LimitExceeded(ShareLimitViolation::CooldownActive).to_string(),
            "Limit exceeded: cooldown_active"
        );
        assert_eq!(
            ShareLimitViolation::UserDailyLimitExceeded.as_str(),
            "user_daily_limit_exceeded"
        );
    }
}
