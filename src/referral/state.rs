//! Referral lifecycle states and the transition table

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferralStatus {
    Pending,
    Active,
    Completed,
    Expired,
    Fraudulent,
}

impl ReferralStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReferralStatus::Completed | ReferralStatus::Expired | ReferralStatus::Fraudulent
        )
    }

    /// The only legal edges: pending -> active -> completed, pending -> expired,
    /// pending|active -> fraudulent
    pub fn can_transition_to(&self, next: ReferralStatus) -> bool {
        use ReferralStatus::*;
        matches!(
            (self, next),
            (Pending, Active)
                | (Pending, Expired)
                | (Pending, Fraudulent)
                | (Active, Completed)
                | (Active, Fraudulent)
        )
    }

    pub fn ensure_transition(&self, next: ReferralStatus) -> EngineResult<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(EngineError::NotEligible(format!(
                "referral cannot move from {} to {}",
                self, next
            )))
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReferralStatus::Pending => "pending",
            ReferralStatus::Active => "active",
            ReferralStatus::Completed => "completed",
            ReferralStatus::Expired => "expired",
            ReferralStatus::Fraudulent => "fraudulent",
        }
    }
}

impl std::fmt::Display for ReferralStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
