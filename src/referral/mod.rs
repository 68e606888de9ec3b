//! Referral Lifecycle
//!
//! ```text
//! pending ──► active ──► completed
//!    │           │
//!    ├──► expired└──► fraudulent
//!    └──► fraudulent
//! ```
//!
//! Activation is automatic once all four progress metrics reach their
//! criteria. Expiry is applied by a periodic sweep.

mod manager;
mod model;
mod state;

pub use manager::{ExpirySweepReport, ReferralManager, ReferralSettings};
pub use model::{
    ActivationCriteria, ActivationProgress, EligibilityReport, EligibilityViolation,
    FraudDetection, ProgressUpdate, Referral, ReferralRewards, ReferralSummary, RewardSide,
};
pub use state::ReferralStatus;
