//! ShareLoop Engine
//!
//! Reward, referral-lifecycle and fraud-scoring engine for a share-to-earn
//! app catalog. Users share apps, earn XP and Points, unlock badges, bring in
//! referrals and climb tournament leaderboards.
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── lib.rs         - Crate root with re-exports
//! ├── main.rs        - Engine daemon entrypoint (expiry sweeper)
//! ├── config.rs      - Configuration management
//! ├── error.rs       - Error taxonomy
//! ├── engine.rs      - Share pipeline orchestrator, notifications
//! ├── sweep.rs       - Periodic referral expiry
//! ├── models/        - Versioned records (user ledger, app, share, badge, tournament)
//! ├── store/         - Repository seam, guarded updates, in-memory store
//! ├── rewards/       - Limit gate, bonus layers, reward calculator
//! ├── referral/      - Referral state machine and manager
//! ├── badges/        - Badge eligibility and awarding
//! └── fraud/         - Risk probes, scoring, fraud reports
//! ```

pub mod badges;
pub mod config;
pub mod engine;
pub mod error;
pub mod fraud;
pub mod models;
pub mod referral;
pub mod rewards;
pub mod store;
pub mod sweep;

// Re-export main types for convenience
pub use badges::{BadgeAward, BadgeEligibility, BadgeEvaluator, BadgeTrigger, UserStats};
pub use config::{sanitize_for_logging, EngineConfig};
pub use engine::{
    NotificationDispatcher, NotificationKind, ReferralScreening, RewardEngine,
    RewardNotification, ShareOutcome, TracingDispatcher, VerificationRequest,
};
pub use error::{EngineError, EngineResult, ShareLimitViolation};
pub use fraud::{
    AutomaticAction, FraudAnalysis, FraudContext, FraudEntityType, FraudFlag, FraudLevel,
    FraudReport, FraudScorer, FraudThresholds, InvestigationStatus,
};
pub use models::{Amounts, App, Badge, ShareEvent, Tournament, User};
pub use referral::{Referral, ReferralManager, ReferralStatus, RewardSide};
pub use rewards::{
    RewardCalculator, ShareLimitCheck, ShareLimitValidator, ShareRewards, ShareVerification,
};
pub use store::{guarded_update, Entity, MemoryRepository, Repository, Store};
pub use sweep::ExpirySweeper;
