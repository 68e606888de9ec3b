//! Fraud Scoring
//!
//! Independent risk probes score a share, payment, user, or device. The
//! aggregate is clamped to [0, 100] and mapped to a risk level and an
//! automatic action; high scores open an idempotent fraud report.
//!
//! ```text
//! context ──► probes ──► aggregate ──► level / action / review
//!                                  └─► FraudReport (score > report threshold)
//! ```

mod probes;
mod report;
mod score;
mod scorer;

pub use probes::{
    DeviceRiskContext, PaymentMethodKind, PaymentRiskContext, PriorShare, ProbeSettings,
    ShareRiskContext, UserRiskContext,
};
pub use report::{report_id, FraudEntityType, FraudReport, Investigation, InvestigationStatus};
pub use score::{
    aggregate, worst_case, AutomaticAction, FraudFlag, FraudLevel, FraudThresholds, ProbeResult,
    RiskAssessment,
};
pub use scorer::{FraudAnalysis, FraudContext, FraudScorer, FraudScorerSettings};
