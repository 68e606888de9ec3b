//! Domain records owned by the engine
//!
//! Each record carries a `version` used by the store for compare-and-swap.

mod app;
mod badge;
mod receipts;
mod share;
mod tournament;
mod user;

pub use app::{App, AppDebit, DailySpend, DebitOutcome, MonetizationConfig, ShareRules};
pub use badge::{Badge, BadgeCriteria, CriteriaType, Rarity, ThresholdOperator};
pub use receipts::ShareReceipts;
pub use share::{DeviceMetadata, ShareChannel, ShareEvent, ValidationStatus};
pub use tournament::{Tournament, TournamentParticipant};
pub use user::{
    Amounts, CreditOutcome, CreditSource, DailyShareSlots, LedgerCredit, ReferralEarnings, User,
};
