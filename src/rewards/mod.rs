//! Share Rewards
//!
//! Limit gate, bonus layers and the calculator that composes them.
//!
//! Regular share:
//! ```text
//! base ─► veteran ─┬─► + streak     (of veteran base)
//!                  ├─► + first-time (of veteran base)
//!                  └─► + diversity  (flat)
//! ```
//! A tournament share adds multiplier, rank and tournament-streak bonuses on
//! top of the regular total.

mod bonus;
mod calculator;
mod limits;

pub use bonus::{
    diversity_bonus, first_time_bonus, percent_of, rank_bonus, streak_bonus,
    tournament_multiplier_bonus, tournament_streak_bonus, veteran_adjusted, RewardSettings,
};
pub use calculator::{
    RegularReason, RewardBreakdown, RewardCalculator, RewardFailure, ShareRewards, ShareType,
    ShareTypeDecision, ShareVerification, TournamentBreakdown,
};
pub use limits::{start_of_day, ShareLimitCheck, ShareLimitValidator};
