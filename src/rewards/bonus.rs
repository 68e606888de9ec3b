//! Reward bonuses
//!
//! Each bonus is a pure function of the amounts it builds on and the context
//! that triggers it. Percentages use integer half-up rounding so the same
//! inputs always produce the same amounts.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::models::Amounts;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardSettings {
    pub veteran_level: u32,
    /// Applied to both currencies, e.g. 110 for x1.10
    pub veteran_multiplier_pct: u64,
    pub streak_days: u32,
    pub streak_xp_pct: u64,
    pub streak_points_pct: u64,
    pub first_time_xp_pct: u64,
    pub first_time_points_pct: u64,
    pub diversity_min_categories: usize,
    pub diversity_bonus: Amounts,
    /// Top-tier rank cut-off as a percentage of participants
    pub top_tier_pct: u64,
    pub top_tier_bonus_pct: (u64, u64),
    pub second_tier_pct: u64,
    pub second_tier_bonus_pct: (u64, u64),
    pub tournament_streak_min_days: u32,
    pub tournament_streak_per_day: Amounts,
    pub xp_per_level: u64,
}

impl Default for RewardSettings {
    fn default() -> Self {
        Self {
            veteran_level: 10,
            veteran_multiplier_pct: 110,
            streak_days: 7,
            streak_xp_pct: 20,
            streak_points_pct: 10,
            first_time_xp_pct: 50,
            first_time_points_pct: 25,
            diversity_min_categories: 5,
            diversity_bonus: Amounts::new(25, 5),
            top_tier_pct: 10,
            top_tier_bonus_pct: (30, 15),
            second_tier_pct: 25,
            second_tier_bonus_pct: (20, 10),
            tournament_streak_min_days: 3,
            tournament_streak_per_day: Amounts::new(20, 5),
            xp_per_level: 1000,
        }
    }
}

/// `amount * pct / 100`, rounded half up
pub fn percent_of(amount: u64, pct: u64) -> u64 {
    amount.saturating_mul(pct).saturating_add(50) / 100
}

pub fn scale(amounts: Amounts, xp_pct: u64, points_pct: u64) -> Amounts {
    Amounts::new(
        percent_of(amounts.xp, xp_pct),
        percent_of(amounts.points, points_pct),
    )
}

/// Base after the veteran multiplier; unchanged below the veteran level
pub fn veteran_adjusted(base: Amounts, user_level: u32, settings: &RewardSettings) -> Amounts {
    if user_level >= settings.veteran_level {
        scale(
            base,
            settings.veteran_multiplier_pct,
            settings.veteran_multiplier_pct,
        )
    } else {
        base
    }
}

pub fn streak_bonus(base: Amounts, streak_days: u32, settings: &RewardSettings) -> Amounts {
    if streak_days >= settings.streak_days {
        scale(base, settings.streak_xp_pct, settings.streak_points_pct)
    } else {
        Amounts::ZERO
    }
}

pub fn first_time_bonus(base: Amounts, prior_app_shares: u32, settings: &RewardSettings) -> Amounts {
    if prior_app_shares == 0 {
        scale(
            base,
            settings.first_time_xp_pct,
            settings.first_time_points_pct,
        )
    } else {
        Amounts::ZERO
    }
}

/// Flat bonus for a user already spanning many categories who reaches a new one
pub fn diversity_bonus(
    user_categories: &BTreeSet<String>,
    app_categories: &BTreeSet<String>,
    settings: &RewardSettings,
) -> Amounts {
    let introduces_new = app_categories.iter().any(|c| !user_categories.contains(c));
    if user_categories.len() >= settings.diversity_min_categories && introduces_new {
        settings.diversity_bonus
    } else {
        Amounts::ZERO
    }
}

/// `round(total * (multiplier - 1))` per currency; multipliers below 1 add nothing
pub fn tournament_multiplier_bonus(total: Amounts, multiplier: f64) -> Option<Amounts> {
    if !multiplier.is_finite() {
        return None;
    }
    let factor = (multiplier - 1.0).max(0.0);
    let apply = |amount: u64| -> u64 {
        let scaled = (amount as f64 * factor).round();
        if scaled >= u64::MAX as f64 {
            u64::MAX
        } else {
            scaled as u64
        }
    };
    Some(Amounts::new(apply(total.xp), apply(total.points)))
}

/// Performance bonus for the top ranks of the leaderboard
pub fn rank_bonus(total: Amounts, rank: u32, participants: u32, settings: &RewardSettings) -> Amounts {
    if rank == 0 || participants == 0 {
        return Amounts::ZERO;
    }
    let rank = u64::from(rank) * 100;
    let participants = u64::from(participants);

    if rank <= participants * settings.top_tier_pct {
        let (xp, points) = settings.top_tier_bonus_pct;
        scale(total, xp, points)
    } else if rank <= participants * settings.second_tier_pct {
        let (xp, points) = settings.second_tier_bonus_pct;
        scale(total, xp, points)
    } else {
        Amounts::ZERO
    }
}

pub fn tournament_streak_bonus(active_days: u32, settings: &RewardSettings) -> Amounts {
    if active_days < settings.tournament_streak_min_days {
        return Amounts::ZERO;
    }
    let days = u64::from(active_days);
    Amounts::new(
        settings.tournament_streak_per_day.xp.saturating_mul(days),
        settings.tournament_streak_per_day.points.saturating_mul(days),
    )
}
