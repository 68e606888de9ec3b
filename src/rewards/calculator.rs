//! Share reward calculator
//!
//! Works on snapshots only. The caller loads user, app, tournament and share
//! history; identical snapshots always yield identical rewards.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::models::{Amounts, App, Tournament, User};
use crate::rewards::bonus::{
    diversity_bonus, first_time_bonus, rank_bonus, streak_bonus, tournament_multiplier_bonus,
    tournament_streak_bonus, veteran_adjusted, RewardSettings,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareType {
    Regular,
    Tournament,
}

/// Why a share offered with a tournament is scored as a regular share
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegularReason {
    TournamentNotLive,
    AppNotInTournament,
    UserNotRegistered,
    RegionNotEligible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareTypeDecision {
    pub share_type: ShareType,
    pub reason: Option<RegularReason>,
}

impl ShareTypeDecision {
    fn regular(reason: Option<RegularReason>) -> Self {
        Self {
            share_type: ShareType::Regular,
            reason,
        }
    }
}

/// Failure tags; "no reward" outcomes are not failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum RewardFailure {
    AppNotFound,
    UserNotFound,
    SystemError(String),
}

impl RewardFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            RewardFailure::AppNotFound => "app_not_found",
            RewardFailure::UserNotFound => "user_not_found",
            RewardFailure::SystemError(_) => "system_error",
        }
    }
}

/// Verification snapshot of the share being rewarded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareVerification {
    pub verified_at: DateTime<Utc>,
    /// The user's verified shares of this app before this one
    pub prior_app_shares: u32,
    /// Days with a verified share in this tournament before this one
    pub tournament_share_days: BTreeSet<NaiveDate>,
}

impl ShareVerification {
    pub fn new(verified_at: DateTime<Utc>, prior_app_shares: u32) -> Self {
        Self {
            verified_at,
            prior_app_shares,
            tournament_share_days: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TournamentBreakdown {
    pub tournament_id: String,
    pub regular_total: Amounts,
    pub multiplier_bonus: Amounts,
    pub rank: Option<u32>,
    pub total_participants: u32,
    pub rank_bonus: Amounts,
    pub active_days: u32,
    pub streak_bonus: Amounts,
}

/// Every layer of the computation, for audit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardBreakdown {
    pub share_type: ShareType,
    pub base: Amounts,
    pub veteran_adjusted: Amounts,
    pub streak_bonus: Amounts,
    pub first_time_bonus: Amounts,
    pub diversity_bonus: Amounts,
    pub tournament: Option<TournamentBreakdown>,
}

impl RewardBreakdown {
    pub fn regular_total(&self) -> Amounts {
        self.veteran_adjusted + self.streak_bonus + self.first_time_bonus + self.diversity_bonus
    }

    pub fn total(&self) -> Amounts {
        match &self.tournament {
            Some(t) => t.regular_total + t.multiplier_bonus + t.rank_bonus + t.streak_bonus,
            None => self.regular_total(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareRewards {
    pub total_xp: u64,
    pub total_points: u64,
    pub breakdown: RewardBreakdown,
}

impl ShareRewards {
    fn from_breakdown(breakdown: RewardBreakdown) -> Self {
        let total = breakdown.total();
        Self {
            total_xp: total.xp,
            total_points: total.points,
            breakdown,
        }
    }

    pub fn amounts(&self) -> Amounts {
        Amounts::new(self.total_xp, self.total_points)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RewardCalculator {
    settings: RewardSettings,
}

impl RewardCalculator {
    pub fn new(settings: RewardSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &RewardSettings {
        &self.settings
    }

    pub fn determine_share_type(
        &self,
        user: &User,
        app: &App,
        tournament: Option<&Tournament>,
        now: DateTime<Utc>,
    ) -> ShareTypeDecision {
        let Some(tournament) = tournament else {
            return ShareTypeDecision::regular(None);
        };

        if !tournament.is_live(now) {
            return ShareTypeDecision::regular(Some(RegularReason::TournamentNotLive));
        }
        if !tournament.includes_app(&app.id) {
            return ShareTypeDecision::regular(Some(RegularReason::AppNotInTournament));
        }
        let Some(participant) = tournament.participant(&user.id) else {
            return ShareTypeDecision::regular(Some(RegularReason::UserNotRegistered));
        };
        let region = participant.region.as_deref().or(user.country.as_deref());
        if !tournament.region_eligible(region) {
            return ShareTypeDecision::regular(Some(RegularReason::RegionNotEligible));
        }

        ShareTypeDecision {
            share_type: ShareType::Tournament,
            reason: None,
        }
    }

    /// Veteran, streak, first-time and diversity layers over the app base
    pub fn calculate_regular_share_rewards(
        &self,
        user: &User,
        app: &App,
        verification: &ShareVerification,
    ) -> ShareRewards {
        ShareRewards::from_breakdown(self.regular_breakdown(user, app, verification))
    }

    fn regular_breakdown(
        &self,
        user: &User,
        app: &App,
        verification: &ShareVerification,
    ) -> RewardBreakdown {
        let s = &self.settings;
        let base = app.base_amounts();
        let adjusted = veteran_adjusted(base, user.user_level, s);
        let streak_days = user.current_streak(verification.verified_at.date_naive());

        RewardBreakdown {
            share_type: ShareType::Regular,
            base,
            veteran_adjusted: adjusted,
            streak_bonus: streak_bonus(adjusted, streak_days, s),
            first_time_bonus: first_time_bonus(adjusted, verification.prior_app_shares, s),
            diversity_bonus: diversity_bonus(&user.categories_shared, &app.categories, s),
            tournament: None,
        }
    }

    /// Regular result plus multiplier, rank and tournament-streak bonuses
    pub fn calculate_tournament_share_rewards(
        &self,
        user: &User,
        app: &App,
        tournament: &Tournament,
        verification: &ShareVerification,
    ) -> Result<ShareRewards, RewardFailure> {
        let s = &self.settings;
        let mut breakdown = self.regular_breakdown(user, app, verification);
        let regular_total = breakdown.regular_total();

        let multiplier_bonus =
            tournament_multiplier_bonus(regular_total, tournament.reward_multiplier).ok_or_else(
                || {
                    RewardFailure::SystemError(format!(
                        "tournament {} has a non-finite reward multiplier",
                        tournament.id
                    ))
                },
            )?;

        let total_participants = tournament.total_participants();
        let rank = tournament.rank_of(&user.id);
        let rank_bonus = rank
            .map(|rank| rank_bonus(regular_total, rank, total_participants, s))
            .unwrap_or(Amounts::ZERO);

        let mut days = verification.tournament_share_days.clone();
        days.insert(verification.verified_at.date_naive());
        let active_days = u32::try_from(days.len()).unwrap_or(u32::MAX);

        breakdown.share_type = ShareType::Tournament;
        breakdown.tournament = Some(TournamentBreakdown {
            tournament_id: tournament.id.clone(),
            regular_total,
            multiplier_bonus,
            rank,
            total_participants,
            rank_bonus,
            active_days,
            streak_bonus: tournament_streak_bonus(active_days, s),
        });
        Ok(ShareRewards::from_breakdown(breakdown))
    }

    /// Entry point: classifies the share, then scores it
    pub fn calculate_share_rewards(
        &self,
        user: Option<&User>,
        app: Option<&App>,
        tournament: Option<&Tournament>,
        verification: &ShareVerification,
    ) -> Result<ShareRewards, RewardFailure> {
        let app = app.ok_or(RewardFailure::AppNotFound)?;
        let user = user.ok_or(RewardFailure::UserNotFound)?;

        let decision = self.determine_share_type(user, app, tournament, verification.verified_at);
        match (decision.share_type, tournament) {
            (ShareType::Tournament, Some(tournament)) => {
                self.calculate_tournament_share_rewards(user, app, tournament, verification)
            }
            _ => Ok(self.calculate_regular_share_rewards(user, app, verification)),
        }
    }
}
