//! Badge Evaluation
//!
//! Badges are checked against a snapshot of user statistics. Holding a badge
//! is the only guard against awarding it twice: the id is inserted into the
//! user's badge set and the badge rewards are credited in the same guarded
//! update.
//!
//! `users_achieved_count` is derived from the user ledger. A grant bumps it
//! right away; [`BadgeEvaluator::reconcile_counters`] recounts holders and
//! repairs any bump that was lost.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::EngineResult;
use crate::models::{
    Amounts, Badge, CreditSource, CriteriaType, LedgerCredit, ThresholdOperator, User,
};
use crate::store::{guarded_update, require, BadgeRepository, Repository, UserRepository};

/// Rolled-up user statistics badges are measured against
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStats {
    pub total_shares: u64,
    pub total_xp_earned: u64,
    pub total_points_earned: u64,
    pub sharing_streak: u64,
    pub longest_streak: u64,
    pub referrals_completed: u64,
    pub user_level: u64,
    pub categories_shared: u64,
    pub tournaments_joined: u64,
}

impl UserStats {
    pub fn from_user(user: &User, now: DateTime<Utc>) -> Self {
        Self {
            total_shares: user.total_shares,
            total_xp_earned: user.total_xp_earned,
            total_points_earned: user.total_points_earned,
            sharing_streak: u64::from(user.current_streak(now.date_naive())),
            longest_streak: u64::from(user.longest_sharing_streak),
            referrals_completed: u64::from(user.total_referrals_completed),
            user_level: u64::from(user.user_level),
            categories_shared: user.categories_shared.len() as u64,
            tournaments_joined: u64::from(user.tournaments_joined),
        }
    }

    pub fn value_for(&self, kind: CriteriaType) -> u64 {
        match kind {
            CriteriaType::TotalShares => self.total_shares,
            CriteriaType::TotalXpEarned => self.total_xp_earned,
            CriteriaType::TotalPointsEarned => self.total_points_earned,
            CriteriaType::SharingStreak => self.sharing_streak,
            CriteriaType::LongestStreak => self.longest_streak,
            CriteriaType::ReferralsCompleted => self.referrals_completed,
            CriteriaType::UserLevel => self.user_level,
            CriteriaType::CategoriesShared => self.categories_shared,
            CriteriaType::TournamentsJoined => self.tournaments_joined,
        }
    }
}

/// What caused the evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BadgeTrigger {
    Share,
    Referral,
    Tournament,
    LevelUp,
    /// Re-evaluates every criteria type
    Manual,
}

impl BadgeTrigger {
    /// Whether this event can move the statistic a criteria type reads
    pub fn covers(&self, kind: CriteriaType) -> bool {
        use CriteriaType::*;
        match self {
            BadgeTrigger::Manual => true,
            BadgeTrigger::Share => !matches!(kind, ReferralsCompleted | TournamentsJoined),
            BadgeTrigger::Referral => matches!(
                kind,
                ReferralsCompleted | TotalXpEarned | TotalPointsEarned | UserLevel
            ),
            // a tournament share is still a share
            BadgeTrigger::Tournament => {
                kind == TournamentsJoined || BadgeTrigger::Share.covers(kind)
            }
            BadgeTrigger::LevelUp => matches!(kind, UserLevel),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadgeEligibility {
    pub badge_id: String,
    pub eligible: bool,
    pub current_value: u64,
    pub target_value: u64,
    pub progress_percentage: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadgeAward {
    pub badge_id: String,
    pub rewards: Amounts,
}

fn progress_percentage(operator: ThresholdOperator, current: u64, target: u64) -> u8 {
    match operator {
        ThresholdOperator::Gte | ThresholdOperator::Gt | ThresholdOperator::Eq => {
            if target == 0 || operator.compare(current, target) {
                return 100;
            }
            let pct = (current as f64 / target as f64 * 100.0).floor();
            pct.clamp(0.0, 100.0) as u8
        }
        ThresholdOperator::Lte | ThresholdOperator::Lt => {
            if operator.compare(current, target) {
                100
            } else {
                0
            }
        }
    }
}

/// Pure check; never writes
pub fn check_badge_eligibility(
    user: &User,
    badge: &Badge,
    trigger: BadgeTrigger,
    stats: &UserStats,
) -> BadgeEligibility {
    let criteria = &badge.criteria;
    let current_value = stats.value_for(criteria.kind);
    let held = user.badges_ids.contains(&badge.id);
    let met = criteria
        .threshold_operator
        .compare(current_value, criteria.threshold_value);

    BadgeEligibility {
        badge_id: badge.id.clone(),
        eligible: badge.is_active && !held && trigger.covers(criteria.kind) && met,
        current_value,
        target_value: criteria.threshold_value,
        progress_percentage: if held {
            100
        } else {
            progress_percentage(
                criteria.threshold_operator,
                current_value,
                criteria.threshold_value,
            )
        },
    }
}

pub struct BadgeEvaluator {
    users: Arc<dyn UserRepository>,
    badges: Arc<dyn BadgeRepository>,
    xp_per_level: u64,
    max_cas_retries: u32,
}

impl BadgeEvaluator {
    pub fn new(
        users: Arc<dyn UserRepository>,
        badges: Arc<dyn BadgeRepository>,
        xp_per_level: u64,
        max_cas_retries: u32,
    ) -> Self {
        Self {
            users,
            badges,
            xp_per_level,
            max_cas_retries,
        }
    }

    /// Progress towards every active badge the user does not hold yet
    pub async fn badge_progress(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<BadgeEligibility>> {
        let user: User = require(self.users.as_ref(), user_id).await?;
        let stats = UserStats::from_user(&user, now);
        Ok(self
            .badges
            .list_active()
            .await?
            .iter()
            .filter(|b| !user.badges_ids.contains(&b.id))
            .map(|b| check_badge_eligibility(&user, b, BadgeTrigger::Manual, &stats))
            .collect())
    }

    /// Award every newly qualifying badge; returns what was granted by this call
    pub async fn evaluate_and_award(
        &self,
        user_id: &str,
        trigger: BadgeTrigger,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<BadgeAward>> {
        let user: User = require(self.users.as_ref(), user_id).await?;
        let stats = UserStats::from_user(&user, now);
        let mut awards = Vec::new();

        for badge in self.badges.list_active().await? {
            if !check_badge_eligibility(&user, &badge, trigger, &stats).eligible {
                continue;
            }
            if self.grant(user_id, &badge).await? {
                awards.push(BadgeAward {
                    badge_id: badge.id.clone(),
                    rewards: badge.rewards(),
                });
            }
        }
        Ok(awards)
    }

    async fn grant(&self, user_id: &str, badge: &Badge) -> EngineResult<bool> {
        let credit = LedgerCredit::new(
            format!("badge:{}", badge.id),
            badge.rewards(),
            CreditSource::Badge,
        );
        let xp_per_level = self.xp_per_level;

        let (_, granted) = guarded_update(
            self.users.as_ref(),
            user_id,
            self.max_cas_retries,
            |user: &mut User| {
                if !user.badges_ids.insert(badge.id.clone()) {
                    return Ok(false);
                }
                user.apply_credit(&credit, xp_per_level);
                Ok(true)
            },
        )
        .await?;

        if !granted {
            return Ok(false);
        }

        info!(
            user_id = %user_id,
            badge_id = %badge.id,
            xp = badge.xp_reward,
            points = badge.points_reward,
            "Badge awarded"
        );

        let counted = guarded_update(
            self.badges.as_ref(),
            &badge.id,
            self.max_cas_retries,
            |badge: &mut Badge| {
                badge.users_achieved_count = badge.users_achieved_count.saturating_add(1);
                Ok(())
            },
        )
        .await;
        if let Err(e) = counted {
            // the user keeps the badge; the next reconcile repairs the counter
            warn!(badge_id = %badge.id, error = %e, "Failed to bump badge counter");
        }
        Ok(true)
    }

    /// Recount holders of every active badge; returns how many counters moved
    pub async fn reconcile_counters(&self) -> EngineResult<usize> {
        let mut corrected = 0;
        for badge in self.badges.list_active().await? {
            let holders = self.users.count_badge_holders(&badge.id).await?;
            if holders == badge.users_achieved_count {
                continue;
            }

            guarded_update(
                self.badges.as_ref(),
                &badge.id,
                self.max_cas_retries,
                |stored: &mut Badge| {
                    stored.users_achieved_count = holders;
                    Ok(())
                },
            )
            .await?;
            info!(
                badge_id = %badge.id,
                from = badge.users_achieved_count,
                to = holders,
                "Badge counter reconciled"
            );
            corrected += 1;
        }
        Ok(corrected)
    }
}
