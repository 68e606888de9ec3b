//! Share limit gate
//!
//! Runs before any reward is computed. Checks are evaluated in a fixed order
//! and the first failure is reported; nothing is written.
//!
//! The count checks read committed shares, so two shares racing past the gate
//! could both fit under `daily_user_limit`. A share that passes therefore also
//! takes a daily slot in the user's record ([`ShareLimitValidator::reserve_daily_slot`])
//! before anything is charged.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::error::{EngineResult, ShareLimitViolation};
use crate::models::{App, ShareEvent, User};
use crate::store::{guarded_update, AppRepository, Repository, ShareRepository, UserRepository};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareLimitCheck {
    pub valid: bool,
    pub reason: Option<ShareLimitViolation>,
}

impl ShareLimitCheck {
    pub fn passed() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn failed(reason: ShareLimitViolation) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
        }
    }
}

/// Midnight UTC of the day containing `now`
pub fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

pub struct ShareLimitValidator {
    users: Arc<dyn UserRepository>,
    apps: Arc<dyn AppRepository>,
    shares: Arc<dyn ShareRepository>,
}

impl ShareLimitValidator {
    pub fn new(
        users: Arc<dyn UserRepository>,
        apps: Arc<dyn AppRepository>,
        shares: Arc<dyn ShareRepository>,
    ) -> Self {
        Self {
            users,
            apps,
            shares,
        }
    }

    pub async fn validate_share_limits(
        &self,
        user_id: &str,
        app_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<ShareLimitCheck> {
        let user = self.users.get(user_id).await?;
        let app = self.apps.get(app_id).await?;
        self.check(user.as_ref(), app.as_ref(), now).await
    }

    /// Same gate over records the caller already loaded
    pub async fn check(
        &self,
        user: Option<&User>,
        app: Option<&App>,
        now: DateTime<Utc>,
    ) -> EngineResult<ShareLimitCheck> {
        let Some(user) = user else {
            return Ok(ShareLimitCheck::failed(ShareLimitViolation::UserNotFound));
        };
        let Some(app) = app else {
            return Ok(ShareLimitCheck::failed(ShareLimitViolation::AppNotFound));
        };

        let rules = &app.share_rules;
        let today = start_of_day(now);

        let user_today = self
            .shares
            .count_verified_since(&app.id, Some(&user.id), today)
            .await?;
        if user_today >= rules.daily_user_limit {
            return Ok(self.refuse(user, app, ShareLimitViolation::UserDailyLimitExceeded));
        }

        let app_today = self.shares.count_verified_since(&app.id, None, today).await?;
        if app_today >= rules.daily_global_limit {
            return Ok(self.refuse(user, app, ShareLimitViolation::GlobalDailyLimitExceeded));
        }

        if rules.cooldown_minutes > 0 {
            if let Some(last) = self.shares.last_verified_at(&user.id, &app.id).await? {
                if now - last < Duration::minutes(i64::from(rules.cooldown_minutes)) {
                    return Ok(self.refuse(user, app, ShareLimitViolation::CooldownActive));
                }
            }
        }

        if user.user_level < rules.min_user_level {
            return Ok(self.refuse(user, app, ShareLimitViolation::LevelTooLow));
        }

        let cost = app.cost_per_share();
        if app.remaining_budget() < cost {
            return Ok(self.refuse(user, app, ShareLimitViolation::InsufficientBudget));
        }

        let daily_cap = app.monetization_config.budget_daily;
        if daily_cap > 0.0 && app.spent_on(now.date_naive()) + cost > daily_cap {
            return Ok(self.refuse(user, app, ShareLimitViolation::DailyBudgetExceeded));
        }

        Ok(ShareLimitCheck::passed())
    }

    /// Hold one of the user's daily slots on the app for `share`
    pub async fn reserve_daily_slot(
        &self,
        share: &ShareEvent,
        app: &App,
        now: DateTime<Utc>,
        max_retries: u32,
    ) -> EngineResult<()> {
        let day = now.date_naive();
        let limit = app.share_rules.daily_user_limit;
        guarded_update(
            self.users.as_ref(),
            &share.user_id,
            max_retries,
            |user: &mut User| user.reserve_share_slot(&app.id, &share.id, day, limit),
        )
        .await?;
        Ok(())
    }

    /// Return the slot of a share that will not be rewarded
    pub async fn release_daily_slot(
        &self,
        share: &ShareEvent,
        now: DateTime<Utc>,
        max_retries: u32,
    ) -> EngineResult<bool> {
        let day = now.date_naive();
        let (_, released) = guarded_update(
            self.users.as_ref(),
            &share.user_id,
            max_retries,
            |user: &mut User| Ok(user.release_share_slot(&share.app_id, &share.id, day)),
        )
        .await?;
        Ok(released)
    }

    fn refuse(&self, user: &User, app: &App, reason: ShareLimitViolation) -> ShareLimitCheck {
        debug!(
            user_id = %user.id,
            app_id = %app.id,
            reason = %reason,
            "Share refused by limit gate"
        );
        ShareLimitCheck::failed(reason)
    }
}
