//! User Ledger
//!
//! Balances, level, streak and referral counters. Every mutation goes through
//! a guarded repository update; the methods here are the pure state changes
//! applied inside that guard.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{EngineError, EngineResult, ShareLimitViolation};
use crate::models::ShareReceipts;
use crate::store::Entity;

/// XP/Points pair used across the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amounts {
    pub xp: u64,
    pub points: u64,
}

impl Amounts {
    pub const ZERO: Amounts = Amounts { xp: 0, points: 0 };

    pub fn new(xp: u64, points: u64) -> Self {
        Self { xp, points }
    }

    pub fn is_zero(&self) -> bool {
        self.xp == 0 && self.points == 0
    }
}

impl std::ops::Add for Amounts {
    type Output = Amounts;

    fn add(self, rhs: Amounts) -> Amounts {
        Amounts {
            xp: self.xp.saturating_add(rhs.xp),
            points: self.points.saturating_add(rhs.points),
        }
    }
}

impl std::ops::AddAssign for Amounts {
    fn add_assign(&mut self, rhs: Amounts) {
        *self = *self + rhs;
    }
}

/// Where a ledger credit came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditSource {
    Share,
    TournamentShare,
    Badge,
    ReferrerBonus,
    ReferredBonus,
}

/// An idempotent credit to a user's balances
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerCredit {
    /// Idempotency key, e.g. `share:<id>` or `referral:<id>:referrer`
    pub key: String,
    pub amounts: Amounts,
    pub source: CreditSource,
}

impl LedgerCredit {
    pub fn new(key: impl Into<String>, amounts: Amounts, source: CreditSource) -> Self {
        Self {
            key: key.into(),
            amounts,
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditOutcome {
    Applied,
    /// The key was already recorded; balances untouched
    Duplicate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralEarnings {
    pub xp: u64,
    pub points: u64,
}

/// Per-app share slots held on one calendar day
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyShareSlots {
    pub day: Option<NaiveDate>,
    /// app id -> ids of shares holding a slot
    pub held: BTreeMap<String, BTreeSet<String>>,
}

impl DailyShareSlots {
    pub fn held_for(&self, app_id: &str, day: NaiveDate) -> u32 {
        if self.day != Some(day) {
            return 0;
        }
        self.held
            .get(app_id)
            .map_or(0, |shares| u32::try_from(shares.len()).unwrap_or(u32::MAX))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub country: Option<String>,

    pub current_xp: u64,
    pub current_points: u64,
    pub total_xp_earned: u64,
    pub total_points_earned: u64,
    pub user_level: u32,

    pub sharing_streak_days: u32,
    pub longest_sharing_streak: u32,
    pub last_share_date: Option<NaiveDate>,
    pub total_shares: u64,
    pub categories_shared: BTreeSet<String>,
    pub tournaments_joined: u32,

    pub badges_ids: BTreeSet<String>,

    pub referral_count: u32,
    pub total_referrals_completed: u32,
    pub total_referral_earnings: ReferralEarnings,

    /// Idempotency keys of referral, badge and tournament credits
    pub credit_receipts: BTreeSet<String>,
    pub share_receipts: ShareReceipts,
    pub share_slots: DailyShareSlots,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            country: None,
            current_xp: 0,
            current_points: 0,
            total_xp_earned: 0,
            total_points_earned: 0,
            user_level: 1,
            sharing_streak_days: 0,
            longest_sharing_streak: 0,
            last_share_date: None,
            total_shares: 0,
            categories_shared: BTreeSet::new(),
            tournaments_joined: 0,
            badges_ids: BTreeSet::new(),
            referral_count: 0,
            total_referrals_completed: 0,
            total_referral_earnings: ReferralEarnings::default(),
            credit_receipts: BTreeSet::new(),
            share_receipts: ShareReceipts::default(),
            share_slots: DailyShareSlots::default(),
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn has_receipt(&self, key: &str) -> bool {
        self.credit_receipts.contains(key) || self.share_receipts.contains(key)
    }

    /// Credit balances once per idempotency key
    pub fn apply_credit(&mut self, credit: &LedgerCredit, xp_per_level: u64) -> CreditOutcome {
        if !self.credit_receipts.insert(credit.key.clone()) {
            return CreditOutcome::Duplicate;
        }
        self.credit_balances(credit, xp_per_level);
        CreditOutcome::Applied
    }

    /// Credit for a share; the receipt is kept only for `retention`
    pub fn apply_share_credit(
        &mut self,
        credit: &LedgerCredit,
        at: DateTime<Utc>,
        retention: Duration,
        xp_per_level: u64,
    ) -> CreditOutcome {
        if !self.share_receipts.record(&credit.key, at, retention) {
            return CreditOutcome::Duplicate;
        }
        self.credit_balances(credit, xp_per_level);
        CreditOutcome::Applied
    }

    fn credit_balances(&mut self, credit: &LedgerCredit, xp_per_level: u64) {
        self.current_xp = self.current_xp.saturating_add(credit.amounts.xp);
        self.current_points = self.current_points.saturating_add(credit.amounts.points);
        self.total_xp_earned = self.total_xp_earned.saturating_add(credit.amounts.xp);
        self.total_points_earned = self.total_points_earned.saturating_add(credit.amounts.points);

        if credit.source == CreditSource::ReferrerBonus {
            self.total_referral_earnings.xp =
                self.total_referral_earnings.xp.saturating_add(credit.amounts.xp);
            self.total_referral_earnings.points = self
                .total_referral_earnings
                .points
                .saturating_add(credit.amounts.points);
        }

        self.refresh_level(xp_per_level);
        self.updated_at = Utc::now();
    }

    /// Hold one of the app's daily share slots for `share_id`; holding twice is a no-op
    pub fn reserve_share_slot(
        &mut self,
        app_id: &str,
        share_id: &str,
        day: NaiveDate,
        daily_limit: u32,
    ) -> EngineResult<()> {
        if self.share_slots.day != Some(day) {
            self.share_slots = DailyShareSlots {
                day: Some(day),
                held: BTreeMap::new(),
            };
        }
        let held = self.share_slots.held.entry(app_id.to_string()).or_default();
        if held.contains(share_id) {
            return Ok(());
        }
        if u32::try_from(held.len()).unwrap_or(u32::MAX) >= daily_limit {
            return Err(EngineError::LimitExceeded(
                ShareLimitViolation::UserDailyLimitExceeded,
            ));
        }
        held.insert(share_id.to_string());
        Ok(())
    }

    /// Give a slot back after the share failed downstream
    pub fn release_share_slot(&mut self, app_id: &str, share_id: &str, day: NaiveDate) -> bool {
        if self.share_slots.day != Some(day) {
            return false;
        }
        self.share_slots
            .held
            .get_mut(app_id)
            .is_some_and(|held| held.remove(share_id))
    }

    /// Level derived from lifetime XP; never goes down
    pub fn refresh_level(&mut self, xp_per_level: u64) {
        if xp_per_level == 0 {
            return;
        }
        let earned = 1 + self.total_xp_earned / xp_per_level;
        let earned = u32::try_from(earned).unwrap_or(u32::MAX);
        self.user_level = self.user_level.max(earned);
    }

    /// Advance the sharing streak for a share made on `day`
    pub fn record_share_day(&mut self, day: NaiveDate) {
        match self.last_share_date {
            None => self.sharing_streak_days = 1,
            Some(last) if day <= last => {}
            Some(last) if day == last + Duration::days(1) => {
                self.sharing_streak_days = self.sharing_streak_days.saturating_add(1);
            }
            Some(_) => self.sharing_streak_days = 1,
        }

        if self.last_share_date.map_or(true, |last| day > last) {
            self.last_share_date = Some(day);
        }
        self.longest_sharing_streak = self.longest_sharing_streak.max(self.sharing_streak_days);
    }

    /// Streak as seen on `today`: broken streaks read as zero
    pub fn current_streak(&self, today: NaiveDate) -> u32 {
        match self.last_share_date {
            Some(last) if last >= today - Duration::days(1) => self.sharing_streak_days,
            _ => 0,
        }
    }

    /// Admin adjustment or refund. Only current balances move; lifetime totals never decrease.
    pub fn adjust_balance(&mut self, xp_delta: i64, points_delta: i64) -> EngineResult<()> {
        let xp = apply_delta(self.current_xp, xp_delta)
            .ok_or_else(|| EngineError::Validation("XP adjustment below zero".to_string()))?;
        let points = apply_delta(self.current_points, points_delta)
            .ok_or_else(|| EngineError::Validation("Points adjustment below zero".to_string()))?;

        if xp > self.current_xp || points > self.current_points {
            return Err(EngineError::Validation(
                "Adjustments may only reduce balances; use a credit to add".to_string(),
            ));
        }

        self.current_xp = xp;
        self.current_points = points;
        self.updated_at = Utc::now();
        Ok(())
    }
}

fn apply_delta(value: u64, delta: i64) -> Option<u64> {
    if delta >= 0 {
        value.checked_add(delta.unsigned_abs())
    } else {
        value.checked_sub(delta.unsigned_abs())
    }
}

impl Entity for User {
    const KIND: &'static str = "user";

    fn entity_id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}
