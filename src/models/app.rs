//! Catalog apps and their share budgets

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{EngineError, EngineResult, ShareLimitViolation};
use crate::models::{Amounts, ShareReceipts};
use crate::store::Entity;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareRules {
    pub daily_user_limit: u32,
    pub daily_global_limit: u32,
    pub cooldown_minutes: u32,
    pub min_user_level: u32,
}

impl Default for ShareRules {
    fn default() -> Self {
        Self {
            daily_user_limit: 10,
            daily_global_limit: 10_000,
            cooldown_minutes: 0,
            min_user_level: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonetizationConfig {
    pub budget_total: f64,
    /// Zero disables the daily cap
    pub budget_daily: f64,
    pub cost_per_xp: f64,
    pub cost_per_point: f64,
}

impl Default for MonetizationConfig {
    fn default() -> Self {
        Self {
            budget_total: 0.0,
            budget_daily: 0.0,
            cost_per_xp: 0.0,
            cost_per_point: 0.0,
        }
    }
}

impl MonetizationConfig {
    pub fn cost_of(&self, amounts: Amounts) -> f64 {
        amounts.xp as f64 * self.cost_per_xp + amounts.points as f64 * self.cost_per_point
    }
}

/// Spend accumulated on a single calendar day
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailySpend {
    pub day: NaiveDate,
    pub spent: f64,
}

/// A budget debit for one rewarded share
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppDebit {
    pub key: String,
    pub amounts: Amounts,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebitOutcome {
    Applied,
    Duplicate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    pub id: String,
    pub name: String,
    pub categories: BTreeSet<String>,
    pub is_active: bool,

    pub app_xp: u64,
    pub app_points: u64,
    pub share_rules: ShareRules,
    pub monetization_config: MonetizationConfig,

    pub total_shared: u64,
    pub total_xp_allocated: u64,
    pub total_points_allocated: u64,
    pub total_points_spent: f64,
    pub daily_spend: Option<DailySpend>,

    /// Idempotency keys of debits inside the retention window
    pub debit_receipts: ShareReceipts,

    pub created_at: DateTime<Utc>,
    pub version: u64,
}

impl App {
    pub fn new(id: impl Into<String>, app_xp: u64, app_points: u64) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            categories: BTreeSet::new(),
            is_active: true,
            app_xp,
            app_points,
            share_rules: ShareRules::default(),
            monetization_config: MonetizationConfig::default(),
            total_shared: 0,
            total_xp_allocated: 0,
            total_points_allocated: 0,
            total_points_spent: 0.0,
            daily_spend: None,
            debit_receipts: ShareReceipts::default(),
            created_at: Utc::now(),
            version: 0,
        }
    }

    pub fn base_amounts(&self) -> Amounts {
        Amounts::new(self.app_xp, self.app_points)
    }

    pub fn cost_per_share(&self) -> f64 {
        self.monetization_config.cost_of(self.base_amounts())
    }

    pub fn remaining_budget(&self) -> f64 {
        (self.monetization_config.budget_total - self.total_points_spent).max(0.0)
    }

    pub fn spent_on(&self, day: NaiveDate) -> f64 {
        match &self.daily_spend {
            Some(spend) if spend.day == day => spend.spent,
            _ => 0.0,
        }
    }

    /// Debit the budget for a rewarded share; never lets spend pass the totals
    pub fn apply_debit(
        &mut self,
        debit: &AppDebit,
        retention: Duration,
    ) -> EngineResult<DebitOutcome> {
        if self.debit_receipts.contains(&debit.key) {
            return Ok(DebitOutcome::Duplicate);
        }

        let cost = self.monetization_config.cost_of(debit.amounts);
        if !cost.is_finite() || cost < 0.0 {
            return Err(EngineError::Validation(format!(
                "App {} has an invalid cost configuration",
                self.id
            )));
        }

        if self.total_points_spent + cost > self.monetization_config.budget_total {
            return Err(EngineError::LimitExceeded(
                ShareLimitViolation::InsufficientBudget,
            ));
        }

        let day = debit.at.date_naive();
        let daily_cap = self.monetization_config.budget_daily;
        let spent_today = self.spent_on(day);
        if daily_cap > 0.0 && spent_today + cost > daily_cap {
            return Err(EngineError::LimitExceeded(
                ShareLimitViolation::DailyBudgetExceeded,
            ));
        }

        self.total_points_spent += cost;
        self.daily_spend = Some(DailySpend {
            day,
            spent: spent_today + cost,
        });
        self.total_shared += 1;
        self.total_xp_allocated = self.total_xp_allocated.saturating_add(debit.amounts.xp);
        self.total_points_allocated = self
            .total_points_allocated
            .saturating_add(debit.amounts.points);
        self.debit_receipts.record(&debit.key, debit.at, retention);

        Ok(DebitOutcome::Applied)
    }
}

impl Entity for App {
    const KIND: &'static str = "app";

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

#[cfg(test)]
mod tests {
    use super::*;

    fn funded_app() -> App {
        let mut app = App::new("app_1", 50, 10);
        app.monetization_config = MonetizationConfig {
            budget_total: 10.0,
            budget_daily: 0.0,
            cost_per_xp: 0.01,
            cost_per_point: 0.1,
        };
        app
    }

    fn today() -> DateTime<Utc> {
        NaiveDate::from_ymd_opt(2026, 5, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
            .and_utc()
    }

    fn week() -> Duration {
        Duration::days(7)
    }

    #[test]
    fn test_cost_per_share() {
        let app = funded_app();
        assert!((app.cost_per_share() - 1.5).abs() < 1e-9);
        assert!((app.remaining_budget() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_debit_respects_total_budget() {
        let mut app = funded_app();
        for i in 0..6 {
            let debit = AppDebit {
                key: format!("share:{}", i),
                amounts: app.base_amounts(),
                at: today(),
            };
            assert_eq!(app.apply_debit(&debit, week()).unwrap(), DebitOutcome::Applied);
        }

        let debit = AppDebit {
            key: "share:overflow".to_string(),
            amounts: app.base_amounts(),
            at: today(),
        };
        assert_eq!(
            app.apply_debit(&debit, week()),
            Err(EngineError::LimitExceeded(ShareLimitViolation::InsufficientBudget))
        );
        assert!(app.total_points_spent <= app.monetization_config.budget_total);
        assert_eq!(app.total_shared, 6);
    }

    #[test]
    fn test_duplicate_debit_is_noop() {
        let mut app = funded_app();
        let debit = AppDebit {
            key: "share:1".to_string(),
            amounts: app.base_amounts(),
            at: today(),
        };
        app.apply_debit(&debit, week()).unwrap();
        assert_eq!(app.apply_debit(&debit, week()).unwrap(), DebitOutcome::Duplicate);
        assert_eq!(app.total_shared, 1);
    }

    #[test]
    fn test_daily_budget_cap() {
        let mut app = funded_app();
        app.monetization_config.budget_daily = 2.0;
        let first = AppDebit {
            key: "a".to_string(),
            amounts: app.base_amounts(),
            at: today(),
        };
        app.apply_debit(&first, week()).unwrap();
        let second = AppDebit {
            key: "b".to_string(),
            amounts: app.base_amounts(),
            at: today(),
        };
        assert_eq!(
            app.apply_debit(&second, week()),
            Err(EngineError::LimitExceeded(ShareLimitViolation::DailyBudgetExceeded))
        );

        let next_day = AppDebit {
            key: "c".to_string(),
            amounts: app.base_amounts(),
            at: today() + Duration::days(1),
        };
        assert_eq!(app.apply_debit(&next_day, week()).unwrap(), DebitOutcome::Applied);
    }

    #[test]
    fn test_debit_receipts_are_bounded() {
        let mut app = App::new("app_1", 50, 10);
        app.monetization_config.budget_total = 1_000_000.0;
        app.monetization_config.cost_per_point = 0.1;
        for i in 0..30 {
            let debit = AppDebit {
                key: format!("share:{}", i),
                amounts: app.base_amounts(),
                at: today() + Duration::days(i),
            };
            assert_eq!(
                app.apply_debit(&debit, Duration::days(2)).unwrap(),
                DebitOutcome::Applied
            );
        }
        assert_eq!(app.total_shared, 30);
        assert_eq!(app.debit_receipts.len(), 3);
        assert!(app.debit_receipts.contains("share:29"));
    }
}
