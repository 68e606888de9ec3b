//! Referral Manager - Lifecycle Orchestrator
//!
//! Owns every persisted referral mutation: creation, progress, fraud marking,
//! bonus disbursement, completion and expiry. Each save runs through a guarded
//! update and re-evaluates automatic activation.
//!
//! Bonus disbursement credits the beneficiary first, keyed by
//! `referral:<id>:<side>`, then flips the `*_rewarded` flag under its own guard.
//! A retry after a crash between the two steps finds the credit receipt and
//! only flips the flag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::fraud::FraudFlag;
use crate::models::{Amounts, CreditOutcome, LedgerCredit, User};
use crate::referral::{
    ActivationCriteria, EligibilityReport, ProgressUpdate, Referral, ReferralStatus,
    ReferralSummary, RewardSide,
};
use crate::store::{guarded_update, require, ReferralRepository, Repository, UserRepository};

#[derive(Debug, Clone)]
pub struct ReferralSettings {
    pub criteria: ActivationCriteria,
    pub referrer_bonus: Amounts,
    pub referred_bonus: Amounts,
    pub expiry_days: u32,
    pub xp_per_level: u64,
    pub max_cas_retries: u32,
}

impl Default for ReferralSettings {
    fn default() -> Self {
        Self {
            criteria: ActivationCriteria::default(),
            referrer_bonus: Amounts::new(500, 100),
            referred_bonus: Amounts::new(250, 50),
            expiry_days: 30,
            xp_per_level: 1000,
            max_cas_retries: 8,
        }
    }
}

/// Result of one expiry sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirySweepReport {
    pub scanned: usize,
    pub expired: usize,
    /// Referrals that changed state between the scan and the update
    pub skipped: usize,
    pub failed: usize,
}

pub struct ReferralManager {
    users: Arc<dyn UserRepository>,
    referrals: Arc<dyn ReferralRepository>,
    settings: ReferralSettings,
}

impl ReferralManager {
    pub fn new(
        users: Arc<dyn UserRepository>,
        referrals: Arc<dyn ReferralRepository>,
        settings: ReferralSettings,
    ) -> Self {
        Self {
            users,
            referrals,
            settings,
        }
    }

    pub fn settings(&self) -> &ReferralSettings {
        &self.settings
    }

    /// Save path shared by every mutation: apply, then evaluate activation
    async fn save<R, F>(
        &self,
        referral_id: &str,
        now: DateTime<Utc>,
        mut apply: F,
    ) -> EngineResult<(Referral, R)>
    where
        R: Send,
        F: FnMut(&mut Referral) -> EngineResult<R> + Send,
    {
        let (referral, (outcome, activated)) = guarded_update(
            self.referrals.as_ref(),
            referral_id,
            self.settings.max_cas_retries,
            |referral: &mut Referral| {
                let outcome = apply(referral)?;
                let activated = referral.refresh_activation(now);
                Ok((outcome, activated))
            },
        )
        .await?;

        if activated {
            info!(
                referral_id = %referral.id,
                referred_id = %referral.referred_id,
                "Referral activated"
            );
        }
        Ok((referral, outcome))
    }

    /// Register a referral of `referred_id` by `referrer_id`
    pub async fn create_referral(
        &self,
        referrer_id: &str,
        referred_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Referral> {
        if referrer_id == referred_id {
            return Err(EngineError::Validation(
                "a user cannot refer themselves".to_string(),
            ));
        }
        let _: User = require(self.users.as_ref(), referrer_id).await?;
        let _: User = require(self.users.as_ref(), referred_id).await?;

        let referral = Referral::new(
            referrer_id,
            referred_id,
            self.settings.criteria.clone(),
            self.settings.referrer_bonus,
            self.settings.referred_bonus,
            self.settings.expiry_days,
            now,
        );

        if !self.referrals.insert(referral.clone()).await? {
            return Err(EngineError::NotEligible(format!(
                "user {} already has a referral",
                referred_id
            )));
        }

        let key = format!("referral:{}:registered", referral.id);
        guarded_update(
            self.users.as_ref(),
            referrer_id,
            self.settings.max_cas_retries,
            |user: &mut User| {
                if user.credit_receipts.insert(key.clone()) {
                    user.referral_count = user.referral_count.saturating_add(1);
                }
                Ok(())
            },
        )
        .await?;

        info!(
            referral_id = %referral.id,
            referrer_id = %referrer_id,
            referred_id = %referred_id,
            "Referral created"
        );
        Ok(referral)
    }

    pub async fn get(&self, referral_id: &str) -> EngineResult<Referral> {
        require(self.referrals.as_ref(), referral_id).await
    }

    pub async fn find_by_referred(&self, referred_id: &str) -> EngineResult<Option<Referral>> {
        self.referrals.find_by_referred(referred_id).await
    }

    pub async fn referrals_of(&self, referrer_id: &str) -> EngineResult<Vec<Referral>> {
        self.referrals.find_by_referrer(referrer_id).await
    }

    pub async fn update_progress(
        &self,
        referral_id: &str,
        update: &ProgressUpdate,
        now: DateTime<Utc>,
    ) -> EngineResult<Referral> {
        let (referral, _) = self
            .save(referral_id, now, |referral| referral.apply_progress(update))
            .await?;
        debug!(
            referral_id = %referral.id,
            progress = referral.activation_percentage(),
            "Referral progress updated"
        );
        Ok(referral)
    }

    /// Forward a referred user's activity to their referral, if it is still open
    pub async fn record_activity_for_referred(
        &self,
        referred_id: &str,
        update: &ProgressUpdate,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<Referral>> {
        let Some(referral) = self.referrals.find_by_referred(referred_id).await? else {
            return Ok(None);
        };
        if referral.status.is_terminal() {
            return Ok(None);
        }

        match self.update_progress(&referral.id, update, now).await {
            Ok(referral) => Ok(Some(referral)),
            // lost a race with expiry, fraud marking or completion
            Err(EngineError::NotEligible(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn mark_as_fraudulent(
        &self,
        referral_id: &str,
        fraud_score: u8,
        flags: Vec<FraudFlag>,
        reviewer: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Referral> {
        let (referral, _) = self
            .save(referral_id, now, |referral| {
                referral.mark_fraudulent(fraud_score, flags.clone(), reviewer, now)
            })
            .await?;
        warn!(
            referral_id = %referral.id,
            score = fraud_score,
            reviewer = %reviewer,
            "Referral marked as fraudulent"
        );
        Ok(referral)
    }

    pub async fn award_referrer_bonus(
        &self,
        referral_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Referral> {
        self.award(referral_id, RewardSide::Referrer, now).await
    }

    pub async fn award_referred_bonus(
        &self,
        referral_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Referral> {
        self.award(referral_id, RewardSide::Referred, now).await
    }

    async fn award(
        &self,
        referral_id: &str,
        side: RewardSide,
        now: DateTime<Utc>,
    ) -> EngineResult<Referral> {
        let referral = self.get(referral_id).await?;
        referral.ensure_awardable(side)?;

        let credit = LedgerCredit::new(
            referral.credit_key(side),
            referral.bonus_for(side),
            side.credit_source(),
        );
        let xp_per_level = self.settings.xp_per_level;
        let (_, credited) = guarded_update(
            self.users.as_ref(),
            referral.beneficiary(side),
            self.settings.max_cas_retries,
            |user: &mut User| Ok(user.apply_credit(&credit, xp_per_level)),
        )
        .await?;

        match self
            .save(referral_id, now, |referral| referral.mark_rewarded(side, now))
            .await
        {
            Ok((referral, _)) => {
                info!(
                    referral_id = %referral.id,
                    side = side.as_str(),
                    user_id = %referral.beneficiary(side),
                    xp = credit.amounts.xp,
                    points = credit.amounts.points,
                    "Referral bonus awarded"
                );
                Ok(referral)
            }
            Err(EngineError::NotEligible(reason)) if credited == CreditOutcome::Applied => {
                warn!(
                    referral_id = %referral_id,
                    side = side.as_str(),
                    reason = %reason,
                    "Referral left active state after the bonus was credited"
                );
                Err(EngineError::NotEligible(reason))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn complete_referral(
        &self,
        referral_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Referral> {
        let (referral, _) = self
            .save(referral_id, now, |referral| {
                referral.transition(ReferralStatus::Completed, now)
            })
            .await?;

        let key = format!("referral:{}:completed", referral.id);
        guarded_update(
            self.users.as_ref(),
            &referral.referrer_id,
            self.settings.max_cas_retries,
            |user: &mut User| {
                if user.credit_receipts.insert(key.clone()) {
                    user.total_referrals_completed =
                        user.total_referrals_completed.saturating_add(1);
                }
                Ok(())
            },
        )
        .await?;

        info!(referral_id = %referral.id, "Referral completed");
        Ok(referral)
    }

    /// Referrer bonus, then referred bonus, then completion; sides already paid are skipped
    pub async fn process_both_rewards(
        &self,
        referral_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Referral> {
        let mut referral = self.get(referral_id).await?;
        if referral.status == ReferralStatus::Completed
            && referral.is_rewarded(RewardSide::Referrer)
            && referral.is_rewarded(RewardSide::Referred)
        {
            return Ok(referral);
        }

        for side in [RewardSide::Referrer, RewardSide::Referred] {
            if referral.is_rewarded(side) {
                continue;
            }
            referral = match self.award(referral_id, side, now).await {
                Ok(referral) => referral,
                Err(EngineError::AlreadyAwarded(_)) => self.get(referral_id).await?,
                Err(e) => return Err(e),
            };
        }

        match self.complete_referral(referral_id, now).await {
            Ok(referral) => Ok(referral),
            Err(EngineError::NotEligible(_)) => {
                let current = self.get(referral_id).await?;
                if current.status == ReferralStatus::Completed {
                    Ok(current)
                } else {
                    Err(EngineError::NotEligible(format!(
                        "referral {} is {}, cannot complete",
                        current.id, current.status
                    )))
                }
            }
            Err(e) => Err(e),
        }
    }

    pub async fn validate_eligibility(
        &self,
        referral_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<EligibilityReport> {
        Ok(self.get(referral_id).await?.validate_eligibility(now))
    }

    pub async fn get_summary(
        &self,
        referral_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<ReferralSummary> {
        Ok(self.get(referral_id).await?.summary(now))
    }

    /// Move every pending referral past `expires_at` to expired
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> EngineResult<ExpirySweepReport> {
        let candidates = self.referrals.list_expirable(now).await?;
        let mut report = ExpirySweepReport {
            scanned: candidates.len(),
            ..ExpirySweepReport::default()
        };

        for candidate in candidates {
            let result = guarded_update(
                self.referrals.as_ref(),
                &candidate.id,
                self.settings.max_cas_retries,
                |referral: &mut Referral| {
                    if referral.status != ReferralStatus::Pending || !referral.is_expired(now) {
                        return Ok(false);
                    }
                    referral.transition(ReferralStatus::Expired, now)?;
                    Ok(true)
                },
            )
            .await;

            match result {
                Ok((_, true)) => report.expired += 1,
                Ok((_, false)) => report.skipped += 1,
                Err(e) => {
                    warn!(referral_id = %candidate.id, error = %e, "Failed to expire referral");
                    report.failed += 1;
                }
            }
        }

        if report.expired > 0 {
            info!(
                scanned = report.scanned,
                expired = report.expired,
                "Expired stale referrals"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRepository;
    use chrono::Duration;

    struct Fixture {
        manager: Arc<ReferralManager>,
        users: Arc<MemoryRepository<User>>,
    }

    async fn fixture() -> Fixture {
        let users = Arc::new(MemoryRepository::<User>::new());
        users.insert(User::new("alice")).await.unwrap();
        users.insert(User::new("bob")).await.unwrap();
        let referrals = Arc::new(MemoryRepository::<Referral>::new());
        let manager = Arc::new(ReferralManager::new(
            users.clone(),
            referrals,
            ReferralSettings::default(),
        ));
        Fixture { manager, users }
    }

    fn full_progress(at: DateTime<Utc>) -> ProgressUpdate {
        ProgressUpdate {
            shares: 5,
            xp: 100,
            points: 10,
            activity_at: at,
        }
    }

    async fn active_referral(f: &Fixture, now: DateTime<Utc>) -> Referral {
        let referral = f.manager.create_referral("alice", "bob", now).await.unwrap();
        let mut current = referral;
        for day in 0..7 {
            current = f
                .manager
                .update_progress(&current.id, &full_progress(now + Duration::days(day)), now)
                .await
                .unwrap();
        }
        assert_eq!(current.status, ReferralStatus::Active);
        current
    }

    #[tokio::test]
    async fn test_create_rejects_self_and_duplicates() {
        let f = fixture().await;
        let now = Utc::now();
        assert!(matches!(
            f.manager.create_referral("alice", "alice", now).await,
            Err(EngineError::Validation(_))
        ));
        f.manager.create_referral("alice", "bob", now).await.unwrap();
        assert!(matches!(
            f.manager.create_referral("alice", "bob", now).await,
            Err(EngineError::NotEligible(_))
        ));
        assert!(matches!(
            f.manager.create_referral("alice", "carol", now).await,
            Err(EngineError::NotFound { .. })
        ));

        let alice = f.users.get("alice").await.unwrap().unwrap();
        assert_eq!(alice.referral_count, 1);
    }

    #[tokio::test]
    async fn test_concurrent_referrer_awards_pay_once() {
        let f = fixture().await;
        let now = Utc::now();
        let referral = active_referral(&f, now).await;

        let a = {
            let manager = f.manager.clone();
            let id = referral.id.clone();
            tokio::spawn(async move { manager.award_referrer_bonus(&id, now).await })
        };
        let b = {
            let manager = f.manager.clone();
            let id = referral.id.clone();
            tokio::spawn(async move { manager.award_referrer_bonus(&id, now).await })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];

        let ok = results.iter().filter(|r| r.is_ok()).count();
        let dup = results
            .iter()
            .filter(|r| matches!(r, Err(EngineError::AlreadyAwarded(_))))
            .count();
        assert_eq!((ok, dup), (1, 1));

        let alice = f.users.get("alice").await.unwrap().unwrap();
        assert_eq!(alice.current_xp, 500);
        assert_eq!(alice.current_points, 100);
        assert_eq!(alice.total_referral_earnings.xp, 500);
    }

    #[tokio::test]
    async fn test_award_requires_active() {
        let f = fixture().await;
        let now = Utc::now();
        let referral = f.manager.create_referral("alice", "bob", now).await.unwrap();
        assert!(matches!(
            f.manager.award_referred_bonus(&referral.id, now).await,
            Err(EngineError::NotEligible(_))
        ));
        let bob = f.users.get("bob").await.unwrap().unwrap();
        assert_eq!(bob.current_xp, 0);
    }

    #[tokio::test]
    async fn test_process_both_rewards_resumes_after_partial_failure() {
        let f = fixture().await;
        let now = Utc::now();
        let referral = active_referral(&f, now).await;

        // referrer paid in an earlier attempt that never finished
        f.manager
            .award_referrer_bonus(&referral.id, now)
            .await
            .unwrap();

        let done = f
            .manager
            .process_both_rewards(&referral.id, now)
            .await
            .unwrap();
        assert_eq!(done.status, ReferralStatus::Completed);
        assert!(done.rewards.referrer_rewarded && done.rewards.referred_rewarded);

        let again = f
            .manager
            .process_both_rewards(&referral.id, now)
            .await
            .unwrap();
        assert_eq!(again.status, ReferralStatus::Completed);

        let alice = f.users.get("alice").await.unwrap().unwrap();
        let bob = f.users.get("bob").await.unwrap().unwrap();
        assert_eq!(alice.current_xp, 500);
        assert_eq!(alice.total_referrals_completed, 1);
        assert_eq!(bob.current_xp, 250);
        assert_eq!(bob.current_points, 50);
    }

    #[tokio::test]
    async fn test_expiry_sweep_is_idempotent() {
        let f = fixture().await;
        let created = Utc::now() - Duration::days(31);
        let referral = f
            .manager
            .create_referral("alice", "bob", created)
            .await
            .unwrap();

        let now = Utc::now();
        let first = f.manager.expire_stale(now).await.unwrap();
        assert_eq!(first.expired, 1);
        let second = f.manager.expire_stale(now).await.unwrap();
        assert_eq!(second.scanned, 0);

        let expired = f.manager.get(&referral.id).await.unwrap();
        assert_eq!(expired.status, ReferralStatus::Expired);
        assert!(f
            .manager
            .mark_as_fraudulent(&referral.id, 90, vec![], "admin", now)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_fraudulent_referral_stops_progress() {
        let f = fixture().await;
        let now = Utc::now();
        let referral = f.manager.create_referral("alice", "bob", now).await.unwrap();
        let marked = f
            .manager
            .mark_as_fraudulent(&referral.id, 120, vec![FraudFlag::ReferralRing], "admin", now)
            .await
            .unwrap();
        assert_eq!(marked.fraud_detection.fraud_score, 100);
        assert!(marked.fraud_detection.is_suspicious);

        let forwarded = f
            .manager
            .record_activity_for_referred("bob", &full_progress(now), now)
            .await
            .unwrap();
        assert!(forwarded.is_none());
    }
}
