//! Reward Engine - Share Pipeline Orchestrator
//!
//! ```text
//! share ─► limit gate ─► fraud gate ─► calculator ─► app debit ─► user credit
//!                                                                     │
//!        notification ◄─ referral progress ◄─ badges ◄─ share verified ◄┘
//! ```
//!
//! Every write is keyed by the share id (`share:<id>`), so re-running the
//! pipeline after a partial failure only finishes the steps that did not land.
//! Those per-share receipts are kept for the configured retention window, and
//! a pending share older than the window is refused instead of resumed.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::badges::{BadgeAward, BadgeEvaluator, BadgeTrigger};
use crate::config::{sanitize_for_logging, EngineConfig};
use crate::error::{EngineError, EngineResult, ShareLimitViolation};
use crate::fraud::{
    AutomaticAction, FraudAnalysis, FraudContext, FraudEntityType, FraudFlag, FraudScorer,
    PriorShare, ShareRiskContext, UserRiskContext,
};
use crate::models::{
    Amounts, App, AppDebit, CreditOutcome, CreditSource, LedgerCredit, ShareEvent, Tournament,
    User, ValidationStatus,
};
use crate::referral::{
    ExpirySweepReport, ProgressUpdate, Referral, ReferralManager, ReferralStatus, RewardSide,
};
use crate::rewards::{
    RewardCalculator, RewardFailure, ShareLimitValidator, ShareRewards, ShareType,
    ShareVerification,
};
use crate::store::{guarded_update, require, Repository, Store};

/// Reviewer recorded when the engine itself marks a referral fraudulent
pub const FRAUD_SCORER_REVIEWER: &str = "fraud_scorer";

/// How far back user risk signals look
const USER_SIGNAL_WINDOW_DAYS: i64 = 90;

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ShareReward,
    BadgeAwarded,
    ReferralBonus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardNotification {
    pub user_id: String,
    pub kind: NotificationKind,
    pub amounts: Amounts,
    /// Share, badge or referral id the reward belongs to
    pub reference: String,
    pub issued_at: DateTime<Utc>,
}

/// Fire-and-forget hand-off; failures never roll back a reward
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(&self, notification: RewardNotification) -> anyhow::Result<()>;
}

/// Writes notifications to the log
pub struct TracingDispatcher;

#[async_trait]
impl NotificationDispatcher for TracingDispatcher {
    async fn dispatch(&self, notification: RewardNotification) -> anyhow::Result<()> {
        let payload = serde_json::to_string(&notification)?;
        info!(
            user_id = %notification.user_id,
            kind = ?notification.kind,
            payload = %payload,
            "Reward notification"
        );
        Ok(())
    }
}

// ============================================================================
// Pipeline types
// ============================================================================

/// Data reported when a share link is verified
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub verified_at: DateTime<Utc>,
    pub clicks: u32,
    pub conversions: u32,
    /// Set by the edge when the request came through a known proxy or VPN
    pub ip_is_proxy: bool,
}

impl VerificationRequest {
    pub fn at(verified_at: DateTime<Utc>) -> Self {
        Self {
            verified_at,
            clicks: 0,
            conversions: 0,
            ip_is_proxy: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ShareOutcome {
    Rewarded {
        share_id: String,
        rewards: ShareRewards,
        fraud_score: u8,
        flagged: bool,
        badges: Vec<BadgeAward>,
        referral_status: Option<ReferralStatus>,
    },
    /// Fraud gate chose `limit`: no reward, share stays pending for review
    Held {
        share_id: String,
        fraud_score: u8,
        report_id: Option<String>,
    },
    /// Fraud gate chose `block`
    Rejected {
        share_id: String,
        fraud_score: u8,
        fraud_flags: Vec<FraudFlag>,
    },
}

/// Result of a fraud screen of a referral's referred user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralScreening {
    pub analysis: FraudAnalysis,
    pub referral: Referral,
}

fn share_key(share_id: &str) -> String {
    format!("share:{}", share_id)
}

// ============================================================================
// Engine
// ============================================================================

pub struct RewardEngine {
    store: Store,
    limits: ShareLimitValidator,
    calculator: RewardCalculator,
    fraud: Arc<FraudScorer>,
    badges: Arc<BadgeEvaluator>,
    referrals: Arc<ReferralManager>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    xp_per_level: u64,
    max_cas_retries: u32,
    receipt_retention: Duration,
    sanitize_logs: bool,
}

impl RewardEngine {
    pub fn new(store: Store, config: &EngineConfig) -> Self {
        let retries = config.store.max_cas_retries;
        let xp_per_level = config.rewards.xp_per_level;

        let referrals = ReferralManager::new(
            store.users.clone(),
            store.referrals.clone(),
            config.referral.to_settings(xp_per_level, retries),
        );
        let fraud = FraudScorer::new(
            store.fraud_reports.clone(),
            config.fraud.to_scorer_settings(retries),
        );

        Self {
            limits: ShareLimitValidator::new(
                store.users.clone(),
                store.apps.clone(),
                store.shares.clone(),
            ),
            calculator: RewardCalculator::new(config.rewards.to_settings()),
            fraud: Arc::new(fraud),
            badges: Arc::new(BadgeEvaluator::new(
                store.users.clone(),
                store.badges.clone(),
                xp_per_level,
                retries,
            )),
            referrals: Arc::new(referrals),
            dispatcher: Arc::new(TracingDispatcher),
            xp_per_level,
            max_cas_retries: retries,
            receipt_retention: Duration::hours(i64::from(config.store.receipt_retention_hours)),
            sanitize_logs: config.logging.sanitize_logs,
            store,
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn referrals(&self) -> Arc<ReferralManager> {
        self.referrals.clone()
    }

    pub fn fraud(&self) -> Arc<FraudScorer> {
        self.fraud.clone()
    }

    pub fn limits(&self) -> &ShareLimitValidator {
        &self.limits
    }

    pub fn calculator(&self) -> &RewardCalculator {
        &self.calculator
    }

    pub fn badges(&self) -> Arc<BadgeEvaluator> {
        self.badges.clone()
    }

    fn redact(&self, value: &str) -> String {
        if self.sanitize_logs {
            sanitize_for_logging(value)
        } else {
            value.to_string()
        }
    }

    /// Register a share attempt; the record stays pending until verified
    pub async fn record_share(&self, share: ShareEvent) -> EngineResult<ShareEvent> {
        if !self.store.shares.insert(share.clone()).await? {
            return Err(EngineError::Validation(format!(
                "share {} already exists",
                share.id
            )));
        }
        debug!(
            share_id = %share.id,
            user_id = %share.user_id,
            app_id = %share.app_id,
            "Share recorded"
        );
        Ok(share)
    }

    /// Verify a share and issue its rewards
    pub async fn process_share(
        &self,
        share_id: &str,
        request: &VerificationRequest,
    ) -> EngineResult<ShareOutcome> {
        let now = request.verified_at;
        let share: ShareEvent = require(self.store.shares.as_ref(), share_id).await?;
        match share.validation_status {
            ValidationStatus::Pending => {}
            ValidationStatus::Verified => {
                return Err(EngineError::AlreadyAwarded(format!(
                    "share {} is already verified",
                    share.id
                )))
            }
            ValidationStatus::Rejected => {
                return Err(EngineError::NotEligible(format!(
                    "share {} was rejected",
                    share.id
                )))
            }
        }

        if now - share.created_at > self.receipt_retention {
            self.reject_share(&share.id, "verification_window_elapsed", None)
                .await;
            return Err(EngineError::NotEligible(format!(
                "share {} is older than the verification window",
                share.id
            )));
        }

        let key = share_key(&share.id);
        let user = self.store.users.get(&share.user_id).await?;
        let app = self.store.apps.get(&share.app_id).await?;
        let resuming = user.as_ref().is_some_and(|u| u.has_receipt(&key))
            || app.as_ref().is_some_and(|a| a.debit_receipts.contains(&key));

        let (fraud_score, flagged) = if resuming {
            info!(share_id = %share.id, "Resuming partially processed share");
            (share.fraud_score.unwrap_or(0), share.flagged)
        } else {
            self.gate_limits(&share, user.as_ref(), app.as_ref(), now)
                .await?;
            match self.gate_fraud(&share, request).await? {
                Ok(passed) => passed,
                Err(outcome) => return Ok(outcome),
            }
        };

        let user = user.ok_or_else(|| EngineError::not_found("user", &share.user_id))?;
        let app = app.ok_or_else(|| EngineError::not_found("app", &share.app_id))?;
        if !resuming {
            self.reserve_slot(&share, &app, fraud_score, now).await?;
        }

        let charged = self.charge_app(&share, &user, &app, fraud_score, now).await;
        let rewards = match charged {
            Ok(rewards) => rewards,
            Err(e) => {
                if !resuming {
                    self.release_slot(&share, now).await;
                }
                return Err(e);
            }
        };
        let amounts = rewards.amounts();

        let is_tournament = rewards.breakdown.share_type == ShareType::Tournament;
        self.credit_user(&share, &app, amounts, is_tournament, now)
            .await?;

        guarded_update(
            self.store.shares.as_ref(),
            &share.id,
            self.max_cas_retries,
            |record: &mut ShareEvent| {
                record.verify(fraud_score, flagged, now)?;
                record.record_engagement(request.clicks, request.conversions);
                Ok(())
            },
        )
        .await?;

        info!(
            share_id = %share.id,
            user_id = %share.user_id,
            xp = amounts.xp,
            points = amounts.points,
            fraud_score = fraud_score,
            flagged = flagged,
            "Share rewarded"
        );

        let trigger = if is_tournament {
            BadgeTrigger::Tournament
        } else {
            BadgeTrigger::Share
        };
        let badges = match self.badges.evaluate_and_award(&share.user_id, trigger, now).await {
            Ok(badges) => badges,
            Err(e) => {
                warn!(share_id = %share.id, error = %e, "Badge evaluation failed after reward");
                Vec::new()
            }
        };

        let progress = ProgressUpdate {
            shares: 1,
            xp: amounts.xp,
            points: amounts.points,
            activity_at: now,
        };
        let referral_status = match self
            .referrals
            .record_activity_for_referred(&share.user_id, &progress, now)
            .await
        {
            Ok(referral) => referral.map(|r| r.status),
            Err(e) => {
                warn!(share_id = %share.id, error = %e, "Referral progress update failed");
                None
            }
        };

        self.notify(RewardNotification {
            user_id: share.user_id.clone(),
            kind: NotificationKind::ShareReward,
            amounts,
            reference: share.id.clone(),
            issued_at: now,
        });
        for badge in &badges {
            self.notify(RewardNotification {
                user_id: share.user_id.clone(),
                kind: NotificationKind::BadgeAwarded,
                amounts: badge.rewards,
                reference: badge.badge_id.clone(),
                issued_at: now,
            });
        }

        Ok(ShareOutcome::Rewarded {
            share_id: share.id,
            rewards,
            fraud_score,
            flagged,
            badges,
            referral_status,
        })
    }

    async fn gate_limits(
        &self,
        share: &ShareEvent,
        user: Option<&User>,
        app: Option<&App>,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let check = self.limits.check(user, app, now).await?;
        match check.reason {
            None => Ok(()),
            Some(ShareLimitViolation::UserNotFound) => {
                Err(EngineError::not_found("user", &share.user_id))
            }
            Some(ShareLimitViolation::AppNotFound) => {
                Err(EngineError::not_found("app", &share.app_id))
            }
            Some(reason) => {
                self.reject_share(&share.id, reason.as_str(), None).await;
                Err(EngineError::LimitExceeded(reason))
            }
        }
    }

    /// `Ok(Ok((score, flagged)))` lets the share through; `Ok(Err(outcome))` stops it
    async fn gate_fraud(
        &self,
        share: &ShareEvent,
        request: &VerificationRequest,
    ) -> EngineResult<Result<(u8, bool), ShareOutcome>> {
        let now = request.verified_at;
        let context = FraudContext::Share(self.share_risk_context(share, request).await?);

        let analysis = self
            .fraud
            .analyze_fraud(FraudEntityType::Share, &share.id, &context, now)
            .await;
        let score = analysis.fraud_score;

        match analysis.automatic_action {
            AutomaticAction::Block => {
                self.reject_share(&share.id, "fraud_blocked", Some(score)).await;
                warn!(
                    share_id = %share.id,
                    user_id = %share.user_id,
                    ip = %self.redact(share.metadata.ip_address.as_deref().unwrap_or("")),
                    device = %self.redact(share.metadata.device_fingerprint.as_deref().unwrap_or("")),
                    score = score,
                    "Share blocked by fraud gate"
                );
                Ok(Err(ShareOutcome::Rejected {
                    share_id: share.id.clone(),
                    fraud_score: score,
                    fraud_flags: analysis.fraud_flags,
                }))
            }
            AutomaticAction::Limit => {
                self.store_screening(&share.id, score, true, request).await?;
                Ok(Err(ShareOutcome::Held {
                    share_id: share.id.clone(),
                    fraud_score: score,
                    report_id: analysis.report_id,
                }))
            }
            AutomaticAction::Flag | AutomaticAction::Allow => {
                let flagged = analysis.automatic_action == AutomaticAction::Flag;
                self.store_screening(&share.id, score, flagged, request).await?;
                Ok(Ok((score, flagged)))
            }
        }
    }

    async fn share_risk_context(
        &self,
        share: &ShareEvent,
        request: &VerificationRequest,
    ) -> EngineResult<ShareRiskContext> {
        let shares = &self.store.shares;
        let now = request.verified_at;

        let accounts_on_device = match share.metadata.device_fingerprint.as_deref() {
            Some(fp) if !fp.is_empty() => shares.other_users_on_device(fp, &share.user_id).await?,
            _ => 0,
        };
        let accounts_on_ip = match share.metadata.ip_address.as_deref() {
            Some(ip) if !ip.is_empty() => shares.other_users_on_ip(ip, &share.user_id).await?,
            _ => 0,
        };

        let mut known_countries: BTreeSet<String> = shares
            .verified_for_user(&share.user_id)
            .await?
            .into_iter()
            .filter_map(|s| s.metadata.country)
            .collect();
        if let Some(user) = self.store.users.get(&share.user_id).await? {
            known_countries.extend(user.country);
        }

        let recent = shares
            .attempts_since(&share.user_id, now - Duration::hours(24))
            .await?;
        let previous_share = recent
            .iter()
            .filter(|s| s.id != share.id && s.created_at <= share.created_at)
            .max_by_key(|s| s.created_at)
            .map(|s| PriorShare {
                at: s.created_at,
                country: s.metadata.country.clone(),
            });
        let mut recent_share_times: Vec<DateTime<Utc>> = recent
            .iter()
            .filter(|s| s.id != share.id)
            .map(|s| s.created_at)
            .collect();
        recent_share_times.push(share.created_at);

        Ok(ShareRiskContext {
            metadata: share.metadata.clone(),
            shared_at: share.created_at,
            accounts_on_device,
            accounts_on_ip,
            ip_is_proxy: request.ip_is_proxy,
            known_countries,
            previous_share,
            recent_share_times,
            clicks: request.clicks,
            conversions: request.conversions,
        })
    }

    async fn calculate(
        &self,
        share: &ShareEvent,
        user: &User,
        app: &App,
        tournament: Option<&Tournament>,
        now: DateTime<Utc>,
    ) -> EngineResult<ShareRewards> {
        let history = self.store.shares.verified_for_user(&user.id).await?;
        let prior_app_shares = history.iter().filter(|s| s.app_id == app.id).count();

        let mut verification = ShareVerification::new(
            now,
            u32::try_from(prior_app_shares).unwrap_or(u32::MAX),
        );
        if let Some(tournament) = tournament {
            verification.tournament_share_days = history
                .iter()
                .filter(|s| s.tournament_id.as_deref() == Some(tournament.id.as_str()))
                .map(|s| s.verified_at.unwrap_or(s.created_at).date_naive())
                .collect::<BTreeSet<NaiveDate>>();
        }

        self.calculator
            .calculate_share_rewards(Some(user), Some(app), tournament, &verification)
            .map_err(|failure| match failure {
                RewardFailure::AppNotFound => EngineError::not_found("app", &share.app_id),
                RewardFailure::UserNotFound => EngineError::not_found("user", &share.user_id),
                RewardFailure::SystemError(reason) => EngineError::System(reason),
            })
    }

    /// Hold a daily slot; a full day rejects the share
    async fn reserve_slot(
        &self,
        share: &ShareEvent,
        app: &App,
        fraud_score: u8,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let reserved = self
            .limits
            .reserve_daily_slot(share, app, now, self.max_cas_retries)
            .await;
        if let Err(EngineError::LimitExceeded(reason)) = &reserved {
            self.reject_share(&share.id, reason.as_str(), Some(fraud_score))
                .await;
        }
        reserved
    }

    async fn release_slot(&self, share: &ShareEvent, now: DateTime<Utc>) {
        let released = self
            .limits
            .release_daily_slot(share, now, self.max_cas_retries)
            .await;
        if let Err(e) = released {
            warn!(share_id = %share.id, error = %e, "Could not release daily share slot");
        }
    }

    /// Calculate the rewards and debit the app budget for them
    async fn charge_app(
        &self,
        share: &ShareEvent,
        user: &User,
        app: &App,
        fraud_score: u8,
        now: DateTime<Utc>,
    ) -> EngineResult<ShareRewards> {
        let tournament = match &share.tournament_id {
            Some(id) => self.store.tournaments.get(id).await?,
            None => None,
        };
        let rewards = self
            .calculate(share, user, app, tournament.as_ref(), now)
            .await?;

        if let Err(e) = self.debit_app(share, rewards.amounts(), now).await {
            if let EngineError::LimitExceeded(reason) = &e {
                self.reject_share(&share.id, reason.as_str(), Some(fraud_score))
                    .await;
            }
            return Err(e);
        }
        Ok(rewards)
    }

    async fn debit_app(
        &self,
        share: &ShareEvent,
        amounts: Amounts,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        let debit = AppDebit {
            key: share_key(&share.id),
            amounts,
            at: now,
        };
        let retention = self.receipt_retention;
        guarded_update(
            self.store.apps.as_ref(),
            &share.app_id,
            self.max_cas_retries,
            |app: &mut App| app.apply_debit(&debit, retention),
        )
        .await?;
        Ok(())
    }

    async fn credit_user(
        &self,
        share: &ShareEvent,
        app: &App,
        amounts: Amounts,
        is_tournament: bool,
        now: DateTime<Utc>,
    ) -> EngineResult<CreditOutcome> {
        let source = if is_tournament {
            CreditSource::TournamentShare
        } else {
            CreditSource::Share
        };
        let credit = LedgerCredit::new(share_key(&share.id), amounts, source);
        let tournament_key = share
            .tournament_id
            .as_ref()
            .filter(|_| is_tournament)
            .map(|id| format!("tournament:{}", id));
        let xp_per_level = self.xp_per_level;
        let retention = self.receipt_retention;
        let day = now.date_naive();

        let (_, outcome) = guarded_update(
            self.store.users.as_ref(),
            &share.user_id,
            self.max_cas_retries,
            |user: &mut User| {
                let outcome = user.apply_share_credit(&credit, now, retention, xp_per_level);
                if outcome == CreditOutcome::Applied {
                    user.record_share_day(day);
                    user.total_shares = user.total_shares.saturating_add(1);
                    user.categories_shared.extend(app.categories.iter().cloned());
                    if let Some(key) = &tournament_key {
                        if user.credit_receipts.insert(key.clone()) {
                            user.tournaments_joined = user.tournaments_joined.saturating_add(1);
                        }
                    }
                }
                Ok(outcome)
            },
        )
        .await?;
        Ok(outcome)
    }

    async fn store_screening(
        &self,
        share_id: &str,
        score: u8,
        flagged: bool,
        request: &VerificationRequest,
    ) -> EngineResult<()> {
        guarded_update(
            self.store.shares.as_ref(),
            share_id,
            self.max_cas_retries,
            |share: &mut ShareEvent| {
                share.record_fraud_score(score);
                share.record_engagement(request.clicks, request.conversions);
                share.flagged = share.flagged || flagged;
                Ok(())
            },
        )
        .await?;
        Ok(())
    }

    async fn reject_share(&self, share_id: &str, reason: &str, score: Option<u8>) {
        let result = guarded_update(
            self.store.shares.as_ref(),
            share_id,
            self.max_cas_retries,
            |share: &mut ShareEvent| share.reject(reason, score),
        )
        .await;
        if let Err(e) = result {
            warn!(share_id = %share_id, reason = %reason, error = %e, "Could not reject share");
        }
    }

    fn notify(&self, notification: RewardNotification) {
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            let reference = notification.reference.clone();
            if let Err(e) = dispatcher.dispatch(notification).await {
                warn!(reference = %reference, error = %e, "Notification dispatch failed");
            }
        });
    }

    // ------------------------------------------------------------------------
    // Referrals
    // ------------------------------------------------------------------------

    pub async fn create_referral(
        &self,
        referrer_id: &str,
        referred_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Referral> {
        self.referrals
            .create_referral(referrer_id, referred_id, now)
            .await
    }

    /// Pay both referral bonuses and complete the referral
    pub async fn settle_referral(&self, referral_id: &str, now: DateTime<Utc>) -> EngineResult<Referral> {
        let before = self.referrals.get(referral_id).await?;
        let referral = self.referrals.process_both_rewards(referral_id, now).await?;

        for side in [RewardSide::Referrer, RewardSide::Referred] {
            if !before.is_rewarded(side) && referral.is_rewarded(side) {
                self.notify(RewardNotification {
                    user_id: referral.beneficiary(side).to_string(),
                    kind: NotificationKind::ReferralBonus,
                    amounts: referral.bonus_for(side),
                    reference: referral.id.clone(),
                    issued_at: now,
                });
            }
        }

        if let Err(e) = self
            .badges
            .evaluate_and_award(&referral.referrer_id, BadgeTrigger::Referral, now)
            .await
        {
            warn!(referral_id = %referral.id, error = %e, "Badge evaluation failed after referral");
        }
        Ok(referral)
    }

    /// Score the referred user; a `block` verdict marks the referral fraudulent
    pub async fn screen_referral(
        &self,
        referral_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<ReferralScreening> {
        let referral = self.referrals.get(referral_id).await?;
        let context = FraudContext::User(self.user_risk_context(&referral, now).await?);

        let analysis = self
            .fraud
            .analyze_fraud(FraudEntityType::User, &referral.referred_id, &context, now)
            .await;

        let referral = if analysis.automatic_action == AutomaticAction::Block
            && !referral.status.is_terminal()
        {
            self.referrals
                .mark_as_fraudulent(
                    &referral.id,
                    analysis.fraud_score,
                    analysis.fraud_flags.clone(),
                    FRAUD_SCORER_REVIEWER,
                    now,
                )
                .await?
        } else {
            referral
        };

        Ok(ReferralScreening { analysis, referral })
    }

    async fn user_risk_context(
        &self,
        referral: &Referral,
        now: DateTime<Utc>,
    ) -> EngineResult<UserRiskContext> {
        let shares = &self.store.shares;
        let referred: User = require(self.store.users.as_ref(), &referral.referred_id).await?;

        let day_ago = now - Duration::hours(24);
        let window_start = now - Duration::days(USER_SIGNAL_WINDOW_DAYS);
        let referred_shares = shares.attempts_since(&referred.id, window_start).await?;

        let shares_last_24h = referred_shares
            .iter()
            .filter(|s| s.created_at >= day_ago)
            .count();
        let distinct_devices_7d: HashSet<&str> = referred_shares
            .iter()
            .filter(|s| s.created_at >= now - Duration::days(7))
            .filter_map(|s| s.metadata.device_fingerprint.as_deref())
            .collect();

        let siblings = self.referrals.referrals_of(&referral.referrer_id).await?;
        let referrals_last_24h = siblings.iter().filter(|r| r.created_at >= day_ago).count();

        // referred accounts sharing a device or IP with the referrer
        let referrer_shares = shares
            .attempts_since(&referral.referrer_id, window_start)
            .await?;
        let referrer_devices: HashSet<String> = referrer_shares
            .iter()
            .flat_map(|s| {
                [
                    s.metadata.device_fingerprint.clone(),
                    s.metadata.ip_address.clone(),
                ]
            })
            .flatten()
            .collect();
        let mut linked_referrals = 0u32;
        for sibling in &siblings {
            let theirs = shares
                .attempts_since(&sibling.referred_id, window_start)
                .await?;
            let linked = theirs.iter().any(|s| {
                [&s.metadata.device_fingerprint, &s.metadata.ip_address]
                    .into_iter()
                    .flatten()
                    .any(|v| referrer_devices.contains(v))
            });
            if linked {
                linked_referrals += 1;
            }
        }

        let age_days = (now - referred.created_at).num_days().max(1) as u64;
        Ok(UserRiskContext {
            account_created_at: referred.created_at,
            evaluated_at: now,
            shares_last_24h: u32::try_from(shares_last_24h).unwrap_or(u32::MAX),
            referrals_last_24h: u32::try_from(referrals_last_24h).unwrap_or(u32::MAX),
            linked_referrals,
            avg_points_per_day: referred.total_points_earned / age_days,
            distinct_devices_7d: u32::try_from(distinct_devices_7d.len()).unwrap_or(u32::MAX),
        })
    }

    pub async fn run_expiry_sweep(&self, now: DateTime<Utc>) -> EngineResult<ExpirySweepReport> {
        self.referrals.expire_stale(now).await
    }
}
