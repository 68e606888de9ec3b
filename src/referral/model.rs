//! Referral record, activation progress and eligibility rules

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::fraud::FraudFlag;
use crate::models::{Amounts, CreditSource};
use crate::referral::ReferralStatus;
use crate::store::Entity;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationCriteria {
    pub min_shares: u32,
    pub min_xp_earned: u64,
    pub min_points_earned: u64,
    pub min_days_active: u32,
}

impl Default for ActivationCriteria {
    fn default() -> Self {
        Self {
            min_shares: 5,
            min_xp_earned: 100,
            min_points_earned: 10,
            min_days_active: 7,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationProgress {
    pub shares_completed: u32,
    pub xp_earned: u64,
    pub points_earned: u64,
    /// Distinct calendar days with recorded activity
    pub days_active: u32,
    pub last_activity_date: Option<DateTime<Utc>>,
}

/// Activity reported for the referred user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub shares: u32,
    pub xp: u64,
    pub points: u64,
    pub activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralRewards {
    pub referrer_bonus: Amounts,
    pub referred_bonus: Amounts,
    pub referrer_rewarded: bool,
    pub referred_rewarded: bool,
    pub referrer_rewarded_at: Option<DateTime<Utc>>,
    pub referred_rewarded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FraudDetection {
    pub fraud_score: u8,
    pub fraud_flags: Vec<FraudFlag>,
    pub is_suspicious: bool,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

/// Which party of a referral a bonus goes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardSide {
    Referrer,
    Referred,
}

impl RewardSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            RewardSide::Referrer => "referrer",
            RewardSide::Referred => "referred",
        }
    }

    pub fn credit_source(&self) -> CreditSource {
        match self {
            RewardSide::Referrer => CreditSource::ReferrerBonus,
            RewardSide::Referred => CreditSource::ReferredBonus,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum EligibilityViolation {
    NotPending { status: ReferralStatus },
    Expired { expired_at: DateTime<Utc> },
    Suspicious { fraud_score: u8 },
    CriteriaNotMet { activation_percentage: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibilityReport {
    pub eligible: bool,
    pub violations: Vec<EligibilityViolation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralSummary {
    pub id: String,
    pub referrer_id: String,
    pub referred_id: String,
    pub status: ReferralStatus,
    pub activation_percentage: u8,
    pub can_be_activated: bool,
    pub days_until_expiry: i64,
    pub referrer_rewarded: bool,
    pub referred_rewarded: bool,
    pub is_suspicious: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Referral {
    pub id: String,
    pub referrer_id: String,
    pub referred_id: String,
    pub status: ReferralStatus,
    pub activation_criteria: ActivationCriteria,
    pub activation_progress: ActivationProgress,
    pub rewards: ReferralRewards,
    pub fraud_detection: FraudDetection,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub version: u64,
}

impl Referral {
    pub fn new(
        referrer_id: impl Into<String>,
        referred_id: impl Into<String>,
        criteria: ActivationCriteria,
        referrer_bonus: Amounts,
        referred_bonus: Amounts,
        expiry_days: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("ref_{}", uuid::Uuid::new_v4().simple()),
            referrer_id: referrer_id.into(),
            referred_id: referred_id.into(),
            status: ReferralStatus::Pending,
            activation_criteria: criteria,
            activation_progress: ActivationProgress::default(),
            rewards: ReferralRewards {
                referrer_bonus,
                referred_bonus,
                ..ReferralRewards::default()
            },
            fraud_detection: FraudDetection::default(),
            created_at: now,
            activated_at: None,
            completed_at: None,
            expires_at: now + Duration::days(i64::from(expiry_days)),
            version: 0,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Mean of the four progress ratios, each capped at 100 before averaging
    pub fn activation_percentage(&self) -> u8 {
        let c = &self.activation_criteria;
        let p = &self.activation_progress;
        let ratios = [
            capped_ratio(u64::from(p.shares_completed), u64::from(c.min_shares)),
            capped_ratio(p.xp_earned, c.min_xp_earned),
            capped_ratio(p.points_earned, c.min_points_earned),
            capped_ratio(u64::from(p.days_active), u64::from(c.min_days_active)),
        ];
        let mean = ratios.iter().sum::<f64>() / ratios.len() as f64;
        mean.round().clamp(0.0, 100.0) as u8
    }

    pub fn criteria_met(&self) -> bool {
        let c = &self.activation_criteria;
        let p = &self.activation_progress;
        p.shares_completed >= c.min_shares
            && p.xp_earned >= c.min_xp_earned
            && p.points_earned >= c.min_points_earned
            && p.days_active >= c.min_days_active
    }

    pub fn can_be_activated(&self, now: DateTime<Utc>) -> bool {
        self.status == ReferralStatus::Pending && self.criteria_met() && !self.is_expired(now)
    }

    /// Runs on every save: pending referrals that cleared their criteria become active
    pub fn refresh_activation(&mut self, now: DateTime<Utc>) -> bool {
        if !self.can_be_activated(now) {
            return false;
        }
        self.status = ReferralStatus::Active;
        self.activated_at = Some(now);
        true
    }

    pub fn transition(&mut self, next: ReferralStatus, now: DateTime<Utc>) -> EngineResult<()> {
        self.status.ensure_transition(next)?;
        match next {
            ReferralStatus::Active => self.activated_at = Some(now),
            ReferralStatus::Completed => self.completed_at = Some(now),
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    pub fn apply_progress(&mut self, update: &ProgressUpdate) -> EngineResult<()> {
        if self.status.is_terminal() {
            return Err(EngineError::NotEligible(format!(
                "referral {} is {}; progress is closed",
                self.id, self.status
            )));
        }

        let p = &mut self.activation_progress;
        p.shares_completed = p.shares_completed.saturating_add(update.shares);
        p.xp_earned = p.xp_earned.saturating_add(update.xp);
        p.points_earned = p.points_earned.saturating_add(update.points);

        let new_day = match p.last_activity_date {
            None => true,
            Some(last) => update.activity_at.date_naive() > last.date_naive(),
        };
        if new_day {
            p.days_active = p.days_active.saturating_add(1);
        }
        if p.last_activity_date.map_or(true, |last| update.activity_at > last) {
            p.last_activity_date = Some(update.activity_at);
        }
        Ok(())
    }

    pub fn is_rewarded(&self, side: RewardSide) -> bool {
        match side {
            RewardSide::Referrer => self.rewards.referrer_rewarded,
            RewardSide::Referred => self.rewards.referred_rewarded,
        }
    }

    pub fn bonus_for(&self, side: RewardSide) -> Amounts {
        match side {
            RewardSide::Referrer => self.rewards.referrer_bonus,
            RewardSide::Referred => self.rewards.referred_bonus,
        }
    }

    pub fn beneficiary(&self, side: RewardSide) -> &str {
        match side {
            RewardSide::Referrer => &self.referrer_id,
            RewardSide::Referred => &self.referred_id,
        }
    }

    pub fn credit_key(&self, side: RewardSide) -> String {
        format!("referral:{}:{}", self.id, side.as_str())
    }

    /// Already-awarded is checked before status so a retry reports the double award
    pub fn ensure_awardable(&self, side: RewardSide) -> EngineResult<()> {
        if self.is_rewarded(side) {
            return Err(EngineError::AlreadyAwarded(format!(
                "{} bonus for referral {}",
                side.as_str(),
                self.id
            )));
        }
        if self.status != ReferralStatus::Active {
            return Err(EngineError::NotEligible(format!(
                "referral {} is {}, bonuses require active",
                self.id, self.status
            )));
        }
        Ok(())
    }

    /// Flag flip for a bonus; the flag never goes back to false
    pub fn mark_rewarded(&mut self, side: RewardSide, now: DateTime<Utc>) -> EngineResult<()> {
        self.ensure_awardable(side)?;
        match side {
            RewardSide::Referrer => {
                self.rewards.referrer_rewarded = true;
                self.rewards.referrer_rewarded_at = Some(now);
            }
            RewardSide::Referred => {
                self.rewards.referred_rewarded = true;
                self.rewards.referred_rewarded_at = Some(now);
            }
        }
        Ok(())
    }

    pub fn mark_fraudulent(
        &mut self,
        fraud_score: u8,
        flags: Vec<FraudFlag>,
        reviewer: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.transition(ReferralStatus::Fraudulent, now)?;
        self.fraud_detection.fraud_score = fraud_score.min(100);
        for flag in flags {
            if !self.fraud_detection.fraud_flags.contains(&flag) {
                self.fraud_detection.fraud_flags.push(flag);
            }
        }
        self.fraud_detection.is_suspicious = true;
        self.fraud_detection.reviewed_by = Some(reviewer.to_string());
        self.fraud_detection.reviewed_at = Some(now);
        Ok(())
    }

    /// Every violated rule, not just the first
    pub fn validate_eligibility(&self, now: DateTime<Utc>) -> EligibilityReport {
        let mut violations = Vec::new();

        if self.status != ReferralStatus::Pending {
            violations.push(EligibilityViolation::NotPending {
                status: self.status,
            });
        }
        if self.is_expired(now) {
            violations.push(EligibilityViolation::Expired {
                expired_at: self.expires_at,
            });
        }
        if self.fraud_detection.is_suspicious {
            violations.push(EligibilityViolation::Suspicious {
                fraud_score: self.fraud_detection.fraud_score,
            });
        }
        if !self.criteria_met() {
            violations.push(EligibilityViolation::CriteriaNotMet {
                activation_percentage: self.activation_percentage(),
            });
        }

        EligibilityReport {
            eligible: violations.is_empty(),
            violations,
        }
    }

    pub fn summary(&self, now: DateTime<Utc>) -> ReferralSummary {
        ReferralSummary {
            id: self.id.clone(),
            referrer_id: self.referrer_id.clone(),
            referred_id: self.referred_id.clone(),
            status: self.status,
            activation_percentage: self.activation_percentage(),
            can_be_activated: self.can_be_activated(now),
            days_until_expiry: (self.expires_at - now).num_days().max(0),
            referrer_rewarded: self.rewards.referrer_rewarded,
            referred_rewarded: self.rewards.referred_rewarded,
            is_suspicious: self.fraud_detection.is_suspicious,
            created_at: self.created_at,
        }
    }
}

fn capped_ratio(value: u64, target: u64) -> f64 {
    if target == 0 {
        return 100.0;
    }
    (value as f64 / target as f64 * 100.0).min(100.0)
}

impl Entity for Referral {
    const KIND: &'static str = "referral";

    fn entity_id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn unique_key(&self) -> Option<&str> {
        Some(&self.referred_id)
    }
}
