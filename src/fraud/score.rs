//! Risk score aggregation and thresholds
//!
//! Probes report independent non-negative sub-scores. The aggregate is their
//! sum clamped to [0, 100]; level, action and review requirements are pure
//! functions of that clamped score.

use serde::{Deserialize, Serialize};

/// Tags attached by risk probes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FraudFlag {
    // share probes
    MissingDeviceFingerprint,
    SharedDevice,
    BlockedIp,
    MalformedIp,
    ProxyOrVpn,
    IpCrowding,
    RegularSharingPattern,
    BurstSharing,
    UnusualHours,
    GeoMismatch,
    ImpossibleTravel,
    MissingUserAgent,
    AutomatedUserAgent,
    ImpossibleConversion,
    ConversionAnomaly,
    // payment probes
    NewPaymentMethod,
    HighRiskPaymentMethod,
    AmountSpike,
    ThresholdProbing,
    PaymentHistoryIssues,
    PaymentGeoMismatch,
    RapidPayout,
    PayoutVelocity,
    // user probes
    NewAccount,
    ExcessiveActivity,
    ReferralRing,
    ReferralVelocity,
    RewardVelocity,
    DeviceChurn,
    // device probes
    MultiAccount,
    EmulatorDetected,
    PlatformSpoofing,
    IncompleteBrowserFingerprint,
    TimezoneMismatch,
    RootedDevice,
    // set by the engine itself
    ManualReview,
    AnalysisFailure,
}

impl FraudFlag {
    pub fn recommendation(&self) -> &'static str {
        match self {
            FraudFlag::MissingDeviceFingerprint | FraudFlag::IncompleteBrowserFingerprint => {
                "Require a complete device fingerprint before rewarding"
            }
            FraudFlag::SharedDevice | FraudFlag::MultiAccount => {
                "Review accounts linked to the same device"
            }
            FraudFlag::BlockedIp | FraudFlag::MalformedIp => "Reject traffic from this IP address",
            FraudFlag::ProxyOrVpn | FraudFlag::IpCrowding => {
                "Verify the user outside of the proxied network"
            }
            FraudFlag::RegularSharingPattern | FraudFlag::BurstSharing => {
                "Check for scripted sharing and tighten cooldowns"
            }
            FraudFlag::UnusualHours => "Compare activity hours with the user's history",
            FraudFlag::GeoMismatch | FraudFlag::ImpossibleTravel | FraudFlag::PaymentGeoMismatch => {
                "Confirm the user's location"
            }
            FraudFlag::MissingUserAgent | FraudFlag::AutomatedUserAgent => {
                "Treat the client as automated until verified"
            }
            FraudFlag::ImpossibleConversion | FraudFlag::ConversionAnomaly => {
                "Audit conversion tracking for this share"
            }
            FraudFlag::NewPaymentMethod | FraudFlag::HighRiskPaymentMethod => {
                "Hold payout until the payment method is verified"
            }
            FraudFlag::AmountSpike | FraudFlag::ThresholdProbing => {
                "Review payout amount against the user's history"
            }
            FraudFlag::PaymentHistoryIssues => "Review previous chargebacks and failed payments",
            FraudFlag::RapidPayout | FraudFlag::PayoutVelocity => "Delay payouts for young accounts",
            FraudFlag::NewAccount => "Apply new-account limits",
            FraudFlag::ExcessiveActivity | FraudFlag::RewardVelocity => {
                "Throttle reward issuance for this user"
            }
            FraudFlag::ReferralRing | FraudFlag::ReferralVelocity => {
                "Investigate the referral network for self-referrals"
            }
            FraudFlag::DeviceChurn => "Require re-verification on new devices",
            FraudFlag::EmulatorDetected | FraudFlag::PlatformSpoofing | FraudFlag::RootedDevice => {
                "Block rewards from emulated or tampered devices"
            }
            FraudFlag::TimezoneMismatch => "Cross-check device timezone with IP location",
            FraudFlag::ManualReview => "Escalate to a fraud analyst",
            FraudFlag::AnalysisFailure => "Fraud analysis failed; escalate to manual review",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FraudLevel {
    Minimal,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomaticAction {
    Allow,
    Flag,
    Limit,
    Block,
}

/// Score boundaries; every comparison is inclusive unless noted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudThresholds {
    pub low_level: u8,
    pub medium_level: u8,
    pub high_level: u8,
    pub critical_level: u8,
    pub flag_action: u8,
    pub limit_action: u8,
    pub block_action: u8,
    /// Review required when the score is strictly above this
    pub review_above: u8,
    /// A report is opened when the score is strictly above this
    pub report_above: u8,
}

impl Default for FraudThresholds {
    fn default() -> Self {
        Self {
            low_level: 40,
            medium_level: 60,
            high_level: 80,
            critical_level: 90,
            flag_action: 60,
            limit_action: 80,
            block_action: 90,
            review_above: 60,
            report_above: 70,
        }
    }
}

impl FraudThresholds {
    pub fn level_for(&self, score: u8) -> FraudLevel {
        if score >= self.critical_level {
            FraudLevel::Critical
        } else if score >= self.high_level {
            FraudLevel::High
        } else if score >= self.medium_level {
            FraudLevel::Medium
        } else if score >= self.low_level {
            FraudLevel::Low
        } else {
            FraudLevel::Minimal
        }
    }

    pub fn action_for(&self, score: u8) -> AutomaticAction {
        if score >= self.block_action {
            AutomaticAction::Block
        } else if score >= self.limit_action {
            AutomaticAction::Limit
        } else if score >= self.flag_action {
            AutomaticAction::Flag
        } else {
            AutomaticAction::Allow
        }
    }

    pub fn requires_review(&self, score: u8) -> bool {
        score > self.review_above
    }

    pub fn opens_report(&self, score: u8) -> bool {
        score > self.report_above
    }
}

/// Output of a single risk probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub probe: String,
    pub score: u32,
    pub flags: Vec<FraudFlag>,
}

impl ProbeResult {
    pub fn clean(probe: &str) -> Self {
        Self {
            probe: probe.to_string(),
            score: 0,
            flags: Vec::new(),
        }
    }

    pub fn raise(&mut self, points: u32, flag: FraudFlag) {
        self.score = self.score.saturating_add(points);
        if !self.flags.contains(&flag) {
            self.flags.push(flag);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub fraud_score: u8,
    pub fraud_level: FraudLevel,
    pub automatic_action: AutomaticAction,
    pub requires_review: bool,
    pub fraud_flags: Vec<FraudFlag>,
}

/// Sum the sub-scores and clamp to [0, 100]
pub fn aggregate(probes: &[ProbeResult], thresholds: &FraudThresholds) -> RiskAssessment {
    let total = probes
        .iter()
        .fold(0u32, |acc, p| acc.saturating_add(p.score));
    let fraud_score = u8::try_from(total.min(100)).unwrap_or(100);

    let mut fraud_flags: Vec<FraudFlag> = probes.iter().flat_map(|p| p.flags.iter().copied()).collect();
    fraud_flags.sort();
    fraud_flags.dedup();

    RiskAssessment {
        fraud_score,
        fraud_level: thresholds.level_for(fraud_score),
        automatic_action: thresholds.action_for(fraud_score),
        requires_review: thresholds.requires_review(fraud_score),
        fraud_flags,
    }
}

/// Conservative result used when analysis cannot be completed
pub fn worst_case() -> RiskAssessment {
    RiskAssessment {
        fraud_score: 100,
        fraud_level: FraudLevel::Critical,
        automatic_action: AutomaticAction::Block,
        requires_review: true,
        fraud_flags: vec![FraudFlag::AnalysisFailure],
    }
}
