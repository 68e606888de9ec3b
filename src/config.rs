use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::net::IpAddr;
use std::str::FromStr;

use crate::fraud::{FraudScorerSettings, FraudThresholds, ProbeSettings};
use crate::models::Amounts;
use crate::referral::{ActivationCriteria, ReferralSettings};
use crate::rewards::RewardSettings;

const ENV_PREFIX: &str = "SHARELOOP_";

/// Configuration for the reward, referral and fraud engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub logging: LoggingConfig,
    pub referral: ReferralConfig,
    pub rewards: RewardsConfig,
    pub fraud: FraudConfig,
    pub store: StoreConfig,
    pub sweep: SweepConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// error | warn | info | debug | trace
    pub level: String,
    /// Mask IPs and device fingerprints in log output
    pub sanitize_logs: bool,
    /// Emit span open/close events
    pub log_spans: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralConfig {
    pub expiry_days: u32,
    pub min_shares: u32,
    pub min_xp_earned: u64,
    pub min_points_earned: u64,
    pub min_days_active: u32,
    pub referrer_bonus_xp: u64,
    pub referrer_bonus_points: u64,
    pub referred_bonus_xp: u64,
    pub referred_bonus_points: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardsConfig {
    pub veteran_level: u32,
    pub streak_days: u32,
    pub diversity_min_categories: usize,
    pub xp_per_level: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudConfig {
    /// Review is required above this score
    pub review_above: u8,
    /// A fraud report is opened above this score
    pub report_above: u8,
    pub flag_action: u8,
    pub limit_action: u8,
    pub block_action: u8,
    pub report_window_hours: u32,
    pub blocked_ips: Vec<String>,
    pub max_accounts_per_device: u32,
    pub max_accounts_per_ip: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Retries of a guarded update after a version conflict
    pub max_cas_retries: u32,
    /// How long per-share ledger receipts are kept; pending shares older
    /// than this can no longer be verified
    pub receipt_retention_hours: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for ReferralConfig {
    fn default() -> Self {
        Self {
            expiry_days: 30,
            min_shares: 5,
            min_xp_earned: 100,
            min_points_earned: 10,
            min_days_active: 7,
            referrer_bonus_xp: 500,
            referrer_bonus_points: 100,
            referred_bonus_xp: 250,
            referred_bonus_points: 50,
        }
    }
}

impl ReferralConfig {
    pub fn to_criteria(&self) -> ActivationCriteria {
        ActivationCriteria {
            min_shares: self.min_shares,
            min_xp_earned: self.min_xp_earned,
            min_points_earned: self.min_points_earned,
            min_days_active: self.min_days_active,
        }
    }

    pub fn to_settings(&self, xp_per_level: u64, max_cas_retries: u32) -> ReferralSettings {
        ReferralSettings {
            criteria: self.to_criteria(),
            referrer_bonus: Amounts::new(self.referrer_bonus_xp, self.referrer_bonus_points),
            referred_bonus: Amounts::new(self.referred_bonus_xp, self.referred_bonus_points),
            expiry_days: self.expiry_days,
            xp_per_level,
            max_cas_retries,
        }
    }
}

impl Default for RewardsConfig {
    fn default() -> Self {
        Self {
            veteran_level: 10,
            streak_days: 7,
            diversity_min_categories: 5,
            xp_per_level: 1000,
        }
    }
}

impl RewardsConfig {
    pub fn to_settings(&self) -> RewardSettings {
        RewardSettings {
            veteran_level: self.veteran_level,
            streak_days: self.streak_days,
            diversity_min_categories: self.diversity_min_categories,
            xp_per_level: self.xp_per_level,
            ..RewardSettings::default()
        }
    }
}

impl Default for FraudConfig {
    fn default() -> Self {
        Self {
            review_above: 60,
            report_above: 70,
            flag_action: 60,
            limit_action: 80,
            block_action: 90,
            report_window_hours: 24,
            blocked_ips: Vec::new(),
            max_accounts_per_device: 2,
            max_accounts_per_ip: 5,
        }
    }
}

impl FraudConfig {
    pub fn to_thresholds(&self) -> FraudThresholds {
        FraudThresholds {
            flag_action: self.flag_action,
            limit_action: self.limit_action,
            block_action: self.block_action,
            review_above: self.review_above,
            report_above: self.report_above,
            ..FraudThresholds::default()
        }
    }

    pub fn to_scorer_settings(&self, max_cas_retries: u32) -> FraudScorerSettings {
        FraudScorerSettings {
            thresholds: self.to_thresholds(),
            probes: ProbeSettings {
                blocked_ips: self.blocked_ips.clone(),
                max_accounts_per_device: self.max_accounts_per_device,
                max_accounts_per_ip: self.max_accounts_per_ip,
                ..ProbeSettings::default()
            },
            report_window_hours: self.report_window_hours,
            max_cas_retries,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig {
                level: "info".to_string(),
                sanitize_logs: true,
                log_spans: false,
            },
            referral: ReferralConfig::default(),
            rewards: RewardsConfig::default(),
            fraud: FraudConfig::default(),
            store: StoreConfig {
                max_cas_retries: 8,
                receipt_retention_hours: 168,
            },
            sweep: SweepConfig {
                enabled: true,
                interval_secs: 3600,
            },
        }
    }
}

/// Overwrite `target` when `SHARELOOP_<name>` is set
fn env_override<T>(name: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let key = format!("{}{}", ENV_PREFIX, name);
    if let Ok(raw) = env::var(&key) {
        *target = raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {} value", key))?;
    }
    Ok(())
}

impl EngineConfig {
    /// Load configuration from environment variables and validate it
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        // Logging
        if let Ok(level) = env::var(format!("{}LOG_LEVEL", ENV_PREFIX)) {
            config.logging.level = level;
        }
        env_override("SANITIZE_LOGS", &mut config.logging.sanitize_logs)?;
        env_override("LOG_SPANS", &mut config.logging.log_spans)?;

        // Referral lifecycle
        let referral = &mut config.referral;
        env_override("REFERRAL_EXPIRY_DAYS", &mut referral.expiry_days)?;
        env_override("REFERRAL_MIN_SHARES", &mut referral.min_shares)?;
        env_override("REFERRAL_MIN_XP", &mut referral.min_xp_earned)?;
        env_override("REFERRAL_MIN_POINTS", &mut referral.min_points_earned)?;
        env_override("REFERRAL_MIN_DAYS", &mut referral.min_days_active)?;
        env_override("REFERRER_BONUS_XP", &mut referral.referrer_bonus_xp)?;
        env_override("REFERRER_BONUS_POINTS", &mut referral.referrer_bonus_points)?;
        env_override("REFERRED_BONUS_XP", &mut referral.referred_bonus_xp)?;
        env_override("REFERRED_BONUS_POINTS", &mut referral.referred_bonus_points)?;

        // Rewards
        let rewards = &mut config.rewards;
        env_override("VETERAN_LEVEL", &mut rewards.veteran_level)?;
        env_override("STREAK_DAYS", &mut rewards.streak_days)?;
        env_override("DIVERSITY_MIN_CATEGORIES", &mut rewards.diversity_min_categories)?;
        env_override("XP_PER_LEVEL", &mut rewards.xp_per_level)?;

        // Fraud
        let fraud = &mut config.fraud;
        env_override("FRAUD_REVIEW_ABOVE", &mut fraud.review_above)?;
        env_override("FRAUD_REPORT_ABOVE", &mut fraud.report_above)?;
        env_override("FRAUD_FLAG_AT", &mut fraud.flag_action)?;
        env_override("FRAUD_LIMIT_AT", &mut fraud.limit_action)?;
        env_override("FRAUD_BLOCK_AT", &mut fraud.block_action)?;
        env_override("FRAUD_REPORT_WINDOW_HOURS", &mut fraud.report_window_hours)?;
        env_override("FRAUD_MAX_ACCOUNTS_PER_DEVICE", &mut fraud.max_accounts_per_device)?;
        env_override("FRAUD_MAX_ACCOUNTS_PER_IP", &mut fraud.max_accounts_per_ip)?;
        if let Ok(list) = env::var(format!("{}FRAUD_BLOCKED_IPS", ENV_PREFIX)) {
            fraud.blocked_ips = list
                .split(',')
                .map(str::trim)
                .filter(|ip| !ip.is_empty())
                .map(str::to_string)
                .collect();
        }

        // Store and sweep
        env_override("MAX_CAS_RETRIES", &mut config.store.max_cas_retries)?;
        env_override(
            "RECEIPT_RETENTION_HOURS",
            &mut config.store.receipt_retention_hours,
        )?;
        env_override("SWEEP_ENABLED", &mut config.sweep.enabled)?;
        env_override("SWEEP_INTERVAL_SECS", &mut config.sweep.interval_secs)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration for consistency
    pub fn validate(&self) -> Result<()> {
        let level = self.logging.level.to_lowercase();
        if !["error", "warn", "info", "debug", "trace"].contains(&level.as_str()) {
            return Err(anyhow::anyhow!("Unknown log level: {}", self.logging.level));
        }

        if self.referral.expiry_days == 0 {
            return Err(anyhow::anyhow!("Referral expiry must be at least one day"));
        }

        if self.rewards.xp_per_level == 0 {
            return Err(anyhow::anyhow!("XP per level must be non-zero"));
        }

        let fraud = &self.fraud;
        for (name, value) in [
            ("review", fraud.review_above),
            ("report", fraud.report_above),
            ("flag", fraud.flag_action),
            ("limit", fraud.limit_action),
            ("block", fraud.block_action),
        ] {
            if value > 100 {
                return Err(anyhow::anyhow!(
                    "Fraud {} threshold {} is outside 0..=100",
                    name,
                    value
                ));
            }
        }

        if !(fraud.flag_action <= fraud.limit_action && fraud.limit_action <= fraud.block_action) {
            return Err(anyhow::anyhow!(
                "Fraud action thresholds must satisfy flag <= limit <= block"
            ));
        }

        if fraud.report_window_hours == 0 {
            return Err(anyhow::anyhow!("Fraud report window must be non-zero"));
        }

        for ip in &fraud.blocked_ips {
            ip.parse::<IpAddr>()
                .with_context(|| format!("Invalid blocked IP address: {}", ip))?;
        }

        if self.store.max_cas_retries == 0 {
            return Err(anyhow::anyhow!("max_cas_retries must be at least 1"));
        }

        if self.store.receipt_retention_hours == 0 {
            return Err(anyhow::anyhow!("Receipt retention must be at least one hour"));
        }

        if self.sweep.enabled && self.sweep.interval_secs == 0 {
            return Err(anyhow::anyhow!("Sweep interval must be non-zero"));
        }

        Ok(())
    }
}

/// Mask the middle of a sensitive value (IP address, device fingerprint)
pub fn sanitize_for_logging(data: &str) -> String {
    let chars: Vec<char> = data.chars().collect();
    match chars.len() {
        0 => String::new(),
        n if n <= 4 => "***".to_string(),
        n if n > 20 => {
            let head: String = chars[..6].iter().collect();
            let tail: String = chars[n - 6..].iter().collect();
            format!("{}***{}", head, tail)
        }
        n => {
            let head: String = chars[..2].iter().collect();
            let tail: String = chars[n - 2..].iter().collect();
            format!("{}***{}", head, tail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_for_logging() {
        assert_eq!(sanitize_for_logging("203.0.113.7"), "20***.7");
        assert_eq!(
            sanitize_for_logging("fp_9f2c4e1a7b3d5f60a1b2"),
            "fp_9f2***60a1b2"
        );
        assert_eq!(sanitize_for_logging("abc"), "***");
        assert_eq!(sanitize_for_logging(""), "");
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.referral.to_criteria(), ActivationCriteria::default());
        assert_eq!(config.fraud.to_thresholds().report_above, 70);
    }

    #[test]
    fn test_config_validation() {
        let mut config = EngineConfig::default();
        config.fraud.limit_action = 95;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.fraud.blocked_ips = vec!["not-an-ip".to_string()];
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.store.receipt_retention_hours = 0;
        assert!(config.validate().is_err());
    }
}
