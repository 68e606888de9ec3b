//! Risk probes
//!
//! Each probe inspects one signal family of a typed context and returns an
//! independent sub-score with the flags that produced it. Probes never fail;
//! malformed input is itself a signal.

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::IpAddr;

use crate::fraud::score::{FraudFlag, ProbeResult};
use crate::models::DeviceMetadata;

const AUTOMATION_MARKERS: [&str; 9] = [
    "bot",
    "crawler",
    "spider",
    "curl",
    "wget",
    "python-requests",
    "headless",
    "selenium",
    "phantomjs",
];

/// Tunables for signal extraction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSettings {
    pub blocked_ips: Vec<String>,
    pub max_accounts_per_device: u32,
    pub max_accounts_per_ip: u32,
    pub burst_window_secs: i64,
    pub burst_max_shares: usize,
    /// Coefficient of variation of share intervals below which sharing looks scripted
    pub regularity_cv: f64,
    pub regularity_min_samples: usize,
    pub night_start_hour: u32,
    pub night_end_hour: u32,
    pub impossible_travel_minutes: i64,
    pub max_conversion_rate: f64,
    pub min_clicks_for_rate: u32,
    pub new_account_hours: i64,
    pub max_shares_per_day: u32,
    pub max_referrals_per_day: u32,
    pub max_points_per_day: u64,
    pub max_devices_per_week: u32,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            blocked_ips: Vec::new(),
            max_accounts_per_device: 2,
            max_accounts_per_ip: 5,
            burst_window_secs: 60,
            burst_max_shares: 5,
            regularity_cv: 0.1,
            regularity_min_samples: 5,
            night_start_hour: 1,
            night_end_hour: 5,
            impossible_travel_minutes: 60,
            max_conversion_rate: 0.8,
            min_clicks_for_rate: 10,
            new_account_hours: 24,
            max_shares_per_day: 50,
            max_referrals_per_day: 10,
            max_points_per_day: 5_000,
            max_devices_per_week: 5,
        }
    }
}

// ============================================================================
// Contexts
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorShare {
    pub at: DateTime<Utc>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareRiskContext {
    pub metadata: DeviceMetadata,
    pub shared_at: DateTime<Utc>,
    /// Other accounts seen with this device fingerprint
    pub accounts_on_device: u32,
    /// Other accounts seen from this IP
    pub accounts_on_ip: u32,
    pub ip_is_proxy: bool,
    pub known_countries: BTreeSet<String>,
    pub previous_share: Option<PriorShare>,
    /// Recent share attempts of the user including this one
    pub recent_share_times: Vec<DateTime<Utc>>,
    pub clicks: u32,
    pub conversions: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethodKind {
    BankTransfer,
    Paypal,
    Card,
    PrepaidCard,
    GiftCard,
    Crypto,
}

impl PaymentMethodKind {
    fn is_high_risk(&self) -> bool {
        matches!(
            self,
            PaymentMethodKind::PrepaidCard | PaymentMethodKind::GiftCard | PaymentMethodKind::Crypto
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRiskContext {
    pub amount: f64,
    pub method: PaymentMethodKind,
    pub method_added_at: Option<DateTime<Utc>>,
    pub average_payout: f64,
    /// Review threshold payouts are compared against
    pub review_threshold: f64,
    pub prior_chargebacks: u32,
    pub failed_payments: u32,
    pub payment_country: Option<String>,
    pub account_country: Option<String>,
    pub account_created_at: DateTime<Utc>,
    pub payouts_last_24h: u32,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRiskContext {
    pub account_created_at: DateTime<Utc>,
    pub evaluated_at: DateTime<Utc>,
    pub shares_last_24h: u32,
    pub referrals_last_24h: u32,
    /// Referred accounts that share a device or IP with the user
    pub linked_referrals: u32,
    /// Lifetime points divided by account age in days
    pub avg_points_per_day: u64,
    pub distinct_devices_7d: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRiskContext {
    pub fingerprint: String,
    pub accounts_on_device: u32,
    pub reported_platform: Option<String>,
    pub user_agent: Option<String>,
    pub is_emulator: bool,
    pub is_rooted: bool,
    pub canvas_hash: Option<String>,
    pub webgl_hash: Option<String>,
    pub device_utc_offset_minutes: Option<i32>,
    pub ip_utc_offset_minutes: Option<i32>,
}

// ============================================================================
// Share probes
// ============================================================================

pub fn share_probes(ctx: &ShareRiskContext, settings: &ProbeSettings) -> Vec<ProbeResult> {
    vec![
        device_fingerprint(ctx, settings),
        ip_reputation(ctx, settings),
        sharing_pattern(ctx, settings),
        time_of_day(ctx, settings),
        geographic_consistency(ctx, settings),
        user_agent(ctx.metadata.user_agent.as_deref()),
        conversion_plausibility(ctx, settings),
    ]
}

fn device_fingerprint(ctx: &ShareRiskContext, settings: &ProbeSettings) -> ProbeResult {
    let mut result = ProbeResult::clean("device_fingerprint");
    match ctx.metadata.device_fingerprint.as_deref() {
        None | Some("") => result.raise(15, FraudFlag::MissingDeviceFingerprint),
        Some(_) if ctx.accounts_on_device > settings.max_accounts_per_device => {
            result.raise(25, FraudFlag::SharedDevice)
        }
        Some(_) => {}
    }
    result
}

fn ip_reputation(ctx: &ShareRiskContext, settings: &ProbeSettings) -> ProbeResult {
    let mut result = ProbeResult::clean("ip_reputation");
    let Some(raw) = ctx.metadata.ip_address.as_deref() else {
        result.raise(10, FraudFlag::MalformedIp);
        return result;
    };

    let Ok(ip) = raw.trim().parse::<IpAddr>() else {
        result.raise(20, FraudFlag::MalformedIp);
        return result;
    };

    if settings
        .blocked_ips
        .iter()
        .filter_map(|b| b.parse::<IpAddr>().ok())
        .any(|b| b == ip)
    {
        result.raise(40, FraudFlag::BlockedIp);
    }
    if ctx.ip_is_proxy {
        result.raise(20, FraudFlag::ProxyOrVpn);
    }
    if ctx.accounts_on_ip > settings.max_accounts_per_ip {
        result.raise(15, FraudFlag::IpCrowding);
    }
    result
}

fn sharing_pattern(ctx: &ShareRiskContext, settings: &ProbeSettings) -> ProbeResult {
    let mut result = ProbeResult::clean("sharing_pattern");
    let mut times = ctx.recent_share_times.clone();
    times.sort();

    let window = Duration::seconds(settings.burst_window_secs);
    let burst = times
        .iter()
        .enumerate()
        .map(|(i, start)| times[i..].iter().take_while(|t| **t - *start <= window).count())
        .max()
        .unwrap_or(0);
    if burst > settings.burst_max_shares {
        result.raise(20, FraudFlag::BurstSharing);
    }

    let intervals: Vec<f64> = times
        .windows(2)
        .map(|w| (w[1] - w[0]).num_milliseconds() as f64 / 1000.0)
        .collect();
    if intervals.len() >= settings.regularity_min_samples {
        let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
        if mean > 0.0 {
            let variance =
                intervals.iter().map(|i| (i - mean).powi(2)).sum::<f64>() / intervals.len() as f64;
            let cv = variance.sqrt() / mean;
            if cv < settings.regularity_cv {
                result.raise(25, FraudFlag::RegularSharingPattern);
            }
        }
    }
    result
}

fn time_of_day(ctx: &ShareRiskContext, settings: &ProbeSettings) -> ProbeResult {
    let mut result = ProbeResult::clean("time_of_day");
    if ctx.recent_share_times.len() < settings.regularity_min_samples {
        return result;
    }

    let offset = Duration::minutes(i64::from(ctx.metadata.utc_offset_minutes.unwrap_or(0)));
    let night = ctx
        .recent_share_times
        .iter()
        .map(|t| (*t + offset).hour())
        .filter(|h| *h >= settings.night_start_hour && *h <= settings.night_end_hour)
        .count();

    if night * 10 >= ctx.recent_share_times.len() * 8 {
        result.raise(10, FraudFlag::UnusualHours);
    }
    result
}

fn geographic_consistency(ctx: &ShareRiskContext, settings: &ProbeSettings) -> ProbeResult {
    let mut result = ProbeResult::clean("geographic_consistency");
    let Some(country) = ctx.metadata.country.as_deref() else {
        return result;
    };

    if !ctx.known_countries.is_empty()
        && !ctx
            .known_countries
            .iter()
            .any(|c| c.eq_ignore_ascii_case(country))
    {
        result.raise(15, FraudFlag::GeoMismatch);
    }

    if let Some(prior) = &ctx.previous_share {
        if let Some(prior_country) = prior.country.as_deref() {
            let elapsed = ctx.shared_at - prior.at;
            if !prior_country.eq_ignore_ascii_case(country)
                && elapsed < Duration::minutes(settings.impossible_travel_minutes)
            {
                result.raise(25, FraudFlag::ImpossibleTravel);
            }
        }
    }
    result
}

fn user_agent(agent: Option<&str>) -> ProbeResult {
    let mut result = ProbeResult::clean("user_agent");
    let agent = agent.map(str::trim).unwrap_or_default();
    if agent.is_empty() {
        result.raise(15, FraudFlag::MissingUserAgent);
        return result;
    }

    let lowered = agent.to_lowercase();
    if AUTOMATION_MARKERS.iter().any(|m| lowered.contains(m)) {
        result.raise(30, FraudFlag::AutomatedUserAgent);
    }
    result
}

fn conversion_plausibility(ctx: &ShareRiskContext, settings: &ProbeSettings) -> ProbeResult {
    let mut result = ProbeResult::clean("conversion_plausibility");
    if ctx.conversions > ctx.clicks {
        result.raise(30, FraudFlag::ImpossibleConversion);
    } else if ctx.clicks >= settings.min_clicks_for_rate {
        let rate = f64::from(ctx.conversions) / f64::from(ctx.clicks);
        if rate > settings.max_conversion_rate {
            result.raise(20, FraudFlag::ConversionAnomaly);
        }
    }
    result
}

// ============================================================================
// Payment probes
// ============================================================================

pub fn payment_probes(ctx: &PaymentRiskContext, settings: &ProbeSettings) -> Vec<ProbeResult> {
    let mut method = ProbeResult::clean("payment_method");
    if ctx.method.is_high_risk() {
        method.raise(20, FraudFlag::HighRiskPaymentMethod);
    }
    if ctx
        .method_added_at
        .is_some_and(|added| ctx.requested_at - added < Duration::hours(24))
    {
        method.raise(15, FraudFlag::NewPaymentMethod);
    }

    let mut amount = ProbeResult::clean("amount_pattern");
    if ctx.average_payout > 0.0 && ctx.amount > ctx.average_payout * 3.0 {
        amount.raise(20, FraudFlag::AmountSpike);
    }
    if ctx.review_threshold > 0.0
        && ctx.amount < ctx.review_threshold
        && ctx.amount >= ctx.review_threshold * 0.95
    {
        amount.raise(15, FraudFlag::ThresholdProbing);
    }

    let mut history = ProbeResult::clean("payment_history");
    if ctx.prior_chargebacks > 0 || ctx.failed_payments >= 2 {
        let weight = ctx
            .prior_chargebacks
            .saturating_mul(15)
            .saturating_add(ctx.failed_payments.saturating_mul(5));
        history.raise(weight.min(40), FraudFlag::PaymentHistoryIssues);
    }

    let mut geography = ProbeResult::clean("payment_geography");
    if let (Some(paid), Some(home)) = (&ctx.payment_country, &ctx.account_country) {
        if !paid.eq_ignore_ascii_case(home) {
            geography.raise(15, FraudFlag::PaymentGeoMismatch);
        }
    }

    let mut timing = ProbeResult::clean("payment_timing");
    if ctx.requested_at - ctx.account_created_at < Duration::hours(settings.new_account_hours) {
        timing.raise(25, FraudFlag::RapidPayout);
    }
    if ctx.payouts_last_24h > 3 {
        timing.raise(15, FraudFlag::PayoutVelocity);
    }

    vec![method, amount, history, geography, timing]
}

// ============================================================================
// User probes
// ============================================================================

pub fn user_probes(ctx: &UserRiskContext, settings: &ProbeSettings) -> Vec<ProbeResult> {
    let mut account = ProbeResult::clean("account_creation");
    if ctx.evaluated_at - ctx.account_created_at < Duration::hours(settings.new_account_hours) {
        account.raise(15, FraudFlag::NewAccount);
    }

    let mut activity = ProbeResult::clean("activity");
    if ctx.shares_last_24h > settings.max_shares_per_day {
        activity.raise(20, FraudFlag::ExcessiveActivity);
    }

    let mut referral = ProbeResult::clean("referral");
    if ctx.linked_referrals >= 3 {
        referral.raise(30, FraudFlag::ReferralRing);
    } else if ctx.linked_referrals > 0 {
        referral.raise(10, FraudFlag::ReferralRing);
    }
    if ctx.referrals_last_24h > settings.max_referrals_per_day {
        referral.raise(20, FraudFlag::ReferralVelocity);
    }

    let mut reward = ProbeResult::clean("reward");
    if ctx.avg_points_per_day > settings.max_points_per_day {
        reward.raise(20, FraudFlag::RewardVelocity);
    }

    let mut devices = ProbeResult::clean("device_consistency");
    if ctx.distinct_devices_7d > settings.max_devices_per_week {
        devices.raise(15, FraudFlag::DeviceChurn);
    }

    vec![account, activity, referral, reward, devices]
}

// ============================================================================
// Device probes
// ============================================================================

pub fn device_probes(ctx: &DeviceRiskContext, settings: &ProbeSettings) -> Vec<ProbeResult> {
    let mut multi = ProbeResult::clean("multi_account");
    if ctx.accounts_on_device > settings.max_accounts_per_device {
        multi.raise(30, FraudFlag::MultiAccount);
    }

    let mut spoofing = ProbeResult::clean("spoofing");
    if ctx.is_emulator {
        spoofing.raise(30, FraudFlag::EmulatorDetected);
    }
    if let (Some(platform), Some(agent)) = (&ctx.reported_platform, &ctx.user_agent) {
        if !platform_matches(platform, agent) {
            spoofing.raise(25, FraudFlag::PlatformSpoofing);
        }
    }

    let mut browser = ProbeResult::clean("browser_fingerprint");
    let missing_parts = [&ctx.canvas_hash, &ctx.webgl_hash]
        .iter()
        .filter(|h| h.as_deref().map_or(true, str::is_empty))
        .count();
    if missing_parts > 0 {
        browser.raise(5 * missing_parts as u32, FraudFlag::IncompleteBrowserFingerprint);
    }
    if let (Some(device), Some(ip)) = (ctx.device_utc_offset_minutes, ctx.ip_utc_offset_minutes) {
        if device.abs_diff(ip) > 60 {
            browser.raise(10, FraudFlag::TimezoneMismatch);
        }
    }

    let mut mobile = ProbeResult::clean("mobile_fingerprint");
    if ctx.is_rooted {
        mobile.raise(20, FraudFlag::RootedDevice);
    }

    vec![multi, spoofing, browser, mobile]
}

fn platform_matches(platform: &str, agent: &str) -> bool {
    let agent = agent.to_lowercase();
    match platform.to_lowercase().as_str() {
        "ios" => agent.contains("iphone") || agent.contains("ipad") || agent.contains("ios"),
        "android" => agent.contains("android"),
        "windows" => agent.contains("windows"),
        "macos" | "mac" => agent.contains("mac os") || agent.contains("macintosh"),
        "linux" => agent.contains("linux") && !agent.contains("android"),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean_share() -> ShareRiskContext {
        let now = Utc::now();
        ShareRiskContext {
            metadata: DeviceMetadata {
                device_fingerprint: Some("fp_1".to_string()),
                ip_address: Some("203.0.113.7".to_string()),
                user_agent: Some("Mozilla/5.0 (iPhone; CPU iPhone OS 17_0)".to_string()),
                country: Some("US".to_string()),
                utc_offset_minutes: Some(0),
            },
            shared_at: now,
            accounts_on_device: 0,
            accounts_on_ip: 0,
            ip_is_proxy: false,
            known_countries: ["US".to_string()].into_iter().collect(),
            previous_share: None,
            recent_share_times: vec![now],
            clicks: 4,
            conversions: 1,
        }
    }

    fn total(results: &[ProbeResult]) -> u32 {
        results.iter().map(|r| r.score).sum()
    }

    #[test]
    fn test_clean_share_scores_zero() {
        let results = share_probes(&clean_share(), &ProbeSettings::default());
        assert_eq!(results.len(), 7);
        assert_eq!(total(&results), 0);
    }

    #[test]
    fn test_blocked_ip_and_bot_agent() {
        let mut ctx = clean_share();
        ctx.metadata.user_agent = Some("python-requests/2.31".to_string());
        let settings = ProbeSettings {
            blocked_ips: vec!["203.0.113.7".to_string()],
            ..ProbeSettings::default()
        };
        let results = share_probes(&ctx, &settings);
        assert_eq!(total(&results), 70);
        assert!(results.iter().any(|r| r.flags.contains(&FraudFlag::BlockedIp)));
        assert!(results
            .iter()
            .any(|r| r.flags.contains(&FraudFlag::AutomatedUserAgent)));
    }

    #[test]
    fn test_scripted_regular_sharing() {
        let mut ctx = clean_share();
        let start = Utc::now() - Duration::hours(2);
        ctx.recent_share_times = (0..8).map(|i| start + Duration::minutes(10 * i)).collect();
        let result = sharing_pattern(&ctx, &ProbeSettings::default());
        assert!(result.flags.contains(&FraudFlag::RegularSharingPattern));
        assert!(!result.flags.contains(&FraudFlag::BurstSharing));
    }

    #[test]
    fn test_burst_sharing() {
        let mut ctx = clean_share();
        let start = Utc::now();
        ctx.recent_share_times = vec![
            start,
            start + Duration::seconds(3),
            start + Duration::seconds(11),
            start + Duration::seconds(12),
            start + Duration::seconds(30),
            start + Duration::seconds(41),
        ];
        let result = sharing_pattern(&ctx, &ProbeSettings::default());
        assert!(result.flags.contains(&FraudFlag::BurstSharing));
    }

    #[test]
    fn test_impossible_travel() {
        let mut ctx = clean_share();
        ctx.metadata.country = Some("BR".to_string());
        ctx.previous_share = Some(PriorShare {
            at: ctx.shared_at - Duration::minutes(5),
            country: Some("US".to_string()),
        });
        let result = geographic_consistency(&ctx, &ProbeSettings::default());
        assert_eq!(result.score, 40);
        assert!(result.flags.contains(&FraudFlag::ImpossibleTravel));
    }

    #[test]
    fn test_conversions_above_clicks() {
        let mut ctx = clean_share();
        ctx.clicks = 2;
        ctx.conversions = 5;
        let result = conversion_plausibility(&ctx, &ProbeSettings::default());
        assert!(result.flags.contains(&FraudFlag::ImpossibleConversion));
    }

    #[test]
    fn test_payment_probes_young_account() {
        let now = Utc::now();
        let ctx = PaymentRiskContext {
            amount: 480.0,
            method: PaymentMethodKind::GiftCard,
            method_added_at: Some(now - Duration::hours(1)),
            average_payout: 50.0,
            review_threshold: 500.0,
            prior_chargebacks: 0,
            failed_payments: 0,
            payment_country: Some("US".to_string()),
            account_country: Some("US".to_string()),
            account_created_at: now - Duration::hours(3),
            payouts_last_24h: 0,
            requested_at: now,
        };
        let results = payment_probes(&ctx, &ProbeSettings::default());
        // high-risk method, new method, spike, probing, rapid payout
        assert_eq!(total(&results), 20 + 15 + 20 + 15 + 25);
    }

    #[test]
    fn test_device_spoofing() {
        let ctx = DeviceRiskContext {
            fingerprint: "fp".to_string(),
            accounts_on_device: 4,
            reported_platform: Some("ios".to_string()),
            user_agent: Some("Mozilla/5.0 (Linux; Android 14)".to_string()),
            is_emulator: false,
            is_rooted: false,
            canvas_hash: Some("c".to_string()),
            webgl_hash: Some("w".to_string()),
            device_utc_offset_minutes: None,
            ip_utc_offset_minutes: None,
        };
        let results = device_probes(&ctx, &ProbeSettings::default());
        assert_eq!(total(&results), 55);
    }

    #[test]
    fn test_extreme_timezone_offsets_flag_mismatch() {
        let ctx = DeviceRiskContext {
            fingerprint: "fp".to_string(),
            accounts_on_device: 0,
            reported_platform: None,
            user_agent: None,
            is_emulator: false,
            is_rooted: false,
            canvas_hash: Some("c".to_string()),
            webgl_hash: Some("w".to_string()),
            device_utc_offset_minutes: Some(i32::MIN),
            ip_utc_offset_minutes: Some(i32::MAX),
        };
        let results = device_probes(&ctx, &ProbeSettings::default());
        assert!(results
            .iter()
            .any(|r| r.flags.contains(&FraudFlag::TimezoneMismatch)));
    }
}
