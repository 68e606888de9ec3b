//! Integration tests for the ShareLoop engine
//!
//! These tests drive the public engine surface end to end: the share
//! pipeline (limit gate, fraud gate, calculator, ledger), referral lifecycle,
//! badge awarding, fraud reports and the expiry sweep.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use shareloop_engine::fraud::{aggregate, ProbeResult};
use shareloop_engine::models::{
    CriteriaType, DeviceMetadata, ShareChannel, TournamentParticipant, ValidationStatus,
};
use shareloop_engine::referral::ProgressUpdate;
use shareloop_engine::rewards::ShareType;
use shareloop_engine::{
    Amounts, App, AutomaticAction, Badge, EngineConfig, EngineError, FraudEntityType, FraudFlag,
    FraudLevel, FraudThresholds, InvestigationStatus, ReferralStatus, Repository, RewardEngine,
    ShareEvent, ShareLimitViolation, ShareOutcome, Store, Tournament, User, VerificationRequest,
};

// ============================================================================
// Test Helpers
// ============================================================================

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, day, hour, 0, 0).unwrap()
}

fn clean_metadata() -> DeviceMetadata {
    DeviceMetadata {
        device_fingerprint: Some("fp-main".to_string()),
        ip_address: Some("203.0.113.20".to_string()),
        user_agent: Some("Mozilla/5.0 (iPhone; CPU iPhone OS 17_4)".to_string()),
        country: None,
        utc_offset_minutes: None,
    }
}

fn funded_app(id: &str, budget: f64) -> App {
    let mut app = App::new(id, 50, 10);
    app.monetization_config.budget_total = budget;
    app.monetization_config.cost_per_point = 1.0;
    app
}

fn seasoned_user(id: &str) -> User {
    let mut user = User::new(id);
    user.created_at = at(1, 0) - Duration::days(90);
    user
}

/// Engine over an in-memory store with one user `u1` and one app `a1`
async fn create_test_engine(config: EngineConfig) -> RewardEngine {
    let store = Store::in_memory();
    store.users.insert(seasoned_user("u1")).await.unwrap();
    store.apps.insert(funded_app("a1", 1_000.0)).await.unwrap();
    RewardEngine::new(store, &config)
}

async fn submit_share(
    engine: &RewardEngine,
    user: &str,
    app: &str,
    metadata: DeviceMetadata,
    created_at: DateTime<Utc>,
) -> ShareEvent {
    let mut share = ShareEvent::new(user, app, ShareChannel::Link, metadata);
    share.created_at = created_at;
    engine.record_share(share).await.unwrap()
}

async fn share_and_verify(
    engine: &RewardEngine,
    user: &str,
    verified_at: DateTime<Utc>,
) -> Result<ShareOutcome, EngineError> {
    let created_at = verified_at - Duration::minutes(5);
    let share = submit_share(engine, user, "a1", clean_metadata(), created_at).await;
    engine
        .process_share(&share.id, &VerificationRequest::at(verified_at))
        .await
}

async fn user(engine: &RewardEngine, id: &str) -> User {
    engine.store().users.get(id).await.unwrap().unwrap()
}

async fn app(engine: &RewardEngine, id: &str) -> App {
    engine.store().apps.get(id).await.unwrap().unwrap()
}

// ============================================================================
// Share Rewards
// ============================================================================

mod share_rewards {
    use super::*;

    #[tokio::test]
    async fn test_veteran_streak_share_matches_worked_example() {
        let engine = create_test_engine(EngineConfig::default()).await;
        let now = at(10, 12);

        let mut veteran = user(&engine, "u1").await;
        veteran.user_level = 12;
        veteran.sharing_streak_days = 8;
        veteran.longest_sharing_streak = 8;
        veteran.last_share_date = Some(now.date_naive() - Duration::days(1));
        let version = veteran.version;
        assert!(engine
            .store()
            .users
            .compare_and_swap(&veteran, version)
            .await
            .unwrap());

        let outcome = share_and_verify(&engine, "u1", now).await.unwrap();
        let ShareOutcome::Rewarded { rewards, .. } = outcome else {
            panic!("expected reward");
        };

        let b = &rewards.breakdown;
        assert_eq!(b.veteran_adjusted, Amounts::new(55, 11));
        assert_eq!(b.streak_bonus, Amounts::new(11, 1));
        assert_eq!(b.first_time_bonus, Amounts::new(28, 3));
        assert_eq!(b.diversity_bonus, Amounts::ZERO);
        assert_eq!(rewards.amounts(), Amounts::new(94, 15));

        let credited = user(&engine, "u1").await;
        assert_eq!(credited.current_xp, 94);
        assert_eq!(credited.current_points, 15);
        assert_eq!(credited.sharing_streak_days, 9);
    }

    #[tokio::test]
    async fn test_badge_awarded_by_share() {
        let engine = create_test_engine(EngineConfig::default()).await;
        engine
            .store()
            .badges
            .insert(Badge::new("first_share", CriteriaType::TotalShares, 1).with_rewards(20, 5))
            .await
            .unwrap();

        let outcome = share_and_verify(&engine, "u1", at(10, 12)).await.unwrap();
        let ShareOutcome::Rewarded { badges, .. } = outcome else {
            panic!("expected reward");
        };
        assert_eq!(badges.len(), 1);
        assert_eq!(badges[0].badge_id, "first_share");

        // share reward plus badge reward
        let credited = user(&engine, "u1").await;
        assert_eq!(credited.current_xp, 75 + 20);
        assert!(credited.badges_ids.contains("first_share"));

        let second = share_and_verify(&engine, "u1", at(10, 13)).await.unwrap();
        let ShareOutcome::Rewarded { badges, .. } = second else {
            panic!("expected reward");
        };
        assert!(badges.is_empty());
    }

    /// Live tournament `t1` over app `a1` with `u1` ranked first
    fn june_sprint(now: DateTime<Utc>) -> Tournament {
        let participants = ["u1", "p2", "p3", "p4"]
            .iter()
            .enumerate()
            .map(|(i, id)| TournamentParticipant {
                user_id: id.to_string(),
                region: None,
                score: 1_000 - i as u64 * 100,
                joined_at: now - Duration::days(2),
            })
            .collect();
        Tournament {
            id: "t1".to_string(),
            name: "June Sprint".to_string(),
            apps_involved: vec!["a1".to_string()],
            reward_multiplier: 1.5,
            eligible_regions: Vec::new(),
            participants,
            start_date: now - Duration::days(3),
            end_date: now + Duration::days(3),
            version: 0,
        }
    }

    async fn tournament_share(engine: &RewardEngine, verified_at: DateTime<Utc>) -> ShareOutcome {
        let mut share = ShareEvent::new("u1", "a1", ShareChannel::Telegram, clean_metadata())
            .with_tournament("t1");
        share.created_at = verified_at - Duration::minutes(5);
        let share = engine.record_share(share).await.unwrap();
        engine
            .process_share(&share.id, &VerificationRequest::at(verified_at))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_tournament_share_layers_on_regular_reward() {
        let engine = create_test_engine(EngineConfig::default()).await;
        let now = at(10, 12);
        engine.store().tournaments.insert(june_sprint(now)).await.unwrap();

        for hour in [12, 14] {
            let outcome = tournament_share(&engine, at(10, hour)).await;
            let ShareOutcome::Rewarded { rewards, .. } = outcome else {
                panic!("expected reward");
            };
            assert_eq!(rewards.breakdown.share_type, ShareType::Tournament);
            let layers = rewards.breakdown.tournament.clone().unwrap();
            assert_eq!(layers.rank, Some(1));
            assert!(rewards.total_xp > layers.regular_total.xp);
        }

        // joining is counted once per tournament
        let credited = user(&engine, "u1").await;
        assert_eq!(credited.tournaments_joined, 1);
        assert_eq!(credited.total_shares, 2);
    }

    #[tokio::test]
    async fn test_tournament_share_awards_share_badges() {
        let engine = create_test_engine(EngineConfig::default()).await;
        let now = at(10, 12);
        engine.store().tournaments.insert(june_sprint(now)).await.unwrap();
        for badge in [
            Badge::new("first_share", CriteriaType::TotalShares, 1),
            Badge::new("first_streak_day", CriteriaType::SharingStreak, 1),
            Badge::new("contender", CriteriaType::TournamentsJoined, 1),
        ] {
            engine.store().badges.insert(badge).await.unwrap();
        }

        let ShareOutcome::Rewarded { rewards, badges, .. } = tournament_share(&engine, now).await
        else {
            panic!("expected reward");
        };
        assert_eq!(rewards.breakdown.share_type, ShareType::Tournament);

        let mut awarded: Vec<&str> = badges.iter().map(|b| b.badge_id.as_str()).collect();
        awarded.sort_unstable();
        assert_eq!(awarded, vec!["contender", "first_share", "first_streak_day"]);

        let credited = user(&engine, "u1").await;
        assert_eq!(credited.total_shares, 1);
        assert!(credited.badges_ids.contains("first_share"));
        assert!(credited.badges_ids.contains("contender"));
    }

    #[tokio::test]
    async fn test_streak_advances_over_consecutive_days() {
        let engine = create_test_engine(EngineConfig::default()).await;
        for day in 10..13 {
            share_and_verify(&engine, "u1", at(day, 9)).await.unwrap();
        }
        let credited = user(&engine, "u1").await;
        assert_eq!(credited.sharing_streak_days, 3);
        assert_eq!(
            credited.last_share_date,
            NaiveDate::from_ymd_opt(2026, 6, 12)
        );

        // skipping a day restarts the streak
        share_and_verify(&engine, "u1", at(14, 9)).await.unwrap();
        let credited = user(&engine, "u1").await;
        assert_eq!(credited.sharing_streak_days, 1);
        assert_eq!(credited.longest_sharing_streak, 3);
    }
}

// ============================================================================
// Share Limits and Budget
// ============================================================================

mod share_limits {
    use super::*;

    #[tokio::test]
    async fn test_eleventh_share_hits_daily_user_limit() {
        let engine = create_test_engine(EngineConfig::default()).await;
        let now = at(10, 18);

        for i in 0..10 {
            let mut share = ShareEvent::new("u1", "a1", ShareChannel::Link, clean_metadata());
            share.created_at = now - Duration::hours(i + 1);
            share.verify(0, false, share.created_at).unwrap();
            engine.store().shares.insert(share).await.unwrap();
        }

        let check = engine
            .limits()
            .validate_share_limits("u1", "a1", now)
            .await
            .unwrap();
        assert!(!check.valid);
        assert_eq!(
            check.reason.map(|r| r.as_str()),
            Some("user_daily_limit_exceeded")
        );

        let share = submit_share(&engine, "u1", "a1", clean_metadata(), now).await;
        let err = engine
            .process_share(&share.id, &VerificationRequest::at(now))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::LimitExceeded(ShareLimitViolation::UserDailyLimitExceeded)
        );
        assert_eq!(err.code(), "limit_exceeded");

        // nothing was calculated or credited
        assert_eq!(user(&engine, "u1").await.current_xp, 0);
        let stored = engine.store().shares.get(&share.id).await.unwrap().unwrap();
        assert_eq!(stored.validation_status, ValidationStatus::Rejected);
    }

    #[tokio::test]
    async fn test_budget_never_overspent() {
        let engine = create_test_engine(EngineConfig::default()).await;
        engine
            .store()
            .apps
            .insert(funded_app("tight", 30.0))
            .await
            .unwrap();

        let mut rewarded = 0;
        let mut refused = None;
        for hour in 8..12 {
            let share = submit_share(&engine, "u1", "tight", clean_metadata(), at(10, hour)).await;
            match engine
                .process_share(&share.id, &VerificationRequest::at(at(10, hour)))
                .await
            {
                Ok(ShareOutcome::Rewarded { .. }) => rewarded += 1,
                Err(EngineError::LimitExceeded(reason)) => {
                    refused = Some(reason);
                    break;
                }
                other => panic!("unexpected outcome {:?}", other),
            }
        }

        // 13 for the first share, 10 for the second, 7 left is below one share
        assert_eq!(rewarded, 2);
        assert_eq!(refused, Some(ShareLimitViolation::InsufficientBudget));
        let tight = app(&engine, "tight").await;
        assert!(tight.total_points_spent <= tight.monetization_config.budget_total);
        assert_eq!(tight.total_shared, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_shares_respect_daily_limit() {
        let engine = create_test_engine(EngineConfig::default()).await;
        let mut last_slot = app(&engine, "a1").await;
        last_slot.share_rules.daily_user_limit = 1;
        let version = last_slot.version;
        assert!(engine
            .store()
            .apps
            .compare_and_swap(&last_slot, version)
            .await
            .unwrap());

        let now = at(10, 12);
        let first = submit_share(&engine, "u1", "a1", clean_metadata(), now).await;
        let second = submit_share(&engine, "u1", "a1", clean_metadata(), now).await;
        let request = VerificationRequest::at(now);

        let (a, b) = tokio::join!(
            engine.process_share(&first.id, &request),
            engine.process_share(&second.id, &request),
        );
        let results = [a, b];
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Ok(ShareOutcome::Rewarded { .. })))
                .count(),
            1
        );
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(
                    r,
                    Err(EngineError::LimitExceeded(
                        ShareLimitViolation::UserDailyLimitExceeded
                    ))
                ))
                .count(),
            1
        );

        assert_eq!(user(&engine, "u1").await.total_shares, 1);
        assert_eq!(app(&engine, "a1").await.total_shared, 1);
    }

    #[tokio::test]
    async fn test_share_receipts_stay_bounded() {
        let mut config = EngineConfig::default();
        config.store.receipt_retention_hours = 48;
        let engine = create_test_engine(config).await;

        for day in 1..=12 {
            share_and_verify(&engine, "u1", at(day, 9)).await.unwrap();
        }

        // only the last two days of receipts survive
        let credited = user(&engine, "u1").await;
        assert_eq!(credited.total_shares, 12);
        assert_eq!(credited.share_receipts.len(), 3);
        let charged = app(&engine, "a1").await;
        assert_eq!(charged.total_shared, 12);
        assert_eq!(charged.debit_receipts.len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_app_is_not_found() {
        let engine = create_test_engine(EngineConfig::default()).await;
        let share = submit_share(&engine, "u1", "missing", clean_metadata(), at(10, 9)).await;
        let err = engine
            .process_share(&share.id, &VerificationRequest::at(at(10, 9)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }
}

// ============================================================================
// Referral Lifecycle
// ============================================================================

mod referral_lifecycle {
    use super::*;

    async fn engine_with_pair() -> RewardEngine {
        let engine = create_test_engine(EngineConfig::default()).await;
        engine.store().users.insert(seasoned_user("u2")).await.unwrap();
        engine
    }

    fn activity(shares: u32, xp: u64, points: u64, when: DateTime<Utc>) -> ProgressUpdate {
        ProgressUpdate {
            shares,
            xp,
            points,
            activity_at: when,
        }
    }

    #[tokio::test]
    async fn test_activation_when_every_threshold_is_met() {
        let engine = engine_with_pair().await;
        let manager = engine.referrals();
        let referral = engine.create_referral("u1", "u2", at(1, 8)).await.unwrap();

        let mut current = manager
            .update_progress(&referral.id, &activity(5, 100, 10, at(1, 9)), at(1, 9))
            .await
            .unwrap();
        for day in 2..8 {
            assert_eq!(current.status, ReferralStatus::Pending);
            current = manager
                .update_progress(&referral.id, &activity(0, 0, 0, at(day, 9)), at(day, 9))
                .await
                .unwrap();
        }

        assert_eq!(current.activation_percentage(), 100);
        assert_eq!(current.status, ReferralStatus::Active);
        assert!(current.activated_at.is_some());
    }

    #[tokio::test]
    async fn test_settle_pays_both_sides_once() {
        let engine = engine_with_pair().await;
        let manager = engine.referrals();
        let referral = engine.create_referral("u1", "u2", at(1, 8)).await.unwrap();
        for day in 1..8 {
            manager
                .update_progress(&referral.id, &activity(1, 20, 2, at(day, 9)), at(day, 9))
                .await
                .unwrap();
        }

        let settled = engine.settle_referral(&referral.id, at(8, 9)).await.unwrap();
        assert_eq!(settled.status, ReferralStatus::Completed);

        let referrer = user(&engine, "u1").await;
        let referred = user(&engine, "u2").await;
        assert_eq!((referrer.current_xp, referrer.current_points), (500, 100));
        assert_eq!((referred.current_xp, referred.current_points), (250, 50));
        assert_eq!(referrer.total_referrals_completed, 1);
        assert_eq!(referrer.referral_count, 1);

        let again = engine.settle_referral(&referral.id, at(9, 9)).await.unwrap();
        assert_eq!(again.status, ReferralStatus::Completed);
        assert_eq!(user(&engine, "u1").await.current_xp, 500);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_referrer_awards_pay_once() {
        let engine = engine_with_pair().await;
        let manager = engine.referrals();
        let referral = engine.create_referral("u1", "u2", at(1, 8)).await.unwrap();
        for day in 1..8 {
            manager
                .update_progress(&referral.id, &activity(1, 20, 2, at(day, 9)), at(day, 9))
                .await
                .unwrap();
        }

        let (first, second) = tokio::join!(
            manager.award_referrer_bonus(&referral.id, at(8, 9)),
            manager.award_referrer_bonus(&referral.id, at(8, 9)),
        );
        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(EngineError::AlreadyAwarded(_))))
                .count(),
            1
        );
        assert_eq!(user(&engine, "u1").await.current_xp, 500);
    }

    #[tokio::test]
    async fn test_referred_shares_drive_progress() {
        let engine = engine_with_pair().await;
        let referral = engine.create_referral("u1", "u2", at(1, 8)).await.unwrap();

        let outcome = share_and_verify(&engine, "u2", at(2, 9)).await.unwrap();
        let ShareOutcome::Rewarded { referral_status, .. } = outcome else {
            panic!("expected reward");
        };
        assert_eq!(referral_status, Some(ReferralStatus::Pending));

        let stored = engine.referrals().get(&referral.id).await.unwrap();
        assert_eq!(stored.activation_progress.shares_completed, 1);
        assert_eq!(stored.activation_progress.xp_earned, 75);
        assert_eq!(stored.activation_progress.days_active, 1);
    }

    #[tokio::test]
    async fn test_expiry_sweep_is_idempotent() {
        let engine = engine_with_pair().await;
        let referral = engine.create_referral("u1", "u2", at(1, 8)).await.unwrap();
        let late = at(1, 8) + Duration::days(31);

        let first = engine.run_expiry_sweep(late).await.unwrap();
        assert_eq!(first.expired, 1);
        let second = engine.run_expiry_sweep(late).await.unwrap();
        assert_eq!(second.expired, 0);

        let stored = engine.referrals().get(&referral.id).await.unwrap();
        assert_eq!(stored.status, ReferralStatus::Expired);
        assert!(matches!(
            engine.referrals().award_referrer_bonus(&referral.id, late).await,
            Err(EngineError::NotEligible(_))
        ));
    }
}

// ============================================================================
// Fraud Scoring
// ============================================================================

mod fraud_scoring {
    use super::*;

    #[test]
    fn test_five_heavy_probes_clamp_to_block() {
        let probes: Vec<ProbeResult> = (0..5)
            .map(|i| {
                let mut probe = ProbeResult::clean(&format!("probe_{}", i));
                probe.raise(30, FraudFlag::ManualReview);
                probe
            })
            .collect();
        let assessment = aggregate(&probes, &FraudThresholds::default());
        assert_eq!(assessment.fraud_score, 100);
        assert_eq!(assessment.fraud_level, FraudLevel::Critical);
        assert_eq!(assessment.automatic_action, AutomaticAction::Block);
        assert_eq!(
            serde_json::to_value(assessment.fraud_level).unwrap(),
            serde_json::json!("critical")
        );
    }

    #[tokio::test]
    async fn test_limited_share_is_held_with_report() {
        let mut config = EngineConfig::default();
        config.fraud.blocked_ips = vec!["198.51.100.1".to_string()];
        let engine = create_test_engine(config).await;

        let metadata = DeviceMetadata {
            device_fingerprint: None,
            ip_address: Some("198.51.100.1".to_string()),
            user_agent: Some("python-requests/2.31".to_string()),
            ..clean_metadata()
        };
        let share = submit_share(&engine, "u1", "a1", metadata, at(10, 11)).await;
        let outcome = engine
            .process_share(&share.id, &VerificationRequest::at(at(10, 12)))
            .await
            .unwrap();

        let ShareOutcome::Held { fraud_score, report_id, .. } = outcome else {
            panic!("expected hold");
        };
        assert_eq!(fraud_score, 85);
        let report_id = report_id.unwrap();

        let stored = engine.store().shares.get(&share.id).await.unwrap().unwrap();
        assert_eq!(stored.validation_status, ValidationStatus::Pending);
        assert_eq!(stored.fraud_score, Some(85));
        assert!(stored.flagged);
        assert_eq!(user(&engine, "u1").await.current_xp, 0);

        let report = engine
            .fraud()
            .update_investigation(
                &report_id,
                InvestigationStatus::Investigating,
                Some("analyst-7"),
                Some("automation user agent from blocked range"),
                at(10, 13),
            )
            .await
            .unwrap();
        assert_eq!(report.investigation.status, InvestigationStatus::Investigating);
        assert_eq!(
            engine
                .fraud()
                .open_reports_for(FraudEntityType::Share, &share.id)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_crowded_device_scores_but_still_rewards() {
        let engine = create_test_engine(EngineConfig::default()).await;
        for other in ["x1", "x2", "x3"] {
            submit_share(&engine, other, "a1", clean_metadata(), at(9, 9)).await;
        }

        let outcome = share_and_verify(&engine, "u1", at(10, 9)).await.unwrap();
        let ShareOutcome::Rewarded { fraud_score, flagged, .. } = outcome else {
            panic!("expected reward");
        };
        assert_eq!(fraud_score, 25);
        assert!(!flagged);
    }

    #[tokio::test]
    async fn test_rejected_share_cannot_be_reprocessed() {
        let mut config = EngineConfig::default();
        config.fraud.blocked_ips = vec!["198.51.100.1".to_string()];
        let engine = create_test_engine(config).await;

        let metadata = DeviceMetadata {
            ip_address: Some("198.51.100.1".to_string()),
            user_agent: Some("HeadlessChrome/120".to_string()),
            ..clean_metadata()
        };
        let share = submit_share(&engine, "u1", "a1", metadata, at(10, 11)).await;
        let request = VerificationRequest {
            ip_is_proxy: true,
            ..VerificationRequest::at(at(10, 12))
        };
        let outcome = engine.process_share(&share.id, &request).await.unwrap();
        assert!(matches!(outcome, ShareOutcome::Rejected { .. }));

        assert!(matches!(
            engine.process_share(&share.id, &request).await,
            Err(EngineError::NotEligible(_))
        ));
    }
}
