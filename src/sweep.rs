//! Periodic referral expiry sweep
//!
//! Runs outside the request path. Each tick moves pending referrals past their
//! expiry to `expired`; a tick that overlaps another writer is harmless since
//! the transition is guarded on the pending status. When a badge evaluator is
//! attached the tick also recounts badge holders.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::badges::BadgeEvaluator;
use crate::referral::ReferralManager;

pub struct ExpirySweeper {
    referrals: Arc<ReferralManager>,
    badges: Option<Arc<BadgeEvaluator>>,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(referrals: Arc<ReferralManager>, interval_secs: u64) -> Self {
        Self {
            referrals,
            badges: None,
            interval: Duration::from_secs(interval_secs.max(1)),
        }
    }

    pub fn with_badges(mut self, badges: Arc<BadgeEvaluator>) -> Self {
        self.badges = Some(badges);
        self
    }

    /// Sweep on every tick until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        info!(interval_secs = self.interval.as_secs(), "Referral expiry sweeper started");

        loop {
            tokio::select! {
                _ = interval.tick() => self.tick().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Referral expiry sweeper stopped");
    }

    async fn tick(&self) {
        match self.referrals.expire_stale(Utc::now()).await {
            Ok(report) => debug!(
                scanned = report.scanned,
                expired = report.expired,
                failed = report.failed,
                "Expiry sweep finished"
            ),
            Err(e) => error!(error = %e, "Expiry sweep failed"),
        }

        if let Some(badges) = &self.badges {
            match badges.reconcile_counters().await {
                Ok(corrected) => debug!(corrected = corrected, "Badge counters reconciled"),
                Err(e) => error!(error = %e, "Badge counter reconcile failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Badge, CriteriaType, User};
    use crate::referral::{Referral, ReferralSettings, ReferralStatus};
    use crate::store::{MemoryRepository, Repository};
    use chrono::Duration as ChronoDuration;

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_expires_and_stops() {
        let users = Arc::new(MemoryRepository::<User>::new());
        users.insert(User::new("a")).await.unwrap();
        users.insert(User::new("b")).await.unwrap();
        let referrals = Arc::new(MemoryRepository::<Referral>::new());
        let manager = Arc::new(ReferralManager::new(
            users,
            referrals,
            ReferralSettings::default(),
        ));
        let referral = manager
            .create_referral("a", "b", Utc::now() - ChronoDuration::days(40))
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let sweeper = ExpirySweeper::new(manager.clone(), 60);
        let handle = tokio::spawn(async move { sweeper.run(rx).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let stored = manager.get(&referral.id).await.unwrap();
        assert_eq!(stored.status, ReferralStatus::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_repairs_badge_counters() {
        let users = Arc::new(MemoryRepository::<User>::new());
        let mut holder = User::new("a");
        holder.badges_ids.insert("early".to_string());
        users.insert(holder).await.unwrap();
        let badges = Arc::new(MemoryRepository::<Badge>::new());
        badges
            .insert(Badge::new("early", CriteriaType::TotalShares, 1))
            .await
            .unwrap();

        let manager = Arc::new(ReferralManager::new(
            users.clone(),
            Arc::new(MemoryRepository::<Referral>::new()),
            ReferralSettings::default(),
        ));
        let evaluator = Arc::new(BadgeEvaluator::new(users, badges.clone(), 1000, 8));

        let (tx, rx) = watch::channel(false);
        let sweeper = ExpirySweeper::new(manager, 60).with_badges(evaluator);
        let handle = tokio::spawn(async move { sweeper.run(rx).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let badge = badges.get("early").await.unwrap().unwrap();
        assert_eq!(badge.users_achieved_count, 1);
    }
}
