//! In-memory store backed by `DashMap`
//!
//! Compare-and-swap runs under the shard lock of the record, so each guarded
//! update is atomic per entity.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;

use crate::error::EngineResult;
use crate::fraud::{FraudEntityType, FraudReport};
use crate::models::{App, Badge, ShareEvent, Tournament, User};
use crate::referral::{Referral, ReferralStatus};
use crate::store::{
    AppRepository, BadgeRepository, Entity, FraudReportRepository, ReferralRepository,
    Repository, ShareRepository, TournamentRepository, UserRepository,
};

pub struct MemoryRepository<T> {
    records: DashMap<String, T>,
    /// unique key -> record id
    unique_index: DashMap<String, String>,
}

impl<T: Entity> MemoryRepository<T> {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            unique_index: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn filtered<P>(&self, predicate: P) -> Vec<T>
    where
        P: Fn(&T) -> bool,
    {
        self.records
            .iter()
            .filter(|r| predicate(r.value()))
            .map(|r| r.value().clone())
            .collect()
    }
}

impl<T: Entity> Default for MemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Entity> Repository<T> for MemoryRepository<T> {
    async fn get(&self, id: &str) -> EngineResult<Option<T>> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }

    async fn insert(&self, entity: T) -> EngineResult<bool> {
        let slot = match self.records.entry(entity.entity_id().to_string()) {
            Entry::Occupied(_) => return Ok(false),
            Entry::Vacant(slot) => slot,
        };

        if let Some(key) = entity.unique_key() {
            match self.unique_index.entry(key.to_string()) {
                Entry::Occupied(_) => return Ok(false),
                Entry::Vacant(index) => {
                    index.insert(entity.entity_id().to_string());
                }
            }
        }

        slot.insert(entity);
        Ok(true)
    }

    async fn compare_and_swap(&self, entity: &T, expected_version: u64) -> EngineResult<bool> {
        let Some(mut stored) = self.records.get_mut(entity.entity_id()) else {
            return Ok(false);
        };

        if stored.version() != expected_version {
            return Ok(false);
        }

        let mut next = entity.clone();
        next.set_version(expected_version + 1);
        *stored = next;
        Ok(true)
    }
}

#[async_trait]
impl UserRepository for MemoryRepository<User> {
    async fn count_badge_holders(&self, badge_id: &str) -> EngineResult<u64> {
        let holders = self
            .records
            .iter()
            .filter(|r| r.value().badges_ids.contains(badge_id))
            .count();
        Ok(holders as u64)
    }
}

impl AppRepository for MemoryRepository<App> {}

impl TournamentRepository for MemoryRepository<Tournament> {}

#[async_trait]
impl ShareRepository for MemoryRepository<ShareEvent> {
    async fn count_verified_since(
        &self,
        app_id: &str,
        user_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> EngineResult<u32> {
        let count = self
            .records
            .iter()
            .filter(|r| {
                let share = r.value();
                share.app_id == app_id
                    && share.is_verified()
                    && user_id.map_or(true, |u| share.user_id == u)
                    && share.verified_at.unwrap_or(share.created_at) >= since
            })
            .count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn last_verified_at(
        &self,
        user_id: &str,
        app_id: &str,
    ) -> EngineResult<Option<DateTime<Utc>>> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.user_id == user_id && r.app_id == app_id && r.is_verified())
            .filter_map(|r| r.verified_at.or(Some(r.created_at)))
            .max())
    }

    async fn verified_for_user(&self, user_id: &str) -> EngineResult<Vec<ShareEvent>> {
        let mut shares = self.filtered(|s| s.user_id == user_id && s.is_verified());
        shares.sort_by_key(|s| s.created_at);
        Ok(shares)
    }

    async fn attempts_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> EngineResult<Vec<ShareEvent>> {
        let mut shares = self.filtered(|s| s.user_id == user_id && s.created_at >= since);
        shares.sort_by_key(|s| s.created_at);
        Ok(shares)
    }

    async fn other_users_on_device(&self, fingerprint: &str, user_id: &str) -> EngineResult<u32> {
        Ok(self.distinct_other_users(user_id, |s| {
            s.metadata.device_fingerprint.as_deref() == Some(fingerprint)
        }))
    }

    async fn other_users_on_ip(&self, ip_address: &str, user_id: &str) -> EngineResult<u32> {
        Ok(self.distinct_other_users(user_id, |s| {
            s.metadata.ip_address.as_deref() == Some(ip_address)
        }))
    }
}

impl MemoryRepository<ShareEvent> {
    fn distinct_other_users<P>(&self, user_id: &str, predicate: P) -> u32
    where
        P: Fn(&ShareEvent) -> bool,
    {
        let users: HashSet<String> = self
            .records
            .iter()
            .filter(|r| r.user_id != user_id && predicate(r.value()))
            .map(|r| r.user_id.clone())
            .collect();
        u32::try_from(users.len()).unwrap_or(u32::MAX)
    }
}

#[async_trait]
impl ReferralRepository for MemoryRepository<Referral> {
    async fn find_by_referred(&self, referred_id: &str) -> EngineResult<Option<Referral>> {
        let Some(id) = self.unique_index.get(referred_id).map(|r| r.value().clone()) else {
            return Ok(None);
        };
        self.get(&id).await
    }

    async fn find_by_referrer(&self, referrer_id: &str) -> EngineResult<Vec<Referral>> {
        let mut referrals = self.filtered(|r| r.referrer_id == referrer_id);
        referrals.sort_by_key(|r| r.created_at);
        Ok(referrals)
    }

    async fn list_expirable(&self, now: DateTime<Utc>) -> EngineResult<Vec<Referral>> {
        Ok(self.filtered(|r| r.status == ReferralStatus::Pending && r.expires_at < now))
    }
}

#[async_trait]
impl BadgeRepository for MemoryRepository<Badge> {
    async fn list_active(&self) -> EngineResult<Vec<Badge>> {
        let mut badges = self.filtered(|b| b.is_active);
        badges.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(badges)
    }
}

#[async_trait]
impl FraudReportRepository for MemoryRepository<FraudReport> {
    async fn find_open_for_entity(
        &self,
        entity_type: FraudEntityType,
        entity_id: &str,
    ) -> EngineResult<Vec<FraudReport>> {
        let mut reports = self.filtered(|r| {
            r.entity_type == entity_type && r.entity_id == entity_id && r.is_open()
        });
        reports.sort_by_key(|r| r.created_at);
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::guarded_update;
    use crate::error::EngineError;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_insert_rejects_duplicates() {
        let repo = MemoryRepository::<User>::new();
        assert!(repo.insert(User::new("u1")).await.unwrap());
        assert!(!repo.insert(User::new("u1")).await.unwrap());
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn test_compare_and_swap_detects_stale_writes() {
        let repo = MemoryRepository::<User>::new();
        repo.insert(User::new("u1")).await.unwrap();

        let mut copy = repo.get("u1").await.unwrap().unwrap();
        copy.current_xp = 10;
        assert!(repo.compare_and_swap(&copy, 0).await.unwrap());
        copy.current_xp = 20;
        assert!(!repo.compare_and_swap(&copy, 0).await.unwrap());

        let stored = repo.get("u1").await.unwrap().unwrap();
        assert_eq!(stored.current_xp, 10);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn test_guarded_update_serialises_concurrent_writers() {
        let repo = Arc::new(MemoryRepository::<User>::new());
        repo.insert(User::new("u1")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                guarded_update(repo.as_ref(), "u1", 64, |user: &mut User| {
                    user.total_shares += 1;
                    Ok(())
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stored = repo.get("u1").await.unwrap().unwrap();
        assert_eq!(stored.total_shares, 16);
    }

    #[tokio::test]
    async fn test_guarded_update_missing_record() {
        let repo = MemoryRepository::<User>::new();
        let result = guarded_update(&repo, "ghost", 1, |_: &mut User| Ok(())).await;
        assert!(matches!(result, Err(EngineError::NotFound { .. })));
    }
}
