//! Repository Seam
//!
//! Persistence is an external collaborator. The engine only needs versioned
//! reads, inserts, and compare-and-swap writes, plus a handful of queries per
//! record type. Every mutation is applied through [`guarded_update`], which
//! re-checks its guard against the latest stored version before writing.
//!
//! ```text
//! ┌──────────────┐  get    ┌──────────────┐
//! │ guarded_     │────────►│ Repository<T>│
//! │ update       │◄────────│ (versioned)  │
//! │  apply(&mut) │  CAS    └──────────────┘
//! └──────────────┘  retry on version conflict
//! ```

mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::fraud::{FraudEntityType, FraudReport};
use crate::models::{App, Badge, ShareEvent, Tournament, User};
use crate::referral::Referral;

pub use memory::MemoryRepository;

/// A versioned record the store can compare-and-swap
pub trait Entity: Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn entity_id(&self) -> &str;
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);

    /// Secondary key that must be unique across all records of this kind
    fn unique_key(&self) -> Option<&str> {
        None
    }
}

#[async_trait]
pub trait Repository<T: Entity>: Send + Sync {
    async fn get(&self, id: &str) -> EngineResult<Option<T>>;

    /// Returns false when the id or unique key is already taken
    async fn insert(&self, entity: T) -> EngineResult<bool>;

    /// Writes `entity` only if the stored version still equals `expected_version`;
    /// the stored version is bumped on success
    async fn compare_and_swap(&self, entity: &T, expected_version: u64) -> EngineResult<bool>;
}

#[async_trait]
pub trait UserRepository: Repository<User> {
    /// Users whose badge set contains `badge_id`
    async fn count_badge_holders(&self, badge_id: &str) -> EngineResult<u64>;
}

#[async_trait]
pub trait AppRepository: Repository<App> {}

#[async_trait]
pub trait TournamentRepository: Repository<Tournament> {}

#[async_trait]
pub trait ShareRepository: Repository<ShareEvent> {
    /// Verified shares of `app_id` since `since`, optionally for one user
    async fn count_verified_since(
        &self,
        app_id: &str,
        user_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> EngineResult<u32>;

    async fn last_verified_at(
        &self,
        user_id: &str,
        app_id: &str,
    ) -> EngineResult<Option<DateTime<Utc>>>;

    /// Verified shares of a user, oldest first
    async fn verified_for_user(&self, user_id: &str) -> EngineResult<Vec<ShareEvent>>;

    /// Every share attempt of a user since `since`, oldest first
    async fn attempts_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> EngineResult<Vec<ShareEvent>>;

    /// Other users whose shares carried this device fingerprint
    async fn other_users_on_device(&self, fingerprint: &str, user_id: &str) -> EngineResult<u32>;

    /// Other users whose shares came from this IP address
    async fn other_users_on_ip(&self, ip_address: &str, user_id: &str) -> EngineResult<u32>;
}

#[async_trait]
pub trait ReferralRepository: Repository<Referral> {
    async fn find_by_referred(&self, referred_id: &str) -> EngineResult<Option<Referral>>;

    async fn find_by_referrer(&self, referrer_id: &str) -> EngineResult<Vec<Referral>>;

    /// Pending referrals whose `expires_at` is before `now`
    async fn list_expirable(&self, now: DateTime<Utc>) -> EngineResult<Vec<Referral>>;
}

#[async_trait]
pub trait BadgeRepository: Repository<Badge> {
    async fn list_active(&self) -> EngineResult<Vec<Badge>>;
}

#[async_trait]
pub trait FraudReportRepository: Repository<FraudReport> {
    /// Reports for the entity whose investigation has not concluded
    async fn find_open_for_entity(
        &self,
        entity_type: FraudEntityType,
        entity_id: &str,
    ) -> EngineResult<Vec<FraudReport>>;
}

/// All repositories the engine reads and writes
#[derive(Clone)]
pub struct Store {
    pub users: Arc<dyn UserRepository>,
    pub apps: Arc<dyn AppRepository>,
    pub shares: Arc<dyn ShareRepository>,
    pub referrals: Arc<dyn ReferralRepository>,
    pub badges: Arc<dyn BadgeRepository>,
    pub tournaments: Arc<dyn TournamentRepository>,
    pub fraud_reports: Arc<dyn FraudReportRepository>,
}

impl Store {
    pub fn in_memory() -> Self {
        Self {
            users: Arc::new(MemoryRepository::<User>::new()),
            apps: Arc::new(MemoryRepository::<App>::new()),
            shares: Arc::new(MemoryRepository::<ShareEvent>::new()),
            referrals: Arc::new(MemoryRepository::<Referral>::new()),
            badges: Arc::new(MemoryRepository::<Badge>::new()),
            tournaments: Arc::new(MemoryRepository::<Tournament>::new()),
            fraud_reports: Arc::new(MemoryRepository::<FraudReport>::new()),
        }
    }
}

/// Read-modify-write with the guard evaluated against the latest version.
///
/// `apply` must be pure over the record it is handed: it may run more than once
/// when a concurrent writer wins the compare-and-swap, and every run sees the
/// fresh record, so flags it checks cannot be double-set.
pub async fn guarded_update<T, R, F, Repo>(
    repo: &Repo,
    id: &str,
    max_retries: u32,
    mut apply: F,
) -> EngineResult<(T, R)>
where
    T: Entity,
    R: Send,
    F: FnMut(&mut T) -> EngineResult<R> + Send,
    Repo: Repository<T> + ?Sized,
{
    for attempt in 0..=max_retries {
        let mut record = repo
            .get(id)
            .await?
            .ok_or_else(|| EngineError::not_found(T::KIND, id))?;
        let expected = record.version();

        let outcome = apply(&mut record)?;

        if repo.compare_and_swap(&record, expected).await? {
            record.set_version(expected + 1);
            return Ok((record, outcome));
        }

        debug!(
            kind = T::KIND,
            id = %id,
            attempt = attempt,
            "Version conflict, retrying guarded update"
        );
    }

    Err(EngineError::System(format!(
        "{} {} stayed contended after {} retries",
        T::KIND,
        id,
        max_retries
    )))
}

/// Fetch a record or fail with `NotFound`
pub async fn require<T, Repo>(repo: &Repo, id: &str) -> EngineResult<T>
where
    T: Entity,
    Repo: Repository<T> + ?Sized,
{
    repo.get(id)
        .await?
        .ok_or_else(|| EngineError::not_found(T::KIND, id))
}
