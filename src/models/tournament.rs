//! Time-boxed sharing tournaments

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::Entity;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TournamentParticipant {
    pub user_id: String,
    pub region: Option<String>,
    /// Leaderboard score; higher ranks first
    pub score: u64,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tournament {
    pub id: String,
    pub name: String,
    pub apps_involved: Vec<String>,
    pub reward_multiplier: f64,
    /// Empty means every region is eligible
    pub eligible_regions: Vec<String>,
    pub participants: Vec<TournamentParticipant>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub version: u64,
}

impl Tournament {
    pub fn total_participants(&self) -> u32 {
        u32::try_from(self.participants.len()).unwrap_or(u32::MAX)
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.start_date <= now && now <= self.end_date
    }

    pub fn includes_app(&self, app_id: &str) -> bool {
        self.apps_involved.iter().any(|a| a == app_id)
    }

    pub fn participant(&self, user_id: &str) -> Option<&TournamentParticipant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn region_eligible(&self, region: Option<&str>) -> bool {
        if self.eligible_regions.is_empty() {
            return true;
        }
        match region {
            Some(region) => self
                .eligible_regions
                .iter()
                .any(|r| r.eq_ignore_ascii_case(region)),
            None => false,
        }
    }

    /// 1-based leaderboard rank; ties broken by user id so the order is stable
    pub fn rank_of(&self, user_id: &str) -> Option<u32> {
        let mut board: Vec<&TournamentParticipant> = self.participants.iter().collect();
        board.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.user_id.cmp(&b.user_id)));
        board
            .iter()
            .position(|p| p.user_id == user_id)
            .map(|idx| u32::try_from(idx + 1).unwrap_or(u32::MAX))
    }
}

impl Entity for Tournament {
    const KIND: &'static str = "tournament";

    fn entity_id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}
