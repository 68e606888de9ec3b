//! Badge definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Amounts;
use crate::store::Entity;

/// The user statistic a badge is measured against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriteriaType {
    TotalShares,
    TotalXpEarned,
    TotalPointsEarned,
    SharingStreak,
    LongestStreak,
    ReferralsCompleted,
    UserLevel,
    CategoriesShared,
    TournamentsJoined,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdOperator {
    #[default]
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "<")]
    Lt,
}

impl ThresholdOperator {
    pub fn compare(&self, value: u64, threshold: u64) -> bool {
        match self {
            ThresholdOperator::Gte => value >= threshold,
            ThresholdOperator::Gt => value > threshold,
            ThresholdOperator::Eq => value == threshold,
            ThresholdOperator::Lte => value <= threshold,
            ThresholdOperator::Lt => value < threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadgeCriteria {
    #[serde(rename = "type")]
    pub kind: CriteriaType,
    pub threshold_value: u64,
    #[serde(default)]
    pub threshold_operator: ThresholdOperator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rarity {
    Common,
    Uncommon,
    Rare,
    Epic,
    Legendary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Badge {
    pub id: String,
    pub name: String,
    pub criteria: BadgeCriteria,
    pub xp_reward: u64,
    pub points_reward: u64,
    pub rarity: Rarity,
    pub is_active: bool,
    pub users_achieved_count: u64,
    pub created_at: DateTime<Utc>,
    pub version: u64,
}

impl Badge {
    pub fn new(id: impl Into<String>, kind: CriteriaType, threshold_value: u64) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            criteria: BadgeCriteria {
                kind,
                threshold_value,
                threshold_operator: ThresholdOperator::Gte,
            },
            xp_reward: 0,
            points_reward: 0,
            rarity: Rarity::Common,
            is_active: true,
            users_achieved_count: 0,
            created_at: Utc::now(),
            version: 0,
        }
    }

    pub fn with_rewards(mut self, xp: u64, points: u64) -> Self {
        self.xp_reward = xp;
        self.points_reward = points;
        self
    }

    pub fn rewards(&self) -> Amounts {
        Amounts::new(self.xp_reward, self.points_reward)
    }
}

impl Entity for Badge {
    const KIND: &'static str = "badge";

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
