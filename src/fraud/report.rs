//! Fraud reports and their investigation workflow

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{EngineError, EngineResult};
use crate::fraud::score::{FraudFlag, FraudLevel, RiskAssessment};
use crate::store::Entity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FraudEntityType {
    Share,
    Payment,
    User,
    Device,
}

impl FraudEntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FraudEntityType::Share => "share",
            FraudEntityType::Payment => "payment",
            FraudEntityType::User => "user",
            FraudEntityType::Device => "device",
        }
    }
}

impl std::fmt::Display for FraudEntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestigationStatus {
    Open,
    Investigating,
    Resolved,
    Closed,
    FalsePositive,
}

impl InvestigationStatus {
    pub fn is_concluded(&self) -> bool {
        matches!(
            self,
            InvestigationStatus::Resolved
                | InvestigationStatus::Closed
                | InvestigationStatus::FalsePositive
        )
    }

    pub fn can_transition_to(&self, next: InvestigationStatus) -> bool {
        use InvestigationStatus::*;
        matches!(
            (self, next),
            (Open, Investigating)
                | (Investigating, Resolved)
                | (Investigating, Closed)
                | (Investigating, FalsePositive)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Investigation {
    pub status: InvestigationStatus,
    pub assigned_to: Option<String>,
    pub notes: Vec<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Default for Investigation {
    fn default() -> Self {
        Self {
            status: InvestigationStatus::Open,
            assigned_to: None,
            notes: Vec::new(),
            resolved_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudReport {
    pub id: String,
    pub entity_type: FraudEntityType,
    pub entity_id: String,
    pub fraud_score: u8,
    pub risk_level: FraudLevel,
    pub fraud_flags: Vec<FraudFlag>,
    pub investigation: Investigation,
    /// Start of the scoring window the report covers
    pub window_start: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl FraudReport {
    pub fn open(
        entity_type: FraudEntityType,
        entity_id: &str,
        assessment: &RiskAssessment,
        window_hours: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let window_start = window_start(now, window_hours);
        Self {
            id: report_id(entity_type, entity_id, window_start),
            entity_type,
            entity_id: entity_id.to_string(),
            fraud_score: assessment.fraud_score,
            risk_level: assessment.fraud_level,
            fraud_flags: assessment.fraud_flags.clone(),
            investigation: Investigation::default(),
            window_start,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.investigation.status.is_concluded()
    }

    /// Fold a later assessment from the same window into the report
    pub fn absorb(&mut self, assessment: &RiskAssessment, now: DateTime<Utc>) -> bool {
        let mut changed = false;
        if assessment.fraud_score > self.fraud_score {
            self.fraud_score = assessment.fraud_score;
            self.risk_level = assessment.fraud_level;
            changed = true;
        }
        for flag in &assessment.fraud_flags {
            if !self.fraud_flags.contains(flag) {
                self.fraud_flags.push(*flag);
                changed = true;
            }
        }
        if changed {
            self.fraud_flags.sort();
            self.updated_at = now;
        }
        changed
    }

    pub fn advance(
        &mut self,
        next: InvestigationStatus,
        investigator: Option<&str>,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        if !self.investigation.status.can_transition_to(next) {
            return Err(EngineError::NotEligible(format!(
                "fraud report {} cannot move from {:?} to {:?}",
                self.id, self.investigation.status, next
            )));
        }

        self.investigation.status = next;
        if let Some(investigator) = investigator {
            self.investigation.assigned_to = Some(investigator.to_string());
        }
        if let Some(note) = note {
            self.investigation.notes.push(note.to_string());
        }
        if next.is_concluded() {
            self.investigation.resolved_at = Some(now);
        }
        self.updated_at = now;
        Ok(())
    }
}

fn window_start(now: DateTime<Utc>, window_hours: u32) -> DateTime<Utc> {
    let window = Duration::hours(i64::from(window_hours.max(1)));
    now.duration_trunc(window).unwrap_or(now)
}

/// Deterministic per entity and window, so a second open in the same window collides
pub fn report_id(entity_type: FraudEntityType, entity_id: &str, window_start: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entity_type.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(entity_id.as_bytes());
    hasher.update(b"|");
    hasher.update(window_start.timestamp().to_le_bytes());
    format!("fraud_{:x}", hasher.finalize())
}

impl Entity for FraudReport {
    const KIND: &'static str = "fraud_report";

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fraud::score::worst_case;
    use chrono::TimeZone;

    #[test]
    fn test_same_window_same_id() {
        let morning = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let evening = Utc.with_ymd_and_hms(2024, 3, 1, 20, 0, 0).unwrap();
        let next_day = Utc.with_ymd_and_hms(2024, 3, 2, 1, 0, 0).unwrap();

        let a = FraudReport::open(FraudEntityType::Share, "s1", &worst_case(), 24, morning);
        let b = FraudReport::open(FraudEntityType::Share, "s1", &worst_case(), 24, evening);
        let c = FraudReport::open(FraudEntityType::Share, "s1", &worst_case(), 24, next_day);
        let d = FraudReport::open(FraudEntityType::User, "s1", &worst_case(), 24, morning);

        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_ne!(a.id, d.id);
        assert!(a.id.starts_with("fraud_"));
    }

    #[test]
    fn test_investigation_workflow() {
        let now = Utc::now();
        let mut report = FraudReport::open(FraudEntityType::User, "u1", &worst_case(), 24, now);
        assert!(report.is_open());

        assert!(report
            .advance(InvestigationStatus::Resolved, None, None, now)
            .is_err());
        report
            .advance(InvestigationStatus::Investigating, Some("analyst"), None, now)
            .unwrap();
        report
            .advance(InvestigationStatus::FalsePositive, None, Some("known user"), now)
            .unwrap();

        assert!(!report.is_open());
        assert_eq!(report.investigation.assigned_to.as_deref(), Some("analyst"));
        assert!(report.investigation.resolved_at.is_some());
        assert!(report
            .advance(InvestigationStatus::Investigating, None, None, now)
            .is_err());
    }
}
