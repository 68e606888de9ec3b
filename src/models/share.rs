//! Share events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::store::Entity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Pending,
    Verified,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareChannel {
    Facebook,
    Twitter,
    WhatsApp,
    Telegram,
    Email,
    Sms,
    Link,
    Other,
}

/// Device and network metadata captured when the share link was generated
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceMetadata {
    pub device_fingerprint: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub country: Option<String>,
    /// Offset from UTC in minutes, as reported by the client
    pub utc_offset_minutes: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareEvent {
    pub id: String,
    pub user_id: String,
    pub app_id: String,
    pub tournament_id: Option<String>,
    pub channel: ShareChannel,
    pub metadata: DeviceMetadata,
    pub validation_status: ValidationStatus,
    pub fraud_score: Option<u8>,
    pub flagged: bool,
    pub rejection_reason: Option<String>,
    pub clicks: u32,
    pub conversions: u32,
    pub created_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl ShareEvent {
    pub fn new(
        user_id: impl Into<String>,
        app_id: impl Into<String>,
        channel: ShareChannel,
        metadata: DeviceMetadata,
    ) -> Self {
        Self {
            id: format!("share_{}", uuid::Uuid::new_v4().simple()),
            user_id: user_id.into(),
            app_id: app_id.into(),
            tournament_id: None,
            channel,
            metadata,
            validation_status: ValidationStatus::Pending,
            fraud_score: None,
            flagged: false,
            rejection_reason: None,
            clicks: 0,
            conversions: 0,
            created_at: Utc::now(),
            verified_at: None,
            version: 0,
        }
    }

    pub fn with_tournament(mut self, tournament_id: impl Into<String>) -> Self {
        self.tournament_id = Some(tournament_id.into());
        self
    }

    pub fn is_verified(&self) -> bool {
        self.validation_status == ValidationStatus::Verified
    }

    /// pending -> verified. Verified records are immutable afterwards.
    pub fn verify(&mut self, fraud_score: u8, flagged: bool, at: DateTime<Utc>) -> EngineResult<()> {
        match self.validation_status {
            ValidationStatus::Pending => {
                self.validation_status = ValidationStatus::Verified;
                self.fraud_score = Some(fraud_score);
                self.flagged = flagged;
                self.verified_at = Some(at);
                Ok(())
            }
            ValidationStatus::Verified => Err(EngineError::AlreadyAwarded(format!(
                "share {} is already verified",
                self.id
            ))),
            ValidationStatus::Rejected => Err(EngineError::NotEligible(format!(
                "share {} was rejected",
                self.id
            ))),
        }
    }

    /// pending -> rejected
    pub fn reject(&mut self, reason: &str, fraud_score: Option<u8>) -> EngineResult<()> {
        if self.validation_status != ValidationStatus::Pending {
            return Err(EngineError::NotEligible(format!(
                "share {} is no longer pending",
                self.id
            )));
        }
        self.validation_status = ValidationStatus::Rejected;
        self.rejection_reason = Some(reason.to_string());
        if fraud_score.is_some() {
            self.fraud_score = fraud_score;
        }
        Ok(())
    }

    /// Only the fraud score may change on a share once it left pending
    pub fn record_fraud_score(&mut self, score: u8) {
        self.fraud_score = Some(score);
    }

    /// Click and conversion counts reported for the link; they only grow
    pub fn record_engagement(&mut self, clicks: u32, conversions: u32) {
        self.clicks = self.clicks.max(clicks);
        self.conversions = self.conversions.max(conversions);
    }
}

impl Entity for ShareEvent {
    const KIND: &'static str = "share";

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
