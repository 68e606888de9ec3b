//! Fraud scorer
//!
//! Runs the probe family for an entity type, aggregates the sub-scores, and
//! opens (or refreshes) a fraud report when the score crosses the report
//! threshold. Any failure to evaluate yields the worst-case assessment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::fraud::probes::{
    device_probes, payment_probes, share_probes, user_probes, DeviceRiskContext,
    PaymentRiskContext, ProbeSettings, ShareRiskContext, UserRiskContext,
};
use crate::fraud::report::{FraudEntityType, FraudReport, InvestigationStatus};
use crate::fraud::score::{
    aggregate, worst_case, AutomaticAction, FraudFlag, FraudLevel, FraudThresholds,
    RiskAssessment,
};
use crate::store::{guarded_update, FraudReportRepository, Repository};

/// Signals handed to the scorer, one shape per entity type
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "entity_type", rename_all = "snake_case")]
pub enum FraudContext {
    Share(ShareRiskContext),
    Payment(PaymentRiskContext),
    User(UserRiskContext),
    Device(DeviceRiskContext),
}

impl FraudContext {
    pub fn entity_type(&self) -> FraudEntityType {
        match self {
            FraudContext::Share(_) => FraudEntityType::Share,
            FraudContext::Payment(_) => FraudEntityType::Payment,
            FraudContext::User(_) => FraudEntityType::User,
            FraudContext::Device(_) => FraudEntityType::Device,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudAnalysis {
    pub entity_type: FraudEntityType,
    pub entity_id: String,
    pub fraud_score: u8,
    pub fraud_level: FraudLevel,
    pub fraud_flags: Vec<FraudFlag>,
    pub recommendations: Vec<String>,
    pub requires_review: bool,
    pub automatic_action: AutomaticAction,
    pub report_id: Option<String>,
}

impl FraudAnalysis {
    fn from_assessment(
        entity_type: FraudEntityType,
        entity_id: &str,
        assessment: RiskAssessment,
    ) -> Self {
        let mut recommendations: Vec<String> = Vec::new();
        for flag in &assessment.fraud_flags {
            let text = flag.recommendation();
            if !recommendations.iter().any(|r| r == text) {
                recommendations.push(text.to_string());
            }
        }

        Self {
            entity_type,
            entity_id: entity_id.to_string(),
            fraud_score: assessment.fraud_score,
            fraud_level: assessment.fraud_level,
            fraud_flags: assessment.fraud_flags,
            recommendations,
            requires_review: assessment.requires_review,
            automatic_action: assessment.automatic_action,
            report_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FraudScorerSettings {
    pub thresholds: FraudThresholds,
    pub probes: ProbeSettings,
    pub report_window_hours: u32,
    pub max_cas_retries: u32,
}

impl Default for FraudScorerSettings {
    fn default() -> Self {
        Self {
            thresholds: FraudThresholds::default(),
            probes: ProbeSettings::default(),
            report_window_hours: 24,
            max_cas_retries: 8,
        }
    }
}

pub struct FraudScorer {
    reports: Arc<dyn FraudReportRepository>,
    settings: FraudScorerSettings,
}

impl FraudScorer {
    pub fn new(reports: Arc<dyn FraudReportRepository>, settings: FraudScorerSettings) -> Self {
        Self { reports, settings }
    }

    pub fn thresholds(&self) -> &FraudThresholds {
        &self.settings.thresholds
    }

    /// Pure scoring step; a context that does not match `entity_type` is a failure
    pub fn assess(
        &self,
        entity_type: FraudEntityType,
        context: &FraudContext,
    ) -> EngineResult<RiskAssessment> {
        if context.entity_type() != entity_type {
            return Err(EngineError::Validation(format!(
                "{} context supplied for {} analysis",
                context.entity_type(),
                entity_type
            )));
        }

        let probes = &self.settings.probes;
        let results = match context {
            FraudContext::Share(ctx) => share_probes(ctx, probes),
            FraudContext::Payment(ctx) => payment_probes(ctx, probes),
            FraudContext::User(ctx) => user_probes(ctx, probes),
            FraudContext::Device(ctx) => device_probes(ctx, probes),
        };
        Ok(aggregate(&results, &self.settings.thresholds))
    }

    /// Score an entity; never fails open
    pub async fn analyze_fraud(
        &self,
        entity_type: FraudEntityType,
        entity_id: &str,
        context: &FraudContext,
        now: DateTime<Utc>,
    ) -> FraudAnalysis {
        let assessment = match self.assess(entity_type, context) {
            Ok(assessment) => assessment,
            Err(e) => {
                error!(
                    entity_type = %entity_type,
                    entity_id = %entity_id,
                    error = %e,
                    "Fraud analysis failed, escalating to manual review"
                );
                worst_case()
            }
        };

        let mut analysis = FraudAnalysis::from_assessment(entity_type, entity_id, assessment.clone());

        if self.settings.thresholds.opens_report(assessment.fraud_score) {
            match self.open_report(entity_type, entity_id, &assessment, now).await {
                Ok(id) => analysis.report_id = Some(id),
                Err(e) => {
                    error!(
                        entity_type = %entity_type,
                        entity_id = %entity_id,
                        error = %e,
                        "Failed to open fraud report"
                    );
                    analysis.requires_review = true;
                    if !analysis.fraud_flags.contains(&FraudFlag::ManualReview) {
                        analysis.fraud_flags.push(FraudFlag::ManualReview);
                        analysis
                            .recommendations
                            .push(FraudFlag::ManualReview.recommendation().to_string());
                    }
                }
            }
        }

        if analysis.automatic_action != AutomaticAction::Allow {
            warn!(
                entity_type = %entity_type,
                entity_id = %entity_id,
                score = analysis.fraud_score,
                action = ?analysis.automatic_action,
                "Fraud analysis raised an automatic action"
            );
        }

        analysis
    }

    /// Insert the window's report, or fold the assessment into the existing one
    async fn open_report(
        &self,
        entity_type: FraudEntityType,
        entity_id: &str,
        assessment: &RiskAssessment,
        now: DateTime<Utc>,
    ) -> EngineResult<String> {
        let report = FraudReport::open(
            entity_type,
            entity_id,
            assessment,
            self.settings.report_window_hours,
            now,
        );
        let id = report.id.clone();

        if self.reports.insert(report).await? {
            info!(
                report_id = %id,
                entity_type = %entity_type,
                entity_id = %entity_id,
                score = assessment.fraud_score,
                "Opened fraud report"
            );
            return Ok(id);
        }

        guarded_update(
            self.reports.as_ref(),
            &id,
            self.settings.max_cas_retries,
            |existing: &mut FraudReport| Ok(existing.absorb(assessment, now)),
        )
        .await?;
        Ok(id)
    }

    pub async fn update_investigation(
        &self,
        report_id: &str,
        next: InvestigationStatus,
        investigator: Option<&str>,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> EngineResult<FraudReport> {
        let (report, _) = guarded_update(
            self.reports.as_ref(),
            report_id,
            self.settings.max_cas_retries,
            |report: &mut FraudReport| report.advance(next, investigator, note, now),
        )
        .await?;

        info!(
            report_id = %report_id,
            status = ?report.investigation.status,
            "Fraud investigation updated"
        );
        Ok(report)
    }

    pub async fn open_reports_for(
        &self,
        entity_type: FraudEntityType,
        entity_id: &str,
    ) -> EngineResult<Vec<FraudReport>> {
        self.reports.find_open_for_entity(entity_type, entity_id).await
    }
}
