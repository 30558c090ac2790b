//! Discovery scan over all configured permit sources.

use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::scoring::{heuristic_score, screen, Screening};
use super::{CandidateRecord, CandidateScorer, DiscoveryArea, PermitSource, RawPermit};
use crate::config::DiscoveryConfig;
use crate::error::StagingError;
use crate::identity::PropertyIdentity;
use crate::staging::{PropertySource, StagedProperty, StagingStore};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceError {
    pub source_name: String,
    pub error: String,
}

/// What happened to every permit a scan saw.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryReport {
    pub fetched: usize,
    pub invalid: usize,
    pub filtered: usize,
    pub duplicates_in_batch: usize,
    pub below_threshold: usize,
    /// Already held by an active staged property
    pub already_known: usize,
    /// Scores taken from the LLM instead of the heuristic
    pub llm_scored: usize,
    pub inserted: Vec<StagedProperty>,
    pub source_errors: Vec<SourceError>,
    /// Staging failures other than conflicts
    pub insert_errors: Vec<String>,
}

impl DiscoveryReport {
    pub fn inserted_count(&self) -> usize {
        self.inserted.len()
    }
}

pub struct DiscoveryPipeline {
    staging: Arc<dyn StagingStore>,
    sources: Vec<Arc<dyn PermitSource>>,
    scorer: Option<Arc<dyn CandidateScorer>>,
    config: DiscoveryConfig,
}

impl DiscoveryPipeline {
    pub fn new(staging: Arc<dyn StagingStore>, config: DiscoveryConfig) -> Self {
        Self {
            staging,
            sources: Vec::new(),
            scorer: None,
            config,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn PermitSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn CandidateScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Run one scan. Source and staging failures are reported, never raised.
    pub async fn run(&self, area: &DiscoveryArea) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();
        info!(city = %area.city, sources = self.sources.len(), "Starting discovery scan");

        // 1. Fetch
        let fetches = self.sources.iter().map(|source| async move {
            let result = source.fetch(area).await;
            (source, result)
        });
        let mut permits: Vec<(RawPermit, PropertySource)> = Vec::new();
        for (source, result) in join_all(fetches).await {
            match result {
                Ok(batch) => {
                    debug!(source = source.name(), count = batch.len(), "Source returned permits");
                    permits.extend(batch.into_iter().map(|p| (p, source.source())));
                }
                Err(e) => {
                    warn!(source = source.name(), error = %e, "Permit source failed, skipping");
                    report.source_errors.push(SourceError {
                        source_name: source.name().to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
        report.fetched = permits.len();

        // 2. Screen
        let mut screened = Vec::with_capacity(permits.len());
        for (permit, source) in permits {
            match screen(&permit, &self.config) {
                Screening::Accept => screened.push((permit, source)),
                Screening::Invalid(reason) => {
                    debug!(address = %permit.address, reason = %reason, "Invalid permit");
                    report.invalid += 1;
                }
                Screening::Filtered(reason) => {
                    debug!(address = %permit.address, reason = %reason, "Permit filtered");
                    report.filtered += 1;
                }
            }
        }

        // 3. Deduplicate within the batch, first occurrence wins
        let before = screened.len();
        let mut seen = HashSet::new();
        screened.retain(|(permit, _)| seen.insert(permit.canonical_key()));
        report.duplicates_in_batch = before - screened.len();

        // 4. Score
        let mut candidates = Vec::with_capacity(screened.len());
        for (permit, source) in screened {
            let candidate = self.score(permit, source, &mut report).await;
            if candidate.outdoor_score < self.config.min_outdoor_score {
                debug!(
                    address = %candidate.permit.address,
                    score = candidate.outdoor_score,
                    "Below score threshold"
                );
                report.below_threshold += 1;
                continue;
            }
            candidates.push(candidate);
        }

        // 5. Stage
        for candidate in candidates {
            let address = candidate.permit.address.clone();
            match self.staging.insert(candidate.into_new_staged()).await {
                Ok(staged) => {
                    info!(id = %staged.id, address = %staged.address, "Staged new lead");
                    report.inserted.push(staged);
                }
                Err(StagingError::Conflict { key, existing }) => {
                    debug!(key = %key, existing = %existing, "Lead already staged");
                    report.already_known += 1;
                }
                Err(e) => {
                    warn!(address = %address, error = %e, "Failed to stage lead");
                    report.insert_errors.push(format!("{}: {}", address, e));
                }
            }
        }

        info!(
            fetched = report.fetched,
            invalid = report.invalid,
            filtered = report.filtered,
            duplicates = report.duplicates_in_batch,
            below_threshold = report.below_threshold,
            already_known = report.already_known,
            inserted = report.inserted_count(),
            source_errors = report.source_errors.len(),
            "Discovery scan completed"
        );
        report
    }

    async fn score(
        &self,
        permit: RawPermit,
        source: PropertySource,
        report: &mut DiscoveryReport,
    ) -> CandidateRecord {
        let heuristic = heuristic_score(&permit, source);
        let mut candidate = CandidateRecord {
            permit,
            source,
            outdoor_score: heuristic.score,
            score_reason: heuristic.reason(),
        };

        let Some(scorer) = &self.scorer else {
            return candidate;
        };

        match scorer.score(&candidate).await {
            Ok(llm) if !(1..=10).contains(&llm.score) => {
                warn!(
                    address = %candidate.permit.address,
                    score = llm.score,
                    "LLM score out of range, keeping heuristic"
                );
            }
            Ok(llm) if llm.confidence >= self.config.llm_confidence_threshold => {
                candidate.outdoor_score = llm.score;
                candidate.score_reason = llm.reason;
                report.llm_scored += 1;
            }
            Ok(llm) => {
                debug!(
                    address = %candidate.permit.address,
                    confidence = llm.confidence,
                    "LLM score not confident enough, keeping heuristic"
                );
            }
            Err(e) => {
                warn!(
                    address = %candidate.permit.address,
                    error = %e,
                    "LLM scoring failed, keeping heuristic"
                );
            }
        }
        candidate
    }
}
