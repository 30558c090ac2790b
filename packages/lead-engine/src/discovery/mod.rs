//! Discovery of new leads from public permit data.
//!
//! Pipeline:
//! 1. Fetch raw permits from every source concurrently
//! 2. Drop invalid permits and those outside the configured permit types
//! 3. Deduplicate within the batch by canonical key
//! 4. Score outdoor potential (heuristic, optionally overridden by an LLM)
//! 5. Insert survivors above the score threshold into staging

pub mod pipeline;
pub mod scoring;

pub use pipeline::{DiscoveryPipeline, DiscoveryReport, SourceError};
pub use scoring::{heuristic_score, HeuristicScore};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::CollaboratorResult;
use crate::identity::PropertyIdentity;
use crate::staging::{NewStagedProperty, PropertySource};

/// Area a discovery scan covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryArea {
    pub city: String,
    pub postal_codes: Vec<String>,
}

impl DiscoveryArea {
    pub fn city(city: impl Into<String>) -> Self {
        Self {
            city: city.into(),
            postal_codes: Vec::new(),
        }
    }
}

/// Permit record as a public source reports it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPermit {
    pub address: String,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub bfe: Option<String>,
    pub permit_type: String,
    pub description: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Daily passers-by
    pub traffic_estimate: Option<u32>,
    pub traffic_source: Option<String>,
}

impl RawPermit {
    /// Permit duration in days, when both ends are known.
    pub fn duration_days(&self) -> Option<i64> {
        match (self.start_date, self.end_date) {
            (Some(start), Some(end)) => Some((end - start).num_days()),
            _ => None,
        }
    }
}

impl PropertyIdentity for RawPermit {
    fn address(&self) -> &str {
        &self.address
    }

    fn bfe(&self) -> Option<&str> {
        self.bfe.as_deref()
    }
}

/// A public data source of street-occupation or construction permits.
#[async_trait]
pub trait PermitSource: Send + Sync {
    fn name(&self) -> &str;

    /// Source tag carried onto staged properties.
    fn source(&self) -> PropertySource;

    async fn fetch(&self, area: &DiscoveryArea) -> CollaboratorResult<Vec<RawPermit>>;
}

/// Scored permit on its way into staging. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateRecord {
    pub permit: RawPermit,
    pub source: PropertySource,
    /// 1-10
    pub outdoor_score: u8,
    pub score_reason: String,
}

impl PropertyIdentity for CandidateRecord {
    fn address(&self) -> &str {
        &self.permit.address
    }

    fn bfe(&self) -> Option<&str> {
        self.permit.bfe.as_deref()
    }
}

impl CandidateRecord {
    pub fn into_new_staged(self) -> NewStagedProperty {
        let RawPermit {
            address,
            postal_code,
            city,
            bfe,
            permit_type,
            description,
            traffic_estimate,
            traffic_source,
            ..
        } = self.permit;

        let notes = match description {
            Some(d) if !d.trim().is_empty() => format!("{}: {}", permit_type, d.trim()),
            _ => permit_type,
        };

        NewStagedProperty {
            address,
            source: self.source,
            postal_code,
            city,
            bfe,
            outdoor_score: Some(self.outdoor_score),
            score_reason: Some(self.score_reason),
            traffic_estimate,
            traffic_source,
            notes: Some(notes),
        }
    }
}

/// Score suggested by a language model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmScore {
    pub score: u8,
    /// 0.0 - 1.0
    pub confidence: f32,
    pub reason: String,
}

/// Second opinion on a candidate's outdoor advertising potential.
#[async_trait]
pub trait CandidateScorer: Send + Sync {
    async fn score(&self, candidate: &CandidateRecord) -> CollaboratorResult<LlmScore>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_notes_carry_permit_type() {
        let candidate = CandidateRecord {
            permit: RawPermit {
                address: "Algade 1".into(),
                permit_type: "Stillads".into(),
                description: Some(" facade renovation ".into()),
                ..Default::default()
            },
            source: PropertySource::Scaffolding,
            outdoor_score: 7,
            score_reason: "base 5".into(),
        };

        let staged = candidate.into_new_staged();
        assert_eq!(staged.notes.as_deref(), Some("Stillads: facade renovation"));
        assert_eq!(staged.outdoor_score, Some(7));
        assert_eq!(staged.source, PropertySource::Scaffolding);
    }

    #[test]
    fn duration_needs_both_dates() {
        let mut permit = RawPermit {
            start_date: NaiveDate::from_ymd_opt(2026, 1, 1),
            ..Default::default()
        };
        assert_eq!(permit.duration_days(), None);

        permit.end_date = NaiveDate::from_ymd_opt(2026, 4, 1);
        assert_eq!(permit.duration_days(), Some(90));
    }
}
