//! Research context threaded through the workflow steps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::collaborators::{BuildingInfo, CompanyProfile, OwnerInfo, ResearchAnalysis, SearchHit};
use super::contacts::WebsiteContent;
use crate::common::PropertyRecordId;
use crate::crm::{DataQuality, EmailDraft, PropertyRecord};

/// External data sources feeding the research.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    PropertyRegistry,
    BuildingRegistry,
    CompanyRegistry,
    WebSearch,
    Website,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::PropertyRegistry => "property_registry",
            DataSource::BuildingRegistry => "building_registry",
            DataSource::CompanyRegistry => "company_registry",
            DataSource::WebSearch => "web_search",
            DataSource::Website => "website",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum SourceStatus {
    Available,
    /// Not configured, nothing to look up, or no record
    Unavailable(String),
    Failed(String),
}

impl SourceStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, SourceStatus::Available)
    }
}

/// Everything known about one property during a research run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchContext {
    pub property_id: PropertyRecordId,
    pub property_name: String,
    pub address: String,
    pub bfe: Option<String>,

    pub owner: Option<OwnerInfo>,
    pub building: Option<BuildingInfo>,
    pub company: Option<CompanyProfile>,
    pub search_hits: Vec<SearchHit>,
    pub website: Option<WebsiteContent>,
    pub analysis: Option<ResearchAnalysis>,
    pub email_draft: Option<EmailDraft>,

    pub sources: BTreeMap<DataSource, SourceStatus>,
    pub updated_at: DateTime<Utc>,
}

impl ResearchContext {
    pub fn new(record: &PropertyRecord) -> Self {
        Self {
            property_id: record.id.clone(),
            property_name: record.name.clone(),
            address: record.address.clone(),
            bfe: record.bfe.clone(),
            owner: None,
            building: None,
            company: None,
            search_hits: Vec::new(),
            website: None,
            analysis: None,
            email_draft: None,
            sources: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn merge(&mut self, delta: ContextDelta) {
        if let Some(owner) = delta.owner {
            if self.bfe.is_none() {
                self.bfe = owner.bfe.clone();
            }
            self.owner = Some(owner);
        }
        if delta.building.is_some() {
            self.building = delta.building;
        }
        if delta.company.is_some() {
            self.company = delta.company;
        }
        self.search_hits.extend(delta.search_hits);
        if delta.website.is_some() {
            self.website = delta.website;
        }
        if delta.analysis.is_some() {
            self.analysis = delta.analysis;
        }
        if delta.email_draft.is_some() {
            self.email_draft = delta.email_draft;
        }
        self.sources.extend(delta.sources);
        self.updated_at = Utc::now();
    }

    /// Sources that did not contribute, including those never consulted.
    pub fn missing_sources(&self) -> usize {
        [
            DataSource::PropertyRegistry,
            DataSource::BuildingRegistry,
            DataSource::CompanyRegistry,
            DataSource::WebSearch,
            DataSource::Website,
        ]
        .iter()
        .filter(|s| !self.sources.get(*s).is_some_and(SourceStatus::is_available))
        .count()
    }

    /// Best data quality the gathered sources can justify.
    pub fn quality_ceiling(&self) -> DataQuality {
        match self.missing_sources() {
            0 | 1 => DataQuality::High,
            2 | 3 => DataQuality::Medium,
            _ => DataQuality::Low,
        }
    }
}

/// What one step adds to the context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextDelta {
    pub owner: Option<OwnerInfo>,
    pub building: Option<BuildingInfo>,
    pub company: Option<CompanyProfile>,
    pub search_hits: Vec<SearchHit>,
    pub website: Option<WebsiteContent>,
    pub analysis: Option<ResearchAnalysis>,
    pub email_draft: Option<EmailDraft>,
    pub sources: Vec<(DataSource, SourceStatus)>,
    /// Shown on the step record
    pub details: Option<String>,
}

impl ContextDelta {
    pub fn source(&mut self, source: DataSource, status: SourceStatus) {
        self.sources.push((source, status));
    }

    pub fn any_available(&self) -> bool {
        self.sources.iter().any(|(_, s)| s.is_available())
    }

    pub fn failures(&self) -> Vec<String> {
        self.sources
            .iter()
            .filter_map(|(source, status)| match status {
                SourceStatus::Failed(reason) => Some(format!("{}: {}", source.as_str(), reason)),
                _ => None,
            })
            .collect()
    }
}
